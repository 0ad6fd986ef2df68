pub mod inference;
pub mod ml_model;
pub mod preprocess;
pub mod tensor_registry;

pub use ml_model::{
    build_model, build_model_on, build_model_seeded, CompileOptions, CompiledModel, EcgClassifier,
    LossKind, MetricKind, ModelConfig, CLASS_NAMES, IMAGE_CHANNELS, IMAGE_SIZE, NUM_CLASSES,
};
pub use preprocess::{preprocess, preprocess_image, InputTensor};
pub use inference::{predict, InferenceEngine, Prediction};
pub use tensor_registry::{TensorLease, TensorRegistry};
