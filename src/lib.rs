//! ECG画像のSTEMI判定デモ
//!
//! 未学習のCNNを毎回新しく構築し、画像を (1, 224, 224, 3) に前処理して
//! 1回の順伝播で2クラスの確率を得ます。出力は診断的な意味を持ちません。

pub mod cli;
pub mod error;
pub mod ml;
pub mod model;
pub mod report;
pub mod session;

pub use error::{ConstructionError, InferenceError};
pub use ml::{build_model, predict, preprocess, CompiledModel, InferenceEngine, InputTensor, Prediction};
pub use model::AppConfig;
pub use report::{AnalysisReport, SimulatedFeatures};
pub use session::{AnalysisSession, ImagePreview};

pub use cli::run;
