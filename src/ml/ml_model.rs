//! 機械学習モデルの共通定義
//!
//! ECG画像のSTEMI分類用CNNモデルと、そのコンパイル設定を提供します。
//! 重みは読み込まず、常にライブラリ既定の乱数初期化のまま使用します。

use std::panic::{self, AssertUnwindSafe};

use burn::{
    config::Config,
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        loss::CrossEntropyLossConfig,
        pool::{MaxPool2d, MaxPool2dConfig},
        Dropout, DropoutConfig, Linear, LinearConfig, Relu,
    },
    optim::{AdamConfig, Optimizer},
    tensor::{
        activation::softmax,
        backend::{AutodiffBackend, Backend},
        Int, Tensor,
    },
    train::ClassificationOutput,
};
use log::{debug, info};

use crate::error::{panic_message, ConstructionError};

/// クラス数
pub const NUM_CLASSES: usize = 2;

/// 画像サイズ（正方形）
pub const IMAGE_SIZE: usize = 224;

/// 入力チャネル数（RGB）
pub const IMAGE_CHANNELS: usize = 3;

/// クラス名の定義（0: 異常なし, 1: STEMI）
pub const CLASS_NAMES: [&str; NUM_CLASSES] = ["No STEMI", "STEMI"];

/// 3段の Conv(3x3) + Pool(2x2) を通した後の特徴マップサイズ
///
/// 3段を通せない入力サイズの場合は `None`
pub fn feature_map_size(image_size: usize) -> Option<usize> {
    let mut size = image_size;
    for _ in 0..3 {
        // Conv 3x3 (valid): size - 2
        size = size.checked_sub(2).filter(|s| *s >= 2)?;
        // MaxPool 2x2 stride 2 (valid): (size - 2) / 2 + 1
        size = (size - 2) / 2 + 1;
    }
    Some(size)
}

/// 3段を通せる最小の入力サイズ
pub const MIN_IMAGE_SIZE: usize = 22;

/// モデル設定
///
/// 入力サイズは常に `IMAGE_SIZE` で、ここでは変更できません。
#[derive(Config, Debug)]
pub struct ModelConfig {
    /// 分類クラス数
    #[config(default = 2)]
    pub num_classes: usize,
    /// 全結合層のユニット数
    #[config(default = 128)]
    pub hidden_units: usize,
    /// Flatten直後のドロップアウト率
    #[config(default = 0.5)]
    pub dropout_flatten: f64,
    /// 隠れ層後のドロップアウト率
    #[config(default = 0.3)]
    pub dropout_hidden: f64,
}

impl ModelConfig {
    /// モデルを初期化
    ///
    /// burn のパラメータは遅延初期化なので、この時点ではまだ確保されません。
    /// 確保まで行うには `build_model_on` を使います。
    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<EcgClassifier<B>, ConstructionError> {
        self.init_with_size(device, IMAGE_SIZE)
    }

    pub(crate) fn init_with_size<B: Backend>(
        &self,
        device: &B::Device,
        image_size: usize,
    ) -> Result<EcgClassifier<B>, ConstructionError> {
        let feature_map_size =
            feature_map_size(image_size).ok_or(ConstructionError::InputTooSmall {
                image_size,
                minimum: MIN_IMAGE_SIZE,
            })?;

        // 特徴次元 d = 128チャネル * feature_map_size * feature_map_size
        let d = 128 * feature_map_size * feature_map_size;

        debug!("[Model] 入力サイズ: {}x{}x{}", image_size, image_size, IMAGE_CHANNELS);
        debug!("[Model] Conv3+Pool3後: 128 x {}x{}", feature_map_size, feature_map_size);
        debug!("[Model] Flatten後の特徴次元 d: {}", d);
        debug!("[Model] FC1: {} -> {}", d, self.hidden_units);
        debug!("[Model] FC2: {} -> {}", self.hidden_units, self.num_classes);

        Ok(EcgClassifier {
            conv1: Conv2dConfig::new([IMAGE_CHANNELS, 32], [3, 3])
                .with_stride([1, 1])
                .init(device),
            pool1: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),

            conv2: Conv2dConfig::new([32, 64], [3, 3])
                .with_stride([1, 1])
                .init(device),
            pool2: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),

            conv3: Conv2dConfig::new([64, 128], [3, 3])
                .with_stride([1, 1])
                .init(device),
            pool3: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),

            dropout1: DropoutConfig::new(self.dropout_flatten).init(),
            fc1: LinearConfig::new(d, self.hidden_units).init(device),
            dropout2: DropoutConfig::new(self.dropout_hidden).init(),
            fc2: LinearConfig::new(self.hidden_units, self.num_classes).init(device),

            activation: Relu::new(),
        })
    }
}

/// ECG画像分類用CNNモデル
///
/// # アーキテクチャ
/// - {Conv 3x3 (valid, stride 1) + ReLU + MaxPool 2x2} x 3層
/// - Flatten
/// - Dropout(0.5) -> FC: d -> 128 + ReLU
/// - Dropout(0.3) -> FC: 128 -> 2
/// - Softmax (`forward_probabilities`)
///
/// 入力は NHWC `[batch, 224, 224, 3]` で受け取り、内部で NCHW に並べ替えます。
#[derive(Module, Debug)]
pub struct EcgClassifier<B: Backend> {
    conv1: Conv2d<B>, // 3 -> 32
    pool1: MaxPool2d,
    conv2: Conv2d<B>, // 32 -> 64
    pool2: MaxPool2d,
    conv3: Conv2d<B>, // 64 -> 128
    pool3: MaxPool2d,

    dropout1: Dropout,
    fc1: Linear<B>, // d -> 128
    dropout2: Dropout,
    fc2: Linear<B>, // 128 -> 2

    activation: Relu,
}

impl<B: Backend> EcgClassifier<B> {
    /// 順伝播
    ///
    /// # 引数
    /// - `images`: バッチ画像 [batch_size, height, width, 3]
    ///
    /// # 戻り値
    /// - クラスごとのロジット [batch_size, num_classes]
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let [batch_size, _, _, _] = images.dims();

        // NHWC -> NCHW
        let x = images.swap_dims(2, 3).swap_dims(1, 2);

        let x = self.conv1.forward(x);
        let x = self.activation.forward(x);
        let x = self.pool1.forward(x);

        let x = self.conv2.forward(x);
        let x = self.activation.forward(x);
        let x = self.pool2.forward(x);

        let x = self.conv3.forward(x);
        let x = self.activation.forward(x);
        let x = self.pool3.forward(x);

        // NCHW -> NHWC に戻してから Flatten（チャネル最後の並び）
        let x = x.swap_dims(1, 2).swap_dims(2, 3);
        let [_, h, w, c] = x.dims();
        let x = x.reshape([batch_size, h * w * c]);

        let x = self.dropout1.forward(x);
        let x = self.fc1.forward(x);
        let x = self.activation.forward(x);

        let x = self.dropout2.forward(x);
        self.fc2.forward(x)
    }

    /// 順伝播 + Softmax
    ///
    /// 戻り値の各行は合計1の確率ベクトル
    pub fn forward_probabilities(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        softmax(self.forward(images), 1)
    }

    /// 順伝播と損失計算
    ///
    /// `targets` はクラスインデックス（カテゴリカル交差エントロピー）
    pub fn forward_classification(
        &self,
        images: Tensor<B, 4>,
        targets: Tensor<B, 1, Int>,
    ) -> ClassificationOutput<B> {
        let output = self.forward(images);
        let loss = CrossEntropyLossConfig::new()
            .init(&output.device())
            .forward(output.clone(), targets.clone());

        ClassificationOutput::new(loss, output, targets)
    }
}

/// 損失関数の種類
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LossKind {
    CategoricalCrossEntropy,
}

/// 記録する評価指標
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Accuracy,
}

/// コンパイル設定（最適化手法・損失・指標）
///
/// 学習は行わないため、保持するだけで使われるのは `forward_classification` の損失のみ。
#[derive(Debug, Clone, PartialEq)]
pub struct CompileOptions {
    /// Adamの学習率
    pub learning_rate: f64,
    pub loss: LossKind,
    pub metrics: Vec<MetricKind>,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            learning_rate: 1e-3,
            loss: LossKind::CategoricalCrossEntropy,
            metrics: vec![MetricKind::Accuracy],
        }
    }
}

impl CompileOptions {
    /// Adamオプティマイザを生成（学習率はステップ時に `learning_rate` を渡す）
    pub fn optimizer<AB: AutodiffBackend>(&self) -> impl Optimizer<EcgClassifier<AB>, AB> {
        AdamConfig::new().init::<AB, EcgClassifier<AB>>()
    }
}

/// コンパイル済みモデル
#[derive(Debug)]
pub struct CompiledModel<B: Backend> {
    network: EcgClassifier<B>,
    config: ModelConfig,
    options: CompileOptions,
    image_size: usize,
}

impl<B: Backend> CompiledModel<B> {
    pub fn network(&self) -> &EcgClassifier<B> {
        &self.network
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn options(&self) -> &CompileOptions {
        &self.options
    }

    pub fn learning_rate(&self) -> f64 {
        self.options.learning_rate
    }

    pub fn loss_kind(&self) -> LossKind {
        self.options.loss
    }

    pub fn metrics(&self) -> &[MetricKind] {
        &self.options.metrics
    }

    /// 入力画像の一辺
    pub fn image_size(&self) -> usize {
        self.image_size
    }

    /// 期待する入力形状 [1, H, W, C]
    pub fn input_shape(&self) -> [usize; 4] {
        [1, self.image_size, self.image_size, IMAGE_CHANNELS]
    }

    pub fn num_params(&self) -> usize {
        self.network.num_params()
    }

    /// ラベル付きバッチに対する損失
    pub fn loss(&self, images: Tensor<B, 4>, targets: Tensor<B, 1, Int>) -> Tensor<B, 1> {
        self.network.forward_classification(images, targets).loss
    }
}

/// 既定デバイス・既定設定でモデルを構築
pub fn build_model<B: Backend>() -> Result<CompiledModel<B>, ConstructionError> {
    let device = B::Device::default();
    build_model_on(&device, ModelConfig::new())
}

/// 指定デバイス・指定設定でモデルを構築
///
/// パラメータの確保まで行い、バックエンドの失敗は `ConstructionError` で返します。
pub fn build_model_on<B: Backend>(
    device: &B::Device,
    config: ModelConfig,
) -> Result<CompiledModel<B>, ConstructionError> {
    build_compiled(device, config, None, IMAGE_SIZE)
}

/// バックエンドの乱数シードを固定してからモデルを構築
///
/// シードはバックエンド全体で共有される点に注意。
pub fn build_model_seeded<B: Backend>(
    device: &B::Device,
    config: ModelConfig,
    seed: u64,
) -> Result<CompiledModel<B>, ConstructionError> {
    build_compiled(device, config, Some(seed), IMAGE_SIZE)
}

pub(crate) fn build_compiled<B: Backend>(
    device: &B::Device,
    config: ModelConfig,
    seed: Option<u64>,
    image_size: usize,
) -> Result<CompiledModel<B>, ConstructionError> {
    if config.num_classes == 0 || config.hidden_units == 0 {
        return Err(ConstructionError::Config(format!(
            "num_classes={} / hidden_units={} は1以上である必要があります",
            config.num_classes, config.hidden_units
        )));
    }
    for rate in [config.dropout_flatten, config.dropout_hidden] {
        if !(0.0..1.0).contains(&rate) {
            return Err(ConstructionError::Config(format!(
                "ドロップアウト率は [0, 1) の範囲である必要があります: {}",
                rate
            )));
        }
    }

    // パラメータは初回の順伝播で確保されるので、ゼロ入力で一度流して確定させる
    let network = panic::catch_unwind(AssertUnwindSafe(|| {
        if let Some(seed) = seed {
            debug!("バックエンドシードを設定: {}", seed);
            B::seed(device, seed);
        }
        let network = config.init_with_size::<B>(device, image_size)?;
        let warmup = Tensor::<B, 4>::zeros([1, image_size, image_size, IMAGE_CHANNELS], device);
        let _logits = network.forward(warmup);
        Ok::<_, ConstructionError>(network)
    }))
    .map_err(|payload| ConstructionError::Backend(panic_message(payload.as_ref())))??;

    let options = CompileOptions::default();

    info!(
        "モデルを構築しました: {} パラメータ, Adam(lr={}), {:?}, {:?}",
        network.num_params(),
        options.learning_rate,
        options.loss,
        options.metrics
    );

    Ok(CompiledModel {
        network,
        config,
        options,
        image_size,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use burn::backend::{Autodiff, NdArray};
    use std::sync::{Mutex, MutexGuard};

    type TestBackend = NdArray<f32>;

    /// NdArrayの乱数状態はプロセス共通なので、モデル構築を伴うテストは直列化する
    static BACKEND_LOCK: Mutex<()> = Mutex::new(());

    pub(crate) fn backend_lock() -> MutexGuard<'static, ()> {
        BACKEND_LOCK.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 32x32 用に構築したネットワークに 48x48 の入力形状を名乗らせたモデル
    ///
    /// 形状チェックは通るが、FC1 の行列積で次元が合わずバックエンドが panic する。
    pub(crate) fn model_with_broken_head(
        device: &<TestBackend as Backend>::Device,
    ) -> CompiledModel<TestBackend> {
        let model = build_compiled::<TestBackend>(device, ModelConfig::new(), None, 32).unwrap();
        CompiledModel {
            image_size: 48,
            ..model
        }
    }

    #[test]
    fn test_feature_map_size() {
        assert_eq!(feature_map_size(224), Some(26));
        assert_eq!(feature_map_size(48), Some(4));
        assert_eq!(feature_map_size(MIN_IMAGE_SIZE), Some(1));
        assert_eq!(feature_map_size(MIN_IMAGE_SIZE - 1), None);
        assert_eq!(feature_map_size(0), None);
    }

    #[test]
    fn test_default_config() {
        let config = ModelConfig::new();
        assert_eq!(config.num_classes, NUM_CLASSES);
        assert_eq!(config.hidden_units, 128);
        assert_eq!(config.dropout_flatten, 0.5);
        assert_eq!(config.dropout_hidden, 0.3);
    }

    #[test]
    fn test_compile_options() {
        let options = CompileOptions::default();
        assert_eq!(options.learning_rate, 0.001);
        assert_eq!(options.loss, LossKind::CategoricalCrossEntropy);
        assert_eq!(options.metrics, vec![MetricKind::Accuracy]);
    }

    #[test]
    fn test_too_small_input_is_construction_error() {
        let device = Default::default();
        let err = build_compiled::<TestBackend>(&device, ModelConfig::new(), None, 16).unwrap_err();
        assert!(matches!(err, ConstructionError::InputTooSmall { image_size: 16, .. }));
    }

    #[test]
    fn test_invalid_dropout_is_config_error() {
        let device = Default::default();
        let config = ModelConfig::new().with_dropout_flatten(1.5);
        let err = build_model_on::<TestBackend>(&device, config).unwrap_err();
        assert!(matches!(err, ConstructionError::Config(_)));
    }

    #[test]
    fn test_build_model_architecture() {
        let _guard = backend_lock();
        let model = build_model::<TestBackend>().unwrap();

        assert_eq!(model.input_shape(), [1, 224, 224, 3]);
        assert_eq!(model.learning_rate(), 0.001);
        assert_eq!(model.loss_kind(), LossKind::CategoricalCrossEntropy);
        assert_eq!(model.metrics(), &[MetricKind::Accuracy]);

        // conv: (3*3*3+1)*32 + (3*3*32+1)*64 + (3*3*64+1)*128
        // fc:   (128*26*26+1)*128 + (128+1)*2
        let expected = 896 + 18_496 + 73_856 + 11_075_712 + 258;
        assert_eq!(model.num_params(), expected);
    }

    #[test]
    fn test_build_allocates_parameters() {
        let _guard = backend_lock();
        let device = Default::default();
        let model = build_compiled::<TestBackend>(&device, ModelConfig::new(), None, 32).unwrap();
        let network = model.network();

        assert!(network.conv1.weight.is_initialized());
        assert!(network.conv3.weight.is_initialized());
        assert!(network.fc1.weight.is_initialized());
        assert!(network.fc2.weight.is_initialized());
        assert!(network.fc2.bias.as_ref().is_some_and(|b| b.is_initialized()));
    }

    #[test]
    fn test_build_model_on_allocates_full_size_parameters() {
        let _guard = backend_lock();
        let model = build_model_on::<TestBackend>(&Default::default(), ModelConfig::new()).unwrap();
        assert!(model.network().conv1.weight.is_initialized());
        assert!(model.network().fc1.weight.is_initialized());
    }

    #[test]
    fn test_forward_shapes_small_input() {
        let _guard = backend_lock();
        let device = Default::default();
        let model = build_compiled::<TestBackend>(&device, ModelConfig::new(), None, 32).unwrap();

        let images = Tensor::<TestBackend, 4>::ones([3, 32, 32, 3], &device);
        let probs = model.network().forward_probabilities(images);
        assert_eq!(probs.dims(), [3, 2]);

        let sums = probs.sum_dim(1).into_data().to_vec::<f32>().unwrap();
        for sum in sums {
            assert!((sum - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn test_loss_is_finite() {
        let _guard = backend_lock();
        let device = Default::default();
        let model = build_compiled::<TestBackend>(&device, ModelConfig::new(), None, 32).unwrap();

        let images = Tensor::<TestBackend, 4>::zeros([2, 32, 32, 3], &device);
        let targets = Tensor::<TestBackend, 1, Int>::from_ints([0, 1], &device);
        let loss = model.loss(images, targets).into_scalar();
        assert!(loss.is_finite());
        assert!(loss >= 0.0);
    }

    #[test]
    fn test_optimizer_for_autodiff_backend() {
        let _guard = backend_lock();
        let options = CompileOptions::default();
        let _optim = options.optimizer::<Autodiff<TestBackend>>();
    }
}
