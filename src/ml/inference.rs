//! モデル推論機能

use std::panic::{self, AssertUnwindSafe};

use burn::tensor::{backend::Backend, Tensor, TensorData};
use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::{panic_message, ConstructionError, InferenceError};
use crate::ml::ml_model::{build_compiled, CompiledModel, ModelConfig, CLASS_NAMES, IMAGE_SIZE};
use crate::ml::preprocess::{preprocess_with_size, InputTensor};
use crate::ml::tensor_registry::TensorRegistry;

/// 許容誤差（確率の合計チェック用）
const PROBABILITY_TOLERANCE: f32 = 1e-4;

/// 推論結果（2クラスの確率）
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    /// クラス0: 異常なし
    pub no_stemi: f32,
    /// クラス1: STEMI
    pub stemi: f32,
}

impl Prediction {
    /// softmax出力から作成（値の範囲と合計を検証）
    pub fn from_probabilities(probabilities: &[f32]) -> Result<Self, InferenceError> {
        let [no_stemi, stemi] = probabilities else {
            return Err(InferenceError::InvalidOutput(format!(
                "2クラスの出力を期待しましたが {} 個でした",
                probabilities.len()
            )));
        };
        let (no_stemi, stemi) = (*no_stemi, *stemi);

        for p in [no_stemi, stemi] {
            if !p.is_finite() || !(0.0..=1.0).contains(&p) {
                return Err(InferenceError::InvalidOutput(format!("確率が範囲外です: {}", p)));
            }
        }
        let sum = no_stemi + stemi;
        if (sum - 1.0).abs() > PROBABILITY_TOLERANCE {
            return Err(InferenceError::InvalidOutput(format!("確率の合計が1ではありません: {}", sum)));
        }

        Ok(Self { no_stemi, stemi })
    }

    /// (p0, p1)
    pub fn as_pair(&self) -> (f32, f32) {
        (self.no_stemi, self.stemi)
    }

    /// 確率が高いほうのクラスID
    pub fn predicted_class(&self) -> usize {
        if self.stemi > self.no_stemi { 1 } else { 0 }
    }

    pub fn predicted_label(&self) -> &'static str {
        CLASS_NAMES[self.predicted_class()]
    }

    /// 予測クラスの確率
    pub fn confidence(&self) -> f32 {
        self.no_stemi.max(self.stemi)
    }

    /// STEMI確率がしきい値を超えるか
    pub fn is_stemi(&self, threshold: f32) -> bool {
        self.stemi > threshold
    }
}

/// 推論エンジン
///
/// モデルはここで所有し、推論中に変更されることはありません。
pub struct InferenceEngine<B: Backend> {
    model: CompiledModel<B>,
    device: B::Device,
    registry: TensorRegistry,
}

impl<B: Backend> InferenceEngine<B> {
    /// 構築済みモデルから推論エンジンを作成
    pub fn new(model: CompiledModel<B>, device: B::Device) -> Self {
        Self {
            model,
            device,
            registry: TensorRegistry::new(),
        }
    }

    /// モデルを構築して推論エンジンを初期化
    ///
    /// `seed` を指定するとバックエンドの乱数を固定してから構築します。
    pub fn build(
        device: B::Device,
        config: ModelConfig,
        seed: Option<u64>,
    ) -> Result<Self, ConstructionError> {
        let model = build_compiled::<B>(&device, config, seed, IMAGE_SIZE)?;
        Ok(Self::new(model, device))
    }

    pub fn model(&self) -> &CompiledModel<B> {
        &self.model
    }

    pub fn device(&self) -> &B::Device {
        &self.device
    }

    /// 生存中のバックエンドテンソル数
    pub fn live_tensors(&self) -> usize {
        self.registry.live()
    }

    /// 画像バイト列をこのモデルの入力サイズで前処理
    pub fn preprocess(&self, image_bytes: &[u8]) -> Result<InputTensor, InferenceError> {
        preprocess_with_size(image_bytes, self.model.image_size())
    }

    /// 単一テンソルを推論
    ///
    /// 入力テンソルは消費されます。バックエンド側の入力・出力テンソルは
    /// 確率を読み出した直後に、エラー時も含めて解放されます。
    pub fn predict(&self, tensor: InputTensor) -> Result<Prediction, InferenceError> {
        let shape = tensor.shape();
        let values = tensor.to_vec();
        drop(tensor);

        let input = self.registry.lease(Tensor::<B, 4>::from_data(
            TensorData::new(values, shape),
            &self.device,
        ));

        let expected = self.model.input_shape();
        let actual = input.dims();
        if actual != expected {
            return Err(InferenceError::ShapeMismatch {
                expected,
                actual: actual.to_vec(),
            });
        }

        // 順伝播と読み出しでのバックエンド失敗はここで回収する
        let probabilities = panic::catch_unwind(AssertUnwindSafe(|| {
            let output = self
                .registry
                .lease(self.model.network().forward_probabilities(input.into_inner()));
            output.to_data().to_vec::<f32>()
        }))
        .map_err(|payload| InferenceError::Backend(panic_message(payload.as_ref())))?
        .map_err(|e| InferenceError::TensorData(format!("{:?}", e)))?;

        let prediction = Prediction::from_probabilities(&probabilities)?;
        debug!(
            "推論結果: p0={:.4}, p1={:.4} (live tensors: {})",
            prediction.no_stemi,
            prediction.stemi,
            self.registry.live()
        );
        Ok(prediction)
    }

    /// 画像バイト列を前処理して推論
    pub fn classify_bytes(&self, image_bytes: &[u8]) -> Result<Prediction, InferenceError> {
        let tensor = self.preprocess(image_bytes)?;
        self.predict(tensor)
    }
}

/// `predict(model, tensor)` 形式の関数版
pub fn predict<B: Backend>(
    engine: &InferenceEngine<B>,
    tensor: InputTensor,
) -> Result<(f32, f32), InferenceError> {
    engine.predict(tensor).map(|p| p.as_pair())
}
