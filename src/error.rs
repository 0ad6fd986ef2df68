//! エラー定義
//!
//! - `ConstructionError`: モデル/バックエンドの初期化失敗（起動中止）
//! - `InferenceError`: 前処理・推論の失敗（呼び出し境界で回復可能）

use thiserror::Error;

/// モデル構築エラー
#[derive(Debug, Error)]
pub enum ConstructionError {
    #[error("入力サイズが小さすぎます: {image_size} (最小 {minimum}x{minimum} が必要)")]
    InputTooSmall { image_size: usize, minimum: usize },

    #[error("バックエンドの初期化に失敗しました: {0}")]
    Backend(String),

    #[error("設定エラー: {0}")]
    Config(String),
}

/// 推論エラー
#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("画像データが空です")]
    EmptyInput,

    #[error("画像のデコードに失敗しました: {0}")]
    Decode(#[from] image::ImageError),

    #[error("画像サイズが不正です: {width}x{height}")]
    EmptyImage { width: u32, height: u32 },

    #[error("画像ファイルの読み込みに失敗しました: {0}")]
    Io(#[from] std::io::Error),

    #[error("入力テンソルの形状が不正です: {actual:?} (期待: {expected:?})")]
    ShapeMismatch {
        expected: [usize; 4],
        actual: Vec<usize>,
    },

    #[error("推論中にバックエンドが失敗しました: {0}")]
    Backend(String),

    #[error("推論結果の取得エラー: {0}")]
    TensorData(String),

    #[error("推論結果が不正です: {0}")]
    InvalidOutput(String),

    #[error("解析対象の画像が読み込まれていません")]
    NoImageLoaded,
}

/// `catch_unwind` で捕まえた panic の内容を文字列化
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown backend panic".to_string()
    }
}
