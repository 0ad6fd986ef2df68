//! 画像の前処理
//!
//! 任意サイズ・任意形式の画像を (1, 224, 224, 3) の入力テンソルに変換します。
//! - 最近傍補間で 224x224 にリサイズ
//! - RGB8 に変換（アルファは破棄、グレースケールは複製）
//! - 各チャネル値を 255.0 で割って [0, 1] に正規化

use image::{imageops::FilterType, DynamicImage, GenericImageView};
use ndarray::Array4;

use crate::error::InferenceError;
use crate::ml::ml_model::{IMAGE_CHANNELS, IMAGE_SIZE};

/// 入力テンソル（ホスト側）
///
/// 形状は NHWC。`predict` に渡すと消費され、バッファは必ず解放されます。
#[derive(Debug, Clone, PartialEq)]
pub struct InputTensor {
    data: Array4<f32>,
}

impl InputTensor {
    /// 任意の配列から作成（形状の検証は推論時に行う）
    pub fn from_array(data: Array4<f32>) -> Self {
        Self { data }
    }

    pub fn shape(&self) -> [usize; 4] {
        let dim = self.data.dim();
        [dim.0, dim.1, dim.2, dim.3]
    }

    pub fn as_array(&self) -> &Array4<f32> {
        &self.data
    }

    /// 論理順（行優先）に平坦化した値
    pub fn to_vec(&self) -> Vec<f32> {
        self.data.iter().copied().collect()
    }

    pub fn into_array(self) -> Array4<f32> {
        self.data
    }
}

/// 画像バイト列を前処理
pub fn preprocess(image_bytes: &[u8]) -> Result<InputTensor, InferenceError> {
    if image_bytes.is_empty() {
        return Err(InferenceError::EmptyInput);
    }
    let image = image::load_from_memory(image_bytes)?;
    preprocess_image(&image)
}

/// 指定サイズで画像バイト列を前処理
pub(crate) fn preprocess_with_size(image_bytes: &[u8], size: usize) -> Result<InputTensor, InferenceError> {
    if image_bytes.is_empty() {
        return Err(InferenceError::EmptyInput);
    }
    let image = image::load_from_memory(image_bytes)?;
    preprocess_image_with_size(&image, size)
}

/// デコード済み画像を前処理
pub fn preprocess_image(image: &DynamicImage) -> Result<InputTensor, InferenceError> {
    preprocess_image_with_size(image, IMAGE_SIZE)
}

/// デコード済み画像を指定サイズで前処理
pub(crate) fn preprocess_image_with_size(
    image: &DynamicImage,
    size: usize,
) -> Result<InputTensor, InferenceError> {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return Err(InferenceError::EmptyImage { width, height });
    }

    let rgb = image.to_rgb8();
    let resized = image::imageops::resize(&rgb, size as u32, size as u32, FilterType::Nearest);

    let data = Array4::from_shape_fn((1, size, size, IMAGE_CHANNELS), |(_, y, x, c)| {
        resized.get_pixel(x as u32, y as u32)[c] as f32 / 255.0
    });

    Ok(InputTensor { data })
}
