//! 解析セッション
//!
//! 画像の読み込み（プレビュー）→ 解析 → レポートの流れを保持します。
//! モデルは `InferenceEngine` 経由で外から注入し、セッションは読み取り専用で使います。
//! 解析に失敗した場合は結果を「なし」に戻してエラーを返し、次の試行を受け付けます。

use std::path::Path;

use burn::tensor::backend::Backend;
use image::DynamicImage;
use log::{info, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::error::InferenceError;
use crate::ml::preprocess::preprocess_image_with_size;
use crate::ml::InferenceEngine;
use crate::model::ReportSettings;
use crate::report::{AnalysisReport, SimulatedFeatures};

/// 読み込んだ画像の情報
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImagePreview {
    pub source: Option<String>,
    pub width: u32,
    pub height: u32,
    /// 推定した画像形式（拡張子表記）
    pub format: Option<String>,
    pub byte_len: usize,
}

struct LoadedImage {
    preview: ImagePreview,
    image: DynamicImage,
}

/// 解析セッション
pub struct AnalysisSession<B: Backend> {
    engine: InferenceEngine<B>,
    settings: ReportSettings,
    rng: StdRng,
    loaded: Option<LoadedImage>,
    last_report: Option<AnalysisReport>,
}

impl<B: Backend> AnalysisSession<B> {
    pub fn new(engine: InferenceEngine<B>, settings: ReportSettings) -> Self {
        Self::with_rng(engine, settings, StdRng::from_entropy())
    }

    /// シミュレーション特徴量の乱数を固定したセッション
    pub fn with_rng(engine: InferenceEngine<B>, settings: ReportSettings, rng: StdRng) -> Self {
        Self {
            engine,
            settings,
            rng,
            loaded: None,
            last_report: None,
        }
    }

    pub fn engine(&self) -> &InferenceEngine<B> {
        &self.engine
    }

    pub fn settings(&self) -> &ReportSettings {
        &self.settings
    }

    pub fn settings_mut(&mut self) -> &mut ReportSettings {
        &mut self.settings
    }

    /// 画像をデコードしてプレビューとして保持
    ///
    /// 新しい画像を読み込むと前回の結果は破棄されます。
    pub fn load_image(
        &mut self,
        bytes: &[u8],
        source: Option<String>,
    ) -> Result<&ImagePreview, InferenceError> {
        self.loaded = None;
        self.last_report = None;

        if bytes.is_empty() {
            return Err(InferenceError::EmptyInput);
        }
        let format = image::guess_format(bytes)
            .ok()
            .and_then(|f| f.extensions_str().first().map(|ext| ext.to_string()));
        let image = image::load_from_memory(bytes)?;
        if image.width() == 0 || image.height() == 0 {
            return Err(InferenceError::EmptyImage {
                width: image.width(),
                height: image.height(),
            });
        }

        let preview = ImagePreview {
            source,
            width: image.width(),
            height: image.height(),
            format,
            byte_len: bytes.len(),
        };
        info!(
            "画像を読み込みました: {}x{} ({} bytes)",
            preview.width, preview.height, preview.byte_len
        );

        let loaded = self.loaded.insert(LoadedImage { preview, image });
        Ok(&loaded.preview)
    }

    /// ファイルから画像を読み込む
    pub fn load_image_file<P: AsRef<Path>>(&mut self, path: P) -> Result<&ImagePreview, InferenceError> {
        let path = path.as_ref();
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) => {
                self.clear();
                return Err(e.into());
            }
        };
        self.load_image(&bytes, Some(path.display().to_string()))
    }

    pub fn preview(&self) -> Option<&ImagePreview> {
        self.loaded.as_ref().map(|l| &l.preview)
    }

    /// 解析可能か（画像が読み込まれているか）
    pub fn can_analyze(&self) -> bool {
        self.loaded.is_some()
    }

    /// 読み込み済みの画像を解析
    ///
    /// 失敗時は結果をクリアしてエラーを返します（自動リトライはしない）。
    pub fn analyze(&mut self) -> Result<&AnalysisReport, InferenceError> {
        self.last_report = None;

        match self.run_analysis() {
            Ok(report) => {
                info!("解析完了: {} ({:.1}%)", report.label, report.confidence_percent);
                Ok(self.last_report.insert(report))
            }
            Err(e) => {
                warn!("解析に失敗しました: {}", e);
                Err(e)
            }
        }
    }

    fn run_analysis(&mut self) -> Result<AnalysisReport, InferenceError> {
        let loaded = self.loaded.as_ref().ok_or(InferenceError::NoImageLoaded)?;

        let size = self.engine.model().image_size();
        let tensor = preprocess_image_with_size(&loaded.image, size)?;
        let prediction = self.engine.predict(tensor)?;

        let features = self
            .settings
            .include_simulated_features
            .then(|| SimulatedFeatures::generate(&mut self.rng));

        let mut report = AnalysisReport::new(prediction, self.settings.stemi_threshold, features);
        report.source = loaded.preview.source.clone();
        Ok(report)
    }

    pub fn last_report(&self) -> Option<&AnalysisReport> {
        self.last_report.as_ref()
    }

    /// 画像と結果を破棄
    pub fn clear(&mut self) {
        self.loaded = None;
        self.last_report = None;
    }
}
