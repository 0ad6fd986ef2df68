//! 解析レポート
//!
//! 推論結果（2クラスの確率）と、画像とは無関係に乱数で生成した
//! シミュレーション特徴量をまとめて表示用に整形します。

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::ml::Prediction;

/// 心拍数の生成範囲（bpm）
pub const HEART_RATE_RANGE: std::ops::RangeInclusive<u32> = 60..=120;

/// シミュレーション特徴量
///
/// 画像からもモデル出力からも導出していない乱数値。表示時は必ず明示する。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulatedFeatures {
    /// 常に true（JSON出力でも識別できるように保持）
    pub simulated: bool,
    pub st_elevation: bool,
    pub q_wave_changes: bool,
    pub t_wave_inversion: bool,
    pub heart_rate_bpm: u32,
}

impl SimulatedFeatures {
    pub fn generate<R: Rng + ?Sized>(rng: &mut R) -> Self {
        Self {
            simulated: true,
            st_elevation: rng.gen_bool(0.5),
            q_wave_changes: rng.gen_bool(0.5),
            t_wave_inversion: rng.gen_bool(0.5),
            heart_rate_bpm: rng.gen_range(HEART_RATE_RANGE),
        }
    }
}

/// 解析レポート
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisReport {
    /// 解析元（ファイルパスなど）
    pub source: Option<String>,
    pub prediction: Prediction,
    /// STEMI判定（クラス1の確率がしきい値を超える）
    pub stemi_detected: bool,
    pub label: String,
    /// 判定ラベル側の確率（%）
    pub confidence_percent: f32,
    pub threshold: f32,
    /// RFC3339形式の解析時刻
    pub analyzed_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub simulated_features: Option<SimulatedFeatures>,
}

impl AnalysisReport {
    pub fn new(
        prediction: Prediction,
        threshold: f32,
        simulated_features: Option<SimulatedFeatures>,
    ) -> Self {
        let stemi_detected = prediction.is_stemi(threshold);
        let (label, probability) = if stemi_detected {
            ("STEMI Detected", prediction.stemi)
        } else {
            ("No STEMI Detected", prediction.no_stemi)
        };

        Self {
            source: None,
            prediction,
            stemi_detected,
            label: label.to_string(),
            confidence_percent: probability * 100.0,
            threshold,
            analyzed_at: chrono::Local::now().to_rfc3339(),
            simulated_features,
        }
    }

    pub fn with_source<S: Into<String>>(mut self, source: S) -> Self {
        self.source = Some(source.into());
        self
    }

    /// JSON 1行
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// テキスト形式
    pub fn render_text(&self) -> String {
        let mut lines = Vec::new();
        lines.push("=== ECG解析結果 ===".to_string());
        if let Some(ref source) = self.source {
            lines.push(format!("画像: {}", source));
        }
        lines.push(format!(
            "判定: {} (信頼度 {:.1}%)",
            self.label, self.confidence_percent
        ));
        lines.push(format!(
            "確率: No STEMI {:.4} / STEMI {:.4} (しきい値 {:.2})",
            self.prediction.no_stemi, self.prediction.stemi, self.threshold
        ));

        if let Some(ref features) = self.simulated_features {
            lines.push("--- ECG特徴量 [シミュレーション: 画像から導出していません] ---".to_string());
            lines.push(format!("ST上昇: {}", yes_no(features.st_elevation)));
            lines.push(format!("Q波変化: {}", yes_no(features.q_wave_changes)));
            lines.push(format!("T波逆転: {}", yes_no(features.t_wave_inversion)));
            lines.push(format!("心拍数: {} bpm", features.heart_rate_bpm));
        }

        lines.push("※ 未学習モデルによるデモ出力です。診断には使用できません。".to_string());
        lines.push(format!("解析時刻: {}", self.analyzed_at));
        lines.join("\n")
    }
}

fn yes_no(value: bool) -> &'static str {
    if value { "あり" } else { "なし" }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn prediction(p1: f32) -> Prediction {
        Prediction::from_probabilities(&[1.0 - p1, p1]).unwrap()
    }

    #[test]
    fn test_simulated_features_are_labelled_and_in_range() {
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..100 {
            let features = SimulatedFeatures::generate(&mut rng);
            assert!(features.simulated);
            assert!(HEART_RATE_RANGE.contains(&features.heart_rate_bpm));
        }
    }

    #[test]
    fn test_simulated_features_seeded_reproducible() {
        let a = SimulatedFeatures::generate(&mut StdRng::seed_from_u64(3));
        let b = SimulatedFeatures::generate(&mut StdRng::seed_from_u64(3));
        assert_eq!(a, b);
    }

    #[test]
    fn test_report_threshold() {
        let report = AnalysisReport::new(prediction(0.8), 0.5, None);
        assert!(report.stemi_detected);
        assert_eq!(report.label, "STEMI Detected");
        assert!((report.confidence_percent - 80.0).abs() < 1e-3);

        let report = AnalysisReport::new(prediction(0.8), 0.9, None);
        assert!(!report.stemi_detected);
        assert_eq!(report.label, "No STEMI Detected");
        assert!((report.confidence_percent - 20.0).abs() < 1e-3);
    }

    #[test]
    fn test_render_text_marks_simulation() {
        let features = SimulatedFeatures {
            simulated: true,
            st_elevation: true,
            q_wave_changes: false,
            t_wave_inversion: false,
            heart_rate_bpm: 72,
        };
        let text = AnalysisReport::new(prediction(0.3), 0.5, Some(features))
            .with_source("ecg.png")
            .render_text();

        assert!(text.contains("画像: ecg.png"));
        assert!(text.contains("No STEMI Detected"));
        assert!(text.contains("シミュレーション"));
        assert!(text.contains("心拍数: 72 bpm"));
    }

    #[test]
    fn test_render_text_without_features() {
        let text = AnalysisReport::new(prediction(0.6), 0.5, None).render_text();
        assert!(!text.contains("シミュレーション"));
        assert!(text.contains("STEMI Detected"));
    }

    #[test]
    fn test_json_output() {
        let report = AnalysisReport::new(prediction(0.25), 0.5, None);
        let json = report.to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["stemi_detected"], false);
        assert!(value.get("simulated_features").is_none());

        let report = AnalysisReport::new(
            prediction(0.25),
            0.5,
            Some(SimulatedFeatures::generate(&mut StdRng::seed_from_u64(1))),
        );
        let value: serde_json::Value = serde_json::from_str(&report.to_json().unwrap()).unwrap();
        assert_eq!(value["simulated_features"]["simulated"], true);
    }
}
