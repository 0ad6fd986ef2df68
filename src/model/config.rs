//! アプリケーション設定管理モジュール
//!
//! 計算デバイスやモデル・レポート設定をJSON形式で読み込みます。
//! 実行中の状態は書き戻しません。

use anyhow::Context;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::ml::ModelConfig;

/// 計算デバイスの種類
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    /// NdArray (CPU) バックエンド
    #[default]
    Cpu,
    /// WGPU (GPU) バックエンド（`gpu` フィーチャが必要）
    Wgpu,
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceType::Wgpu => write!(f, "WGPU (GPU)"),
            DeviceType::Cpu => write!(f, "CPU (NdArray)"),
        }
    }
}

impl std::str::FromStr for DeviceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cpu" | "ndarray" => Ok(DeviceType::Cpu),
            "wgpu" | "gpu" => Ok(DeviceType::Wgpu),
            other => Err(format!("不明なデバイス: {} (cpu | wgpu)", other)),
        }
    }
}

/// モデル設定
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ModelSettings {
    /// 乱数シード（未指定なら毎回異なる初期重み）
    pub seed: Option<u64>,
    /// Flatten直後のドロップアウト率
    pub dropout_flatten: f64,
    /// 隠れ層後のドロップアウト率
    pub dropout_hidden: f64,
    /// 全結合層のユニット数
    pub hidden_units: usize,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            seed: None,
            dropout_flatten: 0.5,
            dropout_hidden: 0.3,
            hidden_units: 128,
        }
    }
}

impl ModelSettings {
    /// モデル構築用の設定に変換（入力サイズとクラス数は固定）
    pub fn to_model_config(&self) -> ModelConfig {
        ModelConfig::new()
            .with_hidden_units(self.hidden_units)
            .with_dropout_flatten(self.dropout_flatten)
            .with_dropout_hidden(self.dropout_hidden)
    }
}

/// レポート設定
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReportSettings {
    /// STEMI判定のしきい値（クラス1の確率）
    pub stemi_threshold: f32,
    /// シミュレーション特徴量をレポートに含めるか
    pub include_simulated_features: bool,
}

impl Default for ReportSettings {
    fn default() -> Self {
        Self {
            stemi_threshold: 0.5,
            include_simulated_features: true,
        }
    }
}

/// アプリケーション設定
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    /// 計算デバイスの種類
    pub device_type: DeviceType,
    /// モデル設定
    pub model: ModelSettings,
    /// レポート設定
    pub report: ReportSettings,
}

impl AppConfig {
    /// 設定ファイルのデフォルトパス
    pub fn default_path() -> PathBuf {
        PathBuf::from("stemi_config.json")
    }

    /// 設定を読み込む
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;
        let config: AppConfig = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// 指定パスから設定を読み込む、存在しない・壊れている場合はデフォルト設定を返す
    pub fn load_or_default_from<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        if path.exists() {
            match Self::load(path) {
                Ok(config) => {
                    info!("設定ファイルを読み込みました: {}", path.display());
                    config
                }
                Err(e) => {
                    warn!(
                        "設定ファイルの読み込みに失敗しました ({}): {:#}。デフォルト設定を使用します",
                        path.display(),
                        e
                    );
                    Self::default()
                }
            }
        } else {
            info!("設定ファイルが存在しません。デフォルト設定を使用します");
            Self::default()
        }
    }

    /// デフォルトパスから設定を読み込む
    pub fn load_or_default() -> Self {
        Self::load_or_default_from(Self::default_path())
    }

    /// 値の範囲チェック
    pub fn validate(&self) -> anyhow::Result<()> {
        if !(0.0..=1.0).contains(&self.report.stemi_threshold) {
            anyhow::bail!(
                "stemi_threshold は [0, 1] の範囲である必要があります: {}",
                self.report.stemi_threshold
            );
        }
        Ok(())
    }

    /// 設定情報をログに出力
    pub fn display(&self) {
        info!("=== アプリケーション設定 ===");
        info!("計算デバイス: {}", self.device_type);
        match self.model.seed {
            Some(seed) => info!("乱数シード: {}", seed),
            None => info!("乱数シード: なし"),
        }
        info!(
            "ドロップアウト率: {} / {}",
            self.model.dropout_flatten, self.model.dropout_hidden
        );
        info!("隠れ層ユニット数: {}", self.model.hidden_units);
        info!("STEMIしきい値: {}", self.report.stemi_threshold);
        info!("シミュレーション特徴量: {}", self.report.include_simulated_features);
    }
}
