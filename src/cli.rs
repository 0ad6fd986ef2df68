//! コマンドライン実行
//!
//! 1つのモデルを構築し、指定された画像を順番に解析してレポートを出力します。
//! 画像ごとの失敗は報告して次へ進み、モデル構築の失敗は起動中止とします。

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use burn::tensor::backend::Backend;
use clap::Parser;
use log::{error, info};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::ml::InferenceEngine;
use crate::model::{AppConfig, DeviceType};
use crate::session::AnalysisSession;

/// 全画像の解析に成功
pub const EXIT_OK: u8 = 0;
/// 一部の画像で解析に失敗
pub const EXIT_ANALYSIS_FAILED: u8 = 1;
/// モデル構築失敗（起動中止）
pub const EXIT_CONSTRUCTION_FAILED: u8 = 2;

/// ECG画像のSTEMI判定デモ（未学習CNN）
#[derive(Debug, Parser)]
#[command(name = "stemi_analyzer", version, about)]
pub struct Cli {
    /// 解析する画像ファイル
    #[arg(required = true)]
    pub images: Vec<PathBuf>,

    /// 設定ファイル（JSON）。存在しない場合はデフォルト設定
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// モデル構築前にバックエンドの乱数シードを固定
    #[arg(long)]
    pub seed: Option<u64>,

    /// レポートをJSON（1行1件）で出力
    #[arg(long)]
    pub json: bool,

    /// シミュレーション特徴量を出力しない
    #[arg(long)]
    pub no_simulated_features: bool,

    /// STEMI判定しきい値（クラス1の確率）
    #[arg(long)]
    pub threshold: Option<f32>,

    /// 計算デバイス（cpu | wgpu）
    #[arg(long)]
    pub device: Option<DeviceType>,
}

impl Cli {
    pub fn config_path(&self) -> PathBuf {
        self.config.clone().unwrap_or_else(AppConfig::default_path)
    }

    /// 設定ファイルの値にコマンドライン引数を上書き
    pub fn apply_overrides(&self, config: &mut AppConfig) -> anyhow::Result<()> {
        if let Some(seed) = self.seed {
            config.model.seed = Some(seed);
        }
        if let Some(threshold) = self.threshold {
            config.report.stemi_threshold = threshold;
        }
        if let Some(device) = self.device {
            config.device_type = device;
        }
        if self.no_simulated_features {
            config.report.include_simulated_features = false;
        }
        config.validate().context("Invalid command line options")
    }
}

/// 実行エントリポイント
pub fn run() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();
    ExitCode::from(run_with(&cli))
}

/// 引数を解析済みの状態から実行し、終了コードを返す
pub fn run_with(cli: &Cli) -> u8 {
    let config_path = cli.config_path();
    let mut config = AppConfig::load_or_default_from(&config_path);
    if let Err(e) = cli.apply_overrides(&mut config) {
        error!("{:#}", e);
        return EXIT_CONSTRUCTION_FAILED;
    }
    config.display();

    match config.device_type {
        DeviceType::Cpu => {
            let device = burn_ndarray::NdArrayDevice::Cpu;
            run_on_backend::<burn_ndarray::NdArray<f32>>(cli, &config, device)
        }
        #[cfg(feature = "gpu")]
        DeviceType::Wgpu => {
            let device = burn_wgpu::WgpuDevice::default();
            run_on_backend::<burn::backend::Wgpu>(cli, &config, device)
        }
        #[cfg(not(feature = "gpu"))]
        DeviceType::Wgpu => {
            let e = crate::error::ConstructionError::Backend(
                "WGPUバックエンドは無効です（`gpu` フィーチャを有効にしてビルドしてください）".to_string(),
            );
            error!("モデルの構築に失敗しました: {}", e);
            EXIT_CONSTRUCTION_FAILED
        }
    }
}

fn run_on_backend<B: Backend>(cli: &Cli, config: &AppConfig, device: B::Device) -> u8 {
    let engine = match InferenceEngine::<B>::build(
        device,
        config.model.to_model_config(),
        config.model.seed,
    ) {
        Ok(engine) => engine,
        Err(e) => {
            error!("モデルの構築に失敗しました: {}", e);
            return EXIT_CONSTRUCTION_FAILED;
        }
    };

    let rng = match config.model.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let mut session = AnalysisSession::with_rng(engine, config.report.clone(), rng);

    let mut failures = 0usize;
    for path in &cli.images {
        let result = session.load_image_file(path).map(|_| ());
        let result = result.and_then(|()| session.analyze().cloned());

        match result {
            Ok(report) => {
                if cli.json {
                    match report.to_json() {
                        Ok(line) => println!("{}", line),
                        Err(e) => {
                            error!("JSON出力に失敗しました: {}", e);
                            failures += 1;
                        }
                    }
                } else {
                    println!("{}\n", report.render_text());
                }
            }
            Err(e) => {
                failures += 1;
                eprintln!("解析できませんでした: {}: {}", path.display(), e);
            }
        }
    }

    info!(
        "{} 件中 {} 件の解析に成功しました",
        cli.images.len(),
        cli.images.len() - failures
    );

    if failures == 0 {
        EXIT_OK
    } else {
        EXIT_ANALYSIS_FAILED
    }
}
