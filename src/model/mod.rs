pub mod config;

pub use config::{AppConfig, DeviceType, ModelSettings, ReportSettings};
