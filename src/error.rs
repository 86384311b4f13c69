use thiserror::Error;

use crate::telegram::TelegramError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Config error: {0}")]
    Config(String),
    #[error("Telegram error: {0}")]
    Telegram(#[from] TelegramError),
    #[error("Serial error: {0}")]
    Serial(String),
    #[error("MQTT error: {0}")]
    Mqtt(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, AppError>;
