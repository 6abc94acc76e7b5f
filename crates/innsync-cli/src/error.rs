use std::io;

use innsync_core::config::ConfigError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Core(#[from] innsync_core::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("Invalid {what} `{value}`")]
    InvalidId { what: &'static str, value: String },
    #[error("{0} not found")]
    NotFound(String),
    #[error("Property `{0}` is not listed in INNSYNC_PROPERTIES; pass --external-property")]
    UnknownProperty(String),
    #[error("Sync for {0} is already running")]
    AlreadyRunning(String),
    #[error("Run cannot be cancelled: {0}")]
    NotCancellable(String),
    #[error("Sync run failed: {0}")]
    RunFailed(String),
    #[error("Replay did not deliver: {0}")]
    ReplayFailed(String),
}
