//! Error types for innsync-core

use thiserror::Error;

use crate::channel::ChannelError;

/// Result type alias using innsync-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in innsync-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("Database error: {0}")]
    Database(String),

    /// libSQL error
    #[error("libSQL error: {0}")]
    LibSql(#[from] libsql::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Record not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Malformed or incomplete entity data from either side
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Channel manager API error
    #[error(transparent)]
    Channel(#[from] ChannelError),

    /// A uniqueness rule rejected the write
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Optimistic compare-and-set lost against a concurrent writer
    #[error("Concurrent write detected for {0}")]
    StaleWrite(String),

    /// A sync lock for the pair is held by another worker
    #[error("Sync lock unavailable: {0}")]
    LockUnavailable(String),

    /// PMS collaborator error
    #[error("PMS error: {0}")]
    Pms(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Whether the failure only affects the current item and the run may continue.
    pub fn is_item_scoped(&self) -> bool {
        match self {
            Self::Validation(_) | Self::NotFound(_) | Self::StaleWrite(_) | Self::Pms(_) => true,
            Self::Channel(error) => !error.aborts_run(),
            _ => false,
        }
    }

    /// Whether this is a unique-constraint violation raised by the store.
    pub fn is_unique_violation(&self) -> bool {
        match self {
            Self::LibSql(error) => error.to_string().contains("UNIQUE constraint failed"),
            Self::Database(message) => message.contains("UNIQUE constraint failed"),
            _ => false,
        }
    }
}
