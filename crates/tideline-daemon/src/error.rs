//! Error types for tidelined

use thiserror::Error;
use tideline_engine::{ApiError, EngineError, LockError, QueueError};

/// Daemon-level errors
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Server startup error
    #[error("Server error: {0}")]
    Server(String),

    /// Broker setup error
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    /// Lock store setup error
    #[error("Lock store error: {0}")]
    Lock(#[from] LockError),

    /// Resource API client error
    #[error("API client error: {0}")]
    Api(#[from] ApiError),

    /// Reconciler startup error
    #[error("Reconciler error: {0}")]
    Engine(#[from] EngineError),

    /// Webhook client error
    #[error("Hook client error: {0}")]
    Hook(#[from] reqwest::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for DaemonError {
    fn from(err: config::ConfigError) -> Self {
        DaemonError::Config(err.to_string())
    }
}

/// Result type alias for daemon operations
pub type DaemonResult<T> = Result<T, DaemonError>;
