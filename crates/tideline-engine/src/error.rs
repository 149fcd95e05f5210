//! Error types for tideline-engine

use thiserror::Error;
use tideline_types::NotificationError;

/// Lock store errors
#[derive(Debug, Error)]
pub enum LockError {
    /// Store could not be reached
    #[error("Lock store unavailable: {0}")]
    Unavailable(String),

    /// Store rejected the operation
    #[error("Lock store query failed: {0}")]
    Query(String),
}

/// Message broker errors
#[derive(Debug, Error)]
pub enum QueueError {
    /// Broker could not be reached
    #[error("Broker connection error: {0}")]
    Connection(String),

    /// No stream with this name
    #[error("Stream not found: {0}")]
    StreamNotFound(String),

    /// No durable consumer with this name
    #[error("Consumer not found: {0}")]
    ConsumerNotFound(String),

    /// No stream accepts this subject
    #[error("No stream bound to subject {0}")]
    NoStreamForSubject(String),

    /// Publishing failed
    #[error("Failed to publish to {subject}: {cause}")]
    Publish { subject: String, cause: String },

    /// Pulling failed
    #[error("Failed to pull from {consumer}: {cause}")]
    Pull { consumer: String, cause: String },

    /// Ack or nak failed
    #[error("Failed to acknowledge message {message_id}: {cause}")]
    Acknowledge { message_id: String, cause: String },

    /// Subscription already closed
    #[error("Subscription closed")]
    Closed,
}

/// API client errors
#[derive(Debug, Error)]
pub enum ApiError {
    /// Record does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Transport error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Non-success response
    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    /// Response or request body could not be (de)serialized
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ApiError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ApiError::NotFound(_))
    }
}

/// Event recording errors
#[derive(Debug, Error)]
pub enum EventError {
    /// Event could not be delivered to the API
    #[error("Failed to record event: {0}")]
    Api(#[from] ApiError),
}

/// Error returned by a resource handler
#[derive(Debug, Error)]
#[error("{0}")]
pub struct HandlerError(#[source] Box<dyn std::error::Error + Send + Sync>);

impl HandlerError {
    pub fn new(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self(err.into())
    }

    pub fn msg(message: impl Into<String>) -> Self {
        Self(message.into().into())
    }
}

/// Engine-level errors
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Notification(#[from] NotificationError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error(transparent)]
    Event(#[from] EventError),
}

/// Result type alias for engine operations
pub type EngineResult<T> = Result<T, EngineError>;
