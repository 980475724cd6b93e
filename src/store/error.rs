//! Error types for task-store operations.

use thiserror::Error;

/// Errors that can occur while adding, dequeuing, or resolving a task.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The underlying `SQLite` operation failed.
    #[error("task store database error: {0}")]
    Database(#[from] sqlx::Error),

    /// The `extra` payload failed to (de)serialize.
    #[error("task payload (de)serialization error: {0}")]
    Payload(#[from] serde_json::Error),

    /// A stored row carried an action tag this build does not recognize.
    #[error("unrecognized task action: {0}")]
    UnknownAction(String),
}

/// Result alias for task-store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
