//! Error types for document store operations.
//!
//! Errors fall into two groups:
//! - client errors: the request addressed something that does not exist
//!   or could not be understood (`NotFound`, `BadRequest`, `MethodNotAllowed`)
//! - internal errors: the backend, the lock, or (de)serialization failed
//!
//! Nothing in the store retries; every error surfaces to the caller of the
//! failed operation.

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur during document store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The path does not resolve under the operation's unresolved-segment limit.
    #[error("not found: {0}")]
    NotFound(String),

    /// Malformed request body, undecodable path, or a mutation with no key.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// The HTTP verb has no operation.
    #[error("method not allowed: {0}")]
    MethodNotAllowed(String),

    /// The mutation lock could not be acquired before the deadline.
    #[error("timed out after {0:?} waiting for the store lock")]
    LockTimeout(Duration),

    /// The persisted document is not a JSON object.
    #[error("corrupt document: {0}")]
    CorruptDocument(String),

    /// A write transaction's task was cancelled by runtime shutdown.
    #[error("transaction task failed: {0}")]
    TaskFailed(String),

    /// The configuration file could not be parsed.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Serialization or deserialization error.
    #[error("serialization error: {0}")]
    SerializationError(String),

    /// Database error from SQLx.
    #[error("database error: {0}")]
    DatabaseError(#[from] sqlx::Error),

    /// I/O error.
    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Result type alias for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

impl StoreError {
    /// Returns true if the error was caused by the request rather than the store.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            StoreError::NotFound(_) | StoreError::BadRequest(_) | StoreError::MethodNotAllowed(_)
        )
    }

    pub(crate) fn not_found(path: &[String]) -> Self {
        StoreError::NotFound(format!("/{}", path.join("/")))
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::SerializationError(err.to_string())
    }
}
