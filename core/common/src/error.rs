//! Common error types for Satchel.

use thiserror::Error;

/// Top-level error type for Satchel operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Local store operation failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Network-level failure during a queued operation.
    #[error("Network error: {0}")]
    Network(String),

    /// Cloud transport operation failed.
    #[error("Transport error: {0}")]
    Transport(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Conflict detected or resolution rejected.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Host scheduler rejected a registration or cancellation.
    #[error("Scheduler error: {0}")]
    Scheduler(String),

    /// Invalid sync lifecycle transition.
    #[error("State error: {0}")]
    State(String),
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
