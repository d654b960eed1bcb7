//! Error types for the rategate service.

use std::time::Duration;
use thiserror::Error;

/// Failure reported by a window store.
///
/// The limiter never lets these reach the request path; they end up in the
/// `error` field of a fail-open decision.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The backend could not be reached or initialized
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// The backend did not answer within the configured bound
    #[error("Store operation timed out after {0:?}")]
    Timeout(Duration),

    /// Redis returned an error
    #[error("Redis error: {0}")]
    Backend(#[from] redis::RedisError),
}

/// Main error type for rategate operations.
#[derive(Error, Debug)]
pub enum GateError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Window store errors
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for rategate operations.
pub type Result<T> = std::result::Result<T, GateError>;
