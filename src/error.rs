//! Error types for the rate limiter.

use thiserror::Error;

/// Boxed error returned by user-supplied callbacks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Main error type for rate limiter operations.
#[derive(Error, Debug)]
pub enum RateLimitError {
    /// Configuration-related errors, raised while building a limiter
    #[error("Configuration error: {0}")]
    Config(String),

    /// Store failures surfaced in fail-closed mode
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Errors raised by user callbacks, passed through untouched
    #[error(transparent)]
    Callback(BoxError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors produced by a counting store.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The store does not implement the requested operation
    #[error("store does not support `{0}`")]
    Unsupported(&'static str),

    /// Backend failure (network, database, ...)
    #[error("{0}")]
    Backend(String),
}

/// Result type alias for rate limiter operations.
pub type Result<T> = std::result::Result<T, RateLimitError>;
