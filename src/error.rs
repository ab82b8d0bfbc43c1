//! Error types for the Quotagate service.

use thiserror::Error;

/// Main error type for Quotagate operations.
#[derive(Error, Debug)]
pub enum QuotagateError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A limiter policy with out-of-range values
    #[error("Invalid policy: {0}")]
    InvalidPolicy(String),

    /// Two policies share a namespace but disagree on block duration
    #[error("Policy conflict: {0}")]
    PolicyConflict(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for QuotagateError {
    fn from(err: config::ConfigError) -> Self {
        QuotagateError::Config(err.to_string())
    }
}

/// Result type alias for Quotagate operations.
pub type Result<T> = std::result::Result<T, QuotagateError>;
