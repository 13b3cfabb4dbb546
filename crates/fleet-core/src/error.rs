//! Error types for fleet-core.

use thiserror::Error;

/// Result type alias for fleet-core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors raised while loading or interpreting configuration.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid duration: {0:?}")]
    InvalidDuration(String),

    #[error("invalid condition {expr:?}: {message}")]
    Condition { expr: String, message: String },

    #[error("invalid config: {0}")]
    Invalid(String),
}
