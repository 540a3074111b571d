//! Error types for the speech workspace.

use thiserror::Error;

/// Main error type for encoder, model and criterion operations.
#[derive(Error, Debug)]
pub enum AsrError {
    /// Configuration errors (bad chunk width, malformed conv specs, ...).
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Runtime input that violates an operation's contract.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Files that were read successfully but have unexpected content.
    #[error("Malformed input: {0}")]
    MalformedInput(String),

    /// I/O errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Candle tensor errors.
    #[error("Tensor error: {0}")]
    Candle(#[from] candle_core::Error),

    /// JSON parsing errors.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for ASR operations.
pub type AsrResult<T> = Result<T, AsrError>;

impl AsrError {
    /// Shorthand for [`AsrError::InvalidConfiguration`].
    pub fn config(msg: impl Into<String>) -> Self {
        Self::InvalidConfiguration(msg.into())
    }

    /// Shorthand for [`AsrError::InvalidInput`].
    pub fn input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }
}
