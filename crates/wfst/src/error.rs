//! Error types for automaton operations.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum FsaError {
    /// OpenFst text that could not be parsed.
    #[error("Parse error at line {line}: {message}")]
    Parse { line: usize, message: String },

    /// Structurally invalid automaton (bad state ids, unexpected label layer, ...).
    #[error("Malformed automaton: {0}")]
    MalformedInput(String),

    /// Operation preconditions not met.
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    /// Determinization exceeded the configured state budget.
    #[error("Determinization exceeded {0} states")]
    DeterminizeLimit(usize),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Errors from the tensor-backed serialization.
    #[error("Serialization error: {0}")]
    Candle(#[from] candle_core::Error),
}

pub type FsaResult<T> = Result<T, FsaError>;
