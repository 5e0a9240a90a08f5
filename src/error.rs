use std::io;

use thiserror::Error;

/// Errors surfaced by training, tagging and model I/O.
#[derive(Debug, Error)]
pub enum Error {
    /// File open/read/write failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Malformed model header or data line.
    #[error("format error: {0}")]
    Format(String),

    /// The L-BFGS driver reported failure.
    #[error("optimizer failure: {0}")]
    Optimizer(String),

    /// Caller handed the trainer unusable input.
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

/// Result type alias for crate operations.
pub type Result<T> = std::result::Result<T, Error>;
