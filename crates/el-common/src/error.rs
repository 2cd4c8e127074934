//! Error types for the event logger.
//!
//! Errors carry a stable numeric code and a category so the CLI can map them
//! onto exit codes and agents can group them without parsing messages.
//!
//! Collection failures inside a single catcher are *not* errors at this
//! level: they are annotated into the artifact and the run continues. This
//! type covers the failures that prevent a run from starting or finishing.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for event logger operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error categories for grouping related errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Configuration file or rule errors.
    Config,
    /// Artifact store errors.
    Store,
    /// File I/O errors.
    Io,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorCategory::Config => write!(f, "config"),
            ErrorCategory::Store => write!(f, "store"),
            ErrorCategory::Io => write!(f, "io"),
        }
    }
}

/// Unified error type for the event logger.
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors (10-19)
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid rule for event {event}: {message}")]
    InvalidRule { event: String, message: String },

    // Store errors (30-39)
    #[error("cannot allocate artifact: {0}")]
    Store(String),

    // I/O errors (60-69)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Returns the stable error code for this error.
    pub fn code(&self) -> u32 {
        match self {
            Error::Config(_) => 10,
            Error::InvalidRule { .. } => 11,
            Error::Store(_) => 30,
            Error::Io(_) => 60,
        }
    }

    /// Returns the error category for grouping and filtering.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Config(_) | Error::InvalidRule { .. } => ErrorCategory::Config,
            Error::Store(_) => ErrorCategory::Store,
            Error::Io(_) => ErrorCategory::Io,
        }
    }
}
