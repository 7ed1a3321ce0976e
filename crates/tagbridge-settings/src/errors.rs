//! Settings error types.

use std::path::PathBuf;

use thiserror::Error;

/// Why the gateway's settings could not be produced.
#[derive(Debug, Error)]
pub enum SettingsError {
    /// The settings file exists but could not be read.
    #[error("cannot read settings file {}: {source}", path.display())]
    Read {
        /// File that was opened.
        path: PathBuf,
        /// Underlying I/O failure.
        source: std::io::Error,
    },
    /// The settings file is not valid JSON or does not match the schema.
    #[error("malformed settings: {0}")]
    Json(#[from] serde_json::Error),
    /// A key parsed but holds a value the gateway cannot start with.
    #[error("invalid {key}: {reason}")]
    InvalidValue {
        /// Dotted settings key, e.g. `server.endpoint`.
        key: &'static str,
        /// What is wrong with it.
        reason: String,
    },
}

/// Result type for settings operations.
pub type Result<T> = std::result::Result<T, SettingsError>;
