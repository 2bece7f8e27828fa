//! Error types for presence tracking
//!
//! Errors are classified by whether the service can keep running:
//! - Fatal: configuration errors, exhausted beacon name space
//! - Recoverable: storage and serialization failures (logged, event skipped)

use std::path::PathBuf;
use thiserror::Error;

/// Error types for presence tracking
#[derive(Debug, Error)]
pub enum PresenceError {
    // Fatal errors
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Config file not found at {0}")]
    ConfigNotFound(PathBuf),

    #[error("No unused name left for beacon {name:?} after {attempts} suffixes")]
    BeaconNamesExhausted { name: String, attempts: u32 },

    // Recoverable errors
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Home directory not found")]
    HomeDirNotFound,
}

impl PresenceError {
    /// Returns true if the service cannot continue after this error
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PresenceError::Configuration(_)
                | PresenceError::ConfigNotFound(_)
                | PresenceError::BeaconNamesExhausted { .. }
        )
    }
}

impl From<std::io::Error> for PresenceError {
    fn from(err: std::io::Error) -> Self {
        PresenceError::Io(err.to_string())
    }
}
