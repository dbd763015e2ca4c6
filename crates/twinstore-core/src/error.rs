//! Unified error types for twinstore core.
//!
//! Only setup paths (connecting, loading config, opening the dead-letter log)
//! return these. Replication itself reports through `ReplicationOutcome`.

use thiserror::Error;
use twinstore_types::StoreError;

/// Main error type for twinstore setup and maintenance operations.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum CoreError {
    /// Dead-letter database operation failed (SQLite).
    #[error("Dead-letter database error: {0}")]
    DeadLetter(#[from] rusqlite::Error),

    /// File system I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Configuration values out of range.
    #[error("Invalid configuration: {0}")]
    Validation(#[from] validator::ValidationErrors),

    /// A store could not be opened or queried.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Result type alias for twinstore core operations.
pub type CoreResult<T> = Result<T, CoreError>;
