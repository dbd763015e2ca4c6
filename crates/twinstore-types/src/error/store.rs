//! Store errors.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors reported by a store backend while applying a replicated write.
#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "details")]
pub enum StoreError {
    /// Store could not be reached or the connection dropped
    #[error("Store {store} unreachable: {message}")]
    Connection {
        /// Store id
        store: String,
        /// Driver message
        message: String,
    },

    /// Transaction exceeded the configured bound and was rolled back
    #[error("Transaction on {store} timed out after {after_ms}ms")]
    Timeout {
        /// Store id
        store: String,
        /// Configured bound in milliseconds
        after_ms: u64,
    },

    /// Unique, foreign-key, not-null or check constraint violated
    #[error("Constraint violation on {store}: {message}")]
    Constraint {
        /// Store id
        store: String,
        /// Driver message
        message: String,
    },

    /// Table or column missing, or an identifier that is not a plain name
    #[error("Schema mismatch on {store}: {message}")]
    Schema {
        /// Store id
        store: String,
        /// Driver message
        message: String,
    },

    /// Any other statement failure
    #[error("Query failed on {store}: {message}")]
    Query {
        /// Store id
        store: String,
        /// Driver message
        message: String,
    },
}

impl StoreError {
    /// Connectivity loss and timeouts may succeed on a later attempt; constraint
    /// and schema failures will not.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Timeout { .. })
    }

    pub fn store(&self) -> &str {
        match self {
            Self::Connection { store, .. }
            | Self::Timeout { store, .. }
            | Self::Constraint { store, .. }
            | Self::Schema { store, .. }
            | Self::Query { store, .. } => store,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connection { .. } => "connection",
            Self::Timeout { .. } => "timeout",
            Self::Constraint { .. } => "constraint",
            Self::Schema { .. } => "schema",
            Self::Query { .. } => "query",
        }
    }
}
