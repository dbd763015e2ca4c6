//! Typed error definitions for twinstore.
//!
//! This module provides a structured error hierarchy with specific error types
//! for the three stages of a replication attempt. All errors are designed to be:
//!
//! - **Serializable** so they can be stored alongside dead letters
//! - **Displayable** for logging via Display trait
//! - **Matchable** for retry decisions via enum variants
//! - **Composable** via thiserror derive macros

mod capture;
mod routing;
mod store;

pub use capture::CaptureError;
pub use routing::RoutingError;
pub use store::StoreError;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::SyncKey;

/// Unified error type that wraps all replication errors.
#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "stage", content = "error")]
pub enum SyncError {
    /// Snapshot extraction failed in the change interceptor
    #[error("Capture error: {0}")]
    Capture(#[from] CaptureError),

    /// No target store could be resolved
    #[error("Routing error: {0}")]
    Routing(#[from] RoutingError),

    /// The target store rejected the transaction
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// The dispatch queue had no free slot
    #[error("Replication queue full, dropped {key}")]
    QueueFull {
        /// Key of the rejected replication
        key: SyncKey,
    },

    /// The dispatcher has been shut down
    #[error("Replication dispatcher is closed")]
    Closed,
}

/// Standard Result type using SyncError.
pub type SyncResult<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::models::{EntityType, PrimaryKey};

    #[test]
    fn test_error_serialization() {
        let err = SyncError::Store(StoreError::Constraint {
            store: "sqlite".to_string(),
            message: "UNIQUE constraint failed: core_vehicle.plate_number".to_string(),
        });

        let json = serde_json::to_string(&err).unwrap();
        assert!(json.contains("Store"));
        assert!(json.contains("plate_number"));

        let deserialized: SyncError = serde_json::from_str(&json).unwrap();
        assert_eq!(err, deserialized);
    }

    #[test]
    fn test_queue_full_display() {
        let err = SyncError::QueueFull {
            key: SyncKey::new(EntityType::new("core", "vehicle"), PrimaryKey(42)),
        };
        assert_eq!(err.to_string(), "Replication queue full, dropped core.vehicle#42");
    }
}
