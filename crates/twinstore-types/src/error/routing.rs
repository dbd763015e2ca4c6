//! Routing errors.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A write whose target store cannot be decided. Always handled as a no-op.
#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "details")]
pub enum RoutingError {
    /// Namespace is neither mirrored nor excluded
    #[error("No route defined for namespace {namespace}")]
    UnknownNamespace {
        /// Namespace without a route
        namespace: String,
    },

    /// Write came from a store that is not one of the configured pair
    #[error("Unknown source store {store}")]
    UnknownStore {
        /// Offending store id
        store: String,
    },
}
