//! Change-capture errors.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while turning a mutated entity into a record snapshot.
#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "details")]
pub enum CaptureError {
    /// Entity type was never registered with the interceptor
    #[error("Entity type not registered: {entity}")]
    Unregistered {
        /// `namespace.name` of the unknown type
        entity: String,
    },

    /// Post-write snapshot still has no primary key
    #[error("Entity {entity} has no primary key after write")]
    MissingPrimaryKey {
        /// `namespace.name` of the entity
        entity: String,
    },

    /// A field could not be represented as a scalar value
    #[error("Unsupported field {field} on {entity}: {message}")]
    UnsupportedField {
        /// `namespace.name` of the entity
        entity: String,
        /// Offending field name
        field: String,
        /// Why the value could not be captured
        message: String,
    },
}
