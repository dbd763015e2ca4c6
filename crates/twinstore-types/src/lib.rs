//! # twinstore Types
//!
//! Core types, models, and error definitions for the twinstore replication core.
//!
//! - **`error`** - Typed error hierarchy for capture, routing and store failures
//! - **`models`** - Records, sync keys, replication tasks/outcomes and config
//!
//! ## Architecture Role
//!
//! `twinstore-types` sits at the bottom of the dependency graph:
//!
//! ```text
//!         twinstore-types (this crate)
//!                  │
//!                  ▼
//!          twinstore-core
//!                  │
//!                  ▼
//!           twinstore-cli
//! ```
//!
//! All types are designed to be:
//! - **Serializable** via serde (dead-letter payloads, CLI JSON output)
//! - **Clone** for cheap sharing across worker tasks
//! - **PartialEq** for testing and comparison

pub mod error;
pub mod models;

pub use error::{CaptureError, RoutingError, StoreError, SyncError, SyncResult};

pub use models::{
    AppliedAction, DispatchConfig, EntityType, FieldMap, FieldValue, PrimaryKey, Record,
    ReplicationOutcome, ReplicationTask, RetryConfig, SkipReason, StoreConfig, StoreId,
    SyncConfig, SyncKey, SyncOperation, UpsertMode,
};
