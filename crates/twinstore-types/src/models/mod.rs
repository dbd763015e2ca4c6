//! Core domain models for twinstore.

mod config;
mod record;
mod task;

pub use config::{DispatchConfig, RetryConfig, StoreConfig, SyncConfig};
pub use record::{EntityType, FieldMap, FieldValue, PrimaryKey, Record, StoreId, SyncKey};
pub use task::{
    AppliedAction, ReplicationOutcome, ReplicationTask, SkipReason, SyncOperation, UpsertMode,
};
