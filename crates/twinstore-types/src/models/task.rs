//! Replication tasks and their outcomes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::record::{Record, StoreId, SyncKey};
use crate::error::{RoutingError, StoreError};

/// How the originating write classified the record before it was saved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertMode {
    /// The record had no primary key yet.
    Insert,
    /// The record already existed on the source store.
    Update,
}

/// Operation to mirror onto the target store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "mode", rename_all = "snake_case")]
pub enum SyncOperation {
    Upsert(UpsertMode),
    Delete,
}

impl SyncOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Upsert(_) => "upsert",
            Self::Delete => "delete",
        }
    }

    /// Parse the label produced by [`SyncOperation::as_str`].
    pub fn from_label(label: &str) -> Option<Self> {
        match label {
            "upsert" | "upsert:update" => Some(Self::Upsert(UpsertMode::Update)),
            "upsert:insert" => Some(Self::Upsert(UpsertMode::Insert)),
            "delete" => Some(Self::Delete),
            _ => None,
        }
    }

    /// Label including the upsert mode, used for persisted dead letters.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Upsert(UpsertMode::Insert) => "upsert:insert",
            Self::Upsert(UpsertMode::Update) => "upsert:update",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for SyncOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A single replication attempt request: one record, one operation, one source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicationTask {
    pub id: Uuid,
    pub record: Record,
    pub source: StoreId,
    pub operation: SyncOperation,
    pub captured_at: DateTime<Utc>,
}

impl ReplicationTask {
    pub fn new(record: Record, source: StoreId, operation: SyncOperation) -> Self {
        Self { id: Uuid::new_v4(), record, source, operation, captured_at: Utc::now() }
    }

    pub fn upsert(record: Record, source: StoreId, mode: UpsertMode) -> Self {
        Self::new(record, source, SyncOperation::Upsert(mode))
    }

    pub fn delete(record: Record, source: StoreId) -> Self {
        Self::new(record, source, SyncOperation::Delete)
    }

    pub fn sync_key(&self) -> SyncKey {
        self.record.sync_key()
    }
}

/// What a successful attempt did to the target store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppliedAction {
    Inserted,
    Updated,
    Deleted,
    /// Delete of a record the target never had. Counts as success.
    AlreadyAbsent,
}

/// Why an attempt never touched a target store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", content = "details", rename_all = "snake_case")]
pub enum SkipReason {
    /// Routing resolved the target to the store the write came from.
    SameStore,
    /// Entity belongs to an excluded (single-homed) namespace.
    Excluded,
    /// Another attempt for the same sync key is in flight.
    InFlight,
    /// A newer write for the same sync key was replicated first.
    Superseded,
    /// No route exists for the entity namespace or source store.
    Unroutable(RoutingError),
}

/// Result of one replication attempt. Never an `Err`: replication is a side
/// effect and its failures are reported, not raised.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ReplicationOutcome {
    Applied { target: StoreId, action: AppliedAction, attempts: u32 },
    Skipped { reason: SkipReason },
    Failed { target: StoreId, error: StoreError, attempts: u32 },
}

impl ReplicationOutcome {
    pub fn skipped(reason: SkipReason) -> Self {
        Self::Skipped { reason }
    }

    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied { .. })
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Applied { .. } => "applied",
            Self::Skipped { .. } => "skipped",
            Self::Failed { .. } => "failed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_labels_parse_back() {
        for op in [
            SyncOperation::Upsert(UpsertMode::Insert),
            SyncOperation::Upsert(UpsertMode::Update),
            SyncOperation::Delete,
        ] {
            assert_eq!(SyncOperation::from_label(op.label()), Some(op));
        }
        assert_eq!(SyncOperation::from_label("truncate"), None);
    }

    #[test]
    fn test_outcome_serialization_is_tagged() {
        let outcome = ReplicationOutcome::skipped(SkipReason::InFlight);
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["status"], "skipped");
        assert_eq!(json["reason"]["reason"], "in_flight");
    }
}
