//! SQLite-backed dead-letter log.
//!
//! Holds replications that could not be applied: transient failures that ran
//! out of retries, non-transient rejections, and tasks refused by a full
//! dispatch queue. Entries are keyed by task id, so re-recording a task that
//! failed again on replay updates the existing row.
//!
//! At most one entry is kept per sync key: the one captured last. An entry
//! is also discarded as soon as a newer write for its key is applied, so
//! replay never puts back a stale snapshot.
#![allow(
    clippy::cast_possible_wrap,
    clippy::as_conversions,
    reason = "attempt counters and epoch timestamps fit in i64"
)]

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info, warn};
use twinstore_types::{ReplicationOutcome, ReplicationTask, SkipReason, StoreId};
use uuid::Uuid;

use super::coordinator::SyncCoordinator;
use crate::error::CoreResult;

/// Why a task ended up in the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterReason {
    /// Transient failure on every allowed attempt.
    Exhausted,
    /// Non-transient failure (constraint, schema, query).
    Rejected,
    /// Dispatch queue had no capacity.
    QueueFull,
    /// Dispatcher was already shut down.
    Closed,
}

impl DeadLetterReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Exhausted => "exhausted",
            Self::Rejected => "rejected",
            Self::QueueFull => "queue_full",
            Self::Closed => "closed",
        }
    }

    fn parse(value: &str) -> Self {
        match value {
            "exhausted" => Self::Exhausted,
            "queue_full" => Self::QueueFull,
            "closed" => Self::Closed,
            _ => Self::Rejected,
        }
    }
}

/// One persisted failed replication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub task: ReplicationTask,
    /// Unknown when the task never reached routing (queue rejections).
    pub target: Option<StoreId>,
    pub reason: DeadLetterReason,
    pub error: String,
    pub attempts: u32,
    pub failed_at: DateTime<Utc>,
}

impl DeadLetter {
    pub fn new(
        task: ReplicationTask,
        target: Option<StoreId>,
        reason: DeadLetterReason,
        error: impl Into<String>,
        attempts: u32,
    ) -> Self {
        Self { task, target, reason, error: error.into(), attempts, failed_at: Utc::now() }
    }

    pub fn id(&self) -> Uuid {
        self.task.id
    }
}

/// Summary of a replay pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReplayReport {
    /// Entries applied (or found to need no replication) and removed.
    pub replayed: usize,
    /// Entries that failed again and were kept.
    pub failed: usize,
    /// Entries left untouched because their key was in flight or unroutable.
    pub deferred: usize,
    /// Entries dropped because a newer write for their key got there first.
    pub superseded: usize,
}

pub struct DeadLetterLog {
    conn: Mutex<Connection>,
}

impl DeadLetterLog {
    /// Open (or create) the log at `path`, creating parent directories.
    pub fn open(path: impl AsRef<Path>) -> CoreResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> CoreResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> CoreResult<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS dead_letters (
                id TEXT PRIMARY KEY,
                entity_namespace TEXT NOT NULL,
                entity_name TEXT NOT NULL,
                pk INTEGER NOT NULL,
                operation TEXT NOT NULL,
                source TEXT NOT NULL,
                target TEXT,
                reason TEXT NOT NULL,
                error TEXT NOT NULL,
                attempts INTEGER NOT NULL,
                failed_at INTEGER NOT NULL,
                captured_at INTEGER NOT NULL,
                task_json TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_dead_letters_failed_at ON dead_letters (failed_at);
            CREATE INDEX IF NOT EXISTS idx_dead_letters_key
                ON dead_letters (entity_namespace, entity_name, pk, captured_at);",
        )?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Insert or replace the entry for `letter.task.id`, dropping older
    /// entries for the same sync key. Returns `false` without writing when a
    /// newer entry for the key is already logged.
    pub fn record(&self, letter: &DeadLetter) -> CoreResult<bool> {
        let task_json = serde_json::to_string(&letter.task)?;
        let record = &letter.task.record;
        let id = letter.id().to_string();
        let captured_at = letter.task.captured_at.timestamp_micros();

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let newer: i64 = tx.query_row(
            "SELECT COUNT(*) FROM dead_letters
             WHERE entity_namespace = ?1 AND entity_name = ?2 AND pk = ?3 AND id != ?4 AND captured_at > ?5",
            params![record.entity.namespace, record.entity.name, record.pk.get(), id, captured_at],
            |row| row.get(0),
        )?;
        if newer > 0 {
            return Ok(false);
        }

        let replaced = tx.execute(
            "DELETE FROM dead_letters
             WHERE entity_namespace = ?1 AND entity_name = ?2 AND pk = ?3 AND id != ?4",
            params![record.entity.namespace, record.entity.name, record.pk.get(), id],
        )?;
        if replaced > 0 {
            debug!(key = %letter.task.sync_key(), replaced, "Dead letter replaces older entries for key");
        }
        let _rows_affected: usize = tx.execute(
            "INSERT OR REPLACE INTO dead_letters
                (id, entity_namespace, entity_name, pk, operation, source, target, reason, error, attempts, failed_at, captured_at, task_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                id,
                record.entity.namespace,
                record.entity.name,
                record.pk.get(),
                letter.task.operation.label(),
                letter.task.source.as_str(),
                letter.target.as_ref().map(StoreId::as_str),
                letter.reason.as_str(),
                letter.error,
                i64::from(letter.attempts),
                letter.failed_at.timestamp_millis(),
                captured_at,
                task_json,
            ],
        )?;
        tx.commit()?;
        Ok(true)
    }

    /// Drop entries for `applied`'s sync key captured no later than it.
    /// Called once `applied` reached the target, which makes them stale.
    pub fn discard_superseded(&self, applied: &ReplicationTask) -> CoreResult<usize> {
        let record = &applied.record;
        let deleted = self.conn.lock().execute(
            "DELETE FROM dead_letters
             WHERE entity_namespace = ?1 AND entity_name = ?2 AND pk = ?3 AND id != ?4 AND captured_at <= ?5",
            params![
                record.entity.namespace,
                record.entity.name,
                record.pk.get(),
                applied.id.to_string(),
                applied.captured_at.timestamp_micros(),
            ],
        )?;
        Ok(deleted)
    }

    /// Oldest first. `limit` of `None` returns everything.
    pub fn list(&self, limit: Option<usize>) -> CoreResult<Vec<DeadLetter>> {
        let limit = limit.map_or(-1, |l| l as i64);
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT target, reason, error, attempts, failed_at, task_json
             FROM dead_letters
             ORDER BY failed_at ASC, id ASC
             LIMIT ?1",
        )?;
        let rows = stmt.query_map([limit], RawLetter::from_row)?;

        let mut letters = Vec::new();
        for raw in rows {
            letters.push(raw?.into_letter()?);
        }
        Ok(letters)
    }

    pub fn get(&self, id: Uuid) -> CoreResult<Option<DeadLetter>> {
        let raw = self
            .conn
            .lock()
            .query_row(
                "SELECT target, reason, error, attempts, failed_at, task_json
                 FROM dead_letters WHERE id = ?1",
                [id.to_string()],
                RawLetter::from_row,
            )
            .optional()?;
        raw.map(RawLetter::into_letter).transpose()
    }

    pub fn contains(&self, id: Uuid) -> CoreResult<bool> {
        let found = self
            .conn
            .lock()
            .query_row("SELECT 1 FROM dead_letters WHERE id = ?1", [id.to_string()], |_| Ok(()))
            .optional()?;
        Ok(found.is_some())
    }

    pub fn remove(&self, id: Uuid) -> CoreResult<bool> {
        let deleted = self
            .conn
            .lock()
            .execute("DELETE FROM dead_letters WHERE id = ?1", [id.to_string()])?;
        Ok(deleted > 0)
    }

    /// Delete every entry; returns how many were removed.
    pub fn purge(&self) -> CoreResult<usize> {
        let deleted = self.conn.lock().execute("DELETE FROM dead_letters", [])?;
        info!("Purged {} dead-letter entries", deleted);
        Ok(deleted)
    }

    pub fn count(&self) -> CoreResult<usize> {
        let count: i64 =
            self.conn.lock().query_row("SELECT COUNT(*) FROM dead_letters", [], |row| row.get(0))?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    /// Re-run every entry through `coordinator`, oldest first.
    ///
    /// Each entry is looked up again once its sync key is held: an entry a
    /// newer write discarded in the meantime is skipped, not re-applied.
    /// Failures are re-recorded here with the accumulated attempt count.
    pub async fn replay(&self, coordinator: &SyncCoordinator) -> CoreResult<ReplayReport> {
        let mut report = ReplayReport::default();

        for letter in self.list(None)? {
            let key = letter.task.sync_key();
            let id = letter.id();
            let outcome = coordinator
                .attempt_if(&letter.task, || match self.contains(id) {
                    Ok(found) => found,
                    Err(err) => {
                        warn!(key = %key, error = %err, "Dead-letter lookup failed, skipping entry");
                        false
                    },
                })
                .await;
            match outcome {
                ReplicationOutcome::Applied { .. }
                | ReplicationOutcome::Skipped { reason: SkipReason::SameStore | SkipReason::Excluded } => {
                    self.remove(letter.id())?;
                    report.replayed += 1;
                    debug!(key = %key, "Replayed dead letter");
                },
                ReplicationOutcome::Skipped { reason: SkipReason::Superseded } => {
                    report.superseded += 1;
                    debug!(key = %key, "Dead letter superseded by newer write");
                },
                ReplicationOutcome::Skipped { reason } => {
                    report.deferred += 1;
                    debug!(key = %key, ?reason, "Dead letter deferred");
                },
                ReplicationOutcome::Failed { target, error, attempts } => {
                    let reason = if error.is_transient() {
                        DeadLetterReason::Exhausted
                    } else {
                        DeadLetterReason::Rejected
                    };
                    let retried = DeadLetter::new(
                        letter.task,
                        Some(target),
                        reason,
                        error.to_string(),
                        letter.attempts.saturating_add(attempts),
                    );
                    if self.record(&retried)? {
                        report.failed += 1;
                    } else {
                        report.superseded += 1;
                    }
                    warn!(key = %key, error = %error, "Dead letter failed again");
                },
            }
        }

        info!(
            replayed = report.replayed,
            failed = report.failed,
            deferred = report.deferred,
            superseded = report.superseded,
            "Dead-letter replay finished"
        );
        Ok(report)
    }
}

struct RawLetter {
    target: Option<String>,
    reason: String,
    error: String,
    attempts: i64,
    failed_at: i64,
    task_json: String,
}

impl RawLetter {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            target: row.get(0)?,
            reason: row.get(1)?,
            error: row.get(2)?,
            attempts: row.get(3)?,
            failed_at: row.get(4)?,
            task_json: row.get(5)?,
        })
    }

    fn into_letter(self) -> CoreResult<DeadLetter> {
        Ok(DeadLetter {
            task: serde_json::from_str(&self.task_json)?,
            target: self.target.map(StoreId::new),
            reason: DeadLetterReason::parse(&self.reason),
            error: self.error,
            attempts: u32::try_from(self.attempts).unwrap_or(u32::MAX),
            failed_at: DateTime::from_timestamp_millis(self.failed_at).unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use twinstore_types::{EntityType, FieldMap, FieldValue, Record, UpsertMode};

    fn task(pk: i64) -> ReplicationTask {
        let mut fields = FieldMap::new();
        fields.insert("plate_number".to_string(), FieldValue::from("ABC123"));
        ReplicationTask::upsert(
            Record::new(EntityType::new("core", "vehicle"), pk, fields),
            StoreId::new("default"),
            UpsertMode::Insert,
        )
    }

    fn letter(pk: i64) -> DeadLetter {
        DeadLetter::new(
            task(pk),
            Some(StoreId::new("sqlite")),
            DeadLetterReason::Exhausted,
            "Store sqlite unreachable: refused",
            3,
        )
    }

    #[test]
    fn test_record_and_list_preserve_task() {
        let log = DeadLetterLog::open_in_memory().unwrap();
        let letter = letter(42);
        log.record(&letter).unwrap();

        let listed = log.list(None).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].task, letter.task);
        assert_eq!(listed[0].target, Some(StoreId::new("sqlite")));
        assert_eq!(listed[0].reason, DeadLetterReason::Exhausted);
        assert_eq!(listed[0].attempts, 3);
        assert_eq!(listed[0].failed_at.timestamp_millis(), letter.failed_at.timestamp_millis());
    }

    #[test]
    fn test_rerecord_replaces_entry() {
        let log = DeadLetterLog::open_in_memory().unwrap();
        let mut letter = letter(42);
        log.record(&letter).unwrap();

        letter.attempts = 6;
        letter.reason = DeadLetterReason::Rejected;
        log.record(&letter).unwrap();

        assert_eq!(log.count().unwrap(), 1);
        let stored = log.get(letter.id()).unwrap().unwrap();
        assert_eq!(stored.attempts, 6);
        assert_eq!(stored.reason, DeadLetterReason::Rejected);
    }

    #[test]
    fn test_remove_and_purge() {
        let log = DeadLetterLog::open_in_memory().unwrap();
        let first = letter(1);
        log.record(&first).unwrap();
        log.record(&letter(2)).unwrap();
        log.record(&letter(3)).unwrap();

        assert!(log.remove(first.id()).unwrap());
        assert!(!log.remove(first.id()).unwrap());
        assert_eq!(log.list(Some(1)).unwrap().len(), 1);
        assert_eq!(log.purge().unwrap(), 2);
        assert_eq!(log.count().unwrap(), 0);
    }

    #[test]
    fn test_only_newest_entry_per_key_is_kept() {
        let log = DeadLetterLog::open_in_memory().unwrap();
        let older = letter(42);
        let mut newer = letter(42);
        newer.task.captured_at = older.task.captured_at + chrono::Duration::milliseconds(5);

        assert!(log.record(&newer).unwrap());
        assert!(!log.record(&older).unwrap());
        assert_eq!(log.count().unwrap(), 1);
        assert!(log.contains(newer.id()).unwrap());

        let mut latest = letter(42);
        latest.task.captured_at = newer.task.captured_at + chrono::Duration::milliseconds(5);
        assert!(log.record(&latest).unwrap());
        assert_eq!(log.count().unwrap(), 1);
        assert!(!log.contains(newer.id()).unwrap());
        assert!(log.contains(latest.id()).unwrap());
    }

    #[test]
    fn test_discard_superseded_keeps_newer_and_other_keys() {
        let log = DeadLetterLog::open_in_memory().unwrap();
        let stale = letter(42);
        let other = letter(7);
        log.record(&stale).unwrap();
        log.record(&other).unwrap();

        let mut applied = task(42);
        applied.captured_at = stale.task.captured_at - chrono::Duration::milliseconds(5);
        assert_eq!(log.discard_superseded(&applied).unwrap(), 0);

        applied.captured_at = stale.task.captured_at + chrono::Duration::milliseconds(5);
        assert_eq!(log.discard_superseded(&applied).unwrap(), 1);
        assert!(!log.contains(stale.id()).unwrap());
        assert!(log.contains(other.id()).unwrap());
    }

    #[test]
    fn test_open_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("dead_letters.db");
        let log = DeadLetterLog::open(&path).unwrap();
        log.record(&letter(42)).unwrap();
        drop(log);

        let reopened = DeadLetterLog::open(&path).unwrap();
        assert_eq!(reopened.count().unwrap(), 1);
    }

    #[test]
    fn test_queue_rejection_has_no_target() {
        let log = DeadLetterLog::open_in_memory().unwrap();
        let letter = DeadLetter::new(task(9), None, DeadLetterReason::QueueFull, "queue full", 0);
        log.record(&letter).unwrap();

        let stored = log.get(letter.id()).unwrap().unwrap();
        assert_eq!(stored.target, None);
        assert_eq!(stored.reason, DeadLetterReason::QueueFull);
    }
}
