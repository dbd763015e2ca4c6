//! Sync coordinator: applies one replication task to the opposite store.
//!
//! Per task:
//! 1. Excluded namespace → skipped, no target transaction is ever opened.
//! 2. Resolve the target via [`RoutingTable`]; unroutable → warn + skipped.
//! 3. Target equal to source → skipped.
//! 4. Claim the sync key; already held → skipped (trace only).
//! 5. Run the write in a target transaction bounded by the configured timeout,
//!    retrying transient failures with backoff while the key stays held.
//! 6. Release the key (guard drop), whatever happened.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, trace, warn};
use twinstore_types::{
    AppliedAction, ReplicationOutcome, ReplicationTask, RoutingError, SkipReason, StoreError,
    StoreId, SyncOperation,
};

use super::dead_letter::{DeadLetter, DeadLetterLog, DeadLetterReason};
use super::guard::SyncGuardSet;
use super::metrics::{self, SyncStats};
use super::retry::RetryPolicy;
use super::routing::RoutingTable;
use crate::store::{Store, StoreResult, StoreTransaction};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

pub struct SyncCoordinator {
    routing: RoutingTable,
    stores: HashMap<StoreId, Arc<dyn Store>>,
    guards: SyncGuardSet,
    retry: RetryPolicy,
    timeout: Duration,
    dead_letters: Option<Arc<DeadLetterLog>>,
    stats: Arc<SyncStats>,
}

impl SyncCoordinator {
    pub fn new(
        routing: RoutingTable,
        stores: impl IntoIterator<Item = Arc<dyn Store>>,
        guards: SyncGuardSet,
    ) -> Self {
        let stores = stores.into_iter().map(|store| (store.id().clone(), store)).collect();
        Self {
            routing,
            stores,
            guards,
            retry: RetryPolicy::default(),
            timeout: DEFAULT_TIMEOUT,
            dead_letters: None,
            stats: Arc::new(SyncStats::new()),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Bound on each target transaction (per attempt, not across retries).
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_dead_letters(mut self, log: Arc<DeadLetterLog>) -> Self {
        self.dead_letters = Some(log);
        self
    }

    pub fn with_stats(mut self, stats: Arc<SyncStats>) -> Self {
        self.stats = stats;
        self
    }

    pub fn routing(&self) -> &RoutingTable {
        &self.routing
    }

    pub fn guards(&self) -> &SyncGuardSet {
        &self.guards
    }

    pub fn stats(&self) -> &Arc<SyncStats> {
        &self.stats
    }

    pub fn dead_letters(&self) -> Option<&Arc<DeadLetterLog>> {
        self.dead_letters.as_ref()
    }

    pub fn store(&self, id: &StoreId) -> Option<&Arc<dyn Store>> {
        self.stores.get(id)
    }

    /// Release connections of every store.
    pub async fn close_stores(&self) {
        for store in self.stores.values() {
            store.close().await;
        }
    }

    /// Run the task and dead-letter it when it fails. Once applied, older
    /// dead letters for the same key are stale and get discarded.
    pub async fn replicate(&self, task: &ReplicationTask) -> ReplicationOutcome {
        let outcome = self.attempt(task).await;
        match &outcome {
            ReplicationOutcome::Applied { .. } => self.discard_superseded(task),
            ReplicationOutcome::Failed { target, error, attempts } => {
                let reason = if error.is_transient() {
                    DeadLetterReason::Exhausted
                } else {
                    DeadLetterReason::Rejected
                };
                let letter =
                    DeadLetter::new(task.clone(), Some(target.clone()), reason, error.to_string(), *attempts);
                self.dead_letter(&letter);
            },
            ReplicationOutcome::Skipped { .. } => {},
        }
        outcome
    }

    /// Run the task without touching the dead-letter log.
    pub async fn attempt(&self, task: &ReplicationTask) -> ReplicationOutcome {
        self.attempt_if(task, || true).await
    }

    /// Like [`attempt`](Self::attempt), but `still_current` is checked once
    /// the sync key is held. `false` skips the task as superseded, so no
    /// newer write for the key can be applied between the check and the
    /// attempt.
    pub(crate) async fn attempt_if<F>(&self, task: &ReplicationTask, still_current: F) -> ReplicationOutcome
    where
        F: FnOnce() -> bool,
    {
        let started = Instant::now();
        let outcome = self.run(task, still_current).await;

        self.stats.record_outcome(&outcome);
        metrics::record_replication(&task.sync_key(), task.operation, &outcome, started.elapsed());
        outcome
    }

    fn discard_superseded(&self, task: &ReplicationTask) {
        let Some(log) = &self.dead_letters else {
            return;
        };
        match log.discard_superseded(task) {
            Ok(0) => {},
            Ok(discarded) => {
                debug!(key = %task.sync_key(), discarded, "Discarded dead letters superseded by newer write");
            },
            Err(err) => {
                warn!(key = %task.sync_key(), error = %err, "Failed to discard superseded dead letters");
            },
        }
    }

    /// Persist a dead letter. Failures to write are logged and dropped.
    pub(crate) fn dead_letter(&self, letter: &DeadLetter) {
        let Some(log) = &self.dead_letters else {
            warn!(key = %letter.task.sync_key(), reason = letter.reason.as_str(), "Replication lost: no dead-letter log configured");
            return;
        };
        match log.record(letter) {
            Ok(false) => {
                debug!(key = %letter.task.sync_key(), "Newer dead letter for key already recorded, dropping older one");
            },
            Ok(true) => {
                self.stats.record_dead_letter();
                metrics::record_dead_letter(letter.reason.as_str());
                warn!(
                    key = %letter.task.sync_key(),
                    operation = %letter.task.operation,
                    reason = letter.reason.as_str(),
                    attempts = letter.attempts,
                    "Replication moved to dead-letter log"
                );
            },
            Err(err) => {
                error!(key = %letter.task.sync_key(), error = %err, "Failed to write dead letter");
            },
        }
    }

    async fn run<F>(&self, task: &ReplicationTask, still_current: F) -> ReplicationOutcome
    where
        F: FnOnce() -> bool,
    {
        let key = task.sync_key();
        let namespace = key.entity.namespace.as_str();

        if self.routing.is_excluded(namespace) {
            trace!(key = %key, "Excluded namespace, not replicated");
            return ReplicationOutcome::skipped(SkipReason::Excluded);
        }

        let target = match self.routing.route(namespace, &task.source) {
            Ok(target) => target,
            Err(err) => {
                warn!(key = %key, source = %task.source, error = %err, "No route for write, skipping");
                return ReplicationOutcome::skipped(SkipReason::Unroutable(err));
            },
        };
        if target == task.source {
            return ReplicationOutcome::skipped(SkipReason::SameStore);
        }
        let Some(store) = self.stores.get(&target) else {
            let err = RoutingError::UnknownStore { store: target.to_string() };
            warn!(key = %key, error = %err, "Target store not connected, skipping");
            return ReplicationOutcome::skipped(SkipReason::Unroutable(err));
        };

        let Some(_guard) = self.guards.try_acquire(&key) else {
            trace!(key = %key, "Sync key in flight, skipping");
            metrics::record_guard_skip(&key);
            return ReplicationOutcome::skipped(SkipReason::InFlight);
        };
        if !still_current() {
            trace!(key = %key, "Newer write already replicated, skipping");
            return ReplicationOutcome::skipped(SkipReason::Superseded);
        }

        let mut attempt = 0_u32;
        loop {
            attempt += 1;
            match self.apply_once(store.as_ref(), task).await {
                Ok(action) => {
                    debug!(
                        key = %key,
                        operation = %task.operation,
                        source = %task.source,
                        target = %target,
                        ?action,
                        attempt,
                        "Replicated"
                    );
                    return ReplicationOutcome::Applied { target, action, attempts: attempt };
                },
                Err(err) if self.retry.should_retry(&err, attempt) => {
                    let delay = self.retry.backoff_with_jitter(attempt);
                    debug!(
                        key = %key,
                        target = %target,
                        error = %err,
                        attempt,
                        max_attempts = self.retry.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        "Transient replication failure, retrying"
                    );
                    self.stats.record_retry();
                    tokio::time::sleep(delay).await;
                },
                Err(err) => {
                    error!(
                        key = %key,
                        entity = %key.entity,
                        pk = %key.pk,
                        operation = %task.operation,
                        source = %task.source,
                        target = %target,
                        fields = ?task.record.fields,
                        attempts = attempt,
                        error = %err,
                        "Replication failed"
                    );
                    return ReplicationOutcome::Failed { target, error: err, attempts: attempt };
                },
            }
        }
    }

    /// One attempt, bounded by the transaction timeout. On expiry the
    /// transaction future is dropped, which rolls it back.
    async fn apply_once(&self, store: &dyn Store, task: &ReplicationTask) -> StoreResult<AppliedAction> {
        match tokio::time::timeout(self.timeout, apply_in_transaction(store, task)).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout {
                store: store.id().to_string(),
                after_ms: self.timeout.as_millis() as u64,
            }),
        }
    }
}

async fn apply_in_transaction(store: &dyn Store, task: &ReplicationTask) -> StoreResult<AppliedAction> {
    let mut tx = store.begin().await?;
    match apply_operation(tx.as_mut(), task).await {
        Ok(action) => {
            tx.commit().await?;
            Ok(action)
        },
        Err(err) => {
            if let Err(rollback_err) = tx.rollback().await {
                debug!(store = %store.id(), error = %rollback_err, "Rollback after failed write also failed");
            }
            Err(err)
        },
    }
}

async fn apply_operation(
    tx: &mut dyn StoreTransaction,
    task: &ReplicationTask,
) -> StoreResult<AppliedAction> {
    let record = &task.record;
    match task.operation {
        SyncOperation::Upsert(_) => {
            if tx.exists(&record.entity, record.pk).await? {
                tx.update(&record.entity, record.pk, &record.fields).await?;
                Ok(AppliedAction::Updated)
            } else {
                tx.insert(&record.entity, record.pk, &record.fields).await?;
                Ok(AppliedAction::Inserted)
            }
        },
        SyncOperation::Delete => {
            if tx.delete(&record.entity, record.pk).await? {
                Ok(AppliedAction::Deleted)
            } else {
                Ok(AppliedAction::AlreadyAbsent)
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use twinstore_types::{EntityType, FieldMap, FieldValue, PrimaryKey, Record, UpsertMode};

    fn vehicle() -> EntityType {
        EntityType::new("core", "vehicle")
    }

    fn record(pk: i64, plate: &str) -> Record {
        let mut fields = FieldMap::new();
        fields.insert("plate_number".to_string(), FieldValue::from(plate));
        Record::new(vehicle(), pk, fields)
    }

    fn setup() -> (SyncCoordinator, MemoryStore, MemoryStore) {
        let primary = MemoryStore::new(StoreId::new("default"));
        let replica = MemoryStore::new(StoreId::new("sqlite"));
        let routing =
            RoutingTable::new(StoreId::new("default"), StoreId::new("sqlite"), ["sessions".to_string()]);
        let stores: Vec<Arc<dyn Store>> = vec![Arc::new(primary.clone()), Arc::new(replica.clone())];
        let coordinator = SyncCoordinator::new(routing, stores, SyncGuardSet::new())
            .with_retry(RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
            })
            .with_timeout(Duration::from_millis(200));
        (coordinator, primary, replica)
    }

    fn upsert(record: Record) -> ReplicationTask {
        ReplicationTask::upsert(record, StoreId::new("default"), UpsertMode::Insert)
    }

    #[tokio::test]
    async fn test_insert_then_update() {
        let (coordinator, _, replica) = setup();

        let first = coordinator.attempt(&upsert(record(42, "ABC123"))).await;
        assert!(matches!(first, ReplicationOutcome::Applied { action: AppliedAction::Inserted, .. }));

        let second = coordinator.attempt(&upsert(record(42, "XYZ999"))).await;
        assert!(matches!(second, ReplicationOutcome::Applied { action: AppliedAction::Updated, .. }));

        let row = replica.get(&vehicle(), PrimaryKey(42)).unwrap();
        assert_eq!(row.get("plate_number"), Some(&FieldValue::from("XYZ999")));
        assert!(coordinator.guards().is_empty());
    }

    #[tokio::test]
    async fn test_delete_absent_is_success() {
        let (coordinator, _, _) = setup();
        let task = ReplicationTask::delete(record(42, "ABC123"), StoreId::new("default"));

        let outcome = coordinator.attempt(&task).await;
        assert!(matches!(
            outcome,
            ReplicationOutcome::Applied { action: AppliedAction::AlreadyAbsent, .. }
        ));
    }

    #[tokio::test]
    async fn test_reverse_direction_targets_primary() {
        let (coordinator, primary, replica) = setup();
        let task = ReplicationTask::upsert(record(7, "LMN456"), StoreId::new("sqlite"), UpsertMode::Insert);

        coordinator.attempt(&task).await;
        assert!(primary.get(&vehicle(), PrimaryKey(7)).is_some());
        assert_eq!(replica.transactions_begun(), 0);
    }

    #[tokio::test]
    async fn test_in_flight_key_is_skipped() {
        let (coordinator, _, replica) = setup();
        let task = upsert(record(42, "ABC123"));
        let _held = coordinator.guards().try_acquire(&task.sync_key()).unwrap();

        let outcome = coordinator.attempt(&task).await;
        assert_eq!(outcome, ReplicationOutcome::skipped(SkipReason::InFlight));
        assert_eq!(replica.transactions_begun(), 0);
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let (coordinator, _, replica) = setup();
        replica.fail_next_begin(StoreError::Connection {
            store: "sqlite".to_string(),
            message: "connection reset".to_string(),
        });

        let outcome = coordinator.attempt(&upsert(record(42, "ABC123"))).await;
        assert!(matches!(outcome, ReplicationOutcome::Applied { attempts: 2, .. }));
        assert_eq!(coordinator.stats().snapshot().retries, 1);
    }

    #[tokio::test]
    async fn test_constraint_failure_is_not_retried() {
        let (coordinator, _, replica) = setup();
        replica.fail_next_commit(StoreError::Constraint {
            store: "sqlite".to_string(),
            message: "UNIQUE constraint failed".to_string(),
        });

        let outcome = coordinator.attempt(&upsert(record(42, "ABC123"))).await;
        assert!(matches!(outcome, ReplicationOutcome::Failed { attempts: 1, .. }));
        assert!(replica.get(&vehicle(), PrimaryKey(42)).is_none());
        assert!(coordinator.guards().is_empty());
    }

    #[tokio::test]
    async fn test_timeout_rolls_back_and_releases_key() {
        let (coordinator, _, replica) = setup();
        let coordinator = coordinator.with_retry(RetryPolicy::none());
        replica.set_latency(Some(Duration::from_millis(500)));

        let outcome = coordinator.attempt(&upsert(record(42, "ABC123"))).await;
        match outcome {
            ReplicationOutcome::Failed { error, .. } => assert_eq!(error.kind(), "timeout"),
            other => panic!("expected timeout, got {other:?}"),
        }
        assert!(replica.get(&vehicle(), PrimaryKey(42)).is_none());
        assert_eq!(replica.transactions_rolled_back(), 1);
        assert!(coordinator.guards().is_empty());
    }

    #[tokio::test]
    async fn test_failed_replication_is_dead_lettered() {
        let (coordinator, _, replica) = setup();
        let log = Arc::new(DeadLetterLog::open_in_memory().unwrap());
        let coordinator = coordinator.with_dead_letters(Arc::clone(&log));
        for _ in 0..3 {
            replica.fail_next_begin(StoreError::Connection {
                store: "sqlite".to_string(),
                message: "refused".to_string(),
            });
        }

        let task = upsert(record(42, "ABC123"));
        let outcome = coordinator.replicate(&task).await;
        assert!(matches!(outcome, ReplicationOutcome::Failed { attempts: 3, .. }));

        let letters = log.list(None).unwrap();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].task.id, task.id);
        assert_eq!(letters[0].reason, DeadLetterReason::Exhausted);
    }

    #[tokio::test]
    async fn test_stale_task_is_skipped_once_key_is_held() {
        let (coordinator, _, replica) = setup();

        let outcome = coordinator.attempt_if(&upsert(record(42, "ABC123")), || false).await;
        assert_eq!(outcome, ReplicationOutcome::skipped(SkipReason::Superseded));
        assert_eq!(replica.transactions_begun(), 0);
        assert!(coordinator.guards().is_empty());
    }

    #[tokio::test]
    async fn test_applied_write_discards_older_dead_letters() {
        let (coordinator, _, replica) = setup();
        let log = Arc::new(DeadLetterLog::open_in_memory().unwrap());
        let coordinator = coordinator.with_dead_letters(Arc::clone(&log));
        replica.fail_next_commit(StoreError::Constraint {
            store: "sqlite".to_string(),
            message: "CHECK constraint failed".to_string(),
        });

        coordinator.replicate(&upsert(record(42, "ABC123"))).await;
        coordinator.replicate(&upsert(record(7, "LMN456"))).await;
        assert_eq!(log.count().unwrap(), 1);

        let newer = ReplicationTask::upsert(record(42, "XYZ999"), StoreId::new("default"), UpsertMode::Update);
        assert!(coordinator.replicate(&newer).await.is_applied());
        assert_eq!(log.count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_excluded_namespace_never_touches_stores() {
        let (coordinator, primary, replica) = setup();
        let session = Record::new(EntityType::new("sessions", "session"), 1, FieldMap::new());
        let task = ReplicationTask::upsert(session, StoreId::new("sqlite"), UpsertMode::Insert);

        let outcome = coordinator.attempt(&task).await;
        assert_eq!(outcome, ReplicationOutcome::skipped(SkipReason::Excluded));
        assert_eq!(primary.transactions_begun(), 0);
        assert_eq!(replica.transactions_begun(), 0);
    }
}
