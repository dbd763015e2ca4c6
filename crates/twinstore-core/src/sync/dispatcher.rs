//! Bounded replication queues drained by a fixed pool of workers.
//!
//! Each worker owns one queue and a task is routed by the hash of its
//! [`SyncKey`], so writes to one record are applied in the order they were
//! captured while unrelated records spread across the pool. Bursts queue up
//! to the per-worker share of `queue_capacity`; beyond that the non-blocking
//! path rejects the task into the dead-letter log instead of spawning more
//! work.

use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use twinstore_types::{DispatchConfig, ReplicationTask, SyncError, SyncKey, SyncResult};

use super::coordinator::SyncCoordinator;
use super::dead_letter::{DeadLetter, DeadLetterReason};
use super::metrics;

/// Tasks accepted but not yet finished (queued or running).
#[derive(Debug, Default)]
struct Outstanding {
    count: AtomicUsize,
    idle: Notify,
}

impl Outstanding {
    fn begin(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }

    fn finish(&self) {
        if self.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }
}

pub struct Dispatcher {
    /// One sender per worker; `None` once shut down.
    senders: RwLock<Option<Vec<mpsc::Sender<ReplicationTask>>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    coordinator: Arc<SyncCoordinator>,
    outstanding: Arc<Outstanding>,
    /// Capacity of each worker queue.
    shard_capacity: usize,
}

impl Dispatcher {
    /// Spawn the worker pool. Must be called inside a tokio runtime.
    pub fn start(coordinator: Arc<SyncCoordinator>, config: DispatchConfig) -> Self {
        let worker_count = config.workers.max(1);
        let shard_capacity = config.queue_capacity.div_ceil(worker_count).max(1);
        let outstanding = Arc::new(Outstanding::default());

        let mut senders = Vec::with_capacity(worker_count);
        let mut workers = Vec::with_capacity(worker_count);
        for worker in 0..worker_count {
            let (sender, receiver) = mpsc::channel(shard_capacity);
            senders.push(sender);
            workers.push(tokio::spawn(worker_loop(
                worker,
                receiver,
                Arc::clone(&coordinator),
                Arc::clone(&outstanding),
            )));
        }

        info!(
            workers = worker_count,
            queue_capacity = shard_capacity * worker_count,
            "Replication dispatcher started"
        );

        Self {
            senders: RwLock::new(Some(senders)),
            workers: Mutex::new(workers),
            coordinator,
            outstanding,
            shard_capacity,
        }
    }

    /// Queue without waiting. A full or closed queue dead-letters the task.
    pub fn try_dispatch(&self, task: ReplicationTask) -> SyncResult<()> {
        self.outstanding.begin();
        let result = match self.senders.read().as_ref() {
            Some(senders) => senders[shard(&task.sync_key(), senders.len())].try_send(task),
            None => Err(TrySendError::Closed(task)),
        };
        if result.is_err() {
            self.outstanding.finish();
        }

        match result {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(task)) => {
                let key = task.sync_key();
                warn!(key = %key, capacity = self.shard_capacity, "Replication queue full, rejecting task");
                self.coordinator.stats().record_queue_rejection();
                metrics::record_queue_rejection();
                self.reject(task, DeadLetterReason::QueueFull, "replication queue full");
                Err(SyncError::QueueFull { key })
            },
            Err(TrySendError::Closed(task)) => {
                self.reject(task, DeadLetterReason::Closed, "replication dispatcher closed");
                Err(SyncError::Closed)
            },
        }
    }

    /// Queue, waiting for capacity if the task's queue is full.
    pub async fn dispatch(&self, task: ReplicationTask) -> SyncResult<()> {
        let sender = self
            .senders
            .read()
            .as_ref()
            .map(|senders| senders[shard(&task.sync_key(), senders.len())].clone());
        let Some(sender) = sender else {
            self.reject(task, DeadLetterReason::Closed, "replication dispatcher closed");
            return Err(SyncError::Closed);
        };
        self.outstanding.begin();
        match sender.send(task).await {
            Ok(()) => Ok(()),
            Err(mpsc::error::SendError(task)) => {
                self.outstanding.finish();
                self.reject(task, DeadLetterReason::Closed, "replication dispatcher closed");
                Err(SyncError::Closed)
            },
        }
    }

    /// Tasks waiting in the queues.
    pub fn pending(&self) -> usize {
        self.senders.read().as_ref().map_or(0, |senders| {
            senders
                .iter()
                .map(|sender| self.shard_capacity.saturating_sub(sender.capacity()))
                .sum()
        })
    }

    /// Tasks accepted and not yet finished, running ones included.
    pub fn outstanding(&self) -> usize {
        self.outstanding.count.load(Ordering::SeqCst)
    }

    /// Wait until every accepted task has finished.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.outstanding.idle.notified();
            if self.outstanding() == 0 {
                return;
            }
            notified.await;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.senders.read().is_none()
    }

    /// Stop accepting tasks, let workers drain their queues, and wait for them.
    pub async fn shutdown(&self) {
        if self.senders.write().take().is_none() {
            return;
        }
        let workers = std::mem::take(&mut *self.workers.lock());
        debug!(workers = workers.len(), pending = self.outstanding(), "Waiting for replication workers to drain");

        for handle in workers {
            if let Err(err) = handle.await {
                error!(error = %err, "Replication worker terminated abnormally");
            }
        }
        info!("Replication dispatcher stopped");
    }

    fn reject(&self, task: ReplicationTask, reason: DeadLetterReason, message: &str) {
        let letter = DeadLetter::new(task, None, reason, message, 0);
        self.coordinator.dead_letter(&letter);
    }
}

/// Worker index owning `key`.
fn shard(key: &SyncKey, shards: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % shards as u64) as usize
}

async fn worker_loop(
    worker: usize,
    mut receiver: mpsc::Receiver<ReplicationTask>,
    coordinator: Arc<SyncCoordinator>,
    outstanding: Arc<Outstanding>,
) {
    while let Some(task) = receiver.recv().await {
        let key = task.sync_key();
        let result = AssertUnwindSafe(coordinator.replicate(&task)).catch_unwind().await;
        if result.is_err() {
            error!(worker, key = %key, operation = %task.operation, "Replication task panicked");
        }
        outstanding.finish();
    }
    debug!(worker, "Replication worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, Store};
    use crate::sync::{DeadLetterLog, RoutingTable, SyncGuardSet};
    use std::time::Duration;
    use twinstore_types::{EntityType, FieldMap, FieldValue, PrimaryKey, Record, StoreId, UpsertMode};

    fn task(pk: i64) -> ReplicationTask {
        let mut fields = FieldMap::new();
        fields.insert("plate_number".to_string(), FieldValue::from(format!("PLATE{pk}")));
        ReplicationTask::upsert(
            Record::new(EntityType::new("core", "vehicle"), pk, fields),
            StoreId::new("default"),
            UpsertMode::Insert,
        )
    }

    fn coordinator(replica: &MemoryStore, log: &Arc<DeadLetterLog>) -> Arc<SyncCoordinator> {
        let primary = MemoryStore::new(StoreId::new("default"));
        let routing = RoutingTable::new(StoreId::new("default"), StoreId::new("sqlite"), Vec::new());
        let stores: Vec<Arc<dyn Store>> = vec![Arc::new(primary), Arc::new(replica.clone())];
        Arc::new(
            SyncCoordinator::new(routing, stores, SyncGuardSet::new())
                .with_dead_letters(Arc::clone(log)),
        )
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_shutdown_drains_queue() {
        let replica = MemoryStore::new(StoreId::new("sqlite"));
        let log = Arc::new(DeadLetterLog::open_in_memory().unwrap());
        let dispatcher = Dispatcher::start(
            coordinator(&replica, &log),
            DispatchConfig { workers: 3, queue_capacity: 64 },
        );

        for pk in 1..=50 {
            dispatcher.dispatch(task(pk)).await.unwrap();
        }
        dispatcher.shutdown().await;

        assert_eq!(replica.len(&EntityType::new("core", "vehicle")), 50);
        assert!(dispatcher.is_closed());
        assert_eq!(log.count().unwrap(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_same_key_writes_apply_in_capture_order() {
        let replica = MemoryStore::new(StoreId::new("sqlite"));
        replica.set_latency(Some(Duration::from_millis(1)));
        let log = Arc::new(DeadLetterLog::open_in_memory().unwrap());
        let coordinator = coordinator(&replica, &log);
        let dispatcher = Dispatcher::start(
            Arc::clone(&coordinator),
            DispatchConfig { workers: 4, queue_capacity: 256 },
        );

        for version in 0..40 {
            let mut fields = FieldMap::new();
            fields.insert("plate_number".to_string(), FieldValue::from(format!("V{version}")));
            let record = Record::new(EntityType::new("core", "vehicle"), 42, fields);
            let mode = if version == 0 { UpsertMode::Insert } else { UpsertMode::Update };
            dispatcher
                .dispatch(ReplicationTask::upsert(record, StoreId::new("default"), mode))
                .await
                .unwrap();
            dispatcher.dispatch(task(1_000 + version)).await.unwrap();
        }
        dispatcher.wait_idle().await;

        let row = replica.get(&EntityType::new("core", "vehicle"), PrimaryKey(42)).unwrap();
        assert_eq!(row.get("plate_number"), Some(&FieldValue::from("V39")));
        let stats = coordinator.stats().snapshot();
        assert_eq!(stats.applied, 80);
        assert_eq!(stats.skipped_in_flight, 0);
        dispatcher.shutdown().await;
    }

    #[test]
    fn test_shard_is_stable_per_key() {
        let key = task(42).sync_key();
        let first = shard(&key, 8);
        assert!(first < 8);
        assert_eq!(shard(&key, 8), first);
        assert_eq!(shard(&key, 1), 0);
    }

    #[tokio::test]
    async fn test_full_queue_rejects_into_dead_letters() {
        let replica = MemoryStore::new(StoreId::new("sqlite"));
        replica.set_latency(Some(Duration::from_millis(100)));
        let log = Arc::new(DeadLetterLog::open_in_memory().unwrap());
        let coordinator = coordinator(&replica, &log);
        let dispatcher =
            Dispatcher::start(Arc::clone(&coordinator), DispatchConfig { workers: 1, queue_capacity: 1 });

        let mut rejected = 0;
        for pk in 1..=10 {
            if let Err(err) = dispatcher.try_dispatch(task(pk)) {
                assert!(matches!(err, SyncError::QueueFull { .. }));
                rejected += 1;
            }
        }

        assert!(rejected >= 8);
        dispatcher.wait_idle().await;
        assert_eq!(dispatcher.outstanding(), 0);
        assert_eq!(coordinator.stats().snapshot().queue_rejections, rejected);
        assert_eq!(log.count().unwrap(), rejected as usize);
        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_dispatch_after_shutdown_is_closed() {
        let replica = MemoryStore::new(StoreId::new("sqlite"));
        let log = Arc::new(DeadLetterLog::open_in_memory().unwrap());
        let dispatcher = Dispatcher::start(coordinator(&replica, &log), DispatchConfig::default());
        dispatcher.shutdown().await;

        assert_eq!(dispatcher.try_dispatch(task(1)), Err(SyncError::Closed));
        assert_eq!(dispatcher.dispatch(task(2)).await, Err(SyncError::Closed));
        assert_eq!(dispatcher.pending(), 0);
        assert!(replica.get(&EntityType::new("core", "vehicle"), PrimaryKey(1)).is_none());
        assert_eq!(log.count().unwrap(), 2);
    }
}
