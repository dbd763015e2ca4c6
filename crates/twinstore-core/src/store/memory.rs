//! In-memory store.
//!
//! Used as the fake target in tests and for `memory:` URLs. Supports fault
//! injection (`fail_next_begin`, `fail_next_commit`) and artificial latency so
//! timeout and concurrency behavior can be exercised without a database.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use twinstore_types::{EntityType, FieldMap, PrimaryKey, StoreError, StoreId};

use super::{Store, StoreResult, StoreTransaction};

type Tables = HashMap<EntityType, BTreeMap<PrimaryKey, FieldMap>>;

#[derive(Debug, Default)]
struct Faults {
    begin: VecDeque<StoreError>,
    commit: VecDeque<StoreError>,
}

#[derive(Debug, Default)]
struct Counters {
    begun: AtomicU64,
    committed: AtomicU64,
    rolled_back: AtomicU64,
    active: AtomicUsize,
    peak_active: AtomicUsize,
}

#[derive(Debug)]
struct Shared {
    tables: Mutex<Tables>,
    /// When set, only these entity types have a "table".
    schema: Mutex<Option<HashSet<EntityType>>>,
    faults: Mutex<Faults>,
    latency: Mutex<Option<Duration>>,
    counters: Counters,
}

/// Cloneable handle; clones share the same data.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    id: StoreId,
    shared: Arc<Shared>,
}

impl MemoryStore {
    pub fn new(id: StoreId) -> Self {
        Self {
            id,
            shared: Arc::new(Shared {
                tables: Mutex::new(HashMap::new()),
                schema: Mutex::new(None),
                faults: Mutex::new(Faults::default()),
                latency: Mutex::new(None),
                counters: Counters::default(),
            }),
        }
    }

    /// Restrict the store to the given entity types; others fail with a
    /// schema error.
    pub fn with_schema(self, entities: impl IntoIterator<Item = EntityType>) -> Self {
        *self.shared.schema.lock() = Some(entities.into_iter().collect());
        self
    }

    /// Delay applied inside every transaction statement.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.shared.latency.lock() = latency;
    }

    /// Make the next `begin` fail with `err`.
    pub fn fail_next_begin(&self, err: StoreError) {
        self.shared.faults.lock().begin.push_back(err);
    }

    /// Make the next `commit` fail with `err` (the transaction is discarded).
    pub fn fail_next_commit(&self, err: StoreError) {
        self.shared.faults.lock().commit.push_back(err);
    }

    /// Write directly, bypassing transactions (fixture setup).
    pub fn put(&self, entity: EntityType, pk: PrimaryKey, fields: FieldMap) {
        self.shared.tables.lock().entry(entity).or_default().insert(pk, fields);
    }

    pub fn get(&self, entity: &EntityType, pk: PrimaryKey) -> Option<FieldMap> {
        self.shared.tables.lock().get(entity).and_then(|rows| rows.get(&pk).cloned())
    }

    pub fn len(&self, entity: &EntityType) -> usize {
        self.shared.tables.lock().get(entity).map_or(0, BTreeMap::len)
    }

    pub fn is_empty(&self, entity: &EntityType) -> bool {
        self.len(entity) == 0
    }

    /// Number of transactions ever opened on this store.
    pub fn transactions_begun(&self) -> u64 {
        self.shared.counters.begun.load(Ordering::SeqCst)
    }

    pub fn transactions_committed(&self) -> u64 {
        self.shared.counters.committed.load(Ordering::SeqCst)
    }

    pub fn transactions_rolled_back(&self) -> u64 {
        self.shared.counters.rolled_back.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously open transactions observed.
    pub fn peak_concurrent_transactions(&self) -> usize {
        self.shared.counters.peak_active.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Store for MemoryStore {
    fn id(&self) -> &StoreId {
        &self.id
    }

    async fn begin(&self) -> StoreResult<Box<dyn StoreTransaction>> {
        if let Some(err) = self.shared.faults.lock().begin.pop_front() {
            return Err(err);
        }

        let counters = &self.shared.counters;
        counters.begun.fetch_add(1, Ordering::SeqCst);
        let active = counters.active.fetch_add(1, Ordering::SeqCst) + 1;
        counters.peak_active.fetch_max(active, Ordering::SeqCst);

        Ok(Box::new(MemoryTransaction {
            store: self.id.clone(),
            shared: Arc::clone(&self.shared),
            pending: Vec::new(),
            finished: false,
        }))
    }

    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }

    async fn close(&self) {}
}

#[derive(Debug)]
enum Pending {
    Put(EntityType, PrimaryKey, FieldMap),
    Remove(EntityType, PrimaryKey),
}

struct MemoryTransaction {
    store: StoreId,
    shared: Arc<Shared>,
    pending: Vec<Pending>,
    finished: bool,
}

impl MemoryTransaction {
    async fn statement(&self, entity: &EntityType) -> StoreResult<()> {
        let latency = *self.shared.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        let known = self.shared.schema.lock().as_ref().map_or(true, |s| s.contains(entity));
        if known {
            Ok(())
        } else {
            Err(StoreError::Schema {
                store: self.store.to_string(),
                message: format!("no such table: {}", entity.table_name()),
            })
        }
    }

    /// Current view: committed rows overlaid with this transaction's writes.
    fn current(&self, entity: &EntityType, pk: PrimaryKey) -> Option<FieldMap> {
        let mut row = self.shared.tables.lock().get(entity).and_then(|rows| rows.get(&pk).cloned());
        for op in &self.pending {
            match op {
                Pending::Put(e, p, fields) if e == entity && *p == pk => row = Some(fields.clone()),
                Pending::Remove(e, p) if e == entity && *p == pk => row = None,
                _ => {},
            }
        }
        row
    }

    fn finish(&mut self) {
        self.finished = true;
        self.shared.counters.active.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl StoreTransaction for MemoryTransaction {
    async fn exists(&mut self, entity: &EntityType, pk: PrimaryKey) -> StoreResult<bool> {
        self.statement(entity).await?;
        Ok(self.current(entity, pk).is_some())
    }

    async fn insert(
        &mut self,
        entity: &EntityType,
        pk: PrimaryKey,
        fields: &FieldMap,
    ) -> StoreResult<()> {
        self.statement(entity).await?;
        if self.current(entity, pk).is_some() {
            return Err(StoreError::Constraint {
                store: self.store.to_string(),
                message: format!("duplicate key {pk} in {}", entity.table_name()),
            });
        }
        self.pending.push(Pending::Put(entity.clone(), pk, fields.clone()));
        Ok(())
    }

    async fn update(
        &mut self,
        entity: &EntityType,
        pk: PrimaryKey,
        fields: &FieldMap,
    ) -> StoreResult<()> {
        self.statement(entity).await?;
        if let Some(mut row) = self.current(entity, pk) {
            row.extend(fields.iter().map(|(k, v)| (k.clone(), v.clone())));
            self.pending.push(Pending::Put(entity.clone(), pk, row));
        }
        Ok(())
    }

    async fn delete(&mut self, entity: &EntityType, pk: PrimaryKey) -> StoreResult<bool> {
        self.statement(entity).await?;
        let existed = self.current(entity, pk).is_some();
        if existed {
            self.pending.push(Pending::Remove(entity.clone(), pk));
        }
        Ok(existed)
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        let mut this = self;
        this.finish();
        if let Some(err) = this.shared.faults.lock().commit.pop_front() {
            this.shared.counters.rolled_back.fetch_add(1, Ordering::SeqCst);
            return Err(err);
        }

        let mut tables = this.shared.tables.lock();
        for op in this.pending.drain(..) {
            match op {
                Pending::Put(entity, pk, fields) => {
                    tables.entry(entity).or_default().insert(pk, fields);
                },
                Pending::Remove(entity, pk) => {
                    if let Some(rows) = tables.get_mut(&entity) {
                        rows.remove(&pk);
                    }
                },
            }
        }
        drop(tables);
        this.shared.counters.committed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> StoreResult<()> {
        let mut this = self;
        this.finish();
        this.shared.counters.rolled_back.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        if !self.finished {
            self.finish();
            self.shared.counters.rolled_back.fetch_add(1, Ordering::SeqCst);
        }
    }
}
