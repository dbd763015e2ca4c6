//! Change interceptor: turns host persistence events into replication tasks.
//!
//! The host calls the hooks from its own write path. Hooks never fail and
//! never block on the remote store; whatever goes wrong is logged and reported
//! back as an informational [`Interception`].

use std::any::TypeId;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, trace, warn};
use twinstore_types::{
    CaptureError, EntityType, FieldMap, PrimaryKey, Record, ReplicationTask, StoreId, SyncError,
    SyncKey, SyncOperation, UpsertMode,
};

use super::dispatcher::Dispatcher;
use super::guard::SyncGuardSet;
use super::metrics::{self, SyncStats};
use super::routing::RoutingTable;

/// A domain type whose writes are mirrored.
pub trait SyncEntity: Send + Sync + 'static {
    /// `namespace` is the governing module, `name` the model.
    fn entity_type() -> EntityType
    where
        Self: Sized;

    /// `None` until the source store has assigned a key.
    fn primary_key(&self) -> Option<PrimaryKey>;

    /// Field snapshot, primary key excluded.
    fn capture(&self) -> Result<FieldMap, CaptureError>;
}

/// Startup-time list of mirrored entity types.
///
/// Filled with [`EntityRegistry::register`] before the interceptor is built;
/// read-only afterwards.
#[derive(Debug, Default, Clone)]
pub struct EntityRegistry {
    by_type: HashMap<TypeId, EntityType>,
}

impl EntityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<E: SyncEntity>(&mut self) -> &mut Self {
        let entity = E::entity_type();
        if self.by_type.values().any(|known| *known == entity) {
            warn!(entity = %entity, "Entity type registered twice under different Rust types");
        }
        debug!(entity = %entity, "Registered entity type");
        self.by_type.insert(TypeId::of::<E>(), entity);
        self
    }

    pub fn lookup<E: SyncEntity>(&self) -> Option<&EntityType> {
        self.by_type.get(&TypeId::of::<E>())
    }

    pub fn is_registered<E: SyncEntity>(&self) -> bool {
        self.by_type.contains_key(&TypeId::of::<E>())
    }

    pub fn entity_types(&self) -> impl Iterator<Item = &EntityType> {
        self.by_type.values()
    }

    /// Distinct namespaces of every registered type.
    pub fn namespaces(&self) -> BTreeSet<String> {
        self.by_type.values().map(|entity| entity.namespace.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.by_type.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_type.is_empty()
    }
}

/// Pre-write classification of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteIntent {
    /// No primary key yet: will be inserted.
    Insert,
    /// Already persisted: will be updated.
    Update,
    /// Unregistered or excluded type: writes are not mirrored.
    Untracked,
}

impl WriteIntent {
    pub fn upsert_mode(self) -> Option<UpsertMode> {
        match self {
            Self::Insert => Some(UpsertMode::Insert),
            Self::Update => Some(UpsertMode::Update),
            Self::Untracked => None,
        }
    }
}

/// Why a hook produced no task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    Unregistered,
    Excluded,
    /// Reflected write of a replication that is still running.
    InFlight,
}

/// What a hook did. Purely informational; hosts may discard it.
#[derive(Debug, Clone, PartialEq)]
pub enum Interception {
    Dispatched { key: SyncKey, operation: SyncOperation },
    Ignored(IgnoreReason),
    /// Already logged (and dead-lettered when the queue refused the task).
    Failed(SyncError),
}

impl Interception {
    pub fn is_dispatched(&self) -> bool {
        matches!(self, Self::Dispatched { .. })
    }
}

pub struct ChangeInterceptor {
    registry: Arc<EntityRegistry>,
    routing: RoutingTable,
    guards: SyncGuardSet,
    dispatcher: Arc<Dispatcher>,
    stats: Arc<SyncStats>,
}

impl ChangeInterceptor {
    pub fn new(
        registry: Arc<EntityRegistry>,
        routing: RoutingTable,
        guards: SyncGuardSet,
        dispatcher: Arc<Dispatcher>,
        stats: Arc<SyncStats>,
    ) -> Self {
        Self { registry, routing, guards, dispatcher, stats }
    }

    pub fn registry(&self) -> &EntityRegistry {
        &self.registry
    }

    /// Classify a record about to be written on `source`.
    pub fn on_before_write<E: SyncEntity>(&self, instance: &E, source: &StoreId) -> WriteIntent {
        let Some(entity) = self.tracked::<E>() else {
            return WriteIntent::Untracked;
        };
        let intent = if instance.primary_key().is_some() {
            WriteIntent::Update
        } else {
            WriteIntent::Insert
        };
        trace!(entity = %entity, source = %source, ?intent, "Pre-write");
        intent
    }

    /// Mirror a committed insert or update.
    pub fn on_after_write<E: SyncEntity>(
        &self,
        instance: &E,
        source: &StoreId,
        was_created: bool,
    ) -> Interception {
        let mode = if was_created { UpsertMode::Insert } else { UpsertMode::Update };
        self.intercept(instance, source, SyncOperation::Upsert(mode))
    }

    /// Mirror a committed delete. `instance` is the record as it was before
    /// removal, so its primary key is still known.
    pub fn on_after_delete<E: SyncEntity>(&self, instance: &E, source: &StoreId) -> Interception {
        self.intercept(instance, source, SyncOperation::Delete)
    }

    fn tracked<E: SyncEntity>(&self) -> Option<&EntityType> {
        self.registry
            .lookup::<E>()
            .filter(|entity| !self.routing.is_excluded(&entity.namespace))
    }

    fn intercept<E: SyncEntity>(
        &self,
        instance: &E,
        source: &StoreId,
        operation: SyncOperation,
    ) -> Interception {
        let Some(entity) = self.registry.lookup::<E>() else {
            debug!(entity = %E::entity_type(), "Write on unregistered entity type ignored");
            return Interception::Ignored(IgnoreReason::Unregistered);
        };
        if self.routing.is_excluded(&entity.namespace) {
            trace!(entity = %entity, "Write on excluded namespace ignored");
            return Interception::Ignored(IgnoreReason::Excluded);
        }

        let record = match snapshot(entity, instance, operation) {
            Ok(record) => record,
            Err(err) => {
                warn!(entity = %entity, source = %source, operation = %operation, error = %err, "Failed to capture write");
                self.stats.record_capture_error();
                return Interception::Failed(err.into());
            },
        };

        let key = record.sync_key();
        if self.guards.contains(&key) {
            trace!(key = %key, source = %source, "Reflected write of in-flight replication ignored");
            self.stats.record_guard_skip();
            metrics::record_guard_skip(&key);
            return Interception::Ignored(IgnoreReason::InFlight);
        }

        self.stats.record_captured();
        let task = ReplicationTask::new(record, source.clone(), operation);
        match self.dispatcher.try_dispatch(task) {
            Ok(()) => {
                trace!(key = %key, source = %source, operation = %operation, "Replication queued");
                Interception::Dispatched { key, operation }
            },
            Err(err) => Interception::Failed(err),
        }
    }
}

/// Deletes only need the key; the field snapshot is skipped for them.
fn snapshot<E: SyncEntity>(
    entity: &EntityType,
    instance: &E,
    operation: SyncOperation,
) -> Result<Record, CaptureError> {
    let pk = instance
        .primary_key()
        .ok_or_else(|| CaptureError::MissingPrimaryKey { entity: entity.to_string() })?;
    let fields = match operation {
        SyncOperation::Upsert(_) => instance.capture()?,
        SyncOperation::Delete => FieldMap::new(),
    };
    Ok(Record::new(entity.clone(), pk, fields))
}
