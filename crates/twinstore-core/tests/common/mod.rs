//! Shared fixtures: two parking-domain entity types plus session state.
#![allow(dead_code, reason = "each integration test binary uses a different subset")]

use std::sync::Arc;
use std::time::Duration;
use twinstore_core::{DeadLetterLog, EntityRegistry, MemoryStore, Store, SyncEntity, SyncRuntime};
use twinstore_types::{
    CaptureError, EntityType, FieldMap, FieldValue, PrimaryKey, StoreConfig, StoreId, SyncConfig,
};

pub const PRIMARY: &str = "default";
pub const REPLICA: &str = "sqlite";

pub fn primary_id() -> StoreId {
    StoreId::new(PRIMARY)
}

pub fn replica_id() -> StoreId {
    StoreId::new(REPLICA)
}

#[derive(Debug, Clone, PartialEq)]
pub struct Vehicle {
    pub id: Option<i64>,
    pub plate_number: String,
}

impl Vehicle {
    pub fn new(id: i64, plate_number: &str) -> Self {
        Self { id: Some(id), plate_number: plate_number.to_string() }
    }

    pub fn fields(&self) -> FieldMap {
        let mut fields = FieldMap::new();
        fields.insert("plate_number".to_string(), FieldValue::from(self.plate_number.as_str()));
        fields
    }

    pub fn from_fields(pk: PrimaryKey, fields: &FieldMap) -> Self {
        let plate_number = match fields.get("plate_number") {
            Some(FieldValue::Text(plate)) => plate.clone(),
            _ => String::new(),
        };
        Self { id: Some(pk.get()), plate_number }
    }
}

impl SyncEntity for Vehicle {
    fn entity_type() -> EntityType {
        EntityType::new("core", "vehicle")
    }

    fn primary_key(&self) -> Option<PrimaryKey> {
        self.id.map(PrimaryKey)
    }

    fn capture(&self) -> Result<FieldMap, CaptureError> {
        Ok(self.fields())
    }
}

#[derive(Debug, Clone)]
pub struct Reservation {
    pub id: i64,
    pub vehicle_id: i64,
    pub total_cost: String,
    pub is_paid: bool,
    pub start_time: chrono::DateTime<chrono::Utc>,
    pub notes: Option<String>,
}

impl SyncEntity for Reservation {
    fn entity_type() -> EntityType {
        EntityType::new("parking", "reservation")
    }

    fn primary_key(&self) -> Option<PrimaryKey> {
        Some(PrimaryKey(self.id))
    }

    fn capture(&self) -> Result<FieldMap, CaptureError> {
        let mut fields = FieldMap::new();
        fields.insert("vehicle_id".to_string(), FieldValue::Int(self.vehicle_id));
        fields.insert("total_cost".to_string(), FieldValue::Decimal(self.total_cost.clone()));
        fields.insert("is_paid".to_string(), FieldValue::Bool(self.is_paid));
        fields.insert("start_time".to_string(), FieldValue::Timestamp(self.start_time));
        fields.insert("notes".to_string(), FieldValue::from(self.notes.clone()));
        Ok(fields)
    }
}

#[derive(Debug, Clone)]
pub struct Session {
    pub id: i64,
    pub data: String,
}

impl SyncEntity for Session {
    fn entity_type() -> EntityType {
        EntityType::new("sessions", "session")
    }

    fn primary_key(&self) -> Option<PrimaryKey> {
        Some(PrimaryKey(self.id))
    }

    fn capture(&self) -> Result<FieldMap, CaptureError> {
        let mut fields = FieldMap::new();
        fields.insert("session_data".to_string(), FieldValue::from(self.data.as_str()));
        Ok(fields)
    }
}

pub fn registry() -> EntityRegistry {
    let mut registry = EntityRegistry::new();
    registry.register::<Vehicle>().register::<Reservation>().register::<Session>();
    registry
}

/// Fast retries and a short transaction bound so failure tests stay quick.
pub fn config() -> SyncConfig {
    let mut config = SyncConfig::new(
        StoreConfig::new(PRIMARY, "memory:"),
        StoreConfig::new(REPLICA, "memory:"),
    );
    config.retry.base_delay_ms = 1;
    config.retry.max_delay_ms = 10;
    config.transaction_timeout_ms = 300;
    config
}

pub struct Harness {
    pub runtime: SyncRuntime,
    pub primary: MemoryStore,
    pub replica: MemoryStore,
}

pub fn harness_with(config: SyncConfig) -> Harness {
    let primary = MemoryStore::new(primary_id());
    let replica = MemoryStore::new(replica_id());
    let runtime = SyncRuntime::with_stores(
        config,
        registry(),
        Arc::new(primary.clone()),
        Arc::new(replica.clone()),
        Arc::new(DeadLetterLog::open_in_memory().expect("in-memory dead-letter log")),
    )
    .expect("runtime assembles");
    Harness { runtime, primary, replica }
}

pub fn harness() -> Harness {
    harness_with(config())
}

impl Harness {
    /// Host-side insert or update on the primary, followed by the post-write hook.
    pub fn save_vehicle(&self, vehicle: &Vehicle, was_created: bool) -> twinstore_core::Interception {
        let pk = vehicle.primary_key().expect("saved vehicle has a key");
        self.primary.put(Vehicle::entity_type(), pk, vehicle.fields());
        self.runtime.interceptor().on_after_write(vehicle, &primary_id(), was_created)
    }

    pub fn replica_vehicle(&self, pk: i64) -> Option<Vehicle> {
        self.replica
            .get(&Vehicle::entity_type(), PrimaryKey(pk))
            .map(|fields| Vehicle::from_fields(PrimaryKey(pk), &fields))
    }
}

pub fn as_store(store: &MemoryStore) -> Arc<dyn Store> {
    Arc::new(store.clone())
}

/// Poll `condition` for up to two seconds.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
