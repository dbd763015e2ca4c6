//! Store abstraction for the two mirrored relational databases.
//!
//! Every replicated write runs inside a [`StoreTransaction`] obtained from
//! [`Store::begin`]. A transaction dropped without `commit` is rolled back, so
//! a cancelled or timed-out attempt never leaves partial writes behind.

mod memory;
mod postgres;
mod sql;
mod sqlite;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use std::sync::Arc;
use twinstore_types::{EntityType, FieldMap, PrimaryKey, StoreConfig, StoreError, StoreId};

use crate::error::CoreResult;

pub type StoreResult<T> = Result<T, StoreError>;

/// One of the two independently addressable stores.
#[async_trait]
pub trait Store: Send + Sync {
    fn id(&self) -> &StoreId;

    /// Open a transaction scoped to this store.
    async fn begin(&self) -> StoreResult<Box<dyn StoreTransaction>>;

    /// Cheap round-trip used by connectivity checks.
    async fn ping(&self) -> StoreResult<()>;

    /// Release pooled connections. Called once at shutdown.
    async fn close(&self);
}

/// Uniform write interface inside one transaction boundary.
#[async_trait]
pub trait StoreTransaction: Send {
    async fn exists(&mut self, entity: &EntityType, pk: PrimaryKey) -> StoreResult<bool>;

    /// Insert a full row. The primary key is written explicitly so both stores
    /// share one key space.
    async fn insert(
        &mut self,
        entity: &EntityType,
        pk: PrimaryKey,
        fields: &FieldMap,
    ) -> StoreResult<()>;

    /// Field-level update of an existing row.
    async fn update(
        &mut self,
        entity: &EntityType,
        pk: PrimaryKey,
        fields: &FieldMap,
    ) -> StoreResult<()>;

    /// Delete by primary key. Returns whether a row was removed; deleting an
    /// absent row is not an error.
    async fn delete(&mut self, entity: &EntityType, pk: PrimaryKey) -> StoreResult<bool>;

    async fn commit(self: Box<Self>) -> StoreResult<()>;

    async fn rollback(self: Box<Self>) -> StoreResult<()>;
}

/// Open a store from its configured URL.
///
/// - `postgres://` / `postgresql://` → [`PostgresStore`]
/// - `memory:` → [`MemoryStore`]
/// - `sqlite:<path>`, `sqlite://<path>` or a bare path → [`SqliteStore`]
pub async fn connect(config: &StoreConfig) -> CoreResult<Arc<dyn Store>> {
    let id = config.store_id();
    let url = config.url.trim();

    if url.starts_with("postgres://") || url.starts_with("postgresql://") {
        let store = PostgresStore::connect(id, url, config.max_connections).await?;
        return Ok(Arc::new(store));
    }
    if url.starts_with("memory:") {
        return Ok(Arc::new(MemoryStore::new(id)));
    }

    let path = url
        .strip_prefix("sqlite://")
        .or_else(|| url.strip_prefix("sqlite:"))
        .unwrap_or(url);
    let store = SqliteStore::open(id, path)?;
    Ok(Arc::new(store))
}
