//! SQLite store backed by a single rusqlite connection.
//!
//! SQLite admits one writer at a time, so transactions hold the connection
//! for their whole lifetime. Every rusqlite call runs on the blocking pool:
//! a busy wait on a locked file must not stall a runtime worker, and the
//! caller's timeout has to be able to fire while the statement is waiting.

use async_trait::async_trait;
use rusqlite::types::{Value, ValueRef};
use rusqlite::{params_from_iter, Connection, ErrorCode};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};
use twinstore_types::{EntityType, FieldMap, FieldValue, PrimaryKey, StoreError, StoreId};

use super::sql::{self, Dialect};
use super::{Store, StoreResult, StoreTransaction};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Timestamp layout used by the host ORM for SQLite datetime columns.
const SQLITE_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

pub struct SqliteStore {
    id: StoreId,
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) a database file.
    pub fn open(id: StoreId, path: impl AsRef<Path>) -> StoreResult<Self> {
        let conn = Connection::open(path).map_err(|err| map_sqlite_err(&id, err))?;
        Self::from_connection(id, conn)
    }

    /// Private in-memory database, mostly for tests.
    pub fn open_in_memory(id: StoreId) -> StoreResult<Self> {
        let conn = Connection::open_in_memory().map_err(|err| map_sqlite_err(&id, err))?;
        Self::from_connection(id, conn)
    }

    fn from_connection(id: StoreId, conn: Connection) -> StoreResult<Self> {
        conn.busy_timeout(BUSY_TIMEOUT).map_err(|err| map_sqlite_err(&id, err))?;
        Ok(Self { id, conn: Arc::new(Mutex::new(conn)) })
    }

    /// Run schema or fixture SQL outside the replication path.
    pub async fn execute_batch(&self, sql: &str) -> StoreResult<()> {
        let sql = sql.to_string();
        self.with_conn(move |conn| conn.execute_batch(&sql)).await
    }

    /// Read one row back as a field map (primary key excluded).
    pub async fn fetch(&self, entity: &EntityType, pk: PrimaryKey) -> StoreResult<Option<FieldMap>> {
        let table = sql::quote_ident(&self.id, &entity.table_name())?;
        let pk_column = sql::quote_ident(&self.id, EntityType::PK_COLUMN)?;
        let query = format!("SELECT * FROM {table} WHERE {pk_column} = ?1");

        let row = self
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(&query)?;
                let columns: Vec<String> =
                    stmt.column_names().iter().map(|c| (*c).to_string()).collect();
                let mut rows = stmt.query([pk.get()])?;
                let Some(row) = rows.next()? else {
                    return Ok(None);
                };
                let mut values = Vec::with_capacity(columns.len());
                for (index, column) in columns.into_iter().enumerate() {
                    values.push((column, Value::from(row.get_ref(index)?)));
                }
                Ok(Some(values))
            })
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };

        let mut fields = FieldMap::new();
        for (column, value) in row {
            if column == EntityType::PK_COLUMN {
                continue;
            }
            let value = match ValueRef::from(&value) {
                ValueRef::Null => FieldValue::Null,
                ValueRef::Integer(v) => FieldValue::Int(v),
                ValueRef::Real(v) => FieldValue::Float(v),
                ValueRef::Text(v) => FieldValue::Text(String::from_utf8_lossy(v).into_owned()),
                ValueRef::Blob(_) => {
                    return Err(StoreError::Schema {
                        store: self.id.to_string(),
                        message: format!("blob column {column} cannot be read as a field"),
                    })
                },
            };
            fields.insert(column, value);
        }
        Ok(Some(fields))
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn).lock_owned().await;
        tokio::task::spawn_blocking(move || f(&conn))
            .await
            .map_err(|err| join_err(&self.id, &err))?
            .map_err(|err| map_sqlite_err(&self.id, err))
    }
}

#[async_trait]
impl Store for SqliteStore {
    fn id(&self) -> &StoreId {
        &self.id
    }

    async fn begin(&self) -> StoreResult<Box<dyn StoreTransaction>> {
        let guard = Arc::clone(&self.conn).lock_owned().await;
        let store = self.id.clone();
        let conn = tokio::task::spawn_blocking(move || {
            let mut conn = TxConn { store, conn: guard, open: false };
            conn.conn.execute_batch("BEGIN IMMEDIATE")?;
            conn.open = true;
            Ok::<_, rusqlite::Error>(conn)
        })
        .await
        .map_err(|err| join_err(&self.id, &err))?
        .map_err(|err| map_sqlite_err(&self.id, err))?;

        Ok(Box::new(SqliteTransaction { store: self.id.clone(), conn: Some(conn) }))
    }

    async fn ping(&self) -> StoreResult<()> {
        self.with_conn(|conn| conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0)))
            .await
            .map(|_| ())
    }

    async fn close(&self) {
        // The connection itself closes when the last handle drops.
        if let Err(err) = self.with_conn(|conn| conn.execute_batch("PRAGMA optimize")).await {
            debug!(store = %self.id, "SQLite optimize on close failed: {}", err);
        }
    }
}

/// Connection locked for one transaction.
///
/// Rolls back on drop while the transaction is still open. The value may be
/// dropped on a blocking thread when the awaiting future was cancelled, so
/// the rollback lives here rather than on [`SqliteTransaction`].
struct TxConn {
    store: StoreId,
    conn: OwnedMutexGuard<Connection>,
    open: bool,
}

impl TxConn {
    fn finish(&mut self, sql: &str) -> rusqlite::Result<()> {
        let result = self.conn.execute_batch(sql);
        if result.is_err() && !self.conn.is_autocommit() {
            // A failed COMMIT leaves the transaction open.
            if let Err(err) = self.conn.execute_batch("ROLLBACK") {
                warn!(store = %self.store, "SQLite rollback after failed {} failed: {}", sql, err);
            }
        }
        self.open = !self.conn.is_autocommit();
        result
    }
}

impl Drop for TxConn {
    fn drop(&mut self) {
        if self.open {
            if let Err(err) = self.conn.execute_batch("ROLLBACK") {
                warn!(store = %self.store, "SQLite rollback on drop failed: {}", err);
            }
        }
    }
}

struct SqliteTransaction {
    store: StoreId,
    /// `None` while a statement is running on the blocking pool.
    conn: Option<TxConn>,
}

impl SqliteTransaction {
    async fn run<T, F>(&mut self, f: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut TxConn) -> rusqlite::Result<T> + Send + 'static,
    {
        let mut conn = self.conn.take().ok_or_else(|| StoreError::Query {
            store: self.store.to_string(),
            message: "transaction is no longer usable".to_string(),
        })?;
        let (conn, result) = tokio::task::spawn_blocking(move || {
            let result = f(&mut conn);
            (conn, result)
        })
        .await
        .map_err(|err| join_err(&self.store, &err))?;

        self.conn = Some(conn);
        result.map_err(|err| map_sqlite_err(&self.store, err))
    }

    async fn execute(&mut self, sql: String, pk: PrimaryKey, values: Vec<Value>) -> StoreResult<usize> {
        self.run(move |tx| {
            let params = std::iter::once(Value::Integer(pk.get())).chain(values);
            tx.conn.execute(&sql, params_from_iter(params))
        })
        .await
    }
}

#[async_trait]
impl StoreTransaction for SqliteTransaction {
    async fn exists(&mut self, entity: &EntityType, pk: PrimaryKey) -> StoreResult<bool> {
        let sql = sql::exists(Dialect::Sqlite, &self.store, entity)?;
        self.run(move |tx| tx.conn.query_row(&sql, [pk.get()], |row| row.get::<_, bool>(0)))
            .await
    }

    async fn insert(
        &mut self,
        entity: &EntityType,
        pk: PrimaryKey,
        fields: &FieldMap,
    ) -> StoreResult<()> {
        let stmt = sql::insert(Dialect::Sqlite, &self.store, entity, fields)?;
        let values = stmt.values.iter().map(|v| to_sql_value(v)).collect();
        self.execute(stmt.sql, pk, values).await.map(|_| ())
    }

    async fn update(
        &mut self,
        entity: &EntityType,
        pk: PrimaryKey,
        fields: &FieldMap,
    ) -> StoreResult<()> {
        let Some(stmt) = sql::update(Dialect::Sqlite, &self.store, entity, fields)? else {
            return Ok(());
        };
        let values = stmt.values.iter().map(|v| to_sql_value(v)).collect();
        self.execute(stmt.sql, pk, values).await.map(|_| ())
    }

    async fn delete(&mut self, entity: &EntityType, pk: PrimaryKey) -> StoreResult<bool> {
        let sql = sql::delete(Dialect::Sqlite, &self.store, entity)?;
        let removed = self.execute(sql, pk, Vec::new()).await?;
        Ok(removed > 0)
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        let mut this = self;
        this.run(|tx| tx.finish("COMMIT")).await
    }

    async fn rollback(self: Box<Self>) -> StoreResult<()> {
        let mut this = self;
        this.run(|tx| tx.finish("ROLLBACK")).await
    }
}

fn join_err(store: &StoreId, err: &tokio::task::JoinError) -> StoreError {
    StoreError::Query { store: store.to_string(), message: format!("SQLite task failed: {err}") }
}

fn to_sql_value(value: &FieldValue) -> Value {
    match value {
        FieldValue::Null => Value::Null,
        FieldValue::Bool(v) => Value::Integer(i64::from(*v)),
        FieldValue::Int(v) => Value::Integer(*v),
        FieldValue::Float(v) => Value::Real(*v),
        FieldValue::Decimal(v) | FieldValue::Text(v) => Value::Text(v.clone()),
        FieldValue::Timestamp(v) => Value::Text(v.format(SQLITE_TIMESTAMP_FORMAT).to_string()),
        FieldValue::Json(v) => Value::Text(v.to_string()),
    }
}

/// Map rusqlite error to store error.
pub(crate) fn map_sqlite_err(store: &StoreId, err: rusqlite::Error) -> StoreError {
    let store = store.to_string();
    let message = err.to_string();
    match &err {
        rusqlite::Error::SqliteFailure(failure, _) => match failure.code {
            ErrorCode::ConstraintViolation => StoreError::Constraint { store, message },
            ErrorCode::DatabaseBusy
            | ErrorCode::DatabaseLocked
            | ErrorCode::CannotOpen
            | ErrorCode::SystemIoFailure => StoreError::Connection { store, message },
            _ if is_schema_message(&message) => StoreError::Schema { store, message },
            _ => StoreError::Query { store, message },
        },
        _ if is_schema_message(&message) => StoreError::Schema { store, message },
        _ => StoreError::Query { store, message },
    }
}

fn is_schema_message(message: &str) -> bool {
    message.contains("no such table")
        || message.contains("no such column")
        || message.contains("has no column named")
}
