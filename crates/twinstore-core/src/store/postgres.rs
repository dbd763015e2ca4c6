//! PostgreSQL store backed by an sqlx connection pool.

use async_trait::async_trait;
use sqlx::error::ErrorKind;
use sqlx::postgres::{PgArguments, PgPool, PgPoolOptions, Postgres};
use sqlx::query::Query;
use sqlx::{Row, Transaction};
use std::time::Duration;
use twinstore_types::{EntityType, FieldMap, FieldValue, PrimaryKey, StoreError, StoreId};

use super::sql::{self, Dialect, Statement};
use super::{Store, StoreResult, StoreTransaction};

/// PostgreSQL-backed store.
pub struct PostgresStore {
    id: StoreId,
    /// Database connection pool.
    pool: PgPool,
}

impl PostgresStore {
    /// Create store with existing pool.
    pub fn new(id: StoreId, pool: PgPool) -> Self {
        Self { id, pool }
    }

    /// Get reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Connect to database and create store.
    pub async fn connect(id: StoreId, database_url: &str, max_connections: u32) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(1)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(300))
            .connect(database_url)
            .await
            .map_err(|err| map_sqlx_err(&id, err))?;
        Ok(Self::new(id, pool))
    }
}

#[async_trait]
impl Store for PostgresStore {
    fn id(&self) -> &StoreId {
        &self.id
    }

    async fn begin(&self) -> StoreResult<Box<dyn StoreTransaction>> {
        let tx = self.pool.begin().await.map_err(|err| map_sqlx_err(&self.id, err))?;
        Ok(Box::new(PostgresTransaction { store: self.id.clone(), tx }))
    }

    async fn ping(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(|err| map_sqlx_err(&self.id, err))
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

/// Open transaction on the pool. Dropping it without commit rolls back.
struct PostgresTransaction {
    store: StoreId,
    tx: Transaction<'static, Postgres>,
}

impl PostgresTransaction {
    async fn execute(&mut self, stmt: &Statement<'_>, pk: PrimaryKey) -> StoreResult<u64> {
        let mut query = sqlx::query(&stmt.sql).bind(pk.get());
        for value in &stmt.values {
            query = bind_value(query, value);
        }
        query
            .execute(&mut *self.tx)
            .await
            .map(|result| result.rows_affected())
            .map_err(|err| map_sqlx_err(&self.store, err))
    }
}

#[async_trait]
impl StoreTransaction for PostgresTransaction {
    async fn exists(&mut self, entity: &EntityType, pk: PrimaryKey) -> StoreResult<bool> {
        let sql = sql::exists(Dialect::Postgres, &self.store, entity)?;
        let row = sqlx::query(&sql)
            .bind(pk.get())
            .fetch_one(&mut *self.tx)
            .await
            .map_err(|err| map_sqlx_err(&self.store, err))?;
        row.try_get::<bool, _>(0).map_err(|err| map_sqlx_err(&self.store, err))
    }

    async fn insert(
        &mut self,
        entity: &EntityType,
        pk: PrimaryKey,
        fields: &FieldMap,
    ) -> StoreResult<()> {
        let stmt = sql::insert(Dialect::Postgres, &self.store, entity, fields)?;
        self.execute(&stmt, pk).await.map(|_| ())
    }

    async fn update(
        &mut self,
        entity: &EntityType,
        pk: PrimaryKey,
        fields: &FieldMap,
    ) -> StoreResult<()> {
        match sql::update(Dialect::Postgres, &self.store, entity, fields)? {
            Some(stmt) => self.execute(&stmt, pk).await.map(|_| ()),
            None => Ok(()),
        }
    }

    async fn delete(&mut self, entity: &EntityType, pk: PrimaryKey) -> StoreResult<bool> {
        let sql = sql::delete(Dialect::Postgres, &self.store, entity)?;
        let result = sqlx::query(&sql)
            .bind(pk.get())
            .execute(&mut *self.tx)
            .await
            .map_err(|err| map_sqlx_err(&self.store, err))?;
        Ok(result.rows_affected() > 0)
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        let Self { store, tx } = *self;
        tx.commit().await.map_err(|err| map_sqlx_err(&store, err))
    }

    async fn rollback(self: Box<Self>) -> StoreResult<()> {
        let Self { store, tx } = *self;
        tx.rollback().await.map_err(|err| map_sqlx_err(&store, err))
    }
}

fn bind_value<'q>(
    query: Query<'q, Postgres, PgArguments>,
    value: &'q FieldValue,
) -> Query<'q, Postgres, PgArguments> {
    match value {
        // Rendered inline by the statement builder.
        FieldValue::Null => query,
        FieldValue::Bool(v) => query.bind(*v),
        FieldValue::Int(v) => query.bind(*v),
        FieldValue::Float(v) => query.bind(*v),
        FieldValue::Decimal(v) | FieldValue::Text(v) => query.bind(v.as_str()),
        FieldValue::Timestamp(v) => query.bind(*v),
        FieldValue::Json(v) => query.bind(sqlx::types::Json(v)),
    }
}

/// Map sqlx error to store error.
pub(crate) fn map_sqlx_err(store: &StoreId, err: sqlx::Error) -> StoreError {
    let store = store.to_string();
    match err {
        sqlx::Error::Database(db) => {
            let message = db.message().to_string();
            match db.kind() {
                ErrorKind::UniqueViolation
                | ErrorKind::ForeignKeyViolation
                | ErrorKind::NotNullViolation
                | ErrorKind::CheckViolation => StoreError::Constraint { store, message },
                _ => match db.code().as_deref() {
                    // undefined_table, undefined_column
                    Some("42P01" | "42703") => StoreError::Schema { store, message },
                    // connection_exception class, admin shutdown, cannot connect now
                    Some(code) if code.starts_with("08") || code == "57P01" || code == "57P03" => {
                        StoreError::Connection { store, message }
                    },
                    _ => StoreError::Query { store, message },
                },
            }
        },
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => StoreError::Connection { store, message: err.to_string() },
        sqlx::Error::ColumnNotFound(_) => StoreError::Schema { store, message: err.to_string() },
        other => StoreError::Query { store, message: other.to_string() },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_errors_are_transient() {
        let err = map_sqlx_err(&StoreId::new("default"), sqlx::Error::PoolTimedOut);
        assert!(err.is_transient());
        assert_eq!(err.store(), "default");
    }

    #[test]
    fn test_missing_column_is_schema_error() {
        let err = map_sqlx_err(
            &StoreId::new("default"),
            sqlx::Error::ColumnNotFound("plate_number".to_string()),
        );
        assert_eq!(err.kind(), "schema");
        assert!(!err.is_transient());
    }
}
