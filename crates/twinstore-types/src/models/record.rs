//! Records, entity identities and the derived sync key.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Identifier of one of the two mirrored stores (e.g. `"default"`, `"sqlite"`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StoreId(String);

impl StoreId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StoreId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Entity type: the governing namespace (application label) plus model name.
///
/// The backing table is `<namespace>_<name>`, matching the table naming of the
/// host application's ORM.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityType {
    pub namespace: String,
    pub name: String,
}

impl EntityType {
    /// Name of the primary key column in every mirrored table.
    pub const PK_COLUMN: &'static str = "id";

    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into() }
    }

    pub fn table_name(&self) -> String {
        format!("{}_{}", self.namespace, self.name)
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.namespace, self.name)
    }
}

/// Primary key shared by both stores. Source and target use the same key space.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct PrimaryKey(pub i64);

impl PrimaryKey {
    pub fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Display for PrimaryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for PrimaryKey {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

/// Scalar column value carried in a record snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    /// Fixed-point numbers travel as their canonical string form.
    Decimal(String),
    Text(String),
    Timestamp(DateTime<Utc>),
    Json(serde_json::Value),
}

impl FieldValue {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Decimal(_) => "decimal",
            Self::Text(_) => "text",
            Self::Timestamp(_) => "timestamp",
            Self::Json(_) => "json",
        }
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for FieldValue {
    fn from(value: i32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_owned())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<DateTime<Utc>> for FieldValue {
    fn from(value: DateTime<Utc>) -> Self {
        Self::Timestamp(value)
    }
}

impl<T: Into<FieldValue>> From<Option<T>> for FieldValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

/// Ordered mapping of column name to value, primary key excluded.
pub type FieldMap = BTreeMap<String, FieldValue>;

/// One row of one entity type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub entity: EntityType,
    pub pk: PrimaryKey,
    pub fields: FieldMap,
}

impl Record {
    /// Build a record. A field named after the primary key column is dropped so
    /// the payload never carries the key twice.
    pub fn new(entity: EntityType, pk: impl Into<PrimaryKey>, mut fields: FieldMap) -> Self {
        fields.remove(EntityType::PK_COLUMN);
        Self { entity, pk: pk.into(), fields }
    }

    pub fn sync_key(&self) -> SyncKey {
        SyncKey::new(self.entity.clone(), self.pk)
    }
}

/// Deduplication key for in-flight replication: entity type + primary key.
///
/// The key deliberately carries no store id, so a write reflected back from
/// the target store maps onto the same key as the write that caused it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SyncKey {
    pub entity: EntityType,
    pub pk: PrimaryKey,
}

impl SyncKey {
    pub fn new(entity: EntityType, pk: PrimaryKey) -> Self {
        Self { entity, pk }
    }
}

impl fmt::Display for SyncKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.entity, self.pk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_drops_pk_field() {
        let mut fields = FieldMap::new();
        fields.insert("id".to_string(), FieldValue::Int(42));
        fields.insert("plate_number".to_string(), FieldValue::from("ABC123"));

        let record = Record::new(EntityType::new("core", "vehicle"), 42, fields);

        assert_eq!(record.fields.len(), 1);
        assert!(!record.fields.contains_key("id"));
        assert_eq!(record.pk, PrimaryKey(42));
    }

    #[test]
    fn test_sync_key_ignores_fields() {
        let entity = EntityType::new("core", "vehicle");
        let mut a = FieldMap::new();
        a.insert("plate_number".to_string(), FieldValue::from("ABC123"));
        let b = FieldMap::new();

        let first = Record::new(entity.clone(), 42, a);
        let second = Record::new(entity, 42, b);

        assert_eq!(first.sync_key(), second.sync_key());
        assert_eq!(first.sync_key().to_string(), "core.vehicle#42");
    }

    #[test]
    fn test_table_name_follows_namespace() {
        let entity = EntityType::new("parking", "reservation");
        assert_eq!(entity.table_name(), "parking_reservation");
    }

    #[test]
    fn test_field_value_serde_shape() {
        let value = FieldValue::Decimal("20.00".to_string());
        let json = serde_json::to_value(&value).unwrap();
        assert_eq!(json, serde_json::json!({"type": "decimal", "value": "20.00"}));

        let null: FieldValue = serde_json::from_value(serde_json::json!({"type": "null"})).unwrap();
        assert!(null.is_null());
    }

    #[test]
    fn test_option_into_field_value() {
        let missing: Option<&str> = None;
        assert_eq!(FieldValue::from(missing), FieldValue::Null);
        assert_eq!(FieldValue::from(Some(5_i64)), FieldValue::Int(5));
    }
}
