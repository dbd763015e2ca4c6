//! SQL text shared by the relational backends.
//!
//! The primary key is always bound first (`$1` / `?1`); field values follow in
//! map order. `NULL` is rendered inline so no untyped parameter is ever bound.

use twinstore_types::{EntityType, FieldMap, FieldValue, StoreError, StoreId};

use super::StoreResult;

const MAX_IDENT_LEN: usize = 63;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Dialect {
    Postgres,
    Sqlite,
}

impl Dialect {
    fn placeholder(self, index: usize) -> String {
        match self {
            Self::Postgres => format!("${index}"),
            Self::Sqlite => format!("?{index}"),
        }
    }

    fn value_expr(self, index: usize, value: &FieldValue) -> String {
        match (self, value) {
            (Self::Postgres, FieldValue::Decimal(_)) => {
                format!("CAST({} AS NUMERIC)", self.placeholder(index))
            },
            _ => self.placeholder(index),
        }
    }
}

/// SQL text plus the non-null values to bind after the primary key.
#[derive(Debug)]
pub(crate) struct Statement<'a> {
    pub sql: String,
    pub values: Vec<&'a FieldValue>,
}

/// Quote an identifier after checking it is a plain name.
pub(crate) fn quote_ident(store: &StoreId, ident: &str) -> StoreResult<String> {
    let mut chars = ident.chars();
    let valid_start = chars.next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    let valid_rest = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');

    if !valid_start || !valid_rest || ident.len() > MAX_IDENT_LEN {
        return Err(StoreError::Schema {
            store: store.to_string(),
            message: format!("invalid identifier {ident:?}"),
        });
    }
    Ok(format!("\"{ident}\""))
}

fn table(store: &StoreId, entity: &EntityType) -> StoreResult<String> {
    quote_ident(store, &entity.table_name())
}

pub(crate) fn exists(dialect: Dialect, store: &StoreId, entity: &EntityType) -> StoreResult<String> {
    Ok(format!(
        "SELECT EXISTS(SELECT 1 FROM {} WHERE {} = {})",
        table(store, entity)?,
        quote_ident(store, EntityType::PK_COLUMN)?,
        dialect.placeholder(1)
    ))
}

pub(crate) fn insert<'a>(
    dialect: Dialect,
    store: &StoreId,
    entity: &EntityType,
    fields: &'a FieldMap,
) -> StoreResult<Statement<'a>> {
    let mut columns = vec![quote_ident(store, EntityType::PK_COLUMN)?];
    let mut exprs = vec![dialect.placeholder(1)];
    let mut values = Vec::with_capacity(fields.len());

    for (name, value) in fields {
        columns.push(quote_ident(store, name)?);
        if value.is_null() {
            exprs.push("NULL".to_string());
        } else {
            values.push(value);
            exprs.push(dialect.value_expr(values.len() + 1, value));
        }
    }

    Ok(Statement {
        sql: format!(
            "INSERT INTO {} ({}) VALUES ({})",
            table(store, entity)?,
            columns.join(", "),
            exprs.join(", ")
        ),
        values,
    })
}

/// `None` when there is nothing to set.
pub(crate) fn update<'a>(
    dialect: Dialect,
    store: &StoreId,
    entity: &EntityType,
    fields: &'a FieldMap,
) -> StoreResult<Option<Statement<'a>>> {
    if fields.is_empty() {
        return Ok(None);
    }

    let mut assignments = Vec::with_capacity(fields.len());
    let mut values = Vec::with_capacity(fields.len());

    for (name, value) in fields {
        let column = quote_ident(store, name)?;
        if value.is_null() {
            assignments.push(format!("{column} = NULL"));
        } else {
            values.push(value);
            assignments.push(format!("{column} = {}", dialect.value_expr(values.len() + 1, value)));
        }
    }

    Ok(Some(Statement {
        sql: format!(
            "UPDATE {} SET {} WHERE {} = {}",
            table(store, entity)?,
            assignments.join(", "),
            quote_ident(store, EntityType::PK_COLUMN)?,
            dialect.placeholder(1)
        ),
        values,
    }))
}

pub(crate) fn delete(dialect: Dialect, store: &StoreId, entity: &EntityType) -> StoreResult<String> {
    Ok(format!(
        "DELETE FROM {} WHERE {} = {}",
        table(store, entity)?,
        quote_ident(store, EntityType::PK_COLUMN)?,
        dialect.placeholder(1)
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vehicle() -> EntityType {
        EntityType::new("core", "vehicle")
    }

    fn store() -> StoreId {
        StoreId::new("default")
    }

    #[test]
    fn test_insert_postgres_placeholders_and_nulls() {
        let mut fields = FieldMap::new();
        fields.insert("plate_number".to_string(), FieldValue::from("ABC123"));
        fields.insert("owner_id".to_string(), FieldValue::Null);
        fields.insert("vehicle_type".to_string(), FieldValue::from("car"));

        let stmt = insert(Dialect::Postgres, &store(), &vehicle(), &fields).unwrap();

        assert_eq!(
            stmt.sql,
            r#"INSERT INTO "core_vehicle" ("id", "owner_id", "plate_number", "vehicle_type") VALUES ($1, NULL, $2, $3)"#
        );
        assert_eq!(stmt.values.len(), 2);
    }

    #[test]
    fn test_update_sqlite_numbers_after_pk() {
        let mut fields = FieldMap::new();
        fields.insert("hourly_rate".to_string(), FieldValue::Decimal("20.00".to_string()));
        fields.insert("is_occupied".to_string(), FieldValue::Bool(true));

        let stmt = update(Dialect::Sqlite, &store(), &EntityType::new("parking", "parkingspace"), &fields)
            .unwrap()
            .unwrap();

        assert_eq!(
            stmt.sql,
            r#"UPDATE "parking_parkingspace" SET "hourly_rate" = ?2, "is_occupied" = ?3 WHERE "id" = ?1"#
        );
    }

    #[test]
    fn test_postgres_decimal_is_cast() {
        let mut fields = FieldMap::new();
        fields.insert("total_cost".to_string(), FieldValue::Decimal("150.00".to_string()));

        let stmt = update(Dialect::Postgres, &store(), &EntityType::new("parking", "reservation"), &fields)
            .unwrap()
            .unwrap();

        assert!(stmt.sql.contains(r#""total_cost" = CAST($2 AS NUMERIC)"#));
    }

    #[test]
    fn test_empty_update_is_skipped() {
        let fields = FieldMap::new();
        assert!(update(Dialect::Sqlite, &store(), &vehicle(), &fields).unwrap().is_none());
    }

    #[test]
    fn test_rejects_injected_identifiers() {
        let mut fields = FieldMap::new();
        fields.insert("plate\"; DROP TABLE x; --".to_string(), FieldValue::from("x"));

        let err = insert(Dialect::Sqlite, &store(), &vehicle(), &fields).unwrap_err();
        assert_eq!(err.kind(), "schema");
        assert!(quote_ident(&store(), "1abc").is_err());
        assert!(quote_ident(&store(), "").is_err());
    }

    #[test]
    fn test_exists_and_delete_text() {
        assert_eq!(
            exists(Dialect::Sqlite, &store(), &vehicle()).unwrap(),
            r#"SELECT EXISTS(SELECT 1 FROM "core_vehicle" WHERE "id" = ?1)"#
        );
        assert_eq!(
            delete(Dialect::Postgres, &store(), &vehicle()).unwrap(),
            r#"DELETE FROM "core_vehicle" WHERE "id" = $1"#
        );
    }
}
