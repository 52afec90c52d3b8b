//! Record repository for the configured entity types.
//!
//! Mutations take a caller-owned transaction so the coordinator can compose
//! them with the audit write. Column names in generated SQL come only from
//! the static [`EntitySchema`] table; values are always bound parameters.

use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, QueryBuilder, Row, Transaction};
use tracing::debug;

use ledger_core::{Entity, EntitySchema, Error, FieldSet, FieldValue, Principal, Result};

/// Server columns plus the full row document, selected from alias `t`.
///
/// Numeric columns are overlaid as text so the document keeps the column's
/// scale (`35.50`, not `35.5`).
fn returning_entity(schema: &EntitySchema) -> String {
    let mut doc = String::from("to_jsonb(t)");
    let numeric: Vec<String> = schema
        .numeric_columns()
        .map(|column| format!("'{0}', t.{0}::text", column.name))
        .collect();
    if !numeric.is_empty() {
        doc.push_str(&format!(" || jsonb_build_object({})", numeric.join(", ")));
    }
    format!(
        "id, created_by, updated_by, created_at, updated_at, {} AS doc",
        doc
    )
}

/// PostgreSQL repository for business entities.
#[derive(Clone)]
pub struct PgRecordRepository {
    pool: PgPool,
}

impl PgRecordRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert a row stamped with the principal as creator and last updater.
    ///
    /// `created_at`/`updated_at` come from column defaults.
    pub async fn create_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        schema: &EntitySchema,
        fields: &FieldSet,
        principal: &Principal,
    ) -> Result<Entity> {
        let mut builder = insert_query(schema, fields, principal);
        let row = builder.build().fetch_one(&mut **tx).await?;
        let entity = entity_from_row(&row)?;

        debug!(
            subsystem = "db",
            component = "records",
            op = "create",
            entity_type = schema.name,
            entity_id = entity.id,
            "Row inserted"
        );
        Ok(entity)
    }

    /// Update the given columns and stamp `updated_by`/`updated_at`.
    ///
    /// Fails with `NotFound` when no row has `id`.
    pub async fn update_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        schema: &EntitySchema,
        id: i64,
        fields: &FieldSet,
        principal: &Principal,
    ) -> Result<Entity> {
        let mut builder = update_query(schema, id, fields, principal);
        let row = builder
            .build()
            .fetch_optional(&mut **tx)
            .await?
            .ok_or_else(|| not_found(schema, id))?;
        let entity = entity_from_row(&row)?;

        debug!(
            subsystem = "db",
            component = "records",
            op = "update",
            entity_type = schema.name,
            entity_id = id,
            columns = fields.len(),
            "Row updated"
        );
        Ok(entity)
    }

    /// Read the row (locking it for the rest of the transaction), then delete it.
    ///
    /// Returns the deleted row so the caller can find attachment references to
    /// clean up. Fails with `NotFound` when no row has `id`.
    pub async fn delete_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        schema: &EntitySchema,
        id: i64,
    ) -> Result<Entity> {
        let existing = self
            .get_for_update_tx(tx, schema, id)
            .await?
            .ok_or_else(|| not_found(schema, id))?;

        let result = sqlx::query(&format!("DELETE FROM {} WHERE id = $1", schema.name))
            .bind(id)
            .execute(&mut **tx)
            .await?;

        if result.rows_affected() == 0 {
            return Err(not_found(schema, id));
        }

        debug!(
            subsystem = "db",
            component = "records",
            op = "delete",
            entity_type = schema.name,
            entity_id = id,
            "Row deleted"
        );
        Ok(existing)
    }

    /// Read a row with `FOR UPDATE`, serializing concurrent writers on it.
    pub async fn get_for_update_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        schema: &EntitySchema,
        id: i64,
    ) -> Result<Option<Entity>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM {} AS t WHERE t.id = $1 FOR UPDATE",
            returning_entity(schema), schema.name
        ))
        .bind(id)
        .fetch_optional(&mut **tx)
        .await?;

        row.as_ref().map(entity_from_row).transpose()
    }

    /// Read a row outside any transaction.
    pub async fn get(&self, schema: &EntitySchema, id: i64) -> Result<Option<Entity>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM {} AS t WHERE t.id = $1",
            returning_entity(schema), schema.name
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(entity_from_row).transpose()
    }

    /// List every row of an entity type in id order.
    pub async fn list(&self, schema: &EntitySchema) -> Result<Vec<Entity>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM {} AS t ORDER BY t.id",
            returning_entity(schema), schema.name
        ))
        .fetch_all(&self.pool)
        .await?;

        debug!(
            subsystem = "db",
            component = "records",
            op = "list",
            entity_type = schema.name,
            result_count = rows.len(),
            "Rows listed"
        );
        rows.iter().map(entity_from_row).collect()
    }
}

fn insert_query<'a>(
    schema: &EntitySchema,
    fields: &FieldSet,
    principal: &Principal,
) -> QueryBuilder<'a, Postgres> {
    let mut builder = QueryBuilder::new("INSERT INTO ");
    builder.push(schema.name);
    builder.push(" AS t (");
    for (name, _) in fields.iter() {
        builder.push(name);
        builder.push(", ");
    }
    builder.push("created_by, updated_by) VALUES (");
    for (_, value) in fields.iter() {
        push_value(&mut builder, value);
        builder.push(", ");
    }
    builder.push_bind(principal.id.clone());
    builder.push(", ");
    builder.push_bind(principal.id.clone());
    builder.push(") RETURNING ");
    builder.push(returning_entity(schema));
    builder
}

fn update_query<'a>(
    schema: &EntitySchema,
    id: i64,
    fields: &FieldSet,
    principal: &Principal,
) -> QueryBuilder<'a, Postgres> {
    let mut builder = QueryBuilder::new("UPDATE ");
    builder.push(schema.name);
    builder.push(" AS t SET ");
    for (name, value) in fields.iter() {
        builder.push(name);
        builder.push(" = ");
        push_value(&mut builder, value);
        builder.push(", ");
    }
    builder.push("updated_by = ");
    builder.push_bind(principal.id.clone());
    builder.push(", updated_at = NOW() WHERE t.id = ");
    builder.push_bind(id);
    builder.push(" RETURNING ");
    builder.push(returning_entity(schema));
    builder
}

fn push_value(builder: &mut QueryBuilder<'_, Postgres>, value: &FieldValue) {
    match value {
        FieldValue::Text(s) => {
            builder.push_bind(s.clone());
        }
        FieldValue::Numeric(n) => {
            builder.push_bind(n.clone());
        }
        FieldValue::Attachment(r) => {
            builder.push_bind(r.as_str().to_string());
        }
        // Untyped literal so it fits any column type.
        FieldValue::Null => {
            builder.push("NULL");
        }
    }
}

fn not_found(schema: &EntitySchema, id: i64) -> Error {
    Error::NotFound(format!("{} item {} not found", schema.name, id))
}

fn entity_from_row(row: &PgRow) -> Result<Entity> {
    Entity::from_parts(
        row.try_get("id")?,
        row.try_get("created_by")?,
        row.try_get("updated_by")?,
        row.try_get("created_at")?,
        row.try_get("updated_at")?,
        row.try_get("doc")?,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledger_core::{schema_for, AttachmentRef};
    use sqlx::types::BigDecimal;
    use std::str::FromStr;

    fn principal() -> Principal {
        Principal::new("user-1", "User One")
    }

    fn product_fields() -> FieldSet {
        let mut fields = FieldSet::new();
        fields.set("name", FieldValue::Text("X100".into()));
        fields.set(
            "gmdc_pct",
            FieldValue::Numeric(BigDecimal::from_str("35.50").unwrap()),
        );
        fields.set(
            "product_pictures",
            FieldValue::Attachment(AttachmentRef::parse("uploads/a.png").unwrap()),
        );
        fields.set("description", FieldValue::Null);
        fields
    }

    #[test]
    fn test_insert_sql_binds_values_and_inlines_null() {
        let schema = schema_for("products").unwrap();
        let builder = insert_query(schema, &product_fields(), &principal());
        assert_eq!(
            builder.sql(),
            "INSERT INTO products AS t (name, gmdc_pct, product_pictures, description, \
             created_by, updated_by) VALUES ($1, $2, $3, NULL, $4, $5) RETURNING \
             id, created_by, updated_by, created_at, updated_at, \
             to_jsonb(t) || jsonb_build_object('gmdc_pct', t.gmdc_pct::text) AS doc"
        );
    }

    #[test]
    fn test_update_sql_stamps_updater_and_time() {
        let schema = schema_for("products").unwrap();
        let mut fields = FieldSet::new();
        fields.set("capacity", FieldValue::Text("1000/month".into()));
        let builder = update_query(schema, 42, &fields, &principal());
        assert_eq!(
            builder.sql(),
            "UPDATE products AS t SET capacity = $1, updated_by = $2, updated_at = NOW() \
             WHERE t.id = $3 RETURNING \
             id, created_by, updated_by, created_at, updated_at, \
             to_jsonb(t) || jsonb_build_object('gmdc_pct', t.gmdc_pct::text) AS doc"
        );
    }

    #[test]
    fn test_update_sql_with_no_columns_still_stamps() {
        let schema = schema_for("product_lines").unwrap();
        let builder = update_query(schema, 7, &FieldSet::new(), &principal());
        assert!(builder
            .sql()
            .starts_with("UPDATE product_lines AS t SET updated_by = $1, updated_at = NOW()"));
    }

    #[test]
    fn test_returning_plain_document_without_numeric_columns() {
        let schema = schema_for("product_lines").unwrap();
        assert_eq!(
            returning_entity(schema),
            "id, created_by, updated_by, created_at, updated_at, to_jsonb(t) AS doc"
        );
    }

    #[test]
    fn test_not_found_message() {
        let schema = schema_for("products").unwrap();
        let err = not_found(schema, 42);
        assert_eq!(err.to_string(), "Not found: products item 42 not found");
    }
}
