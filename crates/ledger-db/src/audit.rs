//! Audit log repository.
//!
//! Audit entries are appended as the second statement of the primary
//! mutation's transaction, so an entry exists if and only if its mutation
//! committed. Prior entries are never read back or modified by the write path.

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::debug;

use ledger_core::{AuditRecord, NewAuditRecord, Result};

/// Appends audit entries inside a caller-owned transaction.
#[async_trait]
pub trait AuditLog: Send + Sync {
    /// Append one entry. A failure here aborts the enclosing transaction.
    async fn append(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        entry: &NewAuditRecord,
    ) -> Result<AuditRecord>;
}

const AUDIT_COLUMNS: &str =
    "id, action, table_name, document_id, user_id, user_name, details, logged_at";

/// PostgreSQL audit log backed by the `audit_logs` table.
#[derive(Clone)]
pub struct PgAuditLog {
    pool: PgPool,
}

impl PgAuditLog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Most recent entries first.
    pub async fn list_recent(&self, limit: i64) -> Result<Vec<AuditRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM audit_logs ORDER BY logged_at DESC, id DESC LIMIT $1",
            AUDIT_COLUMNS
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(audit_record_from_row).collect()
    }

    /// All entries for one entity, oldest first.
    pub async fn list_for_entity(
        &self,
        entity_type: &str,
        entity_id: &str,
    ) -> Result<Vec<AuditRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM audit_logs WHERE table_name = $1 AND document_id = $2 ORDER BY id",
            AUDIT_COLUMNS
        ))
        .bind(entity_type)
        .bind(entity_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(audit_record_from_row).collect()
    }
}

#[async_trait]
impl AuditLog for PgAuditLog {
    async fn append(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        entry: &NewAuditRecord,
    ) -> Result<AuditRecord> {
        let row = sqlx::query(&format!(
            r#"INSERT INTO audit_logs (action, table_name, document_id, user_id, user_name, details)
               VALUES ($1, $2, $3, $4, $5, $6)
               RETURNING {}"#,
            AUDIT_COLUMNS
        ))
        .bind(entry.action.as_str())
        .bind(&entry.entity_type)
        .bind(&entry.entity_id)
        .bind(&entry.principal.id)
        .bind(&entry.principal.display_name)
        .bind(&entry.details)
        .fetch_one(&mut **tx)
        .await?;

        let record = audit_record_from_row(&row)?;
        debug!(
            subsystem = "db",
            component = "audit",
            op = "append",
            audit_action = %entry.action,
            entity_type = %entry.entity_type,
            entity_id = %entry.entity_id,
            principal_id = %entry.principal.id,
            "Audit entry appended"
        );
        Ok(record)
    }
}

fn audit_record_from_row(row: &PgRow) -> Result<AuditRecord> {
    let action: String = row.try_get("action")?;
    Ok(AuditRecord {
        id: row.try_get("id")?,
        action: action.parse()?,
        table_name: row.try_get("table_name")?,
        document_id: row.try_get("document_id")?,
        user_id: row.try_get("user_id")?,
        user_name: row.try_get("user_name")?,
        details: row.try_get("details")?,
        logged_at: row.try_get("logged_at")?,
    })
}
