//! Transaction coordinator for the audited write path.
//!
//! Every create/update/delete runs as one database transaction holding the
//! primary row mutation and its audit entry. Attachment blobs live outside
//! that transaction, so the coordinator brackets it with explicit
//! compensation:
//!
//! ```text
//! Begin → PrimaryWrite → AuditWrite → Commit → PostCommitCleanup → Done
//!            │               │          │
//!            └───────────────┴──────────┴──→ Rollback → CleanupNewAttachment → Done(Err)
//! ```
//!
//! - Uploads are saved before `Begin` and stay provisional until commit. Any
//!   failure deletes them again.
//! - Blobs superseded by an update, or owned by a deleted row, are deleted only
//!   after commit succeeds.
//! - Blob deletion failures are logged and never change the outcome.
//!
//! Audit policy: the audit insert shares the primary transaction for all
//! entity types, so an audit failure aborts the mutation.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use serde_json::json;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::{debug, error, info, warn};

use ledger_core::{
    schema_for, validate_upload, AttachmentRef, AttachmentStore, AuditAction, Entity,
    EntitySchema, Error, FieldSet, FieldValue, NewAuditRecord, Principal, Result, Upload,
    UploadCheck, WriteOutcome, WritePayload, WriteStatus,
};

use crate::audit::{AuditLog, PgAuditLog};
use crate::records::PgRecordRepository;

/// Default per-file upload limit (10 MiB).
pub const DEFAULT_MAX_UPLOAD_BYTES: u64 = 10 * 1024 * 1024;

/// Coordinator state machine phase, reported in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Begin,
    PrimaryWrite,
    AuditWrite,
    Commit,
    PostCommitCleanup,
    Rollback,
    CleanupNewAttachment,
    Done,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Begin => "begin",
            Phase::PrimaryWrite => "primary_write",
            Phase::AuditWrite => "audit_write",
            Phase::Commit => "commit",
            Phase::PostCommitCleanup => "post_commit_cleanup",
            Phase::Rollback => "rollback",
            Phase::CleanupNewAttachment => "cleanup_new_attachment",
            Phase::Done => "done",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Orchestrates record mutations, audit entries, and attachment cleanup.
#[derive(Clone)]
pub struct TransactionCoordinator {
    pool: PgPool,
    records: PgRecordRepository,
    audit: Arc<dyn AuditLog>,
    attachments: Arc<dyn AttachmentStore>,
    max_upload_bytes: u64,
}

impl TransactionCoordinator {
    /// Create a coordinator using the PostgreSQL audit log.
    pub fn new(pool: PgPool, attachments: Arc<dyn AttachmentStore>) -> Self {
        Self {
            records: PgRecordRepository::new(pool.clone()),
            audit: Arc::new(PgAuditLog::new(pool.clone())),
            attachments,
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            pool,
        }
    }

    /// Replace the audit log implementation.
    pub fn with_audit_log(mut self, audit: Arc<dyn AuditLog>) -> Self {
        self.audit = audit;
        self
    }

    /// Set the per-file upload limit.
    pub fn with_max_upload_bytes(mut self, max_upload_bytes: u64) -> Self {
        self.max_upload_bytes = max_upload_bytes;
        self
    }

    pub fn attachments(&self) -> &Arc<dyn AttachmentStore> {
        &self.attachments
    }

    // =========================================================================
    // CREATE
    // =========================================================================

    /// Create an entity and its CREATE audit entry atomically.
    pub async fn create(
        &self,
        entity_type: &str,
        payload: WritePayload,
        principal: &Principal,
    ) -> Result<WriteOutcome> {
        let start = Instant::now();
        let schema = schema_for(entity_type)?;
        let mut fields = schema.filter_payload(&payload.fields)?;
        let uploaded = self.check_uploads(schema, &payload.uploads)?;
        schema.check_required_with_uploads(&fields, &uploaded)?;

        let provisional = self
            .save_uploads(schema, &payload.uploads, &mut fields)
            .await?;
        if let Err(e) = check_adopted_refs(schema, &fields, &provisional, None) {
            self.discard_provisional(schema, &provisional).await;
            return Err(e);
        }

        let mut phase = Phase::Begin;
        let result = self
            .create_in_tx(schema, &fields, principal, &mut phase)
            .await;

        match result {
            Ok(entity) => {
                info!(
                    subsystem = "db",
                    component = "coordinator",
                    op = "create",
                    entity_type = schema.name,
                    entity_id = entity.id,
                    principal_id = %principal.id,
                    duration_ms = start.elapsed().as_millis() as u64,
                    "Entity created"
                );
                self.enter(schema, &mut phase, Phase::Done);
                Ok(WriteOutcome {
                    status: WriteStatus::Created,
                    entity,
                })
            }
            Err(e) => {
                self.log_failure("create", schema, None, phase, &e);
                self.discard_provisional(schema, &provisional).await;
                self.enter(schema, &mut phase, Phase::Done);
                Err(e)
            }
        }
    }

    async fn create_in_tx(
        &self,
        schema: &EntitySchema,
        fields: &FieldSet,
        principal: &Principal,
        phase: &mut Phase,
    ) -> Result<Entity> {
        let mut tx = self.begin(schema, phase).await?;

        let result = async {
            self.enter(schema, phase, Phase::PrimaryWrite);
            let entity = self
                .records
                .create_tx(&mut tx, schema, fields, principal)
                .await?;

            self.enter(schema, phase, Phase::AuditWrite);
            self.audit
                .append(
                    &mut tx,
                    &NewAuditRecord {
                        action: AuditAction::Create,
                        entity_type: schema.name.to_string(),
                        entity_id: entity.id.to_string(),
                        principal: principal.clone(),
                        details: fields.to_json(),
                    },
                )
                .await?;
            Ok::<_, Error>(entity)
        }
        .await;

        self.finish(tx, schema, phase, result).await
    }

    // =========================================================================
    // UPDATE
    // =========================================================================

    /// Update an entity and append its UPDATE audit entry atomically.
    ///
    /// When a new attachment replaces an old one, the old blob is deleted after
    /// commit.
    pub async fn update(
        &self,
        entity_type: &str,
        id: i64,
        payload: WritePayload,
        principal: &Principal,
    ) -> Result<WriteOutcome> {
        let start = Instant::now();
        let schema = schema_for(entity_type)?;
        let mut fields = schema.filter_payload(&payload.fields)?;
        self.check_uploads(schema, &payload.uploads)?;
        schema.check_not_cleared(&fields)?;

        let provisional = self
            .save_uploads(schema, &payload.uploads, &mut fields)
            .await?;
        self.check_references(schema, &fields, &provisional).await?;

        let mut phase = Phase::Begin;
        let result = self
            .update_in_tx(schema, id, &fields, &provisional, principal, &mut phase)
            .await;

        match result {
            Ok((before, after)) => {
                self.enter(schema, &mut phase, Phase::PostCommitCleanup);
                let superseded = superseded_refs(schema, &fields, &before, &after);
                self.release_superseded(schema, id, &superseded).await;

                info!(
                    subsystem = "db",
                    component = "coordinator",
                    op = "update",
                    entity_type = schema.name,
                    entity_id = id,
                    principal_id = %principal.id,
                    superseded = superseded.len(),
                    duration_ms = start.elapsed().as_millis() as u64,
                    "Entity updated"
                );
                self.enter(schema, &mut phase, Phase::Done);
                Ok(WriteOutcome {
                    status: WriteStatus::Updated,
                    entity: after,
                })
            }
            Err(e) => {
                self.log_failure("update", schema, Some(id), phase, &e);
                self.discard_provisional(schema, &provisional).await;
                self.enter(schema, &mut phase, Phase::Done);
                Err(e)
            }
        }
    }

    async fn update_in_tx(
        &self,
        schema: &EntitySchema,
        id: i64,
        fields: &FieldSet,
        provisional: &[AttachmentRef],
        principal: &Principal,
        phase: &mut Phase,
    ) -> Result<(Entity, Entity)> {
        let mut tx = self.begin(schema, phase).await?;

        let result = async {
            self.enter(schema, phase, Phase::PrimaryWrite);
            let before = self
                .records
                .get_for_update_tx(&mut tx, schema, id)
                .await?
                .ok_or_else(|| {
                    Error::NotFound(format!("{} item {} not found", schema.name, id))
                })?;
            check_adopted_refs(schema, fields, provisional, Some(&before))?;
            let after = self
                .records
                .update_tx(&mut tx, schema, id, fields, principal)
                .await?;

            self.enter(schema, phase, Phase::AuditWrite);
            self.audit
                .append(
                    &mut tx,
                    &NewAuditRecord {
                        action: AuditAction::Update,
                        entity_type: schema.name.to_string(),
                        entity_id: id.to_string(),
                        principal: principal.clone(),
                        details: json!({
                            "old": before.snapshot(),
                            "new": after.snapshot(),
                        }),
                    },
                )
                .await?;
            Ok::<_, Error>((before, after))
        }
        .await;

        self.finish(tx, schema, phase, result).await
    }

    // =========================================================================
    // DELETE
    // =========================================================================

    /// Delete an entity and append its DELETE audit entry atomically.
    ///
    /// Blobs referenced by the deleted row are deleted after commit.
    pub async fn delete(&self, entity_type: &str, id: i64, principal: &Principal) -> Result<()> {
        let start = Instant::now();
        let schema = schema_for(entity_type)?;

        let mut phase = Phase::Begin;
        let result = self.delete_in_tx(schema, id, principal, &mut phase).await;

        match result {
            Ok(deleted) => {
                self.enter(schema, &mut phase, Phase::PostCommitCleanup);
                let owned: Vec<AttachmentRef> = schema
                    .attachment_columns()
                    .filter_map(|column| deleted.attachment_ref(column.name))
                    .collect();
                self.release_superseded(schema, id, &owned).await;

                info!(
                    subsystem = "db",
                    component = "coordinator",
                    op = "delete",
                    entity_type = schema.name,
                    entity_id = id,
                    principal_id = %principal.id,
                    duration_ms = start.elapsed().as_millis() as u64,
                    "Entity deleted"
                );
                self.enter(schema, &mut phase, Phase::Done);
                Ok(())
            }
            Err(e) => {
                // Nothing was uploaded in this flow; rollback is the only compensation.
                self.log_failure("delete", schema, Some(id), phase, &e);
                self.enter(schema, &mut phase, Phase::Done);
                Err(e)
            }
        }
    }

    async fn delete_in_tx(
        &self,
        schema: &EntitySchema,
        id: i64,
        principal: &Principal,
        phase: &mut Phase,
    ) -> Result<Entity> {
        let mut tx = self.begin(schema, phase).await?;

        let result = async {
            self.enter(schema, phase, Phase::PrimaryWrite);
            let deleted = self.records.delete_tx(&mut tx, schema, id).await?;

            self.enter(schema, phase, Phase::AuditWrite);
            self.audit
                .append(
                    &mut tx,
                    &NewAuditRecord {
                        action: AuditAction::Delete,
                        entity_type: schema.name.to_string(),
                        entity_id: id.to_string(),
                        principal: principal.clone(),
                        details: json!({
                            "message": "Record deleted.",
                            "old": deleted.snapshot(),
                        }),
                    },
                )
                .await?;
            Ok::<_, Error>(deleted)
        }
        .await;

        self.finish(tx, schema, phase, result).await
    }

    // =========================================================================
    // TRANSACTION PLUMBING
    // =========================================================================

    async fn begin(
        &self,
        schema: &EntitySchema,
        phase: &mut Phase,
    ) -> Result<Transaction<'static, Postgres>> {
        self.enter(schema, phase, Phase::Begin);
        Ok(self.pool.begin().await?)
    }

    /// Commit on success, roll back on failure. The transaction is always
    /// released before this returns.
    async fn finish<T>(
        &self,
        tx: Transaction<'static, Postgres>,
        schema: &EntitySchema,
        phase: &mut Phase,
        result: Result<T>,
    ) -> Result<T> {
        match result {
            Ok(value) => {
                self.enter(schema, phase, Phase::Commit);
                tx.commit().await?;
                Ok(value)
            }
            Err(e) => {
                let failed_at = *phase;
                self.enter(schema, phase, Phase::Rollback);
                if let Err(rollback_err) = tx.rollback().await {
                    // The server discards the transaction when the connection drops.
                    warn!(
                        subsystem = "db",
                        component = "coordinator",
                        entity_type = schema.name,
                        error = %rollback_err,
                        "Rollback failed"
                    );
                }
                *phase = failed_at;
                Err(e)
            }
        }
    }

    fn enter(&self, schema: &EntitySchema, phase: &mut Phase, next: Phase) {
        debug!(
            subsystem = "db",
            component = "coordinator",
            entity_type = schema.name,
            phase = %next,
            "Phase transition"
        );
        *phase = next;
    }

    fn log_failure(
        &self,
        op: &str,
        schema: &EntitySchema,
        id: Option<i64>,
        phase: Phase,
        e: &Error,
    ) {
        if e.is_client_error() {
            debug!(
                subsystem = "db",
                component = "coordinator",
                op,
                entity_type = schema.name,
                entity_id = ?id,
                phase = %phase,
                error_kind = e.kind(),
                error = %e,
                "Write rejected"
            );
        } else {
            error!(
                subsystem = "db",
                component = "coordinator",
                op,
                entity_type = schema.name,
                entity_id = ?id,
                phase = %phase,
                error_kind = e.kind(),
                error = %e,
                "Write failed, transaction rolled back"
            );
        }
    }

    // =========================================================================
    // ATTACHMENTS
    // =========================================================================

    /// Validate uploads before anything is saved. Returns the target columns.
    fn check_uploads(
        &self,
        schema: &EntitySchema,
        uploads: &[Upload],
    ) -> Result<Vec<&'static str>> {
        let mut targets: Vec<&'static str> = Vec::with_capacity(uploads.len());
        for upload in uploads {
            let column = schema
                .column(&upload.field)
                .filter(|_| schema.is_attachment(&upload.field))
                .ok_or_else(|| {
                    Error::ValidationFailed(format!(
                        "{} is not an attachment field of {}",
                        upload.field, schema.name
                    ))
                })?;
            if targets.contains(&column.name) {
                return Err(Error::ValidationFailed(format!(
                    "more than one file uploaded for {}",
                    column.name
                )));
            }
            if let UploadCheck::Blocked(reason) =
                validate_upload(&upload.file_name, &upload.bytes, self.max_upload_bytes)
            {
                return Err(Error::ValidationFailed(format!(
                    "{} rejected: {}",
                    upload.field, reason
                )));
            }
            targets.push(column.name);
        }
        Ok(targets)
    }

    /// Save each upload and point its column at the new reference.
    ///
    /// If any save fails, blobs saved so far are deleted before returning.
    async fn save_uploads(
        &self,
        schema: &EntitySchema,
        uploads: &[Upload],
        fields: &mut FieldSet,
    ) -> Result<Vec<AttachmentRef>> {
        let mut saved = Vec::with_capacity(uploads.len());
        for upload in uploads {
            let column = match schema.column(&upload.field) {
                Some(column) => column,
                None => continue,
            };
            match self.attachments.save(&upload.bytes, &upload.file_name).await {
                Ok(reference) => {
                    fields.set(column.name, FieldValue::Attachment(reference.clone()));
                    saved.push(reference);
                }
                Err(e) => {
                    warn!(
                        subsystem = "storage",
                        component = "coordinator",
                        entity_type = schema.name,
                        error = %e,
                        "Attachment save failed"
                    );
                    self.discard_provisional(schema, &saved).await;
                    return Err(match e {
                        Error::Io(io) => {
                            Error::StorageUnavailable(format!("attachment store: {}", io))
                        }
                        other => other,
                    });
                }
            }
        }
        Ok(saved)
    }

    /// Existing reference tokens submitted in the payload must point at a
    /// stored blob; newly saved ones are known to exist.
    async fn check_references(
        &self,
        schema: &EntitySchema,
        fields: &FieldSet,
        provisional: &[AttachmentRef],
    ) -> Result<()> {
        for (name, value) in fields.iter() {
            let FieldValue::Attachment(reference) = value else {
                continue;
            };
            if provisional.contains(reference) {
                continue;
            }
            let exists = match self.attachments.exists(reference).await {
                Ok(exists) => exists,
                Err(e) => {
                    self.discard_provisional(schema, provisional).await;
                    return Err(Error::StorageUnavailable(format!("attachment store: {}", e)));
                }
            };
            if !exists {
                self.discard_provisional(schema, provisional).await;
                return Err(Error::ValidationFailed(format!(
                    "{} references missing attachment {}",
                    name, reference
                )));
            }
        }
        Ok(())
    }

    /// Undo uploads from a failed attempt.
    async fn discard_provisional(&self, schema: &EntitySchema, provisional: &[AttachmentRef]) {
        for reference in provisional {
            debug!(
                subsystem = "storage",
                component = "coordinator",
                entity_type = schema.name,
                phase = %Phase::CleanupNewAttachment,
                attachment_ref = %reference,
                "Discarding provisional attachment"
            );
            self.delete_quietly(schema, reference).await;
        }
    }

    /// Delete blobs no committed row references any more.
    async fn release_superseded(&self, schema: &EntitySchema, id: i64, refs: &[AttachmentRef]) {
        for reference in refs {
            debug!(
                subsystem = "storage",
                component = "coordinator",
                entity_type = schema.name,
                entity_id = id,
                phase = %Phase::PostCommitCleanup,
                attachment_ref = %reference,
                "Releasing superseded attachment"
            );
            self.delete_quietly(schema, reference).await;
        }
    }

    async fn delete_quietly(&self, schema: &EntitySchema, reference: &AttachmentRef) {
        if let Err(e) = self.attachments.delete(reference).await {
            warn!(
                subsystem = "storage",
                component = "coordinator",
                entity_type = schema.name,
                attachment_ref = %reference,
                error = %e,
                "Attachment cleanup failed, blob left behind"
            );
        }
    }
}

/// Reference tokens in `fields` must be fresh uploads or the value the row
/// already holds in that column.
fn check_adopted_refs(
    schema: &EntitySchema,
    fields: &FieldSet,
    provisional: &[AttachmentRef],
    current: Option<&Entity>,
) -> Result<()> {
    for (name, value) in fields.iter() {
        let FieldValue::Attachment(reference) = value else {
            continue;
        };
        if provisional.contains(reference) {
            continue;
        }
        let held = current.and_then(|entity| entity.attachment_ref(name));
        if held.as_ref() != Some(reference) {
            return Err(Error::ValidationFailed(format!(
                "{} on {} accepts a new upload or its current attachment, not {}",
                name, schema.name, reference
            )));
        }
    }
    Ok(())
}

/// Old references in columns this update wrote that no longer match.
fn superseded_refs(
    schema: &EntitySchema,
    fields: &FieldSet,
    before: &Entity,
    after: &Entity,
) -> Vec<AttachmentRef> {
    schema
        .attachment_columns()
        .filter(|column| fields.contains(column.name))
        .filter_map(|column| {
            let old = before.attachment_ref(column.name)?;
            match after.attachment_ref(column.name) {
                Some(new) if new == old => None,
                _ => Some(old),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::Value as JsonValue;

    fn entity_with(pictures: JsonValue) -> Entity {
        let now = Utc::now();
        Entity::from_parts(
            42,
            "u".into(),
            "u".into(),
            now,
            now,
            json!({ "name": "X100", "product_pictures": pictures }),
        )
        .unwrap()
    }

    fn written(column: &'static str, value: FieldValue) -> FieldSet {
        let mut fields = FieldSet::new();
        fields.set(column, value);
        fields
    }

    fn reference(token: &str) -> AttachmentRef {
        AttachmentRef::parse(token).unwrap()
    }

    #[test]
    fn test_superseded_when_replaced() {
        let schema = schema_for("products").unwrap();
        let fields = written(
            "product_pictures",
            FieldValue::Attachment(reference("uploads/b.png")),
        );
        let refs = superseded_refs(
            schema,
            &fields,
            &entity_with(json!("uploads/a.png")),
            &entity_with(json!("uploads/b.png")),
        );
        assert_eq!(refs, vec![reference("uploads/a.png")]);
    }

    #[test]
    fn test_superseded_when_cleared() {
        let schema = schema_for("products").unwrap();
        let fields = written("product_pictures", FieldValue::Null);
        let refs = superseded_refs(
            schema,
            &fields,
            &entity_with(json!("uploads/a.png")),
            &entity_with(JsonValue::Null),
        );
        assert_eq!(refs, vec![reference("uploads/a.png")]);
    }

    #[test]
    fn test_not_superseded_when_resubmitted_unchanged() {
        let schema = schema_for("products").unwrap();
        let fields = written(
            "product_pictures",
            FieldValue::Attachment(reference("uploads/a.png")),
        );
        let refs = superseded_refs(
            schema,
            &fields,
            &entity_with(json!("uploads/a.png")),
            &entity_with(json!("uploads/a.png")),
        );
        assert!(refs.is_empty());
    }

    #[test]
    fn test_not_superseded_when_column_untouched() {
        let schema = schema_for("products").unwrap();
        let fields = written("description", FieldValue::Text("new".into()));
        let refs = superseded_refs(
            schema,
            &fields,
            &entity_with(json!("uploads/a.png")),
            &entity_with(json!("uploads/a.png")),
        );
        assert!(refs.is_empty());
    }

    #[test]
    fn test_nothing_superseded_without_old_reference() {
        let schema = schema_for("products").unwrap();
        let fields = written(
            "product_pictures",
            FieldValue::Attachment(reference("uploads/b.png")),
        );
        let refs = superseded_refs(
            schema,
            &fields,
            &entity_with(JsonValue::Null),
            &entity_with(json!("uploads/b.png")),
        );
        assert!(refs.is_empty());
    }

    #[test]
    fn test_adopted_refs_accept_fresh_upload() {
        let schema = schema_for("products").unwrap();
        let fresh = reference("uploads/new.png");
        let fields = written("product_pictures", FieldValue::Attachment(fresh.clone()));
        assert!(check_adopted_refs(schema, &fields, &[fresh], None).is_ok());
    }

    #[test]
    fn test_adopted_refs_reject_stored_token_on_create() {
        let schema = schema_for("products").unwrap();
        let fields = written(
            "product_pictures",
            FieldValue::Attachment(reference("uploads/a.png")),
        );
        assert!(matches!(
            check_adopted_refs(schema, &fields, &[], None),
            Err(Error::ValidationFailed(_))
        ));
    }

    #[test]
    fn test_adopted_refs_allow_only_the_rows_own_token() {
        let schema = schema_for("products").unwrap();
        let current = entity_with(json!("uploads/a.png"));

        let own = written(
            "product_pictures",
            FieldValue::Attachment(reference("uploads/a.png")),
        );
        assert!(check_adopted_refs(schema, &own, &[], Some(&current)).is_ok());

        let foreign = written(
            "product_pictures",
            FieldValue::Attachment(reference("uploads/b.png")),
        );
        assert!(matches!(
            check_adopted_refs(schema, &foreign, &[], Some(&current)),
            Err(Error::ValidationFailed(_))
        ));
    }

    #[test]
    fn test_phase_names() {
        assert_eq!(Phase::PrimaryWrite.to_string(), "primary_write");
        assert_eq!(Phase::CleanupNewAttachment.as_str(), "cleanup_new_attachment");
    }
}
