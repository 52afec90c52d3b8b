//! Domain models for the ledger record store.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use crate::error::{Error, Result};
use crate::schema::SERVER_MANAGED_COLUMNS;

// =============================================================================
// PRINCIPAL
// =============================================================================

/// Authenticated actor performing an operation.
///
/// Supplied by the identity collaborator; the core only reads it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub id: String,
    pub display_name: String,
}

impl Principal {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
        }
    }
}

// =============================================================================
// ATTACHMENTS
// =============================================================================

/// Reference token naming a stored blob, e.g. `uploads/01/93/0193….png`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AttachmentRef(String);

impl AttachmentRef {
    /// Wrap a token, rejecting ones that could escape the store's base directory.
    pub fn parse(token: impl Into<String>) -> Result<Self> {
        let token = token.into();
        if token.is_empty()
            || token.starts_with('/')
            || token.starts_with('\\')
            || token.contains('\0')
            || token.split(['/', '\\']).any(|seg| seg == "..")
        {
            return Err(Error::ValidationFailed(format!(
                "invalid attachment reference: {:?}",
                token
            )));
        }
        Ok(Self(token))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for AttachmentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Raw bytes submitted for an attachment-capable field, saved before the
/// transaction opens.
#[derive(Debug, Clone)]
pub struct Upload {
    /// Attachment-capable column the saved reference is written to.
    pub field: String,
    /// Client-supplied file name; only its sanitized extension is kept.
    pub file_name: String,
    pub bytes: Vec<u8>,
}

// =============================================================================
// WRITE PATH
// =============================================================================

/// Caller payload for create/update.
#[derive(Debug, Clone, Default)]
pub struct WritePayload {
    /// Raw field map; filtered against the entity schema before use.
    pub fields: Map<String, JsonValue>,
    /// New files to save for attachment-capable fields.
    pub uploads: Vec<Upload>,
}

impl WritePayload {
    pub fn from_fields(fields: Map<String, JsonValue>) -> Self {
        Self {
            fields,
            uploads: Vec::new(),
        }
    }

    pub fn with_upload(
        mut self,
        field: impl Into<String>,
        file_name: impl Into<String>,
        bytes: impl Into<Vec<u8>>,
    ) -> Self {
        self.uploads.push(Upload {
            field: field.into(),
            file_name: file_name.into(),
            bytes: bytes.into(),
        });
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteStatus {
    Created,
    Updated,
}

/// Result of a successful create or update.
#[derive(Debug, Clone, Serialize)]
pub struct WriteOutcome {
    pub status: WriteStatus,
    #[serde(rename = "data")]
    pub entity: Entity,
}

// =============================================================================
// ENTITY
// =============================================================================

/// A persisted business row.
///
/// Server-managed columns are typed; every other column lives in `fields`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: i64,
    pub created_by: String,
    pub updated_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(flatten)]
    pub fields: Map<String, JsonValue>,
}

impl Entity {
    /// Build an entity from its typed server columns and a `to_jsonb(row)`
    /// document. Server-managed keys are stripped from the document.
    pub fn from_parts(
        id: i64,
        created_by: String,
        updated_by: String,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
        doc: JsonValue,
    ) -> Result<Self> {
        let mut fields = match doc {
            JsonValue::Object(map) => map,
            other => {
                return Err(Error::Internal(format!(
                    "expected row document to be an object, got {}",
                    other
                )))
            }
        };
        for column in SERVER_MANAGED_COLUMNS {
            fields.remove(*column);
        }
        Ok(Self {
            id,
            created_by,
            updated_by,
            created_at,
            updated_at,
            fields,
        })
    }

    pub fn field(&self, name: &str) -> Option<&JsonValue> {
        self.fields.get(name)
    }

    /// Current attachment reference held in `field`, if any.
    pub fn attachment_ref(&self, field: &str) -> Option<AttachmentRef> {
        match self.fields.get(field) {
            Some(JsonValue::String(token)) if !token.is_empty() => {
                AttachmentRef::parse(token.clone()).ok()
            }
            _ => None,
        }
    }

    /// JSON snapshot used in audit details.
    pub fn snapshot(&self) -> JsonValue {
        serde_json::to_value(self).unwrap_or(JsonValue::Null)
    }
}

// =============================================================================
// AUDIT
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AuditAction {
    Create,
    Update,
    Delete,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::Create => "CREATE",
            AuditAction::Update => "UPDATE",
            AuditAction::Delete => "DELETE",
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuditAction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "CREATE" => Ok(AuditAction::Create),
            "UPDATE" => Ok(AuditAction::Update),
            "DELETE" => Ok(AuditAction::Delete),
            other => Err(Error::Internal(format!("unknown audit action: {}", other))),
        }
    }
}

/// Audit entry to append alongside a primary mutation.
#[derive(Debug, Clone)]
pub struct NewAuditRecord {
    pub action: AuditAction,
    pub entity_type: String,
    pub entity_id: String,
    pub principal: Principal,
    pub details: JsonValue,
}

/// Immutable persisted audit entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: i64,
    pub action: AuditAction,
    /// Entity type; stored in the `table_name` column.
    pub table_name: String,
    /// Entity id; stored in the `document_id` column.
    pub document_id: String,
    pub user_id: String,
    pub user_name: String,
    pub details: JsonValue,
    pub logged_at: DateTime<Utc>,
}
