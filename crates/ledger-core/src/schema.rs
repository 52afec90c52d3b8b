//! Static entity schema table.
//!
//! Each writable entity type has a fixed set of columns. Caller payloads are
//! filtered against this table before any SQL is built, so column names in
//! generated statements only ever come from here.

use std::str::FromStr;

use serde_json::{Map, Value as JsonValue};
use sqlx::types::BigDecimal;
use tracing::debug;

use crate::error::{Error, Result};
use crate::models::AttachmentRef;

/// Columns the store manages itself; never taken from a payload.
pub const SERVER_MANAGED_COLUMNS: &[&str] =
    &["id", "created_at", "created_by", "updated_at", "updated_by"];

/// Audit log collection name (readable, never writable).
pub const AUDIT_LOG_COLLECTION: &str = "audit_logs";

/// Identity table name; belongs to the identity collaborator.
pub const USERS_COLLECTION: &str = "users";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Text,
    Numeric,
    /// Holds an attachment reference token.
    Attachment,
}

#[derive(Debug, Clone, Copy)]
pub struct ColumnSpec {
    pub name: &'static str,
    pub kind: ColumnKind,
    pub required: bool,
}

impl ColumnSpec {
    const fn text(name: &'static str) -> Self {
        Self {
            name,
            kind: ColumnKind::Text,
            required: false,
        }
    }

    const fn numeric(name: &'static str) -> Self {
        Self {
            name,
            kind: ColumnKind::Numeric,
            required: false,
        }
    }

    const fn attachment(name: &'static str) -> Self {
        Self {
            name,
            kind: ColumnKind::Attachment,
            required: false,
        }
    }

    const fn required(mut self) -> Self {
        self.required = true;
        self
    }
}

/// Shape of one writable entity type.
#[derive(Debug)]
pub struct EntitySchema {
    /// Collection name; also the table name.
    pub name: &'static str,
    pub columns: &'static [ColumnSpec],
}

pub static ENTITY_SCHEMAS: &[EntitySchema] = &[
    EntitySchema {
        name: "product_lines",
        columns: &[
            ColumnSpec::text("name").required(),
            ColumnSpec::text("type_of_products"),
            ColumnSpec::text("product_line_manager"),
            ColumnSpec::text("strength"),
            ColumnSpec::text("weakness"),
        ],
    },
    EntitySchema {
        name: "products",
        columns: &[
            ColumnSpec::text("name").required(),
            ColumnSpec::text("product_line"),
            ColumnSpec::text("description"),
            ColumnSpec::text("capacity"),
            ColumnSpec::numeric("gmdc_pct"),
            ColumnSpec::attachment("product_pictures"),
        ],
    },
];

/// Look up a writable entity schema by collection name.
pub fn schema_for(name: &str) -> Result<&'static EntitySchema> {
    ENTITY_SCHEMAS
        .iter()
        .find(|schema| schema.name == name)
        .ok_or_else(|| Error::InvalidCollection(format!("{} is not a writable collection", name)))
}

/// A collection the read path may list.
#[derive(Debug, Clone, Copy)]
pub enum Collection {
    Entity(&'static EntitySchema),
    AuditLogs,
}

impl Collection {
    /// Resolve a collection name for reading. The identity table is never exposed.
    pub fn resolve(name: &str) -> Result<Self> {
        if name == AUDIT_LOG_COLLECTION {
            return Ok(Collection::AuditLogs);
        }
        match schema_for(name) {
            Ok(schema) => Ok(Collection::Entity(schema)),
            Err(_) => Err(Error::InvalidCollection(format!(
                "{} is not a readable collection",
                name
            ))),
        }
    }
}

/// Typed value for one whitelisted column.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Text(String),
    Numeric(BigDecimal),
    Attachment(AttachmentRef),
    Null,
}

impl FieldValue {
    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }
}

/// Ordered set of filtered, typed column values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldSet {
    entries: Vec<(&'static str, FieldValue)>,
}

impl FieldSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the value for `column`.
    pub fn set(&mut self, column: &'static str, value: FieldValue) {
        match self.entries.iter_mut().find(|(name, _)| *name == column) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((column, value)),
        }
    }

    pub fn get(&self, column: &str) -> Option<&FieldValue> {
        self.entries
            .iter()
            .find(|(name, _)| *name == column)
            .map(|(_, value)| value)
    }

    pub fn contains(&self, column: &str) -> bool {
        self.get(column).is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &FieldValue)> {
        self.entries.iter().map(|(name, value)| (*name, value))
    }

    /// JSON rendering used for CREATE audit details.
    pub fn to_json(&self) -> JsonValue {
        let mut map = Map::new();
        for (name, value) in self.iter() {
            let json = match value {
                FieldValue::Text(s) => JsonValue::String(s.clone()),
                FieldValue::Numeric(n) => JsonValue::String(n.to_string()),
                FieldValue::Attachment(r) => JsonValue::String(r.as_str().to_string()),
                FieldValue::Null => JsonValue::Null,
            };
            map.insert(name.to_string(), json);
        }
        JsonValue::Object(map)
    }
}

impl EntitySchema {
    pub fn column(&self, name: &str) -> Option<&'static ColumnSpec> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn is_attachment(&self, name: &str) -> bool {
        self.column(name)
            .is_some_and(|c| c.kind == ColumnKind::Attachment)
    }

    pub fn attachment_columns(&self) -> impl Iterator<Item = &'static ColumnSpec> {
        self.columns
            .iter()
            .filter(|c| c.kind == ColumnKind::Attachment)
    }

    pub fn numeric_columns(&self) -> impl Iterator<Item = &'static ColumnSpec> {
        self.columns
            .iter()
            .filter(|c| c.kind == ColumnKind::Numeric)
    }

    /// Keep only whitelisted columns and coerce each value to its column kind.
    ///
    /// Unknown and server-managed keys are dropped silently; malformed values
    /// for known columns fail with `ValidationFailed`.
    pub fn filter_payload(&self, payload: &Map<String, JsonValue>) -> Result<FieldSet> {
        let mut fields = FieldSet::new();
        for column in self.columns {
            if let Some(raw) = payload.get(column.name) {
                fields.set(column.name, coerce(column, raw)?);
            }
        }

        if fields.len() < payload.len() {
            let dropped: Vec<&str> = payload
                .keys()
                .map(String::as_str)
                .filter(|key| self.column(key).is_none())
                .collect();
            debug!(
                subsystem = "core",
                component = "schema",
                entity_type = self.name,
                dropped = ?dropped,
                "Dropped non-writable payload keys"
            );
        }

        Ok(fields)
    }

    /// Fail when a required column is absent or null.
    pub fn check_required(&self, fields: &FieldSet) -> Result<()> {
        self.check_required_with_uploads(fields, &[])
    }

    /// Like [`check_required`](Self::check_required), counting columns that
    /// will be filled by a pending upload as present.
    pub fn check_required_with_uploads(&self, fields: &FieldSet, uploaded: &[&str]) -> Result<()> {
        for column in self.columns.iter().filter(|c| c.required) {
            if uploaded.contains(&column.name) {
                continue;
            }
            match fields.get(column.name) {
                Some(FieldValue::Null) | None => {
                    return Err(Error::ValidationFailed(format!(
                        "{} is required for {}",
                        column.name, self.name
                    )))
                }
                Some(FieldValue::Text(s)) if s.trim().is_empty() => {
                    return Err(Error::ValidationFailed(format!(
                        "{} must not be empty for {}",
                        column.name, self.name
                    )))
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Fail when an update nulls or blanks a required column.
    pub fn check_not_cleared(&self, fields: &FieldSet) -> Result<()> {
        for column in self.columns.iter().filter(|c| c.required) {
            match fields.get(column.name) {
                Some(FieldValue::Null) => {
                    return Err(Error::ValidationFailed(format!(
                        "{} cannot be cleared on {}",
                        column.name, self.name
                    )))
                }
                Some(FieldValue::Text(s)) if s.trim().is_empty() => {
                    return Err(Error::ValidationFailed(format!(
                        "{} must not be empty for {}",
                        column.name, self.name
                    )))
                }
                _ => {}
            }
        }
        Ok(())
    }
}

fn coerce(column: &ColumnSpec, raw: &JsonValue) -> Result<FieldValue> {
    let invalid = |what: &str| {
        Error::ValidationFailed(format!("{} must be {}, got {}", column.name, what, raw))
    };

    match (column.kind, raw) {
        (_, JsonValue::Null) => Ok(FieldValue::Null),

        (ColumnKind::Text, JsonValue::String(s)) => Ok(FieldValue::Text(s.clone())),
        (ColumnKind::Text, JsonValue::Number(n)) => Ok(FieldValue::Text(n.to_string())),
        (ColumnKind::Text, JsonValue::Bool(b)) => Ok(FieldValue::Text(b.to_string())),
        (ColumnKind::Text, _) => Err(invalid("text")),

        (ColumnKind::Numeric, JsonValue::String(s)) if s.trim().is_empty() => Ok(FieldValue::Null),
        (ColumnKind::Numeric, JsonValue::String(s)) => BigDecimal::from_str(s.trim())
            .map(FieldValue::Numeric)
            .map_err(|_| invalid("numeric")),
        (ColumnKind::Numeric, JsonValue::Number(n)) => BigDecimal::from_str(&n.to_string())
            .map(FieldValue::Numeric)
            .map_err(|_| invalid("numeric")),
        (ColumnKind::Numeric, _) => Err(invalid("numeric")),

        (ColumnKind::Attachment, JsonValue::String(s)) if s.is_empty() => Ok(FieldValue::Null),
        (ColumnKind::Attachment, JsonValue::String(s)) => {
            AttachmentRef::parse(s.clone()).map(FieldValue::Attachment)
        }
        (ColumnKind::Attachment, _) => Err(invalid("an attachment reference")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(value: JsonValue) -> Map<String, JsonValue> {
        match value {
            JsonValue::Object(map) => map,
            _ => panic!("payload must be an object"),
        }
    }

    #[test]
    fn test_schema_for_known_collections() {
        assert_eq!(schema_for("products").unwrap().name, "products");
        assert_eq!(schema_for("product_lines").unwrap().name, "product_lines");
    }

    #[test]
    fn test_schema_for_rejects_audit_and_users() {
        assert!(matches!(
            schema_for("audit_logs"),
            Err(Error::InvalidCollection(_))
        ));
        assert!(matches!(schema_for("users"), Err(Error::InvalidCollection(_))));
        assert!(matches!(
            schema_for("products; DROP TABLE products"),
            Err(Error::InvalidCollection(_))
        ));
    }

    #[test]
    fn test_collection_resolve() {
        assert!(matches!(
            Collection::resolve("audit_logs").unwrap(),
            Collection::AuditLogs
        ));
        assert!(matches!(
            Collection::resolve("products").unwrap(),
            Collection::Entity(_)
        ));
        assert!(Collection::resolve(USERS_COLLECTION).is_err());
    }

    #[test]
    fn test_filter_drops_unknown_and_server_managed_keys() {
        let schema = schema_for("products").unwrap();
        let fields = schema
            .filter_payload(&payload(json!({
                "name": "X100",
                "id": 999,
                "created_by": "mallory",
                "updated_at": "1999-01-01",
                "not_a_column": true
            })))
            .unwrap();
        assert_eq!(fields.len(), 1);
        assert_eq!(fields.get("name"), Some(&FieldValue::Text("X100".into())));
        for column in SERVER_MANAGED_COLUMNS {
            assert!(!fields.contains(column));
        }
    }

    #[test]
    fn test_filter_coerces_numeric_string() {
        let schema = schema_for("products").unwrap();
        let fields = schema
            .filter_payload(&payload(json!({ "name": "X100", "gmdc_pct": "35.50" })))
            .unwrap();
        assert_eq!(
            fields.get("gmdc_pct"),
            Some(&FieldValue::Numeric(BigDecimal::from_str("35.50").unwrap()))
        );
    }

    #[test]
    fn test_filter_coerces_numeric_number_and_empty_string() {
        let schema = schema_for("products").unwrap();
        let fields = schema
            .filter_payload(&payload(json!({ "gmdc_pct": 12.25 })))
            .unwrap();
        assert_eq!(
            fields.get("gmdc_pct"),
            Some(&FieldValue::Numeric(BigDecimal::from_str("12.25").unwrap()))
        );

        let fields = schema
            .filter_payload(&payload(json!({ "gmdc_pct": "  " })))
            .unwrap();
        assert_eq!(fields.get("gmdc_pct"), Some(&FieldValue::Null));
    }

    #[test]
    fn test_filter_rejects_malformed_numeric() {
        let schema = schema_for("products").unwrap();
        let err = schema
            .filter_payload(&payload(json!({ "gmdc_pct": "thirty five" })))
            .unwrap_err();
        assert!(matches!(err, Error::ValidationFailed(_)));
    }

    #[test]
    fn test_filter_rejects_object_for_text() {
        let schema = schema_for("product_lines").unwrap();
        let err = schema
            .filter_payload(&payload(json!({ "name": { "nested": 1 } })))
            .unwrap_err();
        assert!(matches!(err, Error::ValidationFailed(_)));
    }

    #[test]
    fn test_filter_attachment_reference() {
        let schema = schema_for("products").unwrap();
        let fields = schema
            .filter_payload(&payload(json!({ "product_pictures": "uploads/a.png" })))
            .unwrap();
        assert_eq!(
            fields.get("product_pictures"),
            Some(&FieldValue::Attachment(
                AttachmentRef::parse("uploads/a.png").unwrap()
            ))
        );

        let err = schema
            .filter_payload(&payload(json!({ "product_pictures": "../../etc/shadow" })))
            .unwrap_err();
        assert!(matches!(err, Error::ValidationFailed(_)));
    }

    #[test]
    fn test_check_required() {
        let schema = schema_for("products").unwrap();
        let missing = schema
            .filter_payload(&payload(json!({ "description": "d" })))
            .unwrap();
        assert!(matches!(
            schema.check_required(&missing),
            Err(Error::ValidationFailed(_))
        ));

        let blank = schema
            .filter_payload(&payload(json!({ "name": "   " })))
            .unwrap();
        assert!(schema.check_required(&blank).is_err());

        let ok = schema
            .filter_payload(&payload(json!({ "name": "X100" })))
            .unwrap();
        assert!(schema.check_required(&ok).is_ok());
    }

    #[test]
    fn test_check_not_cleared() {
        let schema = schema_for("products").unwrap();
        let cleared = schema
            .filter_payload(&payload(json!({ "name": null })))
            .unwrap();
        assert!(schema.check_not_cleared(&cleared).is_err());

        let partial = schema
            .filter_payload(&payload(json!({ "description": "new" })))
            .unwrap();
        assert!(schema.check_not_cleared(&partial).is_ok());
    }

    #[test]
    fn test_check_not_cleared_rejects_blank_text() {
        let schema = schema_for("products").unwrap();
        let blank = schema
            .filter_payload(&payload(json!({ "name": "   " })))
            .unwrap();
        assert!(matches!(
            schema.check_not_cleared(&blank),
            Err(Error::ValidationFailed(_))
        ));

        let renamed = schema
            .filter_payload(&payload(json!({ "name": " X200 " })))
            .unwrap();
        assert!(schema.check_not_cleared(&renamed).is_ok());
    }

    #[test]
    fn test_attachment_columns() {
        let products = schema_for("products").unwrap();
        let names: Vec<_> = products.attachment_columns().map(|c| c.name).collect();
        assert_eq!(names, vec!["product_pictures"]);
        assert!(products.is_attachment("product_pictures"));
        assert!(!products.is_attachment("name"));

        let lines = schema_for("product_lines").unwrap();
        assert_eq!(lines.attachment_columns().count(), 0);
    }

    #[test]
    fn test_numeric_columns() {
        let products = schema_for("products").unwrap();
        let names: Vec<_> = products.numeric_columns().map(|c| c.name).collect();
        assert_eq!(names, vec!["gmdc_pct"]);
        assert_eq!(schema_for("product_lines").unwrap().numeric_columns().count(), 0);
    }

    #[test]
    fn test_no_schema_whitelists_server_managed_columns() {
        for schema in ENTITY_SCHEMAS {
            for column in SERVER_MANAGED_COLUMNS {
                assert!(schema.column(column).is_none(), "{}.{}", schema.name, column);
            }
        }
    }

    #[test]
    fn test_field_set_set_replaces() {
        let mut fields = FieldSet::new();
        fields.set("name", FieldValue::Text("a".into()));
        fields.set("name", FieldValue::Text("b".into()));
        assert_eq!(fields.len(), 1);
        assert_eq!(fields.to_json(), json!({ "name": "b" }));
    }
}
