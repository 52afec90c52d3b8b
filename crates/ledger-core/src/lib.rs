//! # ledger-core
//!
//! Core types, entity schemas, and traits for the ledger record store.
//!
//! This crate provides the foundational data structures and trait definitions
//! that the database and API crates depend on.
//!
//! ## Logging
//!
//! All crates log through `tracing` with the same structured field names:
//! `subsystem` ("api", "db", "storage"), `component`, `op`, `entity_type`,
//! `entity_id`, `principal_id`, `phase`, `attachment_ref`, `duration_ms`,
//! `error_kind`.
//!
//! | Level | Usage |
//! |-------|-------|
//! | ERROR | Primary mutation failed for a server-side reason |
//! | WARN  | Compensation step failed (orphaned blob left behind) |
//! | INFO  | Startup, committed mutations |
//! | DEBUG | Phase transitions, dropped payload keys, attachment saves/deletes |

pub mod error;
pub mod file_safety;
pub mod models;
pub mod schema;
pub mod traits;

// Re-export commonly used types at crate root
pub use error::{Error, Result};
pub use file_safety::{sanitize_filename, storage_extension, validate_upload, UploadCheck};
pub use models::*;
pub use schema::{
    schema_for, Collection, ColumnKind, ColumnSpec, EntitySchema, FieldSet, FieldValue,
    ENTITY_SCHEMAS, SERVER_MANAGED_COLUMNS,
};
pub use traits::*;
