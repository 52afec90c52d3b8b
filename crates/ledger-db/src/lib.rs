//! # ledger-db
//!
//! PostgreSQL write path for the ledger record store.
//!
//! This crate provides:
//! - Connection pool management
//! - Record repository for the configured entity types
//! - Append-only audit log
//! - Filesystem attachment store
//! - Transaction coordinator tying the three together
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use ledger_db::{Database, FilesystemAttachmentStore, Principal, WritePayload};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let db = Database::connect("postgres://localhost/ledger").await?;
//!     let coordinator = db.coordinator(Arc::new(FilesystemAttachmentStore::new("./data")));
//!
//!     let fields = json!({ "name": "X100", "gmdc_pct": "35.5" });
//!     let outcome = coordinator
//!         .create(
//!             "products",
//!             WritePayload::from_fields(fields.as_object().cloned().unwrap_or_default()),
//!             &Principal::new("u-1", "Ana"),
//!         )
//!         .await?;
//!
//!     println!("Created product {}", outcome.entity.id);
//!     Ok(())
//! }
//! ```
pub mod attachments;
pub mod audit;
pub mod coordinator;
pub mod pool;
pub mod records;

// Always compiled so integration tests (in tests/) can use it.
pub mod test_fixtures;

use std::sync::Arc;

// Re-export core types
pub use ledger_core::*;

pub use attachments::{generate_attachment_path, FilesystemAttachmentStore, UPLOADS_DIR};
pub use audit::{AuditLog, PgAuditLog};
pub use coordinator::{Phase, TransactionCoordinator, DEFAULT_MAX_UPLOAD_BYTES};
pub use pool::{create_pool, create_pool_with_config, health_check, log_pool_metrics, PoolConfig};
pub use records::PgRecordRepository;

/// Combined database context with the repositories.
#[derive(Clone)]
pub struct Database {
    /// The underlying connection pool.
    pub pool: sqlx::Pool<sqlx::Postgres>,
    /// Entity rows for every configured entity type.
    pub records: PgRecordRepository,
    /// Audit entries, read side.
    pub audit: PgAuditLog,
}

impl Database {
    /// Create a new Database instance from a connection pool.
    pub fn new(pool: sqlx::Pool<sqlx::Postgres>) -> Self {
        Self {
            records: PgRecordRepository::new(pool.clone()),
            audit: PgAuditLog::new(pool.clone()),
            pool,
        }
    }

    /// Connect with default pool settings.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = create_pool(url).await?;
        Ok(Self::new(pool))
    }

    /// Connect with custom pool settings.
    pub async fn connect_with_config(url: &str, config: PoolConfig) -> Result<Self> {
        let pool = create_pool_with_config(url, config).await?;
        Ok(Self::new(pool))
    }

    /// Run pending migrations.
    #[cfg(feature = "migrations")]
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Internal(format!("migration failed: {}", e)))?;
        Ok(())
    }

    /// Get the underlying connection pool.
    pub fn pool(&self) -> &sqlx::Pool<sqlx::Postgres> {
        &self.pool
    }

    /// Build a write coordinator over this pool and the given attachment store.
    pub fn coordinator(&self, attachments: Arc<dyn AttachmentStore>) -> TransactionCoordinator {
        TransactionCoordinator::new(self.pool.clone(), attachments)
    }
}
