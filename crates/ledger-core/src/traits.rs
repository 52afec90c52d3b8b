//! Core traits for ledger abstractions.
//!
//! These traits define the seams the transaction coordinator composes, so
//! storage backends can be swapped and failure paths can be exercised in tests.

use async_trait::async_trait;

use crate::error::Result;
use crate::models::AttachmentRef;

/// Out-of-band blob store for attachment-capable fields.
///
/// The store cannot join a database transaction; the coordinator treats every
/// `save` as provisional until the owning transaction commits.
#[async_trait]
pub trait AttachmentStore: Send + Sync {
    /// Persist raw bytes and return a fresh, stable reference token.
    async fn save(&self, data: &[u8], suggested_name: &str) -> Result<AttachmentRef>;

    /// Remove a blob. Deleting a missing reference is not an error.
    async fn delete(&self, reference: &AttachmentRef) -> Result<()>;

    /// Check whether a blob exists.
    async fn exists(&self, reference: &AttachmentRef) -> Result<bool>;
}
