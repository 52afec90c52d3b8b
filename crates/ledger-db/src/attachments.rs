//! Filesystem-backed attachment store.
//!
//! Blobs live under `{base_path}/uploads/{2 hex}/{2 hex}/{uuidv7}.{ext}`. The
//! returned reference token is the path relative to `base_path`; that token is
//! what entity rows store in their attachment-capable columns.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

use ledger_core::{storage_extension, AttachmentRef, AttachmentStore, Error, Result};

/// Top-level directory for stored blobs, relative to the store's base path.
pub const UPLOADS_DIR: &str = "uploads";

/// Generate the reference token for a new blob.
///
/// Format: `uploads/{first-2-hex}/{next-2-hex}/{uuid}[.ext]`
pub fn generate_attachment_path(id: &Uuid, extension: Option<&str>) -> String {
    let simple = id.simple().to_string();
    let mut path = format!(
        "{}/{}/{}/{}",
        UPLOADS_DIR,
        &simple[0..2],
        &simple[2..4],
        id.as_hyphenated()
    );
    if let Some(ext) = extension {
        path.push('.');
        path.push_str(ext);
    }
    path
}

/// Attachment store writing blobs to a local directory.
#[derive(Debug, Clone)]
pub struct FilesystemAttachmentStore {
    base_path: PathBuf,
}

impl FilesystemAttachmentStore {
    /// Create a store rooted at `base_path`.
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn full_path(&self, reference: &AttachmentRef) -> PathBuf {
        self.base_path.join(reference.as_str())
    }

    /// Validate that the store can write, read, and delete files.
    ///
    /// Performs a full round-trip at startup to catch permission errors and
    /// missing directories early.
    pub async fn validate(&self) -> std::result::Result<(), String> {
        let test_dir = self.base_path.join(UPLOADS_DIR).join(".health-check");
        let test_file = test_dir.join("test.bin");

        fs::create_dir_all(&test_dir)
            .await
            .map_err(|e| format!("create_dir_all({:?}): {}", test_dir, e))?;

        let data = b"storage-health-check";
        fs::write(&test_file, data)
            .await
            .map_err(|e| format!("write({:?}): {}", test_file, e))?;

        let read_data = fs::read(&test_file)
            .await
            .map_err(|e| format!("read({:?}): {}", test_file, e))?;
        if read_data != data {
            return Err("read-back mismatch".to_string());
        }

        fs::remove_file(&test_file)
            .await
            .map_err(|e| format!("remove_file({:?}): {}", test_file, e))?;
        let _ = fs::remove_dir(&test_dir).await;

        Ok(())
    }

    /// Read a blob's bytes back.
    pub async fn read(&self, reference: &AttachmentRef) -> Result<Vec<u8>> {
        match fs::read(self.full_path(reference)).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(Error::NotFound(format!(
                "attachment {}",
                reference
            ))),
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// Write `data` to `full_path` via temp file + rename.
    async fn write_atomic(&self, full_path: &Path, data: &[u8]) -> Result<()> {
        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| {
                warn!(parent = %parent.display(), error = %e, "attachments: create_dir_all failed");
                e
            })?;
        }

        let temp_path = full_path.with_extension("tmp");
        let mut file = fs::File::create(&temp_path).await.map_err(|e| {
            warn!(temp_path = %temp_path.display(), error = %e, "attachments: File::create failed");
            e
        })?;
        if let Err(e) = file.write_all(data).await {
            warn!(error = %e, "attachments: write_all failed");
            drop(file);
            let _ = fs::remove_file(&temp_path).await;
            return Err(e.into());
        }
        file.sync_all().await?;
        drop(file);

        if let Err(e) = fs::rename(&temp_path, full_path).await {
            warn!(from = %temp_path.display(), to = %full_path.display(), error = %e, "attachments: rename failed");
            let _ = fs::remove_file(&temp_path).await;
            return Err(e.into());
        }

        // rw-r--r--, never executable
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(full_path, std::fs::Permissions::from_mode(0o644)).await?;
        }

        Ok(())
    }
}

#[async_trait]
impl AttachmentStore for FilesystemAttachmentStore {
    async fn save(&self, data: &[u8], suggested_name: &str) -> Result<AttachmentRef> {
        let extension = storage_extension(suggested_name, data);
        let reference = AttachmentRef::parse(generate_attachment_path(
            &Uuid::now_v7(),
            extension.as_deref(),
        ))?;
        let full_path = self.full_path(&reference);

        self.write_atomic(&full_path, data).await?;

        debug!(
            subsystem = "storage",
            component = "attachments",
            op = "save",
            attachment_ref = %reference,
            size_bytes = data.len(),
            "Attachment saved"
        );
        Ok(reference)
    }

    async fn delete(&self, reference: &AttachmentRef) -> Result<()> {
        let full_path = self.full_path(reference);
        match fs::remove_file(&full_path).await {
            Ok(()) => {
                debug!(
                    subsystem = "storage",
                    component = "attachments",
                    op = "delete",
                    attachment_ref = %reference,
                    "Attachment deleted"
                );
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(
                    subsystem = "storage",
                    component = "attachments",
                    op = "delete",
                    attachment_ref = %reference,
                    "Attachment already absent"
                );
                Ok(())
            }
            Err(e) => Err(Error::Io(e)),
        }
    }

    async fn exists(&self, reference: &AttachmentRef) -> Result<bool> {
        Ok(fs::try_exists(self.full_path(reference)).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const PNG: [u8; 8] = [0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];

    #[test]
    fn test_generate_attachment_path_layout() {
        let id = Uuid::parse_str("01948f7e-8b2a-7c3d-9e4f-5a6b7c8d9e0f").unwrap();
        assert_eq!(
            generate_attachment_path(&id, Some("png")),
            "uploads/01/94/01948f7e-8b2a-7c3d-9e4f-5a6b7c8d9e0f.png"
        );
        assert_eq!(
            generate_attachment_path(&id, None),
            "uploads/01/94/01948f7e-8b2a-7c3d-9e4f-5a6b7c8d9e0f"
        );
    }

    #[tokio::test]
    async fn test_save_read_delete() {
        let dir = TempDir::new().unwrap();
        let store = FilesystemAttachmentStore::new(dir.path());

        let reference = store.save(&PNG, "photo.PNG").await.unwrap();
        assert!(reference.as_str().starts_with("uploads/"));
        assert!(reference.as_str().ends_with(".png"));
        assert!(store.exists(&reference).await.unwrap());
        assert_eq!(store.read(&reference).await.unwrap(), PNG.to_vec());

        store.delete(&reference).await.unwrap();
        assert!(!store.exists(&reference).await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_missing_is_ok() {
        let dir = TempDir::new().unwrap();
        let store = FilesystemAttachmentStore::new(dir.path());
        let reference = AttachmentRef::parse("uploads/aa/bb/missing.png").unwrap();

        store.delete(&reference).await.unwrap();
        store.delete(&reference).await.unwrap();
    }

    #[tokio::test]
    async fn test_read_missing_is_not_found() {
        let dir = TempDir::new().unwrap();
        let store = FilesystemAttachmentStore::new(dir.path());
        let reference = AttachmentRef::parse("uploads/aa/bb/missing.png").unwrap();

        assert!(matches!(
            store.read(&reference).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_save_gives_distinct_references() {
        let dir = TempDir::new().unwrap();
        let store = FilesystemAttachmentStore::new(dir.path());

        let a = store.save(b"same bytes", "a.txt").await.unwrap();
        let b = store.save(b"same bytes", "a.txt").await.unwrap();
        assert_ne!(a, b);
        assert!(store.exists(&a).await.unwrap());
        assert!(store.exists(&b).await.unwrap());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_saved_file_is_not_executable() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let store = FilesystemAttachmentStore::new(dir.path());
        let reference = store.save(b"hello", "note.txt").await.unwrap();

        let meta = std::fs::metadata(dir.path().join(reference.as_str())).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o644);
    }

    #[tokio::test]
    async fn test_validate_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = FilesystemAttachmentStore::new(dir.path());
        assert!(store.validate().await.is_ok());
    }
}
