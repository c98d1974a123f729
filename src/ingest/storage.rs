//! Local-disk attachment storage.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;
use uuid::Uuid;

use super::source::AttachmentStore;

/// Writes attachments to `<dir>/<uuid>_<filename>`.
///
/// The storage reference is the file name relative to `dir`, which the
/// server exposes under `/uploads`.
#[derive(Debug, Clone)]
pub struct LocalAttachmentStore {
    dir: PathBuf,
}

impl LocalAttachmentStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Create the storage directory if it doesn't exist.
    pub async fn ensure_dir(&self) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.dir).await
    }
}

#[async_trait]
impl AttachmentStore for LocalAttachmentStore {
    async fn store(&self, filename: &str, bytes: &[u8]) -> Result<String, std::io::Error> {
        let reference = format!("{}_{}", Uuid::new_v4(), sanitize_filename(filename));
        let path = self.dir.join(&reference);

        tokio::fs::write(&path, bytes).await?;

        debug!(path = %path.display(), size = bytes.len(), "Stored attachment");
        Ok(reference)
    }

    async fn remove(&self, storage_reference: &str) -> Result<(), std::io::Error> {
        // References are always produced by `store`, which never emits separators.
        if storage_reference.is_empty()
            || sanitize_filename(storage_reference) != storage_reference
        {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("not a storage reference: {storage_reference}"),
            ));
        }

        let path = self.dir.join(storage_reference);
        tokio::fs::remove_file(&path).await?;

        debug!(path = %path.display(), "Removed attachment");
        Ok(())
    }
}

/// Keep a filename safe to join onto the storage dir.
pub fn sanitize_filename(filename: &str) -> String {
    let base = filename
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default();

    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();

    let cleaned = cleaned.trim_start_matches('.');
    if cleaned.is_empty() {
        "attachment".to_string()
    } else {
        cleaned.to_string()
    }
}
