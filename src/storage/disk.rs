//! Local filesystem storage backend.
//!
//! Files are stored flat under a configurable root directory, each under a
//! fresh UUID key that keeps the original file extension.
//!
//! All writes follow crash-only design: stream to a temp file, fsync, rename.

use futures::StreamExt;
use md5::{Digest, Md5};
use std::future::Future;
use std::path::{Component, Path, PathBuf};
use std::pin::Pin;
use tokio::io::AsyncWriteExt;

use super::backend::StorageBackend;
use crate::source::FileStream;
use crate::upload::{FileInfo, StoredFile, StoredMeta};

/// Stores uploaded files on the local filesystem.
pub struct DiskBackend {
    /// Root directory for all stored files.
    root: PathBuf,
}

impl DiskBackend {
    /// Create a new `DiskBackend` rooted at `root`.
    ///
    /// The directory will be created if it does not exist.
    pub fn new(root: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        // Also create the .tmp directory for atomic writes.
        std::fs::create_dir_all(root.join(".tmp"))?;
        Ok(Self { root })
    }

    /// Resolve a storage key to an absolute file path.
    ///
    /// Rejects keys that could escape the root directory.
    fn resolve(&self, storage_key: &str) -> anyhow::Result<PathBuf> {
        for component in Path::new(storage_key).components() {
            if !matches!(component, Component::Normal(_)) {
                anyhow::bail!("Path traversal detected in storage key: {}", storage_key);
            }
        }
        let path = self.root.join(storage_key);
        if path.exists() {
            let canonical_root = self.root.canonicalize()?;
            if !path.canonicalize()?.starts_with(&canonical_root) {
                anyhow::bail!("Path traversal detected in storage key: {}", storage_key);
            }
        }
        Ok(path)
    }

    /// Generate a temp file path under .tmp/ for atomic writes.
    fn temp_path(&self) -> PathBuf {
        let id = uuid::Uuid::new_v4();
        self.root.join(".tmp").join(format!("tmp-{}", id))
    }

    /// Fresh storage key for a file, keeping a short alphanumeric extension.
    fn new_key(original_name: &str) -> String {
        let id = uuid::Uuid::new_v4();
        let ext = Path::new(original_name)
            .extension()
            .and_then(|e| e.to_str())
            .filter(|e| !e.is_empty() && e.len() <= 16)
            .filter(|e| e.chars().all(|c| c.is_ascii_alphanumeric()));
        match ext {
            Some(ext) => format!("{}.{}", id, ext.to_ascii_lowercase()),
            None => id.to_string(),
        }
    }

    /// Stream `stream` into `path`, returning the byte count and ETag.
    async fn write_temp(path: &Path, mut stream: FileStream) -> anyhow::Result<(u64, String)> {
        let mut file = tokio::fs::File::create(path).await?;
        let mut hasher = Md5::new();
        let mut size: u64 = 0;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            hasher.update(&chunk);
            file.write_all(&chunk).await?;
            size += chunk.len() as u64;
        }
        file.flush().await?;
        file.sync_all().await?; // fsync

        let etag = format!("\"{}\"", hex::encode(hasher.finalize()));
        Ok((size, etag))
    }
}

impl StorageBackend for DiskBackend {
    fn write(
        &self,
        file: &FileInfo,
        stream: FileStream,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<StoredMeta>> + Send + '_>> {
        let storage_key = Self::new_key(&file.original_name);
        Box::pin(async move {
            let final_path = self.resolve(&storage_key)?;
            let tmp_path = self.temp_path();

            let written = match Self::write_temp(&tmp_path, stream).await {
                Ok(written) => tokio::fs::rename(&tmp_path, &final_path)
                    .await
                    .map(|()| written)
                    .map_err(anyhow::Error::from),
                Err(err) => Err(err),
            };
            let (size, etag) = match written {
                Ok(written) => written,
                Err(err) => {
                    // Crash-only: a failed write leaves nothing behind.
                    let _ = tokio::fs::remove_file(&tmp_path).await;
                    return Err(err);
                }
            };

            tracing::debug!("Stored {} ({} bytes)", storage_key, size);
            Ok(StoredMeta {
                location: Some(final_path.display().to_string()),
                storage_key,
                size,
                etag,
            })
        })
    }

    fn delete(
        &self,
        file: &StoredFile,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let storage_key = file.meta.storage_key.clone();
        Box::pin(async move {
            let path = self.resolve(&storage_key)?;

            // Idempotent: if the file doesn't exist, that's fine.
            match tokio::fs::remove_file(&path).await {
                Ok(()) => Ok(()),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(err) => Err(err.into()),
            }
        })
    }
}
