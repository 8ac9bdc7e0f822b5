//! In-memory storage backend.
//!
//! Files are held in a `tokio::sync::RwLock<HashMap<...>>` keyed by a fresh
//! UUID.  A configurable memory limit (`max_size_bytes`) caps total stored
//! bytes; deleting a file releases its share.

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use md5::{Digest, Md5};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use super::backend::StorageBackend;
use crate::source::FileStream;
use crate::upload::{FileInfo, StoredFile, StoredMeta};

/// In-memory storage backend.
pub struct MemoryBackend {
    /// storage_key -> (data, etag).
    objects: tokio::sync::RwLock<HashMap<String, (Bytes, String)>>,
    /// Current total bytes stored.
    current_size: tokio::sync::RwLock<u64>,
    /// Maximum bytes allowed.  0 means unlimited.
    max_size_bytes: u64,
}

impl MemoryBackend {
    pub fn new(max_size_bytes: u64) -> Self {
        Self {
            objects: tokio::sync::RwLock::new(HashMap::new()),
            current_size: tokio::sync::RwLock::new(0),
            max_size_bytes,
        }
    }

    /// Compute the quoted MD5-hex ETag for a byte slice.
    fn compute_etag(data: &[u8]) -> String {
        let mut hasher = Md5::new();
        hasher.update(data);
        format!("\"{}\"", hex::encode(hasher.finalize()))
    }

    /// Fail if `total` bytes would exceed the memory limit.
    fn check_capacity(&self, total: u64) -> anyhow::Result<()> {
        if self.max_size_bytes != 0 && total > self.max_size_bytes {
            anyhow::bail!(
                "Memory limit exceeded: requested={total}, max={}",
                self.max_size_bytes
            );
        }
        Ok(())
    }

    /// Number of files currently held.
    pub async fn object_count(&self) -> usize {
        self.objects.read().await.len()
    }

    /// Total bytes currently held.
    pub async fn stored_bytes(&self) -> u64 {
        *self.current_size.read().await
    }
}

impl StorageBackend for MemoryBackend {
    fn write(
        &self,
        _file: &FileInfo,
        mut stream: FileStream,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<StoredMeta>> + Send + '_>> {
        Box::pin(async move {
            let mut buf = BytesMut::new();
            while let Some(chunk) = stream.next().await {
                let chunk = chunk?;
                // Fail early instead of buffering past the cap.
                let current = *self.current_size.read().await;
                self.check_capacity(current + (buf.len() + chunk.len()) as u64)?;
                buf.extend_from_slice(&chunk);
            }
            let data = buf.freeze();
            let size = data.len() as u64;
            let etag = Self::compute_etag(&data);

            let mut current = self.current_size.write().await;
            self.check_capacity(*current + size)?;
            let storage_key = uuid::Uuid::new_v4().to_string();
            self.objects
                .write()
                .await
                .insert(storage_key.clone(), (data, etag.clone()));
            *current += size;

            Ok(StoredMeta {
                storage_key,
                size,
                etag,
                location: None,
            })
        })
    }

    fn delete(
        &self,
        file: &StoredFile,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let storage_key = file.meta.storage_key.clone();
        Box::pin(async move {
            let mut current = self.current_size.write().await;
            // Idempotent: a missing key is not an error.
            if let Some((data, _)) = self.objects.write().await.remove(&storage_key) {
                *current = current.saturating_sub(data.len() as u64);
            }
            Ok(())
        })
    }
}
