//! Abstract storage backend trait.
//!
//! Every storage backend must implement [`StorageBackend`].  Writes consume
//! a part's [`FileStream`] so callers do not need to know the underlying
//! medium, and may be outstanding for several files of one request at once.

use std::future::Future;
use std::pin::Pin;

use crate::source::FileStream;
use crate::upload::{FileInfo, StoredFile, StoredMeta};

/// Async file storage contract.
pub trait StorageBackend: Send + Sync + 'static {
    /// Store the bytes of `stream`, returning backend metadata.
    ///
    /// An `Err` item from the stream must fail the write.
    fn write(
        &self,
        file: &FileInfo,
        stream: FileStream,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<StoredMeta>> + Send + '_>>;

    /// Remove a previously written file.
    ///
    /// May be called from a different task than the write that stored it.
    fn delete(
        &self,
        file: &StoredFile,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>>;
}
