//! Best-effort removal of files stored by a failed session.

use metrics::counter;
use tracing::{debug, warn};

use crate::errors::RollbackFailure;
use crate::metrics::ROLLBACK_DELETES_TOTAL;
use crate::storage::backend::StorageBackend;
use crate::upload::StoredFile;

/// Deletes committed files one at a time and collects every failure.
pub struct RollbackCoordinator<'a> {
    storage: &'a dyn StorageBackend,
}

impl<'a> RollbackCoordinator<'a> {
    pub fn new(storage: &'a dyn StorageBackend) -> Self {
        Self { storage }
    }

    /// Delete `files` in order.  A failed deletion does not stop the rest.
    pub async fn rollback(&self, files: Vec<StoredFile>) -> Vec<RollbackFailure> {
        let mut failures = Vec::new();
        for file in files {
            match self.storage.delete(&file).await {
                Ok(()) => {
                    debug!("Rolled back {}", file.meta.storage_key);
                    counter!(ROLLBACK_DELETES_TOTAL, "status" => "ok").increment(1);
                }
                Err(err) => {
                    warn!(
                        "Rollback of {} (field {}) failed: {err:#}",
                        file.meta.storage_key, file.info.field_name
                    );
                    counter!(ROLLBACK_DELETES_TOTAL, "status" => "error").increment(1);
                    failures.push(RollbackFailure {
                        field_name: file.info.field_name,
                        storage_key: file.meta.storage_key,
                        source: err,
                    });
                }
            }
        }
        failures
    }
}
