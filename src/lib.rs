//! formstash library: multipart upload ingestion.
//!
//! This crate accepts `multipart/form-data` requests, stores each file part
//! through a pluggable storage backend as it streams in, and answers with
//! either every field and file in arrival order or the first error, after
//! removing whatever the failed request had already stored.

use std::sync::Arc;

pub mod config;
pub mod errors;
pub mod handlers;
pub mod metrics;
pub mod server;
pub mod source;
pub mod storage;
pub mod upload;

use crate::config::Config;
use crate::storage::backend::StorageBackend;
use crate::upload::filter::FileFilter;

/// Shared application state passed to all handlers via `axum::extract::State`.
pub struct AppState {
    /// Server configuration.
    pub config: Config,
    /// File storage backend (local disk or memory).
    pub storage: Arc<dyn StorageBackend>,
    /// Decides which file parts get stored.
    pub filter: Arc<dyn FileFilter>,
}
