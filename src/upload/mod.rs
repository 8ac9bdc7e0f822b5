//! Upload session coordination.
//!
//! [`session::UploadSession`] consumes one request's multipart events,
//! stores accepted files through a [`crate::storage::backend::StorageBackend`],
//! and finishes exactly once: with every field and every stored file in
//! arrival order, or with the first error after rolling back what was stored.

pub mod counter;
pub mod fields;
pub mod filter;
pub mod placeholder;
pub mod rollback;
pub mod session;

use http::HeaderMap;
use serde::Serialize;

/// Part metadata of a file, known before any bytes are stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileInfo {
    /// Multipart field name.
    pub field_name: String,
    /// Filename declared by the client.
    pub original_name: String,
    /// Transfer encoding of the part.
    pub encoding: String,
    /// Declared content type.
    pub content_type: String,
}

/// Metadata a storage backend assigns once a file is written.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredMeta {
    /// Backend-specific key used to address (and delete) the file.
    pub storage_key: String,
    /// Bytes written.
    pub size: u64,
    /// Quoted MD5 hex of the content.
    pub etag: String,
    /// Backend-specific location, e.g. a filesystem path.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

/// A file that reached storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoredFile {
    #[serde(flatten)]
    pub info: FileInfo,
    #[serde(flatten)]
    pub meta: StoredMeta,
}

impl StoredFile {
    pub fn new(info: FileInfo, meta: StoredMeta) -> Self {
        Self { info, meta }
    }
}

/// Request-scoped data handed to file filters.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub request_id: String,
    pub headers: HeaderMap,
}

/// Result of a successful session.
#[derive(Debug, Clone, Serialize)]
pub struct UploadOutcome {
    /// Assembled text fields.
    pub fields: serde_json::Map<String, serde_json::Value>,
    /// Stored files in arrival order.
    pub files: Vec<StoredFile>,
}
