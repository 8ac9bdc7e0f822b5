//! Upload error types.
//!
//! Every failure a session can end with maps to a stable error code.  Limit
//! violations share the [`LimitCode`] table with the multipart source, and
//! [`SessionFailure`] implements [`axum::response::IntoResponse`] so the
//! upload handler can return it directly.

use std::fmt;
use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

/// Generate a 16-character hex request ID.
pub fn generate_request_id() -> String {
    let bytes: [u8; 8] = rand::random();
    hex::encode(bytes).to_uppercase()
}

/// Limit conditions a session can trip, each with a distinct code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LimitCode {
    PartCount,
    FileSize,
    FileCount,
    FieldKey,
    FieldValue,
    FieldCount,
    FieldKeys,
    UnexpectedFile,
    MissingFieldName,
}

impl LimitCode {
    /// Return the wire error code.
    pub fn code(&self) -> &'static str {
        match self {
            LimitCode::PartCount => "LIMIT_PART_COUNT",
            LimitCode::FileSize => "LIMIT_FILE_SIZE",
            LimitCode::FileCount => "LIMIT_FILE_COUNT",
            LimitCode::FieldKey => "LIMIT_FIELD_KEY",
            LimitCode::FieldValue => "LIMIT_FIELD_VALUE",
            LimitCode::FieldCount => "LIMIT_FIELD_COUNT",
            LimitCode::FieldKeys => "LIMIT_FIELD_KEYS",
            LimitCode::UnexpectedFile => "LIMIT_UNEXPECTED_FILE",
            LimitCode::MissingFieldName => "MISSING_FIELD_NAME",
        }
    }

    /// Return the human-readable message.
    pub fn message(&self) -> &'static str {
        match self {
            LimitCode::PartCount => "Too many parts",
            LimitCode::FileSize => "File too large",
            LimitCode::FileCount => "Too many files",
            LimitCode::FieldKey => "Field name too long",
            LimitCode::FieldValue => "Field value too long",
            LimitCode::FieldCount => "Too many fields",
            LimitCode::FieldKeys => "Too many field keys",
            LimitCode::UnexpectedFile => "Unexpected field",
            LimitCode::MissingFieldName => "Field name missing",
        }
    }

    fn status_code(&self) -> StatusCode {
        match self {
            LimitCode::FileSize => StatusCode::PAYLOAD_TOO_LARGE,
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

impl fmt::Display for LimitCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Failure reading a part's bytes from the request body.
///
/// Cloneable so the same failure can be handed to the storage backend
/// through the file stream and reported by the session.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct StreamError {
    message: Arc<str>,
}

impl StreamError {
    pub fn new(message: impl fmt::Display) -> Self {
        Self {
            message: message.to_string().into(),
        }
    }
}

impl From<StreamError> for std::io::Error {
    fn from(err: StreamError) -> Self {
        std::io::Error::new(std::io::ErrorKind::Other, err)
    }
}

/// The primary error of a failed upload session.
#[derive(Debug, Error)]
pub enum UploadError {
    /// A configured limit (or a required field name) was violated.
    #[error("{}", .code.message())]
    Limit {
        code: LimitCode,
        field: Option<String>,
    },

    /// The file filter refused the file with an error.
    #[error("File rejected: {0}")]
    FilterRejected(#[source] anyhow::Error),

    /// The storage backend failed to write a file.
    #[error("Storage write failed: {0}")]
    StorageWrite(#[source] anyhow::Error),

    /// The request body or a file stream failed mid-transfer.
    #[error("Stream error: {0}")]
    Stream(#[from] StreamError),

    /// The multipart decoder could not be constructed.
    #[error("Malformed multipart request: {0}")]
    MalformedRequest(String),

    /// The request is not `multipart/*`.
    #[error("Unsupported content type, expected multipart/form-data")]
    UnsupportedMediaType,
}

impl UploadError {
    /// Shorthand for a limit error without field context.
    pub fn limit(code: LimitCode) -> Self {
        UploadError::Limit { code, field: None }
    }

    /// Shorthand for a limit error scoped to `field`.
    pub fn limit_for(code: LimitCode, field: impl Into<String>) -> Self {
        UploadError::Limit {
            code,
            field: Some(field.into()),
        }
    }

    /// Return the error code string.
    pub fn code(&self) -> &'static str {
        match self {
            UploadError::Limit { code, .. } => code.code(),
            UploadError::FilterRejected(_) => "FILTER_REJECTED",
            UploadError::StorageWrite(_) => "STORAGE_WRITE_FAILED",
            UploadError::Stream(_) => "STREAM_ERROR",
            UploadError::MalformedRequest(_) => "MALFORMED_REQUEST",
            UploadError::UnsupportedMediaType => "UNSUPPORTED_MEDIA_TYPE",
        }
    }

    /// Field the error is scoped to, if any.
    pub fn field(&self) -> Option<&str> {
        match self {
            UploadError::Limit { field, .. } => field.as_deref(),
            _ => None,
        }
    }

    /// Return the appropriate HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            UploadError::Limit { code, .. } => code.status_code(),
            UploadError::FilterRejected(_) => StatusCode::BAD_REQUEST,
            UploadError::StorageWrite(_) => StatusCode::INTERNAL_SERVER_ERROR,
            UploadError::Stream(_) => StatusCode::BAD_REQUEST,
            UploadError::MalformedRequest(_) => StatusCode::BAD_REQUEST,
            UploadError::UnsupportedMediaType => StatusCode::UNSUPPORTED_MEDIA_TYPE,
        }
    }
}

/// A committed file that could not be deleted during rollback.
#[derive(Debug, Error)]
#[error("Failed to delete {storage_key}: {source}")]
pub struct RollbackFailure {
    pub field_name: String,
    pub storage_key: String,
    #[source]
    pub source: anyhow::Error,
}

impl RollbackFailure {
    pub const CODE: &'static str = "STORAGE_DELETE_FAILED";
}

/// Terminal failure of a session: the first error raised, plus every
/// rollback deletion that failed afterwards.
#[derive(Debug, Error)]
#[error("{primary}")]
pub struct SessionFailure {
    #[source]
    pub primary: UploadError,
    pub rollback_errors: Vec<RollbackFailure>,
}

impl SessionFailure {
    pub fn new(primary: UploadError, rollback_errors: Vec<RollbackFailure>) -> Self {
        Self {
            primary,
            rollback_errors,
        }
    }
}

impl From<UploadError> for SessionFailure {
    fn from(primary: UploadError) -> Self {
        Self::new(primary, Vec::new())
    }
}

impl IntoResponse for SessionFailure {
    fn into_response(self) -> Response {
        let status = self.primary.status_code();
        let rollback_errors: Vec<_> = self
            .rollback_errors
            .iter()
            .map(|failure| {
                json!({
                    "code": RollbackFailure::CODE,
                    "field": failure.field_name,
                    "storageKey": failure.storage_key,
                    "message": failure.source.to_string(),
                })
            })
            .collect();

        let body = json!({
            "error": {
                "code": self.primary.code(),
                "message": self.primary.to_string(),
                "field": self.primary.field(),
                "rollbackErrors": rollback_errors,
            }
        });

        (
            status,
            [("content-type", "application/json")],
            body.to_string(),
        )
            .into_response()
    }
}

impl IntoResponse for UploadError {
    fn into_response(self) -> Response {
        SessionFailure::from(self).into_response()
    }
}
