//! `multipart/form-data` source backed by the `multer` decoder.
//!
//! Classifies parts into fields and files, applies the per-part limits and
//! forwards file bytes into each part's [`FileStream`] with backpressure.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use async_compression::tokio::bufread::GzipDecoder;
use bytes::Bytes;
use futures::{Stream, StreamExt, TryStreamExt};
use http::header::{CONTENT_ENCODING, CONTENT_TYPE};
use http::HeaderMap;
use multer::{Field, Multipart};
use tokio_util::io::{ReaderStream, StreamReader};
use tracing::debug;

use crate::errors::{StreamError, UploadError};
use crate::source::{file_stream, FileStreamSender, MultipartSource, SourceEvent};

/// Chunks buffered ahead of a slow storage write.
const FILE_CHANNEL_CAPACITY: usize = 16;

/// Per-request part limits.  `None` means unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartLimits {
    /// Max field name length in bytes.
    pub field_name_size: Option<usize>,
    /// Max field value length in bytes.
    pub field_size: Option<usize>,
    /// Max number of non-file parts.
    pub fields: Option<usize>,
    /// Max size of one file in bytes.
    pub file_size: Option<u64>,
    /// Max number of file parts.
    pub files: Option<usize>,
    /// Max number of parts of either kind.
    pub parts: Option<usize>,
}

impl Default for PartLimits {
    fn default() -> Self {
        Self {
            field_name_size: Some(100),
            field_size: Some(1024 * 1024),
            fields: None,
            file_size: None,
            files: None,
            parts: None,
        }
    }
}

type BodyStream = Pin<Box<dyn Stream<Item = Result<Bytes, io::Error>> + Send>>;

/// Raw request body shared between the decoder and [`FormDataSource::drain`].
#[derive(Clone)]
struct SharedBody(Arc<Mutex<BodyStream>>);

impl Stream for SharedBody {
    type Item = Result<Bytes, io::Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut body = self.0.lock().expect("mutex poisoned");
        Pin::as_mut(&mut *body).poll_next(cx)
    }
}

struct ActiveFile {
    field: Field<'static>,
    sender: FileStreamSender,
}

#[derive(Debug, Default)]
struct PartCounts {
    parts: usize,
    files: usize,
    fields: usize,
    parts_limited: bool,
    files_limited: bool,
    fields_limited: bool,
}

/// [`MultipartSource`] over an HTTP request body.
pub struct FormDataSource {
    multipart: Option<Multipart<'static>>,
    active: Option<ActiveFile>,
    body: SharedBody,
    limits: PartLimits,
    preserve_path: bool,
    counts: PartCounts,
}

impl FormDataSource {
    /// Build a source from request headers and the raw body stream.
    ///
    /// Fails with `UNSUPPORTED_MEDIA_TYPE` when the request is not
    /// `multipart/*`, and with `MALFORMED_REQUEST` when the boundary or
    /// content encoding cannot be used.
    pub fn from_request<S, E>(
        headers: &HeaderMap,
        body: S,
        limits: PartLimits,
        preserve_path: bool,
    ) -> Result<Self, UploadError>
    where
        S: Stream<Item = Result<Bytes, E>> + Send + 'static,
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let content_type = headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .ok_or(UploadError::UnsupportedMediaType)?;
        let parsed: mime::Mime = content_type
            .parse()
            .map_err(|_| UploadError::UnsupportedMediaType)?;
        if parsed.type_() != mime::MULTIPART {
            return Err(UploadError::UnsupportedMediaType);
        }
        let boundary = multer::parse_boundary(content_type)
            .map_err(|e| UploadError::MalformedRequest(e.to_string()))?;

        let raw: BodyStream = Box::pin(body.map_err(|e| io::Error::new(io::ErrorKind::Other, e)));
        let body = SharedBody(Arc::new(Mutex::new(raw)));

        let encoding = headers
            .get(CONTENT_ENCODING)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim().to_ascii_lowercase());
        let multipart = match encoding.as_deref() {
            None | Some("") | Some("identity") => Multipart::new(body.clone(), boundary),
            Some("gzip") | Some("x-gzip") => {
                let decoded = ReaderStream::new(GzipDecoder::new(StreamReader::new(body.clone())));
                Multipart::new(decoded, boundary)
            }
            Some(other) => {
                return Err(UploadError::MalformedRequest(format!(
                    "unsupported content encoding '{other}'"
                )))
            }
        };

        Ok(Self {
            multipart: Some(multipart),
            active: None,
            body,
            limits,
            preserve_path,
            counts: PartCounts::default(),
        })
    }

    async fn advance(&mut self) -> SourceEvent {
        if let Some(active) = self.active.take() {
            if let Err(err) = forward(active, self.limits.file_size).await {
                return SourceEvent::Error(err);
            }
        }

        loop {
            let Some(multipart) = self.multipart.as_mut() else {
                return SourceEvent::Close;
            };
            let field = match multipart.next_field().await {
                Ok(Some(field)) => field,
                Ok(None) => return SourceEvent::Close,
                Err(err) => return SourceEvent::Error(StreamError::new(err)),
            };

            let counts = &mut self.counts;
            counts.parts += 1;
            if over(self.limits.parts, counts.parts) {
                if !counts.parts_limited {
                    counts.parts_limited = true;
                    return SourceEvent::PartsLimit;
                }
                continue;
            }

            if field.file_name().is_some() {
                counts.files += 1;
                if over(self.limits.files, counts.files) {
                    if !counts.files_limited {
                        counts.files_limited = true;
                        return SourceEvent::FilesLimit;
                    }
                    continue;
                }
                return self.open_file(field);
            }

            counts.fields += 1;
            if over(self.limits.fields, counts.fields) {
                if !counts.fields_limited {
                    counts.fields_limited = true;
                    return SourceEvent::FieldsLimit;
                }
                continue;
            }
            return match read_field(field, self.limits).await {
                Ok(event) => event,
                Err(err) => SourceEvent::Error(err),
            };
        }
    }

    fn open_file(&mut self, field: Field<'static>) -> SourceEvent {
        let (sender, stream) = file_stream(FILE_CHANNEL_CAPACITY);
        let field_name = field.name().map(str::to_string);
        let filename = field.file_name().map(|name| {
            if self.preserve_path {
                name.to_string()
            } else {
                basename(name).to_string()
            }
        });
        let encoding = field
            .headers()
            .get("content-transfer-encoding")
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim().to_ascii_lowercase())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| "7bit".to_string());
        let content_type = field
            .content_type()
            .map(|m| m.to_string())
            .unwrap_or_else(|| mime::APPLICATION_OCTET_STREAM.to_string());

        self.active = Some(ActiveFile { field, sender });
        SourceEvent::File {
            field_name,
            stream,
            filename,
            encoding,
            content_type,
        }
    }
}

impl MultipartSource for FormDataSource {
    fn next_event(&mut self) -> Pin<Box<dyn Future<Output = SourceEvent> + Send + '_>> {
        Box::pin(self.advance())
    }

    fn drain(self: Box<Self>) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        let FormDataSource {
            multipart,
            active,
            mut body,
            ..
        } = *self;
        drop(active);
        drop(multipart);
        Box::pin(async move {
            let mut discarded = 0usize;
            while let Some(Ok(chunk)) = body.next().await {
                discarded += chunk.len();
            }
            debug!("Drained {discarded} unread body bytes");
        })
    }
}

/// Push the active file's bytes into its stream until the part ends.
///
/// Past the size limit, or once the consumer is gone, the rest of the
/// part is read and discarded.
async fn forward(active: ActiveFile, file_size: Option<u64>) -> Result<(), StreamError> {
    let ActiveFile { mut field, sender } = active;
    let mut sender = Some(sender);
    let mut written: u64 = 0;

    loop {
        let mut chunk = match field.chunk().await {
            Ok(Some(chunk)) => chunk,
            Ok(None) => return Ok(()),
            Err(err) => {
                let err = StreamError::new(err);
                if let Some(sender) = sender.take() {
                    sender.fail(err.clone()).await;
                }
                return Err(err);
            }
        };
        let Some(tx) = sender.as_ref() else {
            continue;
        };

        let mut truncated = false;
        if let Some(limit) = file_size {
            let room = limit.saturating_sub(written);
            if chunk.len() as u64 > room {
                chunk.truncate(room as usize);
                truncated = true;
            }
        }
        written += chunk.len() as u64;

        if !chunk.is_empty() && !tx.send(chunk).await {
            debug!("File stream dropped by consumer, skipping rest of part");
            sender = None;
            continue;
        }
        if truncated {
            tx.trip_limit();
            sender = None;
        }
    }
}

async fn read_field(
    mut field: Field<'static>,
    limits: PartLimits,
) -> Result<SourceEvent, StreamError> {
    let (name, name_truncated) = match field.name() {
        Some(name) => {
            let (name, truncated) = truncate_name(name, limits.field_name_size);
            (Some(name), truncated)
        }
        None => (None, false),
    };

    let mut value = Vec::new();
    let mut value_truncated = false;
    while let Some(chunk) = field.chunk().await.map_err(StreamError::new)? {
        let room = limits
            .field_size
            .map_or(usize::MAX, |limit| limit.saturating_sub(value.len()));
        if chunk.len() > room {
            value.extend_from_slice(&chunk[..room]);
            value_truncated = true;
        } else {
            value.extend_from_slice(&chunk);
        }
    }

    Ok(SourceEvent::Field {
        name,
        value: String::from_utf8_lossy(&value).into_owned(),
        name_truncated,
        value_truncated,
    })
}

fn over(limit: Option<usize>, count: usize) -> bool {
    limit.is_some_and(|limit| count > limit)
}

/// Last path component of a client-supplied filename.
fn basename(name: &str) -> &str {
    name.rsplit(['/', '\\']).next().unwrap_or(name)
}

fn truncate_name(name: &str, limit: Option<usize>) -> (String, bool) {
    match limit {
        Some(limit) if name.len() > limit => {
            let mut end = limit;
            while !name.is_char_boundary(end) {
                end -= 1;
            }
            (name[..end].to_string(), true)
        }
        _ => (name.to_string(), false),
    }
}
