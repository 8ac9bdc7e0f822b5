//! Multipart event sources.
//!
//! A [`MultipartSource`] turns a request body into an ordered sequence of
//! [`SourceEvent`]s.  File parts carry a [`FileStream`] that yields the
//! part's bytes; the source keeps feeding it while the consumer reads.
//! Framing itself is left to the decoder behind the source (see
//! [`form_data::FormDataSource`]).

pub mod form_data;

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::Stream;
use tokio::sync::{mpsc, Notify};

use crate::errors::StreamError;

/// One event emitted by a multipart source, in arrival order.
#[derive(Debug)]
pub enum SourceEvent {
    /// A non-file part.
    Field {
        name: Option<String>,
        value: String,
        name_truncated: bool,
        value_truncated: bool,
    },
    /// A file part.  `filename` is `None` when the part declared none.
    File {
        field_name: Option<String>,
        stream: FileStream,
        filename: Option<String>,
        encoding: String,
        content_type: String,
    },
    /// More parts than allowed.
    PartsLimit,
    /// More file parts than allowed.
    FilesLimit,
    /// More non-file parts than allowed.
    FieldsLimit,
    /// The body could not be decoded any further.
    Error(StreamError),
    /// All parts have been emitted.
    Close,
}

/// Ordered producer of multipart events.
///
/// `next_event` must not be called again after it returned
/// [`SourceEvent::Close`] or [`SourceEvent::Error`].
pub trait MultipartSource: Send + 'static {
    /// Produce the next event.
    fn next_event(&mut self) -> Pin<Box<dyn Future<Output = SourceEvent> + Send + '_>>;

    /// Stop decoding and discard whatever is left of the request body.
    fn drain(self: Box<Self>) -> Pin<Box<dyn Future<Output = ()> + Send>>;
}

/// State shared between a [`FileStream`] and its producer.
#[derive(Debug, Default)]
struct StreamShared {
    limited: AtomicBool,
    limit_notify: Notify,
    error: Mutex<Option<StreamError>>,
}

/// Create a connected producer/consumer pair for one file part.
///
/// `capacity` bounds the number of chunks buffered ahead of the consumer.
pub fn file_stream(capacity: usize) -> (FileStreamSender, FileStream) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let shared = Arc::new(StreamShared::default());
    (
        FileStreamSender {
            tx,
            shared: shared.clone(),
        },
        FileStream { rx, shared },
    )
}

/// Bytes of a single file part.
///
/// Ends when the part ends or when the size limit cut it short.  Dropping
/// the stream tells the producer to skip the rest of the part.
#[derive(Debug)]
pub struct FileStream {
    rx: mpsc::Receiver<Result<Bytes, StreamError>>,
    shared: Arc<StreamShared>,
}

impl FileStream {
    /// Handle for watching this stream after it has been moved into a
    /// storage backend.
    pub fn observer(&self) -> StreamObserver {
        StreamObserver {
            shared: self.shared.clone(),
        }
    }

    /// Read the remaining bytes into one buffer.
    pub async fn collect_bytes(mut self) -> Result<Bytes, StreamError> {
        use futures::StreamExt;

        let mut buf = bytes::BytesMut::new();
        while let Some(chunk) = self.next().await {
            buf.extend_from_slice(&chunk?);
        }
        Ok(buf.freeze())
    }
}

impl Stream for FileStream {
    type Item = Result<Bytes, StreamError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// Watches a [`FileStream`]'s size-limit signal and error slot.
#[derive(Debug, Clone)]
pub struct StreamObserver {
    shared: Arc<StreamShared>,
}

impl StreamObserver {
    /// Whether the size limit has tripped.
    pub fn is_limited(&self) -> bool {
        self.shared.limited.load(Ordering::SeqCst)
    }

    /// Resolve once the size limit trips.
    ///
    /// Intended for a single waiter.
    pub async fn limit_reached(&self) {
        if self.is_limited() {
            return;
        }
        self.shared.limit_notify.notified().await;
    }

    /// The first error the producer pushed into the stream, if any.
    pub fn error(&self) -> Option<StreamError> {
        self.shared.error.lock().expect("mutex poisoned").clone()
    }
}

/// Producer half of a [`FileStream`].
#[derive(Debug)]
pub struct FileStreamSender {
    tx: mpsc::Sender<Result<Bytes, StreamError>>,
    shared: Arc<StreamShared>,
}

impl FileStreamSender {
    /// Forward a chunk.  Returns `false` once the consumer has gone away.
    pub async fn send(&self, chunk: Bytes) -> bool {
        self.tx.send(Ok(chunk)).await.is_ok()
    }

    /// Mark the stream as cut short by the size limit.
    pub fn trip_limit(&self) {
        self.shared.limited.store(true, Ordering::SeqCst);
        self.shared.limit_notify.notify_one();
    }

    /// Record `err` and deliver it to the consumer.
    pub async fn fail(self, err: StreamError) {
        {
            let mut slot = self.shared.error.lock().expect("mutex poisoned");
            if slot.is_none() {
                *slot = Some(err.clone());
            }
        }
        let _ = self.tx.send(Err(err)).await;
    }

    /// Whether the consumer dropped its end.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
