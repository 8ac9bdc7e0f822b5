//! Upload session controller.
//!
//! One [`UploadSession`] handles one multipart request.  It runs as a single
//! task that owns all session state; the multipart source is pumped by a
//! helper task and every accepted file is written by its own task, both
//! reporting back over channels.  That keeps every terminal decision in one
//! place: a session succeeds once the source has closed and no write is in
//! flight, and fails with the first error raised, after in-flight writes
//! have drained and the files stored so far have been rolled back.
//!
//! ```text
//!   RECEIVING ──error──▶ DRAINING ──writes drained, rollback──▶ DONE
//!       │                                                        ▲
//!       └──────── source closed, no writes in flight ────────────┘
//! ```

use std::sync::Arc;
use std::time::Instant;

use metrics::{counter, histogram};
use serde_json::{Map, Value};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use crate::errors::{LimitCode, SessionFailure, StreamError, UploadError};
use crate::metrics::{
    FILES_STORED_BYTES_TOTAL, FILES_STORED_TOTAL, UPLOAD_SESSIONS_TOTAL,
    UPLOAD_SESSION_DURATION_SECONDS,
};
use crate::source::{FileStream, MultipartSource, SourceEvent};
use crate::storage::backend::StorageBackend;
use crate::upload::counter::{PendingWriteCounter, ZeroSignal};
use crate::upload::fields::{BracketAssembler, FieldAssembler};
use crate::upload::filter::FileFilter;
use crate::upload::placeholder::{PlaceholderSequence, SlotId};
use crate::upload::rollback::RollbackCoordinator;
use crate::upload::{FileInfo, RequestContext, StoredFile, StoredMeta, UploadOutcome};

/// Coordinates one multipart request from first part to final result.
pub struct UploadSession {
    storage: Arc<dyn StorageBackend>,
    filter: Arc<dyn FileFilter>,
    assembler: Box<dyn FieldAssembler>,
    context: RequestContext,
    field_name_size: Option<usize>,
}

/// Message from a file write task.
#[derive(Debug)]
enum WriteReport {
    /// The file's size limit tripped while it was being written.
    SizeLimit { field: String },
    /// The write call returned.
    Finished {
        slot: SlotId,
        info: FileInfo,
        outcome: WriteOutcome,
        /// Set when the size limit tripped for this file.
        aborted: bool,
    },
}

#[derive(Debug)]
enum WriteOutcome {
    Stored(StoredMeta),
    Failed(anyhow::Error),
    StreamFailed(StreamError),
}

#[derive(Default)]
struct SessionState {
    fields: Map<String, Value>,
    files: PlaceholderSequence,
    pending: PendingWriteCounter,
    /// Files whose bytes reached storage, in write completion order.
    uploaded: Vec<StoredFile>,
    read_finished: bool,
    /// First error raised; set at most once.
    failure: Option<UploadError>,
}

impl SessionState {
    fn raise(&mut self, err: UploadError) {
        if let Some(primary) = &self.failure {
            debug!(
                "Ignoring {} raised after {}: {err}",
                err.code(),
                primary.code()
            );
            return;
        }
        info!("Upload aborting with {}: {err}", err.code());
        self.failure = Some(err);
    }

    fn is_complete(&self) -> bool {
        self.read_finished && self.pending.is_zero() && self.failure.is_none()
    }
}

impl UploadSession {
    pub fn new(
        storage: Arc<dyn StorageBackend>,
        filter: Arc<dyn FileFilter>,
        context: RequestContext,
    ) -> Self {
        Self {
            storage,
            filter,
            assembler: Box::new(BracketAssembler::default()),
            context,
            field_name_size: None,
        }
    }

    pub fn with_assembler(mut self, assembler: impl FieldAssembler + 'static) -> Self {
        self.assembler = Box::new(assembler);
        self
    }

    /// Reject field names longer than `limit` bytes.
    pub fn with_field_name_size(mut self, limit: Option<usize>) -> Self {
        self.field_name_size = limit;
        self
    }

    /// Consume `source` and produce the session's single result.
    ///
    /// The source is detached as soon as the outcome is decided; whatever
    /// is left of the request body is drained in the background.
    pub async fn run(
        mut self,
        source: Box<dyn MultipartSource>,
    ) -> Result<UploadOutcome, SessionFailure> {
        debug!("Upload session {} started", self.context.request_id);
        let started = Instant::now();

        let (event_tx, event_rx) = mpsc::channel(1);
        let (stop_tx, stop_rx) = oneshot::channel();
        tokio::spawn(pump(source, event_tx, stop_rx));

        let (report_tx, mut report_rx) = mpsc::unbounded_channel();
        let mut events = Some(event_rx);
        let mut stop = Some(stop_tx);
        let mut drained: Option<ZeroSignal> = None;
        let mut state = SessionState::default();

        loop {
            tokio::select! {
                biased;
                Some(report) = report_rx.recv() => self.on_write_report(&mut state, report),
                event = next_event(&mut events) => {
                    self.on_event(&mut state, event, &report_tx).await;
                    // The pump hangs up after Close; stop listening.
                    if state.read_finished {
                        events = None;
                    }
                }
                _ = wait_drained(&mut drained) => break,
            }

            if state.failure.is_some() {
                if let Some(stop) = stop.take() {
                    events = None;
                    let _ = stop.send(());
                }
                if drained.is_none() {
                    drained = Some(state.pending.once_zero());
                }
            } else if state.is_complete() {
                break;
            }
        }

        match state.failure.take() {
            None => {
                let outcome = UploadOutcome {
                    fields: state.fields,
                    files: state.files.into_files(),
                };
                counter!(UPLOAD_SESSIONS_TOTAL, "outcome" => "success").increment(1);
                histogram!(UPLOAD_SESSION_DURATION_SECONDS, "outcome" => "success")
                    .record(started.elapsed().as_secs_f64());
                info!(
                    "Upload session {} finished: {} field(s), {} file(s)",
                    self.context.request_id,
                    outcome.fields.len(),
                    outcome.files.len()
                );
                Ok(outcome)
            }
            Some(primary) => {
                let uploaded = std::mem::take(&mut state.uploaded);
                let rollback_errors = RollbackCoordinator::new(self.storage.as_ref())
                    .rollback(uploaded)
                    .await;
                counter!(UPLOAD_SESSIONS_TOTAL, "outcome" => "failure").increment(1);
                histogram!(UPLOAD_SESSION_DURATION_SECONDS, "outcome" => "failure")
                    .record(started.elapsed().as_secs_f64());
                info!(
                    "Upload session {} failed with {} ({} rollback error(s))",
                    self.context.request_id,
                    primary.code(),
                    rollback_errors.len()
                );
                Err(SessionFailure::new(primary, rollback_errors))
            }
        }
    }

    async fn on_event(
        &mut self,
        state: &mut SessionState,
        event: Option<SourceEvent>,
        reports: &mpsc::UnboundedSender<WriteReport>,
    ) {
        let Some(event) = event else {
            state.raise(StreamError::new("multipart source stopped before closing").into());
            return;
        };

        match event {
            SourceEvent::Field {
                name,
                value,
                name_truncated,
                value_truncated,
            } => self.on_field(state, name, value, name_truncated, value_truncated),
            SourceEvent::File {
                field_name,
                stream,
                filename,
                encoding,
                content_type,
            } => {
                self.on_file(
                    state,
                    field_name,
                    filename,
                    encoding,
                    content_type,
                    stream,
                    reports,
                )
                .await
            }
            SourceEvent::PartsLimit => state.raise(UploadError::limit(LimitCode::PartCount)),
            SourceEvent::FilesLimit => state.raise(UploadError::limit(LimitCode::FileCount)),
            SourceEvent::FieldsLimit => state.raise(UploadError::limit(LimitCode::FieldCount)),
            SourceEvent::Error(err) => state.raise(err.into()),
            SourceEvent::Close => state.read_finished = true,
        }
    }

    fn name_too_long(&self, name: &str) -> bool {
        self.field_name_size.is_some_and(|limit| name.len() > limit)
    }

    fn on_field(
        &mut self,
        state: &mut SessionState,
        name: Option<String>,
        value: String,
        name_truncated: bool,
        value_truncated: bool,
    ) {
        let Some(name) = name else {
            return state.raise(UploadError::limit(LimitCode::MissingFieldName));
        };
        if name_truncated {
            return state.raise(UploadError::limit(LimitCode::FieldKey));
        }
        if value_truncated {
            return state.raise(UploadError::limit_for(LimitCode::FieldValue, name));
        }
        if self.name_too_long(&name) {
            return state.raise(UploadError::limit(LimitCode::FieldKey));
        }

        if let Err(err) = self.assembler.append(&mut state.fields, &name, value) {
            state.raise(err);
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn on_file(
        &mut self,
        state: &mut SessionState,
        field_name: Option<String>,
        filename: Option<String>,
        encoding: String,
        content_type: String,
        stream: FileStream,
        reports: &mpsc::UnboundedSender<WriteReport>,
    ) {
        let Some(field_name) = field_name else {
            return state.raise(UploadError::limit(LimitCode::MissingFieldName));
        };
        // A file input left empty arrives without a filename.
        let Some(original_name) = filename.filter(|name| !name.is_empty()) else {
            return;
        };
        if self.name_too_long(&field_name) {
            return state.raise(UploadError::limit(LimitCode::FieldKey));
        }

        let info = FileInfo {
            field_name,
            original_name,
            encoding,
            content_type,
        };
        let slot = state.files.reserve(info.clone());

        match self.filter.decide(&self.context, &info).await {
            Err(err) => {
                state.files.release(slot);
                let err = match err.downcast::<UploadError>() {
                    Ok(upload_err) => upload_err,
                    Err(other) => UploadError::FilterRejected(other),
                };
                state.raise(err);
            }
            Ok(false) => {
                debug!(
                    "Filter skipped {} (field {})",
                    info.original_name, info.field_name
                );
                state.files.release(slot);
            }
            Ok(true) => {
                state.pending.increment();
                tokio::spawn(write_file(
                    self.storage.clone(),
                    slot,
                    info,
                    stream,
                    reports.clone(),
                ));
            }
        }
    }

    fn on_write_report(&mut self, state: &mut SessionState, report: WriteReport) {
        let (slot, info, outcome, aborted) = match report {
            WriteReport::SizeLimit { field } => {
                return state.raise(UploadError::limit_for(LimitCode::FileSize, field));
            }
            WriteReport::Finished {
                slot,
                info,
                outcome,
                aborted,
            } => (slot, info, outcome, aborted),
        };

        let error = match outcome {
            WriteOutcome::Stored(meta) if aborted => {
                // Partially written: never exposed, but its bytes must go.
                state.files.release(slot);
                state.uploaded.push(StoredFile::new(info, meta));
                None
            }
            WriteOutcome::Stored(meta) => {
                let file = StoredFile::new(info, meta);
                counter!(FILES_STORED_TOTAL).increment(1);
                counter!(FILES_STORED_BYTES_TOTAL).increment(file.meta.size);
                state.files.commit(slot, file.clone());
                state.uploaded.push(file);
                None
            }
            WriteOutcome::Failed(err) => {
                state.files.release(slot);
                Some(UploadError::StorageWrite(err))
            }
            WriteOutcome::StreamFailed(err) => {
                state.files.release(slot);
                Some(UploadError::Stream(err))
            }
        };

        state.pending.decrement();
        if let Some(err) = error {
            state.raise(err);
        }
    }
}

/// Forward source events to the session until it closes, errors, or the
/// session lets go; then drain the source.
async fn pump(
    mut source: Box<dyn MultipartSource>,
    events: mpsc::Sender<SourceEvent>,
    mut stop: oneshot::Receiver<()>,
) {
    loop {
        let event = tokio::select! {
            biased;
            _ = &mut stop => break,
            event = source.next_event() => event,
        };
        let last = matches!(event, SourceEvent::Close | SourceEvent::Error(_));
        if events.send(event).await.is_err() || last {
            break;
        }
    }
    source.drain().await;
}

/// Write one accepted file and report the outcome.
///
/// The size-limit report, if any, is always sent before the final one.
async fn write_file(
    storage: Arc<dyn StorageBackend>,
    slot: SlotId,
    info: FileInfo,
    stream: FileStream,
    reports: mpsc::UnboundedSender<WriteReport>,
) {
    let observer = stream.observer();
    let mut write = storage.write(&info, stream);
    let mut limit_reported = false;

    let result = loop {
        tokio::select! {
            result = &mut write => break result,
            _ = observer.limit_reached(), if !limit_reported => {
                limit_reported = true;
                let _ = reports.send(WriteReport::SizeLimit { field: info.field_name.clone() });
            }
        }
    };
    drop(write);

    let aborted = observer.is_limited();
    if aborted && !limit_reported {
        let _ = reports.send(WriteReport::SizeLimit {
            field: info.field_name.clone(),
        });
    }

    let outcome = match (observer.error(), result) {
        (Some(err), _) => WriteOutcome::StreamFailed(err),
        (None, Ok(meta)) => WriteOutcome::Stored(meta),
        (None, Err(err)) => WriteOutcome::Failed(err),
    };
    let _ = reports.send(WriteReport::Finished {
        slot,
        info,
        outcome,
        aborted,
    });
}

async fn next_event(events: &mut Option<mpsc::Receiver<SourceEvent>>) -> Option<SourceEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn wait_drained(signal: &mut Option<ZeroSignal>) {
    match signal {
        Some(signal) => signal.await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::file_stream;
    use crate::upload::filter::AcceptAll;
    use bytes::Bytes;
    use std::collections::{HashMap, VecDeque};
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    // -- Test doubles ---------------------------------------------------------

    enum Step {
        Emit(SourceEvent),
        WaitFor(oneshot::Receiver<()>),
    }

    /// Replays a fixed script of events, then closes.
    struct ScriptedSource {
        steps: VecDeque<Step>,
        drained: Arc<AtomicBool>,
    }

    impl ScriptedSource {
        fn new(steps: Vec<Step>) -> (Self, Arc<AtomicBool>) {
            let drained = Arc::new(AtomicBool::new(false));
            (
                Self {
                    steps: steps.into(),
                    drained: drained.clone(),
                },
                drained,
            )
        }
    }

    impl MultipartSource for ScriptedSource {
        fn next_event(&mut self) -> Pin<Box<dyn Future<Output = SourceEvent> + Send + '_>> {
            Box::pin(async move {
                loop {
                    match self.steps.pop_front() {
                        Some(Step::Emit(event)) => return event,
                        Some(Step::WaitFor(rx)) => {
                            let _ = rx.await;
                        }
                        None => return SourceEvent::Close,
                    }
                }
            })
        }

        fn drain(self: Box<Self>) -> Pin<Box<dyn Future<Output = ()> + Send>> {
            Box::pin(async move {
                self.drained.store(true, Ordering::SeqCst);
            })
        }
    }

    /// Storage double whose writes can be held back per original filename.
    #[derive(Default)]
    struct GatedBackend {
        gates: Mutex<HashMap<String, oneshot::Receiver<()>>>,
        fail_writes: Vec<String>,
        fail_deletes: Vec<String>,
        completed: Mutex<Vec<String>>,
        deleted: Mutex<Vec<String>>,
    }

    impl GatedBackend {
        fn gate(&self, name: &str) -> oneshot::Sender<()> {
            let (tx, rx) = oneshot::channel();
            self.gates.lock().unwrap().insert(name.to_string(), rx);
            tx
        }

        fn completed(&self) -> Vec<String> {
            self.completed.lock().unwrap().clone()
        }

        fn deleted(&self) -> Vec<String> {
            let mut keys = self.deleted.lock().unwrap().clone();
            keys.sort();
            keys
        }
    }

    impl StorageBackend for GatedBackend {
        fn write(
            &self,
            file: &FileInfo,
            stream: FileStream,
        ) -> Pin<Box<dyn Future<Output = anyhow::Result<StoredMeta>> + Send + '_>> {
            let name = file.original_name.clone();
            Box::pin(async move {
                let data = stream.collect_bytes().await?;
                let gate = self.gates.lock().unwrap().remove(&name);
                if let Some(gate) = gate {
                    let _ = gate.await;
                }
                self.completed.lock().unwrap().push(name.clone());
                if self.fail_writes.contains(&name) {
                    anyhow::bail!("backend refused {name}");
                }
                Ok(StoredMeta {
                    storage_key: format!("key-{name}"),
                    size: data.len() as u64,
                    etag: String::new(),
                    location: None,
                })
            })
        }

        fn delete(
            &self,
            file: &StoredFile,
        ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
            let key = file.meta.storage_key.clone();
            Box::pin(async move {
                self.deleted.lock().unwrap().push(key.clone());
                if self.fail_deletes.contains(&key) {
                    anyhow::bail!("cannot delete {key}");
                }
                Ok(())
            })
        }
    }

    /// Excludes or errors on files by original name.
    #[derive(Default)]
    struct NamedFilter {
        exclude: Vec<String>,
        reject: Vec<String>,
    }

    impl FileFilter for NamedFilter {
        fn decide<'a>(
            &'a self,
            _ctx: &'a RequestContext,
            file: &'a FileInfo,
        ) -> Pin<Box<dyn Future<Output = anyhow::Result<bool>> + Send + 'a>> {
            Box::pin(async move {
                if self.reject.contains(&file.original_name) {
                    anyhow::bail!("{} is not welcome", file.original_name);
                }
                Ok(!self.exclude.contains(&file.original_name))
            })
        }
    }

    // -- Helpers --------------------------------------------------------------

    fn field(name: &str, value: &str) -> Step {
        Step::Emit(SourceEvent::Field {
            name: Some(name.to_string()),
            value: value.to_string(),
            name_truncated: false,
            value_truncated: false,
        })
    }

    fn file_event(field: &str, filename: Option<&str>, stream: FileStream) -> Step {
        Step::Emit(SourceEvent::File {
            field_name: Some(field.to_string()),
            stream,
            filename: filename.map(str::to_string),
            encoding: "7bit".to_string(),
            content_type: "text/plain".to_string(),
        })
    }

    async fn file(field: &str, name: &str, body: &str) -> Step {
        let (tx, stream) = file_stream(4);
        assert!(tx.send(Bytes::from(body.to_string())).await);
        file_event(field, Some(name), stream)
    }

    async fn oversized_file(field: &str, name: &str, body: &str) -> Step {
        let (tx, stream) = file_stream(4);
        assert!(tx.send(Bytes::from(body.to_string())).await);
        tx.trip_limit();
        file_event(field, Some(name), stream)
    }

    fn session(storage: &Arc<GatedBackend>, filter: impl FileFilter) -> UploadSession {
        UploadSession::new(storage.clone(), Arc::new(filter), RequestContext::default())
    }

    fn names(outcome: &UploadOutcome) -> Vec<String> {
        outcome
            .files
            .iter()
            .map(|f| f.info.original_name.clone())
            .collect()
    }

    async fn wait_until(cond: impl Fn() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    // -- Success paths --------------------------------------------------------

    #[tokio::test]
    async fn test_empty_request_succeeds() {
        let storage = Arc::new(GatedBackend::default());
        let (source, drained) = ScriptedSource::new(Vec::new());

        let outcome = session(&storage, AcceptAll)
            .run(Box::new(source))
            .await
            .unwrap();
        assert!(outcome.fields.is_empty());
        assert!(outcome.files.is_empty());
        wait_until(|| drained.load(Ordering::SeqCst)).await;
    }

    #[tokio::test]
    async fn test_fields_and_files_are_reported() {
        let storage = Arc::new(GatedBackend::default());
        let (source, _) = ScriptedSource::new(vec![
            field("title", "Report"),
            file("attachment", "a.txt", "alpha").await,
            field("tags[]", "x"),
            field("tags[]", "y"),
            file("attachment", "b.txt", "beta").await,
        ]);

        let outcome = session(&storage, AcceptAll)
            .run(Box::new(source))
            .await
            .unwrap();

        assert_eq!(
            Value::Object(outcome.fields.clone()),
            serde_json::json!({"title": "Report", "tags": ["x", "y"]})
        );
        assert_eq!(names(&outcome), vec!["a.txt", "b.txt"]);
        assert_eq!(outcome.files[0].meta.storage_key, "key-a.txt");
        assert_eq!(outcome.files[0].meta.size, 5);
        assert_eq!(outcome.files[1].info.field_name, "attachment");
        assert!(storage.deleted().is_empty());
    }

    #[tokio::test]
    async fn test_close_before_writes_finish_waits_for_them() {
        let storage = Arc::new(GatedBackend::default());
        let gate = storage.gate("slow.txt");
        let (source, _) = ScriptedSource::new(vec![file("doc", "slow.txt", "zzz").await]);

        let handle = tokio::spawn(session(&storage, AcceptAll).run(Box::new(source)));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!handle.is_finished());

        gate.send(()).unwrap();
        let outcome = handle.await.unwrap().unwrap();
        assert_eq!(names(&outcome), vec!["slow.txt"]);
    }

    #[tokio::test]
    async fn test_writes_finishing_before_close_wait_for_close() {
        let storage = Arc::new(GatedBackend::default());
        let (release_close, close_gate) = oneshot::channel();
        let (source, _) = ScriptedSource::new(vec![
            file("doc", "quick.txt", "q").await,
            Step::WaitFor(close_gate),
        ]);

        let handle = tokio::spawn(session(&storage, AcceptAll).run(Box::new(source)));
        wait_until(|| storage.completed().len() == 1).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!handle.is_finished());

        release_close.send(()).unwrap();
        let outcome = handle.await.unwrap().unwrap();
        assert_eq!(names(&outcome), vec!["quick.txt"]);
    }

    #[tokio::test]
    async fn test_part_without_filename_is_skipped() {
        let storage = Arc::new(GatedBackend::default());
        let (_tx, stream) = file_stream(1);
        let (source, _) = ScriptedSource::new(vec![
            file_event("empty", None, stream),
            file("doc", "real.txt", "data").await,
        ]);

        let outcome = session(&storage, AcceptAll)
            .run(Box::new(source))
            .await
            .unwrap();
        assert_eq!(names(&outcome), vec!["real.txt"]);
    }

    #[tokio::test]
    async fn test_arrival_order_kept_for_every_completion_order() {
        let all = ["f0", "f1", "f2", "f3"];
        for order in permutations(&[0, 1, 2, 3]) {
            let storage = Arc::new(GatedBackend::default());
            let gates: Vec<_> = all.iter().map(|name| storage.gate(name)).collect();
            let mut steps = Vec::new();
            for name in all {
                steps.push(file("docs", name, name).await);
            }
            let (source, _) = ScriptedSource::new(steps);
            let handle = tokio::spawn(session(&storage, AcceptAll).run(Box::new(source)));

            let mut gates: Vec<_> = gates.into_iter().map(Some).collect();
            for (done, &index) in order.iter().enumerate() {
                gates[index].take().unwrap().send(()).unwrap();
                wait_until(|| storage.completed().len() == done + 1).await;
            }

            let outcome = handle.await.unwrap().unwrap();
            let expected: Vec<String> = order.iter().map(|&i| all[i].to_string()).collect();
            assert_eq!(storage.completed(), expected);
            assert_eq!(names(&outcome), all.to_vec(), "completion order {order:?}");
        }
    }

    #[tokio::test]
    async fn test_three_files_second_finishes_first_third_excluded() {
        let storage = Arc::new(GatedBackend::default());
        let first = storage.gate("first");
        let second = storage.gate("second");
        let (source, _) = ScriptedSource::new(vec![
            file("docs", "first", "1").await,
            file("docs", "second", "2").await,
            file("docs", "third", "3").await,
        ]);
        let filter = NamedFilter {
            exclude: vec!["third".to_string()],
            ..Default::default()
        };

        let handle = tokio::spawn(session(&storage, filter).run(Box::new(source)));
        second.send(()).unwrap();
        wait_until(|| storage.completed() == vec!["second"]).await;
        first.send(()).unwrap();

        let outcome = handle.await.unwrap().unwrap();
        assert_eq!(names(&outcome), vec!["first", "second"]);
        assert_eq!(storage.completed(), vec!["second", "first"]);
    }

    // -- Failure paths --------------------------------------------------------

    #[tokio::test]
    async fn test_missing_field_name_fails() {
        let storage = Arc::new(GatedBackend::default());
        let (source, drained) = ScriptedSource::new(vec![Step::Emit(SourceEvent::Field {
            name: None,
            value: "v".to_string(),
            name_truncated: false,
            value_truncated: false,
        })]);

        let failure = session(&storage, AcceptAll)
            .run(Box::new(source))
            .await
            .unwrap_err();
        assert_eq!(failure.primary.code(), "MISSING_FIELD_NAME");
        assert!(failure.rollback_errors.is_empty());
        wait_until(|| drained.load(Ordering::SeqCst)).await;
    }

    #[tokio::test]
    async fn test_truncation_flags_map_to_limit_codes() {
        let cases = [
            (true, false, "LIMIT_FIELD_KEY", None),
            (false, true, "LIMIT_FIELD_VALUE", Some("note")),
        ];
        for (name_truncated, value_truncated, code, field_name) in cases {
            let storage = Arc::new(GatedBackend::default());
            let (source, _) = ScriptedSource::new(vec![Step::Emit(SourceEvent::Field {
                name: Some("note".to_string()),
                value: "v".to_string(),
                name_truncated,
                value_truncated,
            })]);
            let failure = session(&storage, AcceptAll)
                .run(Box::new(source))
                .await
                .unwrap_err();
            assert_eq!(failure.primary.code(), code);
            assert_eq!(failure.primary.field(), field_name);
        }
    }

    #[tokio::test]
    async fn test_source_limit_events() {
        let cases = [
            (SourceEvent::PartsLimit, "LIMIT_PART_COUNT"),
            (SourceEvent::FilesLimit, "LIMIT_FILE_COUNT"),
            (SourceEvent::FieldsLimit, "LIMIT_FIELD_COUNT"),
        ];
        for (event, code) in cases {
            let storage = Arc::new(GatedBackend::default());
            let (source, _) = ScriptedSource::new(vec![Step::Emit(event)]);
            let failure = session(&storage, AcceptAll)
                .run(Box::new(source))
                .await
                .unwrap_err();
            assert_eq!(failure.primary.code(), code);
            assert_eq!(failure.primary.field(), None);
        }
    }

    #[tokio::test]
    async fn test_long_field_name_drains_writes_then_rolls_back() {
        let storage = Arc::new(GatedBackend::default());
        let gate_a = storage.gate("a.txt");
        let gate_b = storage.gate("b.txt");
        let (source, drained) = ScriptedSource::new(vec![
            file("doc", "a.txt", "a").await,
            file("doc", "b.txt", "b").await,
            field("much_too_long_name", "value"),
        ]);

        let handle = tokio::spawn(
            session(&storage, AcceptAll)
                .with_field_name_size(Some(8))
                .run(Box::new(source)),
        );
        wait_until(|| drained.load(Ordering::SeqCst)).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!handle.is_finished(), "must wait for in-flight writes");

        gate_b.send(()).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!handle.is_finished());
        gate_a.send(()).unwrap();

        let failure = handle.await.unwrap().unwrap_err();
        assert_eq!(failure.primary.code(), "LIMIT_FIELD_KEY");
        assert!(failure.rollback_errors.is_empty());
        assert_eq!(storage.deleted(), vec!["key-a.txt", "key-b.txt"]);
    }

    #[tokio::test]
    async fn test_file_field_name_length_is_checked() {
        let storage = Arc::new(GatedBackend::default());
        let (source, _) =
            ScriptedSource::new(vec![file("attachment_field", "a.txt", "a").await]);

        let failure = session(&storage, AcceptAll)
            .with_field_name_size(Some(4))
            .run(Box::new(source))
            .await
            .unwrap_err();
        assert_eq!(failure.primary.code(), "LIMIT_FIELD_KEY");
        assert!(storage.completed().is_empty());
    }

    #[tokio::test]
    async fn test_size_limit_rolls_back_partial_file() {
        let storage = Arc::new(GatedBackend::default());
        let (source, _) = ScriptedSource::new(vec![
            file("photos", "ok.jpg", "fine").await,
            oversized_file("photos", "huge.jpg", "trunc").await,
        ]);

        let failure = session(&storage, AcceptAll)
            .run(Box::new(source))
            .await
            .unwrap_err();
        assert_eq!(failure.primary.code(), "LIMIT_FILE_SIZE");
        assert_eq!(failure.primary.field(), Some("photos"));
        assert_eq!(storage.deleted(), vec!["key-huge.jpg", "key-ok.jpg"]);
    }

    #[tokio::test]
    async fn test_rollback_failures_are_attached_not_promoted() {
        let storage = Arc::new(GatedBackend {
            fail_deletes: vec!["key-a".to_string(), "key-c".to_string()],
            ..Default::default()
        });
        let (release, hold) = oneshot::channel();
        let (source, _) = ScriptedSource::new(vec![
            file("f", "a", "1").await,
            file("f", "b", "2").await,
            file("f", "c", "3").await,
            Step::WaitFor(hold),
            Step::Emit(SourceEvent::PartsLimit),
        ]);

        let handle = tokio::spawn(session(&storage, AcceptAll).run(Box::new(source)));
        wait_until(|| storage.completed().len() == 3).await;
        release.send(()).unwrap();

        let failure = handle.await.unwrap().unwrap_err();
        assert_eq!(failure.primary.code(), "LIMIT_PART_COUNT");
        let mut keys: Vec<_> = failure
            .rollback_errors
            .iter()
            .map(|f| f.storage_key.clone())
            .collect();
        keys.sort();
        assert_eq!(keys, vec!["key-a", "key-c"]);
        assert_eq!(storage.deleted(), vec!["key-a", "key-b", "key-c"]);
    }

    #[tokio::test]
    async fn test_first_error_wins() {
        let storage = Arc::new(GatedBackend {
            fail_writes: vec!["bad.txt".to_string()],
            ..Default::default()
        });
        let gate = storage.gate("bad.txt");
        let (source, _) = ScriptedSource::new(vec![
            file("doc", "bad.txt", "x").await,
            Step::Emit(SourceEvent::FilesLimit),
        ]);

        let handle = tokio::spawn(session(&storage, AcceptAll).run(Box::new(source)));
        tokio::time::sleep(Duration::from_millis(20)).await;
        gate.send(()).unwrap();

        let failure = handle.await.unwrap().unwrap_err();
        assert_eq!(failure.primary.code(), "LIMIT_FILE_COUNT");
        assert!(storage.deleted().is_empty());
    }

    #[tokio::test]
    async fn test_storage_write_failure_rolls_back_committed_files() {
        let storage = Arc::new(GatedBackend {
            fail_writes: vec!["broken.bin".to_string()],
            ..Default::default()
        });
        let (source, _) = ScriptedSource::new(vec![
            file("files", "good.bin", "g").await,
            file("files", "broken.bin", "b").await,
        ]);

        let failure = session(&storage, AcceptAll)
            .run(Box::new(source))
            .await
            .unwrap_err();
        assert_eq!(failure.primary.code(), "STORAGE_WRITE_FAILED");
        assert!(failure.primary.to_string().contains("backend refused broken.bin"));
        assert_eq!(storage.deleted(), vec!["key-good.bin"]);
    }

    #[tokio::test]
    async fn test_filter_error_is_wrapped() {
        let storage = Arc::new(GatedBackend::default());
        let (source, _) = ScriptedSource::new(vec![file("doc", "virus.exe", "x").await]);
        let filter = NamedFilter {
            reject: vec!["virus.exe".to_string()],
            ..Default::default()
        };

        let failure = session(&storage, filter)
            .run(Box::new(source))
            .await
            .unwrap_err();
        assert_eq!(failure.primary.code(), "FILTER_REJECTED");
        assert!(failure.primary.to_string().contains("virus.exe is not welcome"));
        assert!(storage.completed().is_empty());
    }

    #[tokio::test]
    async fn test_filter_upload_error_keeps_its_code() {
        let storage = Arc::new(GatedBackend::default());
        let (source, _) = ScriptedSource::new(vec![file("other", "a.png", "x").await]);
        let filter =
            crate::upload::filter::RuleFilter::new(vec!["avatar".to_string()], &[]).unwrap();

        let failure = session(&storage, filter)
            .run(Box::new(source))
            .await
            .unwrap_err();
        assert_eq!(failure.primary.code(), "LIMIT_UNEXPECTED_FILE");
        assert_eq!(failure.primary.field(), Some("other"));
    }

    #[tokio::test]
    async fn test_stream_error_fails_with_stream_error() {
        let storage = Arc::new(GatedBackend::default());
        let (tx, stream) = file_stream(4);
        assert!(tx.send(Bytes::from("partial")).await);
        tx.fail(StreamError::new("connection reset")).await;
        let (source, _) = ScriptedSource::new(vec![
            file("doc", "kept.txt", "k").await,
            file_event("doc", Some("cut.txt"), stream),
        ]);

        let failure = session(&storage, AcceptAll)
            .run(Box::new(source))
            .await
            .unwrap_err();
        assert_eq!(failure.primary.code(), "STREAM_ERROR");
        assert!(failure.primary.to_string().contains("connection reset"));
        assert_eq!(storage.deleted(), vec!["key-kept.txt"]);
    }

    #[tokio::test]
    async fn test_source_error_event() {
        let storage = Arc::new(GatedBackend::default());
        let (source, drained) = ScriptedSource::new(vec![Step::Emit(SourceEvent::Error(
            StreamError::new("unexpected end of body"),
        ))]);

        let failure = session(&storage, AcceptAll)
            .run(Box::new(source))
            .await
            .unwrap_err();
        assert_eq!(failure.primary.code(), "STREAM_ERROR");
        wait_until(|| drained.load(Ordering::SeqCst)).await;
    }

    #[tokio::test]
    async fn test_field_assembler_errors_abort() {
        let storage = Arc::new(GatedBackend::default());
        let (source, _) = ScriptedSource::new(vec![field("a[b][c][d]", "deep")]);

        let failure = session(&storage, AcceptAll)
            .with_assembler(BracketAssembler::new(Some(2)))
            .run(Box::new(source))
            .await
            .unwrap_err();
        assert_eq!(failure.primary.code(), "LIMIT_FIELD_KEYS");
    }

    /// Source that dies without ever closing.
    struct VanishingSource;

    impl MultipartSource for VanishingSource {
        fn next_event(&mut self) -> Pin<Box<dyn Future<Output = SourceEvent> + Send + '_>> {
            Box::pin(async { panic!("source task died") })
        }

        fn drain(self: Box<Self>) -> Pin<Box<dyn Future<Output = ()> + Send>> {
            Box::pin(async {})
        }
    }

    #[tokio::test]
    async fn test_source_gone_without_close_is_a_stream_error() {
        let storage = Arc::new(GatedBackend::default());

        let failure = session(&storage, AcceptAll)
            .run(Box::new(VanishingSource))
            .await
            .unwrap_err();
        assert_eq!(failure.primary.code(), "STREAM_ERROR");
    }

    #[tokio::test]
    async fn test_every_write_outlasting_close_is_awaited() {
        let storage = Arc::new(GatedBackend::default());
        let gates: Vec<_> = ["a", "b", "c"].iter().map(|n| storage.gate(n)).collect();
        let (source, drained) = ScriptedSource::new(vec![
            file("docs", "a", "1").await,
            file("docs", "b", "2").await,
            file("docs", "c", "3").await,
        ]);

        let handle = tokio::spawn(session(&storage, AcceptAll).run(Box::new(source)));
        // The source has closed and hung up long before any write returns.
        wait_until(|| drained.load(Ordering::SeqCst)).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!handle.is_finished());

        for gate in gates.into_iter().rev() {
            gate.send(()).unwrap();
        }
        let outcome = handle.await.unwrap().unwrap();
        assert_eq!(names(&outcome), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_session_duration_and_bytes_are_recorded() {
        let recorder = metrics_exporter_prometheus::PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();

        metrics::with_local_recorder(&recorder, || {
            tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap()
                .block_on(async {
                    let storage = Arc::new(GatedBackend::default());
                    let (source, _) =
                        ScriptedSource::new(vec![file("doc", "a.txt", "12345").await]);
                    session(&storage, AcceptAll)
                        .run(Box::new(source))
                        .await
                        .unwrap();
                })
        });

        let rendered = handle.render();
        assert!(rendered.contains(UPLOAD_SESSION_DURATION_SECONDS));
        assert!(rendered.contains("outcome=\"success\""));
        assert!(rendered.contains(&format!("{FILES_STORED_BYTES_TOTAL} 5")));
    }

    fn permutations(items: &[usize]) -> Vec<Vec<usize>> {
        if items.len() <= 1 {
            return vec![items.to_vec()];
        }
        let mut out = Vec::new();
        for (i, &first) in items.iter().enumerate() {
            let mut rest = items.to_vec();
            rest.remove(i);
            for mut tail in permutations(&rest) {
                tail.insert(0, first);
                out.push(tail);
            }
        }
        out
    }
}
