use std::collections::HashMap;
use std::fmt;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures_util::StreamExt;
use parking_lot::Mutex;
use reqwest::header::CONTENT_LENGTH;
use reqwest::{Body, Client, Response};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use porter_types::{ClientError, TaskId, TaskKind};

use crate::event::EventSink;
use crate::journal::TaskJournal;
use crate::transport::{
    NetworkTask, TaskDescriptor, TaskOutcome, Transport, UploadBody, is_credential_header,
};

/// Supplies credential headers for tasks restored from the journal, which
/// never stores them.
pub type CredentialProvider = Arc<dyn Fn() -> Vec<(String, String)> + Send + Sync>;

#[derive(Clone)]
pub struct HttpTransportConfig {
    /// Set for background transports.
    pub identifier: Option<String>,
    /// Where unfinished tasks are recorded. Restored tasks resume on startup.
    pub journal_path: Option<PathBuf>,
    pub timeout: Duration,
    pub user_agent: String,
    /// Scratch space for downloads before they are handed over.
    pub download_dir: PathBuf,
    pub credentials: Option<CredentialProvider>,
}

impl fmt::Debug for HttpTransportConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpTransportConfig")
            .field("identifier", &self.identifier)
            .field("journal_path", &self.journal_path)
            .field("timeout", &self.timeout)
            .field("user_agent", &self.user_agent)
            .field("download_dir", &self.download_dir)
            .field("credentials", &self.credentials.is_some())
            .finish()
    }
}

impl Default for HttpTransportConfig {
    fn default() -> Self {
        Self {
            identifier: None,
            journal_path: None,
            timeout: Duration::from_secs(100),
            user_agent: format!("porter/{}", env!("CARGO_PKG_VERSION")),
            download_dir: std::env::temp_dir(),
            credentials: None,
        }
    }
}

impl HttpTransportConfig {
    pub fn background(identifier: impl Into<String>, journal_path: impl Into<PathBuf>) -> Self {
        Self {
            identifier: Some(identifier.into()),
            journal_path: Some(journal_path.into()),
            timeout: Duration::from_secs(480),
            ..Self::default()
        }
    }
}

#[derive(Debug, Error)]
pub enum TransportSetupError {
    #[error("failed to build http client: {0}")]
    Client(#[from] reqwest::Error),
    #[error("failed to open task journal {path}: {source}")]
    Journal {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// [`Transport`] over reqwest.
///
/// Every task is one POST. With a journal configured, tasks are recorded
/// until they complete; tasks left over from a previous process are
/// restored and resumed by [`HttpTransport::new`] and show up in
/// [`Transport::all_tasks`] for reconciliation.
pub struct HttpTransport {
    shared: Arc<HttpShared>,
}

struct HttpShared {
    client: Client,
    sink: EventSink,
    config: HttpTransportConfig,
    tasks: Mutex<HashMap<TaskId, Arc<HttpTask>>>,
    next_id: AtomicU64,
    journal: Option<TaskJournal>,
    restoring: AtomicUsize,
    invalidated: CancellationToken,
}

pub struct HttpTask {
    id: TaskId,
    descriptor: TaskDescriptor,
    description: Mutex<Option<String>>,
    restored: bool,
    started: AtomicBool,
    finished: AtomicBool,
    cancel: CancellationToken,
    shared: Weak<HttpShared>,
    me: Weak<HttpTask>,
}

impl HttpTransport {
    /// Build the transport. Must be called from within a tokio runtime when
    /// a journal is configured, since restored tasks resume immediately.
    pub fn new(config: HttpTransportConfig, sink: EventSink) -> Result<Self, TransportSetupError> {
        let client = Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(config.timeout)
            .build()?;
        let journal = match &config.journal_path {
            Some(path) => Some(TaskJournal::open(path).map_err(|source| {
                TransportSetupError::Journal {
                    path: path.clone(),
                    source,
                }
            })?),
            None => None,
        };
        let restored = journal.as_ref().map(TaskJournal::entries).unwrap_or_default();
        let next_id = restored.iter().map(|e| e.id.as_u64()).max().unwrap_or(0) + 1;

        let shared = Arc::new(HttpShared {
            client,
            sink,
            config,
            tasks: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(next_id),
            journal,
            restoring: AtomicUsize::new(restored.len()),
            invalidated: CancellationToken::new(),
        });

        let restored: Vec<_> = restored
            .into_iter()
            .map(|entry| {
                let descriptor = with_credentials(entry.descriptor, shared.config.credentials.as_ref());
                let task = HttpTask::new(&shared, entry.id, descriptor, true);
                shared.tasks.lock().insert(entry.id, task.clone());
                task
            })
            .collect();
        if !restored.is_empty() {
            info!(count = restored.len(), "resuming journaled tasks");
        }
        for task in restored {
            task.resume();
        }

        Ok(Self { shared })
    }
}

fn with_credentials(
    mut descriptor: TaskDescriptor,
    credentials: Option<&CredentialProvider>,
) -> TaskDescriptor {
    if let Some(credentials) = credentials {
        descriptor.headers.retain(|(name, _)| !is_credential_header(name));
        descriptor.headers.extend(credentials());
    }
    descriptor
}

impl Transport for HttpTransport {
    fn identifier(&self) -> Option<&str> {
        self.shared.config.identifier.as_deref()
    }

    fn create_task(&self, descriptor: TaskDescriptor) -> Arc<dyn NetworkTask> {
        let id = TaskId(self.shared.next_id.fetch_add(1, Ordering::Relaxed));
        if let Some(journal) = &self.shared.journal {
            if let Err(err) = journal.record(id, &descriptor) {
                warn!(task = %id, error = %err, "could not journal task");
            }
        }
        let task = HttpTask::new(&self.shared, id, descriptor, false);
        self.shared.tasks.lock().insert(id, task.clone());
        task
    }

    fn all_tasks(&self) -> impl Future<Output = Vec<Arc<dyn NetworkTask>>> + Send {
        let tasks: Vec<Arc<dyn NetworkTask>> = self
            .shared
            .tasks
            .lock()
            .values()
            .map(|task| task.clone() as Arc<dyn NetworkTask>)
            .collect();
        std::future::ready(tasks)
    }

    fn invalidate_and_cancel(&self) {
        self.shared.invalidated.cancel();
        let tasks: Vec<_> = self.shared.tasks.lock().values().cloned().collect();
        for task in tasks {
            task.cancel();
        }
    }
}

impl HttpShared {
    fn forget(&self, id: TaskId) {
        self.tasks.lock().remove(&id);
        if let Some(journal) = &self.journal {
            if let Err(err) = journal.forget(id) {
                warn!(task = %id, error = %err, "could not remove task from journal");
            }
        }
    }
}

impl HttpTask {
    fn new(shared: &Arc<HttpShared>, id: TaskId, descriptor: TaskDescriptor, restored: bool) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            id,
            description: Mutex::new(descriptor.description.clone()),
            descriptor,
            restored,
            started: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            shared: Arc::downgrade(shared),
            me: me.clone(),
        })
    }

    fn finish(&self, shared: &HttpShared, outcome: TaskOutcome) {
        if self.finished.swap(true, Ordering::AcqRel) {
            return;
        }
        let Some(me) = self.me.upgrade() else {
            return;
        };
        shared.forget(self.id);
        let handle: Arc<dyn NetworkTask> = me;
        shared.sink.completed(&handle, outcome);
        if self.restored && shared.restoring.fetch_sub(1, Ordering::AcqRel) == 1 {
            shared.sink.background_events_finished();
        }
    }
}

impl NetworkTask for HttpTask {
    fn id(&self) -> TaskId {
        self.id
    }

    fn kind(&self) -> TaskKind {
        self.descriptor.kind
    }

    fn description(&self) -> Option<String> {
        self.description.lock().clone()
    }

    fn set_description(&self, description: Option<String>) {
        *self.description.lock() = description.clone();
        if let Some(journal) = self.shared.upgrade().as_ref().and_then(|s| s.journal.as_ref()) {
            if let Err(err) = journal.update_description(self.id, description) {
                warn!(task = %self.id, error = %err, "could not journal task description");
            }
        }
    }

    fn resume(&self) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }
        let (Some(shared), Some(me)) = (self.shared.upgrade(), self.me.upgrade()) else {
            return;
        };
        if shared.invalidated.is_cancelled() || self.cancel.is_cancelled() {
            self.finish(&shared, TaskOutcome::failed(ClientError::Cancelled));
            return;
        }
        tokio::spawn(run_task(shared, me));
    }

    fn cancel(&self) {
        self.cancel.cancel();
        // a task that never started has no runner to report the cancellation
        if !self.started.swap(true, Ordering::AcqRel) {
            if let Some(shared) = self.shared.upgrade() {
                self.finish(&shared, TaskOutcome::failed(ClientError::Cancelled));
            }
        }
    }

    fn is_completed(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }
}

impl fmt::Debug for HttpTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpTask")
            .field("id", &self.id)
            .field("kind", &self.descriptor.kind)
            .field("url", &self.descriptor.url)
            .finish()
    }
}

async fn run_task(shared: Arc<HttpShared>, task: Arc<HttpTask>) {
    let handle: Arc<dyn NetworkTask> = task.clone();
    let scratch = shared
        .config
        .download_dir
        .join(format!("porter-{}-{}.part", task.id, Uuid::new_v4()));
    debug!(task = %task.id, kind = %task.descriptor.kind, url = %task.descriptor.url, "task started");

    let outcome = tokio::select! {
        _ = task.cancel.cancelled() => TaskOutcome::failed(ClientError::Cancelled),
        outcome = perform(&shared, &handle, &task.descriptor, &scratch) => outcome,
    };
    if task.descriptor.kind == TaskKind::Download {
        let _ = tokio::fs::remove_file(&scratch).await;
    }

    match (&outcome.status, &outcome.error) {
        (_, Some(err)) => debug!(task = %task.id, error = %err, "task failed"),
        (Some(status), None) => debug!(task = %task.id, status, "task finished"),
        (None, None) => {}
    }
    task.finish(&shared, outcome);
}

async fn perform(
    shared: &HttpShared,
    task: &Arc<dyn NetworkTask>,
    descriptor: &TaskDescriptor,
    scratch: &Path,
) -> TaskOutcome {
    let (body, streamed_len) = match request_body(&shared.sink, task, &descriptor.body).await {
        Ok(body) => body,
        Err(err) => return TaskOutcome::failed(ClientError::FileAccess(err.to_string())),
    };

    let mut request = shared.client.post(&descriptor.url);
    for (name, value) in &descriptor.headers {
        request = request.header(name.as_str(), value.as_str());
    }
    if let Some(len) = streamed_len {
        request = request.header(CONTENT_LENGTH, len.to_string());
    }

    let response = match request.body(body).send().await {
        Ok(response) => response,
        Err(err) => return TaskOutcome::failed(ClientError::Transport(err.to_string())),
    };
    if let UploadBody::Data { bytes } = &descriptor.body {
        let len = bytes.len() as u64;
        shared.sink.body_sent(task, len, Some(len));
    }

    let status = response.status();
    let headers = response
        .headers()
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|value| (name.as_str().to_ascii_lowercase(), value.to_string()))
        })
        .collect();

    // error bodies always come back in memory so they can be decoded
    let received = if descriptor.kind == TaskKind::Download && status.is_success() {
        receive_file(&shared.sink, task, response, scratch).await
    } else {
        receive_data(&shared.sink, task, response).await
    };
    match received {
        Ok(()) => TaskOutcome::response(status.as_u16(), headers),
        Err(err) => TaskOutcome::failed(err),
    }
}

async fn request_body(
    sink: &EventSink,
    task: &Arc<dyn NetworkTask>,
    body: &UploadBody,
) -> std::io::Result<(Body, Option<u64>)> {
    match body {
        UploadBody::Empty => Ok((Body::from(Vec::new()), None)),
        UploadBody::Data { bytes } => Ok((Body::from(bytes.clone()), None)),
        UploadBody::File { path } => {
            let file = tokio::fs::File::open(path).await?;
            let len = file.metadata().await?.len();
            Ok((stream_body(sink, task, file.take(len), len), Some(len)))
        }
        UploadBody::FileRange { path, start, end } => {
            let mut file = tokio::fs::File::open(path).await?;
            file.seek(SeekFrom::Start(*start)).await?;
            let len = end.saturating_sub(*start);
            Ok((stream_body(sink, task, file.take(len), len), Some(len)))
        }
    }
}

fn stream_body<R>(sink: &EventSink, task: &Arc<dyn NetworkTask>, reader: R, len: u64) -> Body
where
    R: AsyncRead + Send + Sync + 'static,
{
    let sink = sink.clone();
    let task = task.clone();
    let mut sent = 0u64;
    let stream = ReaderStream::new(reader).inspect(move |chunk| {
        if let Ok(chunk) = chunk {
            sent += chunk.len() as u64;
            sink.body_sent(&task, sent, Some(len));
        }
    });
    Body::wrap_stream(stream)
}

async fn receive_data(
    sink: &EventSink,
    task: &Arc<dyn NetworkTask>,
    response: Response,
) -> Result<(), ClientError> {
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| ClientError::Transport(e.to_string()))?;
        sink.data_received(task, chunk);
    }
    Ok(())
}

async fn receive_file(
    sink: &EventSink,
    task: &Arc<dyn NetworkTask>,
    response: Response,
    scratch: &Path,
) -> Result<(), ClientError> {
    let access = |e: std::io::Error| ClientError::FileAccess(format!("{}: {e}", scratch.display()));
    let total = response.content_length();
    let mut file = tokio::fs::File::create(scratch).await.map_err(access)?;
    let mut written = 0u64;
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| ClientError::Transport(e.to_string()))?;
        file.write_all(&chunk).await.map_err(access)?;
        written += chunk.len() as u64;
        sink.download_progress(task, written, total);
    }
    file.flush().await.map_err(access)?;
    drop(file);
    sink.download_finished(task, scratch.to_path_buf()).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::event_channel;

    #[tokio::test]
    async fn background_journal_keeps_tokens_off_disk() {
        let dir = tempfile::tempdir().unwrap();
        let journal = dir.path().join("journal.json");
        let (sink, _events) = event_channel();
        let transport =
            HttpTransport::new(HttpTransportConfig::background("porter.test", &journal), sink).unwrap();

        let task = transport.create_task(
            TaskDescriptor::download("http://127.0.0.1:9/2/files/download")
                .header("Authorization", "Bearer SECRET-TOKEN-123"),
        );

        let raw = std::fs::read_to_string(&journal).unwrap();
        assert!(raw.contains("files/download"));
        assert!(!raw.contains("SECRET-TOKEN-123"));
        drop(task);
    }

    #[test]
    fn restored_tasks_get_fresh_credentials() {
        let provider: CredentialProvider =
            Arc::new(|| vec![("Authorization".to_string(), "Bearer fresh".to_string())]);
        let stored = TaskDescriptor::download("https://content.example/2/files/download")
            .header("Dropbox-API-Arg", "{}");

        let restored = with_credentials(stored.clone(), Some(&provider));
        assert_eq!(restored.header_value("authorization"), Some("Bearer fresh"));
        assert_eq!(restored.header_value("Dropbox-API-Arg"), Some("{}"));

        let untouched = with_credentials(stored.clone(), None);
        assert_eq!(untouched, stored);
    }
}
