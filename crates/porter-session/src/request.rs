use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, warn};
use uuid::Uuid;

use porter_types::{ClientError, TaskId, TaskKind};

use crate::noop::NoopTask;
use crate::transport::{NetworkTask, TaskOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestPhase {
    Pending,
    Active,
    Completed,
    Failed,
    Cancelled,
}

impl RequestPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub completed: u64,
    pub total: Option<u64>,
}

pub type ProgressHandler = Arc<dyn Fn(Progress) + Send + Sync>;

/// Successful (2xx) result of a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskResponse {
    pub status: u16,
    /// Lowercase header names.
    pub headers: HashMap<String, String>,
    pub body: Bytes,
    /// Where a download ended up.
    pub file: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskFailure {
    /// The server answered with a non-2xx status.
    Status {
        status: u16,
        headers: HashMap<String, String>,
        body: Bytes,
    },
    Client(ClientError),
}

impl TaskFailure {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Client(ClientError::Cancelled))
    }
}

pub type TaskResult = Result<TaskResponse, TaskFailure>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadDestination {
    pub path: PathBuf,
    pub overwrite: bool,
}

struct RequestState {
    phase: RequestPhase,
    buffer: BytesMut,
    progress: Option<ProgressHandler>,
    destination: Option<DownloadDestination>,
    downloaded: Option<Result<PathBuf, ClientError>>,
}

pub(crate) struct RequestInner {
    task: Arc<dyn NetworkTask>,
    state: Mutex<RequestState>,
    result: watch::Sender<Option<TaskResult>>,
}

/// SDK-side handle for one network task.
///
/// Cloning is cheap and every clone observes the same result. The task
/// registry only keeps a strong reference while the request waits to be
/// claimed by reconciliation; otherwise the caller's clones keep it alive.
#[derive(Clone)]
pub struct LogicalRequest {
    inner: Arc<RequestInner>,
}

/// Non-owning reference held by the registry for caller-owned requests.
#[derive(Clone)]
pub struct WeakRequest {
    inner: Weak<RequestInner>,
}

impl WeakRequest {
    pub fn upgrade(&self) -> Option<LogicalRequest> {
        self.inner.upgrade().map(|inner| LogicalRequest { inner })
    }

    pub fn is_live(&self) -> bool {
        self.inner.strong_count() > 0
    }
}

impl LogicalRequest {
    pub(crate) fn new(task: Arc<dyn NetworkTask>) -> Self {
        let (result, _) = watch::channel(None);
        Self {
            inner: Arc::new(RequestInner {
                task,
                state: Mutex::new(RequestState {
                    phase: RequestPhase::Pending,
                    buffer: BytesMut::new(),
                    progress: None,
                    destination: None,
                    downloaded: None,
                }),
                result,
            }),
        }
    }

    /// A request that never touches the network and is already cancelled.
    pub fn inert() -> Self {
        let request = Self::new(Arc::new(NoopTask));
        request.inner.state.lock().phase = RequestPhase::Cancelled;
        request
            .inner
            .result
            .send_replace(Some(Err(TaskFailure::Client(ClientError::Cancelled))));
        request
    }

    pub fn id(&self) -> TaskId {
        self.inner.task.id()
    }

    pub fn kind(&self) -> TaskKind {
        self.inner.task.kind()
    }

    pub fn task(&self) -> &Arc<dyn NetworkTask> {
        &self.inner.task
    }

    pub fn phase(&self) -> RequestPhase {
        self.inner.state.lock().phase
    }

    pub fn description(&self) -> Option<String> {
        self.inner.task.description()
    }

    pub fn set_description(&self, description: Option<String>) {
        self.inner.task.set_description(description);
    }

    pub fn downgrade(&self) -> WeakRequest {
        WeakRequest {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn ptr_eq(&self, other: &LogicalRequest) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn set_progress_handler(&self, handler: ProgressHandler) {
        self.inner.state.lock().progress = Some(handler);
    }

    /// Where a finished download should be moved.
    ///
    /// If the file already arrived it is moved right away.
    pub fn set_download_destination(&self, path: impl Into<PathBuf>, overwrite: bool) {
        let destination = DownloadDestination {
            path: path.into(),
            overwrite,
        };
        let scratch = {
            let mut state = self.inner.state.lock();
            if state.phase.is_terminal() {
                warn!(task = %self.id(), "download destination set after completion, ignoring");
                return;
            }
            state.destination = Some(destination.clone());
            match state.downloaded.take() {
                Some(Ok(path)) => Some(path),
                other => {
                    state.downloaded = other;
                    None
                }
            }
        };
        if let Some(scratch) = scratch {
            let moved = move_file(&scratch, &destination.path, destination.overwrite);
            if moved.is_ok() {
                let _ = std::fs::remove_file(&scratch);
            }
            self.inner.state.lock().downloaded = Some(moved);
        }
    }

    pub fn cancel(&self) {
        {
            let mut state = self.inner.state.lock();
            if state.phase.is_terminal() {
                return;
            }
            state.phase = RequestPhase::Cancelled;
        }
        self.inner.task.cancel();
        self.inner
            .result
            .send_replace(Some(Err(TaskFailure::Client(ClientError::Cancelled))));
    }

    /// Wait for the terminal result.
    pub async fn response(&self) -> TaskResult {
        let mut rx = self.inner.result.subscribe();
        let result = match rx.wait_for(Option::is_some).await {
            Ok(slot) => Option::clone(&slot),
            Err(_) => None,
        };
        result.unwrap_or_else(|| {
            Err(TaskFailure::Client(ClientError::UnexpectedState(
                "request result channel closed".into(),
            )))
        })
    }

    /// The terminal result, if it is already known.
    pub fn try_response(&self) -> Option<TaskResult> {
        self.inner.result.borrow().clone()
    }

    // -----------------------------------------------------------------------
    // Event handlers, called by the coordinator's router
    // -----------------------------------------------------------------------

    pub(crate) fn handle_receive(&self, data: &[u8]) {
        let mut state = self.inner.state.lock();
        if state.phase.is_terminal() {
            return;
        }
        state.phase = RequestPhase::Active;
        state.buffer.extend_from_slice(data);
    }

    pub(crate) fn handle_progress(&self, completed: u64, total: Option<u64>) {
        let handler = {
            let mut state = self.inner.state.lock();
            if state.phase.is_terminal() {
                return;
            }
            state.phase = RequestPhase::Active;
            state.progress.clone()
        };
        if let Some(handler) = handler {
            handler(Progress { completed, total });
        }
    }

    /// Move the downloaded file out of the transport's temporary location.
    /// Must finish before the transport is acknowledged.
    pub(crate) fn handle_download_finished(&self, location: &Path) {
        let destination = {
            let mut state = self.inner.state.lock();
            if state.phase.is_terminal() {
                return;
            }
            state.phase = RequestPhase::Active;
            state.destination.clone()
        };
        let moved = match destination {
            Some(destination) => move_file(location, &destination.path, destination.overwrite),
            None => {
                let scratch = std::env::temp_dir().join(format!("porter-download-{}", Uuid::new_v4()));
                move_file(location, &scratch, true)
            }
        };
        if let Err(err) = &moved {
            warn!(task = %self.id(), error = %err, "could not move downloaded file");
        }
        self.inner.state.lock().downloaded = Some(moved);
    }

    pub(crate) fn handle_completion(&self, outcome: TaskOutcome) {
        let result = {
            let mut state = self.inner.state.lock();
            if state.phase.is_terminal() {
                debug!(task = %self.id(), "completion after terminal state, ignoring");
                return;
            }
            let result = complete(self.kind(), &mut state, outcome);
            state.phase = match &result {
                Ok(_) => RequestPhase::Completed,
                Err(failure) if failure.is_cancelled() => RequestPhase::Cancelled,
                Err(_) => RequestPhase::Failed,
            };
            result
        };
        self.inner.result.send_replace(Some(result));
    }
}

fn complete(kind: TaskKind, state: &mut RequestState, outcome: TaskOutcome) -> TaskResult {
    if let Some(error) = outcome.error {
        return Err(TaskFailure::Client(error));
    }
    let Some(status) = outcome.status else {
        return Err(TaskFailure::Client(ClientError::UnexpectedState(
            "task completed without a response".into(),
        )));
    };
    let body = state.buffer.split().freeze();
    if !(200..300).contains(&status) {
        return Err(TaskFailure::Status {
            status,
            headers: outcome.headers,
            body,
        });
    }
    let file = match kind {
        TaskKind::Download => match state.downloaded.take() {
            Some(Ok(path)) => Some(path),
            Some(Err(err)) => return Err(TaskFailure::Client(err)),
            None => {
                return Err(TaskFailure::Client(ClientError::UnexpectedState(
                    "download completed without a file".into(),
                )));
            }
        },
        TaskKind::Data | TaskKind::Upload => None,
    };
    Ok(TaskResponse {
        status,
        headers: outcome.headers,
        body,
        file,
    })
}

fn move_file(from: &Path, to: &Path, overwrite: bool) -> Result<PathBuf, ClientError> {
    let access = |err: std::io::Error| ClientError::FileAccess(format!("{}: {err}", to.display()));
    if to.exists() {
        if !overwrite {
            return Err(ClientError::FileAccess(format!(
                "{} already exists",
                to.display()
            )));
        }
        std::fs::remove_file(to).map_err(access)?;
    }
    if let Some(parent) = to.parent() {
        std::fs::create_dir_all(parent).map_err(access)?;
    }
    // rename fails across filesystems; the transport deletes the source after ack
    if std::fs::rename(from, to).is_err() {
        std::fs::copy(from, to).map_err(access)?;
    }
    Ok(to.to_path_buf())
}

impl fmt::Debug for LogicalRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogicalRequest")
            .field("id", &self.id())
            .field("kind", &self.kind())
            .field("phase", &self.phase())
            .finish()
    }
}

impl fmt::Debug for WeakRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakRequest")
            .field("live", &self.is_live())
            .finish()
    }
}
