use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use porter_session::{Call, LogicalRequest, UploadBody};
use porter_types::{
    BatchUploadError, CallError, ClientError, CommitInfo, FinishArg, FinishBatchEntry,
};

use crate::barrier::JoinCounter;
use crate::chunking::{Chunk, ChunkPlan};
use crate::content_hash::content_hash;
use crate::progress::{ProgressCounter, ProgressHandler};
use crate::routes::UploadSessionRoutes;
use crate::staging::{StagedFile, Stager, StagingArea};
use crate::state::UploadSessionState;

pub const DEFAULT_CHUNK_SIZE: u64 = 24 * 1024 * 1024;
pub const DEFAULT_MAX_RETRIES: u32 = 3;

#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Files smaller than this go up in one call.
    pub chunk_size: u64,
    /// Retries per chunk after a rate-limit response.
    pub max_retries: u32,
    /// Parent of the per-job staging directories.
    pub temp_root: PathBuf,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_retries: DEFAULT_MAX_RETRIES,
            temp_root: std::env::temp_dir().join("porter-batch"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("batch upload is not supported by background sessions")]
pub struct MisuseError;

/// Final report of a batch job.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    /// Commit result per source file, present when the commit succeeded.
    pub results: Option<HashMap<PathBuf, FinishBatchEntry>>,
    /// Batch-level failure: the commit failed or the job was cancelled.
    pub finish_error: Option<BatchUploadError>,
    /// Files that never reached the commit.
    pub file_errors: HashMap<PathBuf, BatchUploadError>,
}

impl BatchOutcome {
    pub fn is_cancelled(&self) -> bool {
        self.finish_error == Some(BatchUploadError::Cancelled)
    }
}

pub struct BatchUploader<R> {
    routes: Arc<R>,
    config: BatchConfig,
}

impl<R: UploadSessionRoutes> BatchUploader<R> {
    pub fn new(routes: R, config: BatchConfig) -> Self {
        Self::with_shared_routes(Arc::new(routes), config)
    }

    pub fn with_shared_routes(routes: Arc<R>, config: BatchConfig) -> Self {
        Self { routes, config }
    }

    pub fn routes(&self) -> &R {
        &self.routes
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    /// Upload `files` and commit them in one batch.
    ///
    /// Returns at once; `on_complete` runs exactly once on a runtime task
    /// after the job reaches a terminal state. Duplicate source paths are
    /// uploaded once, with the last commit info given.
    pub fn submit_batch_upload<F>(
        &self,
        files: impl IntoIterator<Item = (PathBuf, CommitInfo)>,
        progress: Option<ProgressHandler>,
        on_complete: F,
    ) -> Result<JobHandle, MisuseError>
    where
        F: FnOnce(BatchOutcome) + Send + 'static,
    {
        if !self.routes.supports_batch_upload() {
            warn!("batch upload submitted to routes that cannot batch");
            return Err(MisuseError);
        }
        let files: BTreeMap<PathBuf, CommitInfo> = files.into_iter().collect();
        let control = Arc::new(JobControl::default());
        let job = Arc::new(Job {
            id: Uuid::new_v4(),
            routes: self.routes.clone(),
            config: self.config.clone(),
            control: control.clone(),
        });
        let id = job.id;
        info!(job = %id, files = files.len(), chunk_size = self.config.chunk_size, "batch upload submitted");
        let driver = tokio::spawn(drive(job, files.into_iter().collect(), progress, on_complete));
        Ok(JobHandle {
            id,
            control,
            driver,
        })
    }
}

/// Handle to a running batch job.
pub struct JobHandle {
    id: Uuid,
    control: Arc<JobControl>,
    driver: JoinHandle<()>,
}

impl JobHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Stop issuing calls and cancel the ones in flight. The job then
    /// completes with [`BatchUploadError::Cancelled`].
    pub fn cancel(&self) {
        let in_flight = self.control.cancel();
        info!(job = %self.id, in_flight, "batch upload cancelled");
    }

    pub fn is_cancelled(&self) -> bool {
        self.control.is_cancelled()
    }

    /// True once the completion callback has run.
    pub fn is_finished(&self) -> bool {
        self.driver.is_finished()
    }

    pub async fn join(self) {
        let JobHandle { id, driver, .. } = self;
        if let Err(err) = driver.await {
            error!(job = %id, error = %err, "batch driver stopped abnormally");
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum CallSlot {
    File(usize),
    Finish,
}

/// Cancellation flag plus the calls currently in flight.
///
/// The flag is only set while holding the in-flight lock, and calls are only
/// dispatched while holding it, so no call can slip out after cancel.
#[derive(Default)]
struct JobControl {
    cancelled: CancellationToken,
    in_flight: Mutex<HashMap<CallSlot, LogicalRequest>>,
}

impl JobControl {
    fn is_cancelled(&self) -> bool {
        self.cancelled.is_cancelled()
    }

    fn cancel(&self) -> usize {
        let requests: Vec<_> = {
            let in_flight = self.in_flight.lock();
            self.cancelled.cancel();
            in_flight.values().cloned().collect()
        };
        for request in &requests {
            request.cancel();
        }
        requests.len()
    }

    fn dispatch<T: DeserializeOwned>(
        &self,
        slot: CallSlot,
        issue: impl FnOnce() -> Call<T>,
    ) -> Option<Call<T>> {
        let mut in_flight = self.in_flight.lock();
        if self.is_cancelled() {
            return None;
        }
        let call = issue();
        in_flight.insert(slot, call.request().clone());
        Some(call)
    }

    fn settle(&self, slot: CallSlot) {
        self.in_flight.lock().remove(&slot);
    }
}

struct Job<R> {
    id: Uuid,
    routes: Arc<R>,
    config: BatchConfig,
    control: Arc<JobControl>,
}

enum FileResult {
    Uploaded(FinishArg),
    Failed(BatchUploadError),
    /// Stopped by cancellation.
    Skipped,
}

struct FileReport {
    index: usize,
    source: PathBuf,
    state: UploadSessionState,
    result: FileResult,
}

async fn drive<R, F>(
    job: Arc<Job<R>>,
    files: Vec<(PathBuf, CommitInfo)>,
    handler: Option<ProgressHandler>,
    on_complete: F,
) where
    R: UploadSessionRoutes,
    F: FnOnce(BatchOutcome) + Send + 'static,
{
    let sources: Vec<PathBuf> = files.iter().map(|(source, _)| source.clone()).collect();
    let progress = Arc::new(ProgressCounter::new(total_size(&sources).await, handler));
    let staging = match StagingArea::create(&job.config.temp_root, job.id).await {
        Ok(area) => area,
        Err(err) => {
            error!(job = %job.id, error = %err, "could not create staging area");
            on_complete(BatchOutcome {
                results: None,
                finish_error: Some(BatchUploadError::Staging(ClientError::FileAccess(format!(
                    "staging area {}: {err}",
                    job.config.temp_root.display()
                )))),
                file_errors: HashMap::new(),
            });
            return;
        }
    };
    let stager = staging.stager();

    let barrier = Arc::new(JoinCounter::new(files.len()));
    let (reports, mut inbox) = mpsc::unbounded_channel();
    for (index, (source, commit)) in files.into_iter().enumerate() {
        let guard = barrier.guard();
        let job = job.clone();
        let progress = progress.clone();
        let stager = stager.clone();
        let reports = reports.clone();
        tokio::spawn(async move {
            let _guard = guard;
            let mut state = UploadSessionState::new();
            let result = job
                .upload_file(index, &source, commit, stager, &mut state, &progress)
                .await;
            let _ = reports.send(FileReport {
                index,
                source,
                state,
                result,
            });
        });
    }
    drop(reports);
    barrier.wait().await;

    let mut uploaded = Vec::new();
    let mut file_errors = HashMap::new();
    let mut reported = vec![false; sources.len()];
    while let Ok(report) = inbox.try_recv() {
        reported[report.index] = true;
        debug!(
            job = %job.id,
            file = report.index,
            phase = ?report.state.phase(),
            offset = report.state.offset(),
            retries = report.state.retries(),
            "file settled"
        );
        match report.result {
            FileResult::Uploaded(arg) => uploaded.push((report.source, arg)),
            FileResult::Failed(err) => {
                file_errors.insert(report.source, err);
            }
            FileResult::Skipped => {}
        }
    }
    for (index, source) in sources.iter().enumerate() {
        if !reported[index] {
            error!(job = %job.id, file = index, "upload worker stopped without a report");
            file_errors.insert(
                source.clone(),
                BatchUploadError::Start(CallError::Client(ClientError::UnexpectedState(
                    "upload worker stopped".into(),
                ))),
            );
        }
    }

    let outcome = if job.control.is_cancelled() {
        cancelled(file_errors)
    } else {
        job.finish(uploaded, file_errors).await
    };
    staging.remove().await;
    info!(
        job = %job.id,
        committed = outcome.results.as_ref().map_or(0, HashMap::len),
        failed = outcome.file_errors.len(),
        bytes = progress.completed(),
        cancelled = outcome.is_cancelled(),
        "batch upload finished"
    );
    on_complete(outcome);
}

fn cancelled(file_errors: HashMap<PathBuf, BatchUploadError>) -> BatchOutcome {
    BatchOutcome {
        results: None,
        finish_error: Some(BatchUploadError::Cancelled),
        file_errors,
    }
}

async fn total_size(sources: &[PathBuf]) -> u64 {
    let mut total = 0;
    for source in sources {
        if let Ok(meta) = tokio::fs::metadata(source).await {
            total += meta.len();
        }
    }
    total
}

impl<R: UploadSessionRoutes> Job<R> {
    async fn upload_file(
        &self,
        index: usize,
        source: &Path,
        commit: CommitInfo,
        stager: Stager,
        state: &mut UploadSessionState,
        progress: &ProgressCounter,
    ) -> FileResult {
        if self.control.is_cancelled() {
            return FileResult::Skipped;
        }
        let staged = match stager.stage(source).await.map_err(|e| e.to_string()) {
            Ok(staged) => staged,
            Err(err) => {
                warn!(job = %self.id, source = %source.display(), error = %err, "staging failed");
                state.failed();
                return FileResult::Failed(BatchUploadError::Staging(ClientError::FileAccess(err)));
            }
        };
        let content_hash = match content_hash(staged.path.clone()).await {
            Ok(hash) => hash,
            Err(err) => {
                warn!(job = %self.id, source = %source.display(), error = %err, "hashing staged file failed");
                state.failed();
                return FileResult::Failed(BatchUploadError::Staging(ClientError::FileAccess(
                    err.to_string(),
                )));
            }
        };

        let plan = ChunkPlan::new(staged.size, self.config.chunk_size);
        debug!(job = %self.id, file = index, size = staged.size, chunks = plan.chunk_count(), "uploading file");
        if let Err(result) = self.send_chunks(index, &staged, plan, state, progress).await {
            return result;
        }
        match state.cursor() {
            Some(cursor) => FileResult::Uploaded(FinishArg {
                cursor,
                commit,
                content_hash: Some(content_hash),
            }),
            None => FileResult::Failed(BatchUploadError::Start(CallError::Client(
                ClientError::UnexpectedState("session finished without an id".into()),
            ))),
        }
    }

    async fn send_chunks(
        &self,
        index: usize,
        staged: &StagedFile,
        plan: ChunkPlan,
        state: &mut UploadSessionState,
        progress: &ProgressCounter,
    ) -> Result<(), FileResult> {
        let mut chunks = plan.chunks();
        let Some(first) = chunks.next() else {
            return Err(FileResult::Failed(BatchUploadError::Start(CallError::Client(
                ClientError::UnexpectedState("empty chunk plan".into()),
            ))));
        };

        let body = if plan.is_single_shot() {
            UploadBody::file(&staged.path)
        } else {
            UploadBody::range(&staged.path, first.start, first.end)
        };
        let slot = CallSlot::File(index);
        let Some(call) = self
            .control
            .dispatch(slot, || self.routes.start(first.is_last, body))
        else {
            return Err(FileResult::Skipped);
        };
        let started = call.response().await;
        self.control.settle(slot);
        match started {
            Ok(result) => {
                state.started(result.session_id, first.len(), first.is_last);
                progress.record(first.len());
            }
            Err(err) => return Err(self.call_failed(state, err, BatchUploadError::Start)),
        }

        for chunk in chunks {
            state.appending(chunk.is_last);
            self.append_chunk(index, &staged.path, chunk, state).await?;
            progress.record(chunk.len());
        }
        Ok(())
    }

    /// Send one append, sleeping and retrying while the server rate-limits.
    async fn append_chunk(
        &self,
        index: usize,
        path: &Path,
        chunk: Chunk,
        state: &mut UploadSessionState,
    ) -> Result<(), FileResult> {
        let slot = CallSlot::File(index);
        let mut retries = 0;
        loop {
            if self.control.is_cancelled() {
                return Err(FileResult::Skipped);
            }
            let Some(cursor) = state.cursor() else {
                return Err(FileResult::Failed(BatchUploadError::Append(CallError::Client(
                    ClientError::UnexpectedState("append before session start".into()),
                ))));
            };
            let body = UploadBody::range(path, chunk.start, chunk.end);
            let Some(call) = self
                .control
                .dispatch(slot, || self.routes.append(&cursor, chunk.is_last, body))
            else {
                return Err(FileResult::Skipped);
            };
            let appended = call.response().await;
            self.control.settle(slot);
            match appended {
                Ok(()) => {
                    state.appended(chunk.start, chunk.len());
                    return Ok(());
                }
                Err(CallError::RateLimit { retry_after, .. }) if retries < self.config.max_retries => {
                    retries += 1;
                    state.retrying();
                    warn!(
                        job = %self.id,
                        file = index,
                        offset = chunk.start,
                        retry = retries,
                        wait_ms = u64::try_from(retry_after.as_millis()).unwrap_or(u64::MAX),
                        "append rate limited"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(retry_after) => {}
                        _ = self.control.cancelled.cancelled() => return Err(FileResult::Skipped),
                    }
                }
                Err(err) => return Err(self.call_failed(state, err, BatchUploadError::Append)),
            }
        }
    }

    fn call_failed(
        &self,
        state: &mut UploadSessionState,
        err: CallError,
        wrap: fn(CallError) -> BatchUploadError,
    ) -> FileResult {
        if err.is_cancelled() && self.control.is_cancelled() {
            return FileResult::Skipped;
        }
        warn!(job = %self.id, offset = state.offset(), error = %err, "upload session call failed");
        state.failed();
        FileResult::Failed(wrap(err))
    }

    async fn finish(
        &self,
        mut uploaded: Vec<(PathBuf, FinishArg)>,
        file_errors: HashMap<PathBuf, BatchUploadError>,
    ) -> BatchOutcome {
        uploaded.sort_by(|a, b| a.1.commit.path.cmp(&b.1.commit.path));
        let (sources, entries): (Vec<_>, Vec<_>) = uploaded.into_iter().unzip();
        info!(job = %self.id, entries = entries.len(), "committing batch");

        let Some(call) = self
            .control
            .dispatch(CallSlot::Finish, || self.routes.finish_batch(&entries))
        else {
            return cancelled(file_errors);
        };
        let finished = call.response().await;
        self.control.settle(CallSlot::Finish);
        if self.control.is_cancelled() {
            return cancelled(file_errors);
        }

        match finished {
            Ok(result) => {
                if result.entries.len() != sources.len() {
                    warn!(
                        job = %self.id,
                        sent = sources.len(),
                        received = result.entries.len(),
                        "commit returned a different number of entries"
                    );
                }
                BatchOutcome {
                    results: Some(sources.into_iter().zip(result.entries).collect()),
                    finish_error: None,
                    file_errors,
                }
            }
            Err(err) => {
                error!(job = %self.id, error = %err, "batch commit failed");
                BatchOutcome {
                    results: None,
                    finish_error: Some(BatchUploadError::Finish(err)),
                    file_errors,
                }
            }
        }
    }
}
