use std::path::PathBuf;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use porter_types::TaskKind;

use crate::event::{TransportEvent, TransportEvents};
use crate::reconnect::{PersistedRequestInfo, ReconciliationError, ReconnectedRequest};
use crate::registry::{Resolved, TaskRegistry};
use crate::request::LogicalRequest;
use crate::transport::{
    ChallengeDisposition, ChallengeHandler, NetworkTask, TaskDescriptor, Transport,
};

pub type BackgroundEventsHandler = Arc<dyn Fn() + Send + Sync>;

#[derive(Clone, Default)]
pub struct CoordinatorOptions {
    pub challenge_handler: Option<ChallengeHandler>,
    pub on_background_events_finished: Option<BackgroundEventsHandler>,
}

/// Owns one transport and keeps its tasks matched to logical requests.
///
/// Every task is registered before it is resumed, so no event can arrive
/// for a task the registry has not seen. Events for tasks nobody created in
/// this process (survivors of a relaunch) are adopted as pending and handed
/// out by [`SessionCoordinator::reconcile`].
pub struct SessionCoordinator<T: Transport> {
    inner: Arc<Inner<T>>,
}

impl<T: Transport> Clone for SessionCoordinator<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct Inner<T> {
    transport: T,
    registry: TaskRegistry,
    /// Shutdown flag. Also held across task creation and registration.
    shutdown: Mutex<bool>,
    options: CoordinatorOptions,
}

impl<T: Transport> SessionCoordinator<T> {
    /// Wire a transport to its event channel and start routing.
    ///
    /// `events` must be the receiver paired with the sink the transport was
    /// built with. Must be called from within a tokio runtime.
    pub fn new(transport: T, events: TransportEvents, options: CoordinatorOptions) -> Self {
        let background = transport.is_background();
        let inner = Arc::new(Inner {
            transport,
            registry: TaskRegistry::new(),
            shutdown: Mutex::new(false),
            options,
        });
        tokio::spawn(route_events(Arc::downgrade(&inner), events));
        info!(background, "session coordinator started");
        Self { inner }
    }

    pub fn transport(&self) -> &T {
        &self.inner.transport
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.inner.registry
    }

    pub fn is_background(&self) -> bool {
        self.inner.transport.is_background()
    }

    pub fn is_shutdown(&self) -> bool {
        *self.inner.shutdown.lock()
    }

    /// Create, register, then resume a task.
    ///
    /// After [`SessionCoordinator::shutdown`] this returns an inert request.
    pub fn create_task(&self, descriptor: TaskDescriptor) -> LogicalRequest {
        self.create_with(descriptor, |_| {})
    }

    pub fn data_task(&self, descriptor: TaskDescriptor) -> LogicalRequest {
        self.create_task(TaskDescriptor {
            kind: TaskKind::Data,
            ..descriptor
        })
    }

    /// Upload task; `info` is persisted in the task description.
    pub fn upload_task(
        &self,
        descriptor: TaskDescriptor,
        info: Option<&PersistedRequestInfo>,
    ) -> LogicalRequest {
        let description = match info {
            Some(info) => encode_info(info),
            None => descriptor.description.clone(),
        };
        self.create_task(TaskDescriptor {
            kind: TaskKind::Upload,
            description,
            ..descriptor
        })
    }

    /// Download task that moves its file to `destination`.
    ///
    /// The destination is persisted so a relaunched process can still
    /// deliver the file where the caller asked.
    pub fn download_task(
        &self,
        descriptor: TaskDescriptor,
        info: PersistedRequestInfo,
    ) -> LogicalRequest {
        let destination = match &info {
            PersistedRequestInfo::DownloadFile(file) => {
                Some((file.destination.clone(), file.overwrite))
            }
            PersistedRequestInfo::Upload(_) => None,
        };
        let descriptor = TaskDescriptor {
            kind: TaskKind::Download,
            description: encode_info(&info),
            ..descriptor
        };
        self.create_with(descriptor, move |request| {
            if let Some((path, overwrite)) = destination {
                request.set_download_destination(path, overwrite);
            }
        })
    }

    /// Download task with an explicit destination and no persisted route.
    pub fn download_to(
        &self,
        descriptor: TaskDescriptor,
        destination: impl Into<PathBuf>,
        overwrite: bool,
    ) -> LogicalRequest {
        let destination = destination.into();
        self.create_with(
            TaskDescriptor {
                kind: TaskKind::Download,
                ..descriptor
            },
            move |request| request.set_download_destination(destination, overwrite),
        )
    }

    fn create_with(
        &self,
        descriptor: TaskDescriptor,
        configure: impl FnOnce(&LogicalRequest),
    ) -> LogicalRequest {
        let request = {
            let shutdown = self.inner.shutdown.lock();
            if *shutdown {
                warn!(url = %descriptor.url, "task requested after shutdown, returning inert request");
                return LogicalRequest::inert();
            }
            let kind = descriptor.kind;
            let task = self.inner.transport.create_task(descriptor);
            let request = LogicalRequest::new(task);
            configure(&request);
            self.inner.registry.register(&request, request.id());
            debug!(task = %request.id(), %kind, "task registered");
            request
        };
        request.task().resume();
        request
    }

    /// Hand out every surviving task that no live request owns.
    ///
    /// Calling this twice in a row vends nothing the second time.
    pub async fn reconcile(&self) -> Vec<LogicalRequest> {
        let tasks = self.inner.transport.all_tasks().await;
        let surviving = tasks.len();
        // creation holds this lock from create_task through register, so a
        // task in the snapshot is either registered by now or not ours
        let vended = {
            let _creating = self.inner.shutdown.lock();
            self.inner.registry.reconcile(tasks, adopt)
        };
        info!(surviving, vended = vended.len(), "reconciled transport tasks");
        vended
    }

    /// Like [`SessionCoordinator::reconcile`], decoding each task's
    /// persisted route. Tasks that cannot be decoded come back as errors.
    pub async fn reconcile_pending_transfers(
        &self,
    ) -> Vec<Result<ReconnectedRequest, ReconciliationError>> {
        self.reconcile()
            .await
            .into_iter()
            .map(|request| {
                let description = request.description();
                match PersistedRequestInfo::from_description(description.as_deref()) {
                    Ok(info) => Ok(ReconnectedRequest { request, info }),
                    Err(kind) => {
                        warn!(task = %request.id(), error = %kind, "surviving task has no usable route information");
                        Err(ReconciliationError {
                            task_id: request.id(),
                            kind,
                            description,
                            request,
                        })
                    }
                }
            })
            .collect()
    }

    /// Cancel everything and refuse new tasks. Idempotent.
    pub fn shutdown(&self) {
        {
            let mut shutdown = self.inner.shutdown.lock();
            if *shutdown {
                return;
            }
            *shutdown = true;
        }
        self.inner.transport.invalidate_and_cancel();
        info!("session coordinator shut down");
    }
}

/// Wrap a task nobody in this process created.
fn adopt(task: Arc<dyn NetworkTask>) -> LogicalRequest {
    let request = LogicalRequest::new(task);
    if let Ok(PersistedRequestInfo::DownloadFile(info)) =
        PersistedRequestInfo::from_description(request.description().as_deref())
    {
        request.set_download_destination(info.destination, info.overwrite);
    }
    request
}

fn encode_info(info: &PersistedRequestInfo) -> Option<String> {
    match info.to_description() {
        Ok(description) => Some(description),
        Err(err) => {
            warn!(error = %err, route = info.route_name(), "could not encode route information");
            None
        }
    }
}

async fn route_events<T: Transport>(inner: Weak<Inner<T>>, mut events: TransportEvents) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.dispatch(event);
    }
    debug!("event router stopped");
}

impl<T: Transport> Inner<T> {
    fn dispatch(&self, event: TransportEvent) {
        match event {
            TransportEvent::DataReceived { task, data } => {
                if let Some(request) = self.request_for(&task) {
                    request.handle_receive(&data);
                }
            }
            TransportEvent::BodySent {
                task,
                total_sent,
                total_expected,
            } => {
                if let Some(request) = self.request_for(&task) {
                    request.handle_progress(total_sent, total_expected);
                }
            }
            TransportEvent::DownloadProgress {
                task,
                total_written,
                total_expected,
            } => {
                if let Some(request) = self.request_for(&task) {
                    request.handle_progress(total_written, total_expected);
                }
            }
            TransportEvent::DownloadFinished {
                task,
                location,
                ack,
            } => {
                let Some(request) = self.request_for(&task) else {
                    let _ = ack.send(());
                    return;
                };
                // the transport waits for the ack before completing this task,
                // so the move can leave the router without reordering its events
                tokio::spawn(async move {
                    let id = request.id();
                    let moved = tokio::task::spawn_blocking(move || {
                        request.handle_download_finished(&location)
                    })
                    .await;
                    if let Err(err) = moved {
                        warn!(task = %id, error = %err, "moving downloaded file stopped abnormally");
                    }
                    let _ = ack.send(());
                });
            }
            TransportEvent::Completed { task, outcome } => {
                let id = task.id();
                if let Some(request) = self.request_for(&task) {
                    request.handle_completion(outcome);
                }
                if self.registry.remove_owned(id) {
                    debug!(task = %id, "task completed, registry entry removed");
                }
            }
            TransportEvent::Challenge { challenge, reply } => {
                let disposition = self
                    .options
                    .challenge_handler
                    .as_ref()
                    .and_then(|handler| handler(&challenge))
                    .unwrap_or(ChallengeDisposition::PerformDefaultHandling);
                debug!(host = %challenge.host, ?disposition, "answered authentication challenge");
                let _ = reply.send(disposition);
            }
            TransportEvent::BackgroundEventsFinished => {
                debug!("background events finished");
                if let Some(handler) = &self.options.on_background_events_finished {
                    handler();
                }
            }
            TransportEvent::Flush { done } => {
                let _ = done.send(());
            }
        }
    }

    fn request_for(&self, task: &Arc<dyn NetworkTask>) -> Option<LogicalRequest> {
        match self.registry.resolve(task, adopt) {
            Resolved::Found(request) => Some(request),
            Resolved::Adopted(request) => {
                info!(task = %request.id(), "adopted task with no owner");
                Some(request)
            }
            Resolved::Released => {
                debug!(task = %task.id(), "request released, dropping event");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use bytes::Bytes;
    use serde_json::json;

    use porter_types::StartResult;

    use super::*;
    use crate::call::Call;
    use crate::event::event_channel;
    use crate::mock::{MockReply, MockTransport};
    use crate::reconnect::ReconciliationErrorKind;
    use crate::request::RequestPhase;
    use crate::transport::{AuthChallenge, UploadBody};

    const URL: &str = "https://api.example/2/files/list_folder";

    fn setup_with(options: CoordinatorOptions) -> (SessionCoordinator<MockTransport>, MockTransport) {
        let (sink, events) = event_channel();
        let transport = MockTransport::new(sink);
        let handle = transport.clone();
        (SessionCoordinator::new(transport, events, options), handle)
    }

    fn setup() -> (SessionCoordinator<MockTransport>, MockTransport) {
        setup_with(CoordinatorOptions::default())
    }

    #[tokio::test]
    async fn task_is_registered_and_resumed() {
        let (coordinator, transport) = setup();
        let request = coordinator.create_task(TaskDescriptor::data(URL, "{}"));

        assert!(coordinator.registry().lookup(request.id()).is_some());
        assert!(transport.created()[0].is_resumed());
        assert_eq!(request.phase(), RequestPhase::Pending);
    }

    #[tokio::test]
    async fn completion_reaches_caller_and_clears_entry() {
        let (coordinator, transport) = setup();
        transport.set_responder(|_| MockReply::json(json!({ "session_id": "s-1" })));

        let call: Call<StartResult> = Call::new(coordinator.data_task(TaskDescriptor::data(URL, "{}")));
        assert_eq!(call.response().await.unwrap().session_id, "s-1");

        transport.sink().flush().await;
        assert!(!coordinator.registry().contains(call.id()));
    }

    #[tokio::test]
    async fn early_events_are_held_until_reconciled() {
        let (coordinator, transport) = setup();
        let orphan = transport.add_surviving_task(TaskDescriptor::data(URL, Bytes::new()));
        orphan
            .clone()
            .deliver(MockReply::json(json!({ "ok": true })))
            .await;
        transport.sink().flush().await;
        assert_eq!(coordinator.registry().all_pending().len(), 1);

        let vended = coordinator.reconcile().await;
        assert_eq!(vended.len(), 1);
        assert_eq!(vended[0].id(), orphan.id());
        let response = vended[0].response().await.unwrap();
        assert_eq!(&response.body[..], br#"{"ok":true}"#);

        assert!(coordinator.reconcile().await.is_empty());
    }

    #[tokio::test]
    async fn reconcile_skips_owned_tasks() {
        let (coordinator, transport) = setup();
        let owned = coordinator.create_task(TaskDescriptor::upload(URL, UploadBody::data("abc")));
        let survivor = transport.add_surviving_task(TaskDescriptor::download(URL));

        let vended = coordinator.reconcile().await;
        let ids: Vec<_> = vended.iter().map(LogicalRequest::id).collect();
        assert_eq!(ids, vec![survivor.id()]);
        assert!(coordinator.registry().lookup(owned.id()).is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn reconcile_racing_creation_never_vends_owned_tasks() {
        let (coordinator, _transport) = setup();

        let creators: Vec<_> = (0..4)
            .map(|_| {
                let coordinator = coordinator.clone();
                tokio::spawn(async move {
                    let mut owned = Vec::new();
                    for _ in 0..200 {
                        owned.push(coordinator.create_task(TaskDescriptor::data(URL, "{}")));
                        tokio::task::yield_now().await;
                    }
                    owned
                })
            })
            .collect();

        let mut vended = Vec::new();
        for _ in 0..400 {
            vended.extend(coordinator.reconcile().await);
            tokio::task::yield_now().await;
        }

        let mut owned = Vec::new();
        for creator in creators {
            owned.extend(creator.await.unwrap());
        }
        vended.extend(coordinator.reconcile().await);

        assert_eq!(owned.len(), 800);
        assert!(vended.is_empty(), "vended {} owned tasks", vended.len());
        for request in &owned {
            let registered = coordinator.registry().lookup(request.id()).unwrap();
            assert!(registered.ptr_eq(request));
        }
    }

    #[tokio::test]
    async fn events_for_released_requests_are_dropped() {
        let (coordinator, transport) = setup();
        let request = coordinator.create_task(TaskDescriptor::data(URL, "{}"));
        let id = request.id();
        drop(request);

        let task = transport.created()[0].clone();
        task.deliver(MockReply::json(json!({}))).await;
        transport.sink().flush().await;

        assert!(coordinator.registry().all_pending().is_empty());
        assert!(!coordinator.registry().contains(id));
    }

    #[tokio::test]
    async fn shutdown_cancels_and_refuses_new_tasks() {
        let (coordinator, transport) = setup();
        let in_flight = coordinator.create_task(TaskDescriptor::data(URL, "{}"));

        coordinator.shutdown();
        coordinator.shutdown();
        assert!(transport.is_invalidated());
        assert!(in_flight.response().await.unwrap_err().is_cancelled());

        let late = coordinator.create_task(TaskDescriptor::data(URL, "{}"));
        assert_eq!(late.phase(), RequestPhase::Cancelled);
        assert_eq!(transport.created().len(), 1);
        assert!(coordinator.is_shutdown());
    }

    #[tokio::test]
    async fn challenges_use_handler_then_default() {
        let handler: ChallengeHandler = Arc::new(|challenge: &AuthChallenge| {
            (challenge.host == "api.example")
                .then(|| ChallengeDisposition::UseCredential("pinned".into()))
        });
        let (_coordinator, transport) = setup_with(CoordinatorOptions {
            challenge_handler: Some(handler),
            ..CoordinatorOptions::default()
        });
        let ask = |host: &str| AuthChallenge {
            host: host.into(),
            method: "server_trust".into(),
            previous_failures: 0,
        };

        assert_eq!(
            transport.sink().challenge(ask("api.example")).await,
            ChallengeDisposition::UseCredential("pinned".into())
        );
        assert_eq!(
            transport.sink().challenge(ask("elsewhere.example")).await,
            ChallengeDisposition::PerformDefaultHandling
        );
    }

    #[tokio::test]
    async fn background_events_callback_runs() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let (_coordinator, transport) = setup_with(CoordinatorOptions {
            on_background_events_finished: Some(Arc::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })),
            ..CoordinatorOptions::default()
        });

        transport.sink().background_events_finished();
        transport.sink().flush().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn progress_events_reach_handler() {
        let (coordinator, transport) = setup();
        let request = coordinator.create_task(TaskDescriptor::upload(URL, UploadBody::data("0123456789")));
        let seen = Arc::new(AtomicUsize::new(0));
        let sink = seen.clone();
        request.set_progress_handler(Arc::new(move |p| {
            sink.store(p.completed as usize, Ordering::SeqCst);
        }));

        let task = transport.created()[0].handle();
        transport.sink().body_sent(&task, 5, Some(10));
        transport.sink().flush().await;
        assert_eq!(seen.load(Ordering::SeqCst), 5);
        assert_eq!(request.phase(), RequestPhase::Active);
    }

    #[tokio::test]
    async fn download_moves_file_to_destination() {
        let dir = tempfile::tempdir().unwrap();
        let destination = dir.path().join("report.pdf");
        let (coordinator, transport) = setup();
        transport.set_responder(|_| MockReply::bytes(200, "pdf bytes"));

        let info = PersistedRequestInfo::download_file("files", "download", &destination, false);
        let request = coordinator.download_task(TaskDescriptor::download(URL), info);
        let response = request.response().await.unwrap();

        assert_eq!(response.file.as_deref(), Some(destination.as_path()));
        assert_eq!(std::fs::read(&destination).unwrap(), b"pdf bytes");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn download_is_moved_before_the_transport_is_acknowledged() {
        let dir = tempfile::tempdir().unwrap();
        let scratch = dir.path().join("incoming.part");
        let destination = dir.path().join("out").join("archive.zip");
        std::fs::write(&scratch, b"zip bytes").unwrap();
        let (coordinator, transport) = setup();

        let request = coordinator.download_to(TaskDescriptor::download(URL), &destination, false);
        let task = transport.created()[0].handle();
        transport.sink().download_finished(&task, scratch.clone()).await;

        // the transport may delete its file now; the data must already be moved
        let _ = std::fs::remove_file(&scratch);
        assert_eq!(std::fs::read(&destination).unwrap(), b"zip bytes");
        assert_eq!(request.phase(), RequestPhase::Active);
    }

    #[tokio::test]
    async fn pending_transfers_decode_persisted_routes() {
        let dir = tempfile::tempdir().unwrap();
        let destination = dir.path().join("photo.jpg");
        let (coordinator, transport) = setup();

        let info = PersistedRequestInfo::download_file("files", "download", &destination, true);
        let survivor = transport.add_surviving_task(
            TaskDescriptor::download(URL).description(Some(info.to_description().unwrap())),
        );
        let foreign = transport.add_surviving_task(
            TaskDescriptor::upload(URL, UploadBody::Empty).description(Some("nightly backup".into())),
        );
        // delivered before anyone reconciles
        survivor
            .clone()
            .deliver(MockReply::bytes(200, "jpeg bytes"))
            .await;

        let results = coordinator.reconcile_pending_transfers().await;
        assert_eq!(results.len(), 2);

        let reconnected = results[0].as_ref().unwrap();
        assert_eq!(reconnected.info, info);
        let response = reconnected.request.response().await.unwrap();
        assert_eq!(response.file.as_deref(), Some(destination.as_path()));
        assert_eq!(std::fs::read(&destination).unwrap(), b"jpeg bytes");

        let err = results[1].as_ref().unwrap_err();
        assert_eq!(err.task_id, foreign.id());
        assert_eq!(err.kind, ReconciliationErrorKind::BadPersistedStringFormat);
        assert_eq!(err.description.as_deref(), Some("nightly backup"));
    }
}
