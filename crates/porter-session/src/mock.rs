//! Scriptable in-memory [`Transport`].
//!
//! Tasks complete through a responder closure that sees each descriptor
//! when the task is resumed, or through [`MockTask::deliver`] called by
//! hand. Tasks that "survived a relaunch" are injected with
//! [`MockTransport::add_surviving_task`].

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::Value;
use uuid::Uuid;

use porter_types::{ClientError, TaskId, TaskKind};

use crate::event::EventSink;
use crate::transport::{NetworkTask, TaskDescriptor, TaskOutcome, Transport};

#[derive(Debug, Clone)]
pub struct MockReply {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    pub error: Option<ClientError>,
    pub delay: Option<Duration>,
}

impl MockReply {
    pub fn empty() -> Self {
        Self::bytes(200, Bytes::new())
    }

    pub fn json(value: Value) -> Self {
        Self::status(200, value)
    }

    pub fn status(status: u16, value: Value) -> Self {
        Self::bytes(status, Bytes::from(value.to_string()))
    }

    pub fn bytes(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.into(),
            error: None,
            delay: None,
        }
    }

    pub fn error(error: ClientError) -> Self {
        Self {
            error: Some(error),
            ..Self::empty()
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn after(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

pub type Responder = Arc<dyn Fn(&TaskDescriptor) -> MockReply + Send + Sync>;

#[derive(Clone)]
pub struct MockTransport {
    shared: Arc<MockShared>,
}

struct MockShared {
    sink: EventSink,
    identifier: Option<String>,
    next_id: AtomicU64,
    created: Mutex<Vec<Arc<MockTask>>>,
    live: Mutex<BTreeMap<TaskId, Arc<MockTask>>>,
    responder: Mutex<Option<Responder>>,
    invalidated: AtomicBool,
}

pub struct MockTask {
    id: TaskId,
    descriptor: TaskDescriptor,
    description: Mutex<Option<String>>,
    resumed: AtomicBool,
    cancelled: AtomicBool,
    finished: AtomicBool,
    shared: Weak<MockShared>,
    me: Weak<MockTask>,
}

impl MockTransport {
    pub fn new(sink: EventSink) -> Self {
        Self::build(sink, None)
    }

    pub fn background(sink: EventSink, identifier: impl Into<String>) -> Self {
        Self::build(sink, Some(identifier.into()))
    }

    fn build(sink: EventSink, identifier: Option<String>) -> Self {
        Self {
            shared: Arc::new(MockShared {
                sink,
                identifier,
                next_id: AtomicU64::new(1),
                created: Mutex::new(Vec::new()),
                live: Mutex::new(BTreeMap::new()),
                responder: Mutex::new(None),
                invalidated: AtomicBool::new(false),
            }),
        }
    }

    /// Answer every task on resume. Without a responder tasks stay open
    /// until delivered or cancelled.
    pub fn set_responder(&self, responder: impl Fn(&TaskDescriptor) -> MockReply + Send + Sync + 'static) {
        *self.shared.responder.lock() = Some(Arc::new(responder));
    }

    pub fn sink(&self) -> EventSink {
        self.shared.sink.clone()
    }

    /// A task this process never created, as if restored after relaunch.
    pub fn add_surviving_task(&self, descriptor: TaskDescriptor) -> Arc<MockTask> {
        let task = self.new_task(descriptor);
        task.resumed.store(true, Ordering::Release);
        task
    }

    /// Tasks created through [`Transport::create_task`], in order.
    pub fn created(&self) -> Vec<Arc<MockTask>> {
        self.shared.created.lock().clone()
    }

    pub fn created_with_tag(&self, tag: &str) -> Vec<Arc<MockTask>> {
        self.shared
            .created
            .lock()
            .iter()
            .filter(|task| task.descriptor.tag.as_deref() == Some(tag))
            .cloned()
            .collect()
    }

    pub fn is_invalidated(&self) -> bool {
        self.shared.invalidated.load(Ordering::Acquire)
    }

    fn new_task(&self, descriptor: TaskDescriptor) -> Arc<MockTask> {
        let id = TaskId(self.shared.next_id.fetch_add(1, Ordering::Relaxed));
        let task = Arc::new_cyclic(|me| MockTask {
            id,
            description: Mutex::new(descriptor.description.clone()),
            descriptor,
            resumed: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            shared: Arc::downgrade(&self.shared),
            me: me.clone(),
        });
        self.shared.live.lock().insert(id, task.clone());
        task
    }
}

impl Transport for MockTransport {
    fn identifier(&self) -> Option<&str> {
        self.shared.identifier.as_deref()
    }

    fn create_task(&self, descriptor: TaskDescriptor) -> Arc<dyn NetworkTask> {
        let task = self.new_task(descriptor);
        self.shared.created.lock().push(task.clone());
        task
    }

    fn all_tasks(&self) -> impl Future<Output = Vec<Arc<dyn NetworkTask>>> + Send {
        let tasks: Vec<Arc<dyn NetworkTask>> = self
            .shared
            .live
            .lock()
            .values()
            .map(|task| task.clone() as Arc<dyn NetworkTask>)
            .collect();
        std::future::ready(tasks)
    }

    fn invalidate_and_cancel(&self) {
        self.shared.invalidated.store(true, Ordering::Release);
        let live: Vec<_> = self.shared.live.lock().values().cloned().collect();
        for task in live {
            task.cancel();
        }
    }
}

impl MockTask {
    pub fn descriptor(&self) -> &TaskDescriptor {
        &self.descriptor
    }

    pub fn is_resumed(&self) -> bool {
        self.resumed.load(Ordering::Acquire)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    pub fn handle(self: &Arc<Self>) -> Arc<dyn NetworkTask> {
        self.clone()
    }

    /// Play a reply through the event sink and complete the task.
    pub async fn deliver(self: Arc<Self>, reply: MockReply) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        if let Some(delay) = reply.delay {
            tokio::time::sleep(delay).await;
        }
        if self.is_cancelled() || self.is_finished() {
            return;
        }
        let handle = self.handle();
        if let Some(error) = reply.error {
            self.finish(&shared, TaskOutcome::failed(error));
            return;
        }
        let success = (200..300).contains(&reply.status);
        if self.descriptor.kind == TaskKind::Download && success {
            let scratch = std::env::temp_dir().join(format!("porter-mock-{}", Uuid::new_v4()));
            if let Err(err) = std::fs::write(&scratch, &reply.body) {
                self.finish(&shared, TaskOutcome::failed(ClientError::FileAccess(err.to_string())));
                return;
            }
            shared.sink.download_finished(&handle, scratch.clone()).await;
            let _ = std::fs::remove_file(&scratch);
        } else if !reply.body.is_empty() {
            shared.sink.data_received(&handle, reply.body);
        }
        let headers: HashMap<String, String> = reply
            .headers
            .into_iter()
            .map(|(name, value)| (name.to_ascii_lowercase(), value))
            .collect();
        self.finish(&shared, TaskOutcome::response(reply.status, headers));
    }

    fn finish(&self, shared: &MockShared, outcome: TaskOutcome) {
        if self.finished.swap(true, Ordering::AcqRel) {
            return;
        }
        shared.live.lock().remove(&self.id);
        if let Some(me) = self.me.upgrade() {
            let handle: Arc<dyn NetworkTask> = me;
            shared.sink.completed(&handle, outcome);
        }
    }
}

impl NetworkTask for MockTask {
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
        *self.description.lock() = description;
    }

    fn resume(&self) {
        if self.resumed.swap(true, Ordering::AcqRel) {
            return;
        }
        let (Some(shared), Some(me)) = (self.shared.upgrade(), self.me.upgrade()) else {
            return;
        };
        if shared.invalidated.load(Ordering::Acquire) {
            self.cancel();
            return;
        }
        let responder = shared.responder.lock().clone();
        if let Some(responder) = responder {
            let reply = responder(&self.descriptor);
            tokio::spawn(me.deliver(reply));
        }
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        if let Some(shared) = self.shared.upgrade() {
            self.finish(&shared, TaskOutcome::failed(ClientError::Cancelled));
        }
    }

    fn is_completed(&self) -> bool {
        self.is_finished()
    }
}

impl fmt::Debug for MockTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockTask")
            .field("id", &self.id)
            .field("kind", &self.descriptor.kind)
            .field("tag", &self.descriptor.tag)
            .finish()
    }
}
