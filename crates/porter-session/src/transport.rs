use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use porter_types::{ClientError, TaskId, TaskKind};

// ---------------------------------------------------------------------------
// Task descriptors
// ---------------------------------------------------------------------------

/// Request body for a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UploadBody {
    Empty,
    Data { bytes: Bytes },
    File { path: PathBuf },
    /// Half-open byte range `[start, end)` of a file.
    FileRange { path: PathBuf, start: u64, end: u64 },
}

impl UploadBody {
    pub fn data(bytes: impl Into<Bytes>) -> Self {
        Self::Data { bytes: bytes.into() }
    }

    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self::File { path: path.into() }
    }

    pub fn range(path: impl Into<PathBuf>, start: u64, end: u64) -> Self {
        Self::FileRange {
            path: path.into(),
            start,
            end,
        }
    }

    /// Length known without touching the filesystem.
    pub fn known_len(&self) -> Option<u64> {
        match self {
            Self::Empty => Some(0),
            Self::Data { bytes } => Some(bytes.len() as u64),
            Self::File { .. } => None,
            Self::FileRange { start, end, .. } => Some(end.saturating_sub(*start)),
        }
    }
}

/// Everything a transport needs to create one task.
///
/// All tasks are POSTs; the route is fully described by `url`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDescriptor {
    pub kind: TaskKind,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: UploadBody,
    /// Persisted alongside the task; survives relaunch on background transports.
    pub description: Option<String>,
    /// Free-form label, used by tests and logs.
    pub tag: Option<String>,
}

impl TaskDescriptor {
    pub fn new(kind: TaskKind, url: impl Into<String>) -> Self {
        Self {
            kind,
            url: url.into(),
            headers: Vec::new(),
            body: UploadBody::Empty,
            description: None,
            tag: None,
        }
    }

    pub fn data(url: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self::new(TaskKind::Data, url).body(UploadBody::data(body))
    }

    pub fn upload(url: impl Into<String>, body: UploadBody) -> Self {
        Self::new(TaskKind::Upload, url).body(body)
    }

    pub fn download(url: impl Into<String>) -> Self {
        Self::new(TaskKind::Download, url)
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn body(mut self, body: UploadBody) -> Self {
        self.body = body;
        self
    }

    pub fn description(mut self, description: Option<String>) -> Self {
        self.description = description;
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    /// Case-insensitive header lookup.
    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Copy without headers that carry credentials, for writing to disk.
    pub fn without_credentials(&self) -> Self {
        Self {
            headers: self
                .headers
                .iter()
                .filter(|(name, _)| !is_credential_header(name))
                .cloned()
                .collect(),
            ..self.clone()
        }
    }
}

/// Headers never written to the task journal.
pub const CREDENTIAL_HEADERS: &[&str] = &["authorization", "proxy-authorization", "cookie"];

pub fn is_credential_header(name: &str) -> bool {
    CREDENTIAL_HEADERS
        .iter()
        .any(|credential| credential.eq_ignore_ascii_case(name))
}

// ---------------------------------------------------------------------------
// NetworkTask
// ---------------------------------------------------------------------------

/// Runtime-level handle for one network operation.
///
/// A task is created suspended; nothing happens until [`NetworkTask::resume`].
/// Cancelling a task that has not completed yields exactly one completion
/// event carrying [`ClientError::Cancelled`].
pub trait NetworkTask: Send + Sync + std::fmt::Debug {
    fn id(&self) -> TaskId;

    fn kind(&self) -> TaskKind;

    fn description(&self) -> Option<String>;

    fn set_description(&self, description: Option<String>);

    fn resume(&self);

    fn cancel(&self);

    /// True once the task has finished, whether or not its completion event
    /// has been routed yet.
    fn is_completed(&self) -> bool;
}

/// How a task ended, as seen by the transport.
#[derive(Debug, Clone, Default)]
pub struct TaskOutcome {
    /// HTTP status, absent when no response arrived.
    pub status: Option<u16>,
    /// Response headers with lowercase names.
    pub headers: HashMap<String, String>,
    pub error: Option<ClientError>,
}

impl TaskOutcome {
    pub fn response(status: u16, headers: HashMap<String, String>) -> Self {
        Self {
            status: Some(status),
            headers,
            error: None,
        }
    }

    pub fn failed(error: ClientError) -> Self {
        Self {
            status: None,
            headers: HashMap::new(),
            error: Some(error),
        }
    }
}

// ---------------------------------------------------------------------------
// Authentication challenges
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthChallenge {
    pub host: String,
    pub method: String,
    pub previous_failures: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChallengeDisposition {
    UseCredential(String),
    PerformDefaultHandling,
    CancelChallenge,
    RejectProtectionSpace,
}

/// Returns `None` to fall back to default handling.
pub type ChallengeHandler =
    Arc<dyn Fn(&AuthChallenge) -> Option<ChallengeDisposition> + Send + Sync>;

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// Factory for network tasks.
///
/// Lifecycle events are not returned from these methods; implementations
/// push them into the [`crate::EventSink`] they were constructed with.
pub trait Transport: Send + Sync + 'static {
    /// Identifier of a background transport. Background transports keep
    /// tasks alive across process relaunch.
    fn identifier(&self) -> Option<&str>;

    fn is_background(&self) -> bool {
        self.identifier().is_some()
    }

    /// Create a suspended task.
    fn create_task(&self, descriptor: TaskDescriptor) -> Arc<dyn NetworkTask>;

    /// Every task the transport still knows about, including tasks restored
    /// from a previous process.
    fn all_tasks(&self) -> impl Future<Output = Vec<Arc<dyn NetworkTask>>> + Send;

    /// Cancel every task and refuse new work.
    fn invalidate_and_cancel(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_len_covers_ranges() {
        assert_eq!(UploadBody::Empty.known_len(), Some(0));
        assert_eq!(UploadBody::data(vec![1u8, 2, 3]).known_len(), Some(3));
        assert_eq!(UploadBody::range("/tmp/a", 10, 25).known_len(), Some(15));
        assert_eq!(UploadBody::file("/tmp/a").known_len(), None);
    }

    #[test]
    fn header_lookup_ignores_case() {
        let descriptor = TaskDescriptor::download("https://content.example/2/files/download")
            .header("Api-Arg", "{}");
        assert_eq!(descriptor.header_value("api-arg"), Some("{}"));
        assert_eq!(descriptor.header_value("authorization"), None);
    }
}
