use serde::{Deserialize, Serialize};

/// Identifier the transport assigns to a network task.
///
/// Identifiers are unique within one transport instance and, for background
/// transports, stable across process relaunch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(pub u64);

impl TaskId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Shape of a network task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Request/response held in memory.
    Data,
    /// Request body streamed from memory or a file range.
    Upload,
    /// Response body written to a temporary file.
    Download,
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Data => write!(f, "data"),
            Self::Upload => write!(f, "upload"),
            Self::Download => write!(f, "download"),
        }
    }
}
