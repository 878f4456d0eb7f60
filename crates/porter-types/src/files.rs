use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// -- Commit metadata --

/// How a committed file resolves a conflict with an existing remote file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = ".tag", content = "update", rename_all = "snake_case")]
pub enum WriteMode {
    #[default]
    Add,
    Overwrite,
    /// Overwrite only if the remote revision still matches.
    Update(String),
}

/// Destination metadata for one uploaded file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitInfo {
    pub path: String,
    #[serde(default)]
    pub mode: WriteMode,
    #[serde(default)]
    pub autorename: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_modified: Option<DateTime<Utc>>,
    #[serde(default)]
    pub mute: bool,
    #[serde(default)]
    pub strict_conflict: bool,
}

impl CommitInfo {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            mode: WriteMode::Add,
            autorename: false,
            client_modified: None,
            mute: false,
            strict_conflict: false,
        }
    }
}

// -- Upload sessions --

/// Position of the next chunk in a multi-chunk upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCursor {
    pub session_id: String,
    pub offset: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartResult {
    pub session_id: String,
}

/// One entry of the batch commit: where the session ended and where the
/// file should land.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinishArg {
    pub cursor: SessionCursor,
    pub commit: CommitInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
}

// -- Batch finish results --

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub name: String,
    pub path_display: String,
    pub id: String,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
}

/// Per-file outcome reported by the batch commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = ".tag", rename_all = "snake_case")]
pub enum FinishBatchEntry {
    Success(FileMetadata),
    Failure { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinishBatchResult {
    pub entries: Vec<FinishBatchEntry>,
}
