use std::time::Duration;

use thiserror::Error;

/// Failures that happen on this side of the wire.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    #[error("file access error: {0}")]
    FileAccess(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("request cancelled")]
    Cancelled,

    #[error("unexpected state: {0}")]
    UnexpectedState(String),
}

/// Outcome of a failed API call.
///
/// Variants mirror the HTTP status classes the API uses; see
/// [`CallError::from_status`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    #[error("internal server error {code}: {message}")]
    InternalServer { code: u16, message: String },

    #[error("bad input: {0}")]
    BadInput(String),

    #[error("rate limited, retry after {}s", .retry_after.as_secs())]
    RateLimit { retry_after: Duration, summary: String },

    #[error("http error {code}: {message}")]
    Http { code: u16, message: String },

    #[error("auth error: {0}")]
    Auth(String),

    #[error("access error: {0}")]
    Access(String),

    #[error("route error: {0}")]
    Route(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error(transparent)]
    Client(#[from] ClientError),
}

impl CallError {
    /// Map a non-2xx response to an error.
    ///
    /// `retry_after` is only consulted for 429 responses.
    pub fn from_status(code: u16, summary: String, retry_after: Option<Duration>) -> Self {
        match code {
            500..=599 => Self::InternalServer { code, message: summary },
            400 => Self::BadInput(summary),
            401 => Self::Auth(summary),
            403 => Self::Access(summary),
            409 => Self::Route(summary),
            429 => Self::RateLimit {
                retry_after: retry_after.unwrap_or(Duration::from_secs(1)),
                summary,
            },
            _ => Self::Http { code, message: summary },
        }
    }

    /// Server-requested backoff, if this is a rate-limit error.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimit { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Client(ClientError::Cancelled))
    }
}

/// Error attached to one file of a batch, or to the batch commit itself.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BatchUploadError {
    /// Copying the source into the job's staging area failed. Never retried.
    #[error("staging failed: {0}")]
    Staging(ClientError),

    #[error("upload session start failed: {0}")]
    Start(CallError),

    #[error("upload session append failed: {0}")]
    Append(CallError),

    /// The batch commit failed; per-file uploads may exist remotely without
    /// any committed file.
    #[error("batch finish failed: {0}")]
    Finish(CallError),

    #[error("batch cancelled")]
    Cancelled,
}
