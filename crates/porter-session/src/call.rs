use std::collections::HashMap;
use std::marker::PhantomData;
use std::path::PathBuf;
use std::time::Duration;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use porter_types::{CallError, ClientError, TaskId};

use crate::reconnect::PersistedRequestInfo;
use crate::request::{LogicalRequest, ProgressHandler, TaskFailure, TaskResponse};

/// Header some content endpoints use to return the JSON result when the
/// body carries file bytes.
pub const RESULT_HEADER: &str = "dropbox-api-result";

/// A logical request whose response decodes into `R`.
pub struct Call<R> {
    request: LogicalRequest,
    _result: PhantomData<fn() -> R>,
}

impl<R> Clone for Call<R> {
    fn clone(&self) -> Self {
        Self {
            request: self.request.clone(),
            _result: PhantomData,
        }
    }
}

impl<R> std::fmt::Debug for Call<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Call").field(&self.request).finish()
    }
}

impl<R: DeserializeOwned> Call<R> {
    pub fn new(request: LogicalRequest) -> Self {
        Self {
            request,
            _result: PhantomData,
        }
    }

    pub fn request(&self) -> &LogicalRequest {
        &self.request
    }

    pub fn into_request(self) -> LogicalRequest {
        self.request
    }

    pub fn id(&self) -> TaskId {
        self.request.id()
    }

    pub fn cancel(&self) {
        self.request.cancel();
    }

    pub fn progress(self, handler: ProgressHandler) -> Self {
        self.request.set_progress_handler(handler);
        self
    }

    /// Store a caller string next to the persisted route so it survives
    /// relaunch. No effect on tasks without persisted route information.
    pub fn persisting_string(self, value: Option<String>) -> Self {
        let description = self.request.description();
        if let Ok(info) = PersistedRequestInfo::from_description(description.as_deref()) {
            match info.with_client_info(value).to_description() {
                Ok(description) => self.request.set_description(Some(description)),
                Err(err) => debug!(error = %err, "could not persist caller string"),
            }
        }
        self
    }

    pub async fn response(&self) -> Result<R, CallError> {
        let response = self.request.response().await.map_err(map_failure)?;
        decode(&response)
    }

    /// Response of a download call together with the delivered file.
    pub async fn response_with_file(&self) -> Result<(R, PathBuf), CallError> {
        let response = self.request.response().await.map_err(map_failure)?;
        let file = response.file.clone().ok_or_else(|| {
            CallError::Client(ClientError::UnexpectedState(
                "response carries no file".into(),
            ))
        })?;
        Ok((decode(&response)?, file))
    }
}

fn decode<R: DeserializeOwned>(response: &TaskResponse) -> Result<R, CallError> {
    let raw: &[u8] = match response.headers.get(RESULT_HEADER) {
        Some(header) => header.as_bytes(),
        None if response.body.is_empty() || response.file.is_some() => &b"null"[..],
        None => response.body.as_ref(),
    };
    serde_json::from_slice(raw).map_err(|err| CallError::Serialization(err.to_string()))
}

fn map_failure(failure: TaskFailure) -> CallError {
    match failure {
        TaskFailure::Client(err) => CallError::Client(err),
        TaskFailure::Status {
            status,
            headers,
            body,
        } => status_error(status, &headers, &body),
    }
}

/// Map a non-2xx response to a [`CallError`].
pub fn status_error(status: u16, headers: &HashMap<String, String>, body: &Bytes) -> CallError {
    let json: Option<Value> = serde_json::from_slice(body).ok();
    let summary = json
        .as_ref()
        .and_then(|v| v.get("error_summary"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| String::from_utf8_lossy(body).into_owned());
    let retry_after = json
        .as_ref()
        .and_then(|v| v.pointer("/error/retry_after"))
        .and_then(Value::as_u64)
        .or_else(|| headers.get("retry-after").and_then(|v| v.trim().parse().ok()))
        .map(Duration::from_secs);
    CallError::from_status(status, summary, retry_after)
}
