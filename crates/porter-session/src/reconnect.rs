//! Route information persisted in a task's description.
//!
//! Background transports keep a task's description across relaunch. The
//! coordinator stores `<sdk version><separator><json>` there so a relaunched
//! process can tell what kind of call a surviving task belongs to.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use porter_types::TaskId;

use crate::request::LogicalRequest;

pub const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

const SEPARATOR: &str = "#?///?#";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StandardInfo {
    pub original_sdk_version: String,
    pub route_namespace: String,
    pub route_name: String,
    pub client_provided_info: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadFileInfo {
    pub original_sdk_version: String,
    pub route_namespace: String,
    pub route_name: String,
    pub client_provided_info: Option<String>,
    pub destination: PathBuf,
    pub overwrite: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PersistedRequestInfo {
    Upload(StandardInfo),
    DownloadFile(DownloadFileInfo),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReconciliationErrorKind {
    #[error("task carries no persisted route information")]
    NoPersistedInfo,
    #[error("persisted by sdk version {found}, running {}", SDK_VERSION)]
    VersionMismatch { found: String },
    #[error("persisted route information is malformed")]
    BadPersistedStringFormat,
    #[error("could not decode persisted route information: {0}")]
    Decode(String),
}

/// A surviving task that could not be matched to a route.
#[derive(Debug, Clone, Error)]
#[error("task {task_id}: {kind}")]
pub struct ReconciliationError {
    pub task_id: TaskId,
    pub kind: ReconciliationErrorKind,
    pub description: Option<String>,
    /// The adopted request. Callers may still await or cancel it.
    pub request: LogicalRequest,
}

/// A surviving task together with the route it was created for.
#[derive(Debug, Clone)]
pub struct ReconnectedRequest {
    pub request: LogicalRequest,
    pub info: PersistedRequestInfo,
}

impl PersistedRequestInfo {
    pub fn upload(route_namespace: impl Into<String>, route_name: impl Into<String>) -> Self {
        Self::Upload(StandardInfo {
            original_sdk_version: SDK_VERSION.to_string(),
            route_namespace: route_namespace.into(),
            route_name: route_name.into(),
            client_provided_info: None,
        })
    }

    pub fn download_file(
        route_namespace: impl Into<String>,
        route_name: impl Into<String>,
        destination: impl Into<PathBuf>,
        overwrite: bool,
    ) -> Self {
        Self::DownloadFile(DownloadFileInfo {
            original_sdk_version: SDK_VERSION.to_string(),
            route_namespace: route_namespace.into(),
            route_name: route_name.into(),
            client_provided_info: None,
            destination: destination.into(),
            overwrite,
        })
    }

    pub fn route_namespace(&self) -> &str {
        match self {
            Self::Upload(info) => &info.route_namespace,
            Self::DownloadFile(info) => &info.route_namespace,
        }
    }

    pub fn route_name(&self) -> &str {
        match self {
            Self::Upload(info) => &info.route_name,
            Self::DownloadFile(info) => &info.route_name,
        }
    }

    pub fn client_provided_info(&self) -> Option<&str> {
        match self {
            Self::Upload(info) => info.client_provided_info.as_deref(),
            Self::DownloadFile(info) => info.client_provided_info.as_deref(),
        }
    }

    pub fn with_client_info(mut self, client_info: Option<String>) -> Self {
        match &mut self {
            Self::Upload(info) => info.client_provided_info = client_info,
            Self::DownloadFile(info) => info.client_provided_info = client_info,
        }
        self
    }

    /// Encode for storage in a task description.
    pub fn to_description(&self) -> Result<String, serde_json::Error> {
        let json = serde_json::to_string(self)?;
        Ok(format!("{SDK_VERSION}{SEPARATOR}{json}"))
    }

    pub fn from_description(description: Option<&str>) -> Result<Self, ReconciliationErrorKind> {
        let description = description
            .filter(|d| !d.is_empty())
            .ok_or(ReconciliationErrorKind::NoPersistedInfo)?;
        let (version, json) = description
            .split_once(SEPARATOR)
            .ok_or(ReconciliationErrorKind::BadPersistedStringFormat)?;
        if version != SDK_VERSION {
            return Err(ReconciliationErrorKind::VersionMismatch {
                found: version.to_string(),
            });
        }
        serde_json::from_str(json).map_err(|err| ReconciliationErrorKind::Decode(err.to_string()))
    }
}
