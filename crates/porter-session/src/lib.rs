//! Porter session layer: network tasks matched to logical requests.
//!
//! - `Transport` creates tasks and reports their lifecycle through an
//!   `EventSink`
//! - `SessionCoordinator` registers every task before it starts and routes
//!   events to the owning `LogicalRequest`
//! - Tasks that outlive the process are adopted and handed back through
//!   reconciliation, with their persisted route decoded
//! - `Call<T>` turns a finished request into a typed result or `CallError`

pub mod call;
pub mod coordinator;
pub mod event;
pub mod http;
pub mod journal;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
pub mod noop;
pub mod reconnect;
pub mod registry;
pub mod request;
pub mod transport;

pub use call::Call;
pub use coordinator::{CoordinatorOptions, SessionCoordinator};
pub use event::{EventSink, TransportEvent, TransportEvents, event_channel};
pub use http::{CredentialProvider, HttpTransport, HttpTransportConfig, TransportSetupError};
pub use reconnect::{
    PersistedRequestInfo, ReconciliationError, ReconciliationErrorKind, ReconnectedRequest,
};
pub use registry::TaskRegistry;
pub use request::{LogicalRequest, Progress, RequestPhase, TaskFailure, TaskResponse};
pub use transport::{
    AuthChallenge, ChallengeDisposition, NetworkTask, TaskDescriptor, TaskOutcome, Transport,
    UploadBody,
};
