pub mod error;
pub mod files;
pub mod task;

pub use error::{BatchUploadError, CallError, ClientError};
pub use files::{
    CommitInfo, FileMetadata, FinishBatchEntry, FinishBatchResult, FinishArg, SessionCursor,
    StartResult, WriteMode,
};
pub use task::{TaskId, TaskKind};
