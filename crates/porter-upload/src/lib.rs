//! Porter batch upload: many files, chunked upload sessions, one commit.
//!
//! - Each file is copied into a job-scoped staging area, then uploaded on
//!   its own task through `upload_session/start` and `append_v2`
//! - Rate-limited appends sleep for the server's `retry_after` and retry
//! - Once every file is done, one `finish_batch_v2` call commits them all,
//!   sorted by destination path
//! - Failures are reported per file; the commit's own failure is separate

pub mod barrier;
pub mod batch;
pub mod chunking;
pub mod content_hash;
pub mod progress;
pub mod routes;
pub mod staging;
pub mod state;

pub use batch::{
    BatchConfig, BatchOutcome, BatchUploader, DEFAULT_CHUNK_SIZE, DEFAULT_MAX_RETRIES, JobHandle,
    MisuseError,
};
pub use chunking::{Chunk, ChunkPlan};
pub use progress::{BatchProgress, ProgressHandler};
pub use routes::{ApiRoutes, RouteConfig, UploadSessionRoutes};
pub use state::{UploadPhase, UploadSessionState};
