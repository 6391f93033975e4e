// crates/server/src/jobs/error.rs
use fetchd_core::ValidationError;
use thiserror::Error;

use super::types::JobStatus;

/// Errors returned by [`JobOrchestrator`](super::JobOrchestrator) operations.
///
/// Job failures are not errors here: they end up in the job record.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("invalid input: {0}")]
    InvalidInput(#[from] ValidationError),

    #[error("job queue is full")]
    Capacity,

    #[error("orchestrator is shutting down")]
    ShuttingDown,

    #[error("job not found: {0}")]
    NotFound(String),

    #[error("job already {0}")]
    AlreadyTerminal(JobStatus),

    #[error("artifact not ready: job is {0}")]
    NotReady(JobStatus),

    #[error("job is still {0}")]
    NotTerminal(JobStatus),

    #[error("artifact path rejected")]
    PathEscape,

    #[error("storage error: {0}")]
    Io(#[from] std::io::Error),
}
