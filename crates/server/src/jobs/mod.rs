// crates/server/src/jobs/mod.rs
//! Background download jobs.
//!
//! Provides:
//! - `JobOrchestrator` - registry, concurrency gate, cancel/resolve/purge, expiry sweep
//! - `JobRecord` - per-job state with snapshot and subscribe
//! - `Worker` - drives one job's subprocess to a terminal status
//! - `JobView` - serializable snapshot for polling and SSE

pub mod error;
pub mod runner;
pub mod state;
pub mod types;
pub mod worker;

pub use error::FetchError;
pub use runner::{HealthReport, HealthStatus, JobOrchestrator, SweepReport};
pub use state::JobRecord;
pub use types::{CancelAck, JobStatus, JobView};
pub use worker::Worker;
