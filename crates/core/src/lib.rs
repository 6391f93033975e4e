// crates/core/src/lib.rs
pub mod config;
pub mod error;
pub mod ids;
pub mod progress;
pub mod store;
pub mod tool;
pub mod validate;

pub use config::FetchConfig;
pub use error::*;
pub use ids::JobId;
pub use progress::{parse_progress_line, ProgressUpdate};
pub use store::{ArtifactStore, CleanupReport};
pub use tool::{classify_failure, DownloadRequest, FetchTool, ToolProbe};
pub use validate::{is_valid_job_id, validate_format_id, validate_locator, HostPolicy};
