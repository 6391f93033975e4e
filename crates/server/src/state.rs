// crates/server/src/state.rs
//! Application state for the Axum server.

use std::sync::Arc;
use std::time::Instant;

use crate::jobs::JobOrchestrator;

/// Shared application state accessible from all route handlers.
pub struct AppState {
    /// Server start time for uptime tracking.
    pub start_time: Instant,
    /// The one orchestrator owning every job in this process.
    pub orchestrator: Arc<JobOrchestrator>,
}

impl AppState {
    /// Create a new application state wrapped in an Arc for sharing.
    pub fn new(orchestrator: Arc<JobOrchestrator>) -> Arc<Self> {
        Arc::new(Self {
            start_time: Instant::now(),
            orchestrator,
        })
    }

    /// Get the server uptime in seconds.
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
