// crates/server/src/routes/mod.rs
//! API route handlers for the fetchd server.

pub mod downloads;
pub mod health;
pub mod jobs;
pub mod metrics;

use std::sync::Arc;

use axum::Router;

use crate::state::AppState;

/// Create the combined API router with all routes under /api prefix.
///
/// Routes:
/// - POST   /api/jobs - Submit a download job
/// - GET    /api/jobs/{id} - Job snapshot
/// - GET    /api/jobs/{id}/stream - SSE progress until the job ends
/// - POST   /api/jobs/{id}/cancel - Request cancellation
/// - DELETE /api/jobs/{id} - Purge a finished job and its file
/// - GET    /api/downloads/{id} - Download the finished artifact
/// - GET    /api/health - Tool, storage, and job health
/// - GET    /api/metrics - Prometheus metrics
pub fn api_routes(state: Arc<AppState>) -> Router {
    let api = jobs::router()
        .merge(downloads::router())
        .merge(health::router())
        .merge(metrics::router());
    Router::new().nest("/api", api).with_state(state)
}
