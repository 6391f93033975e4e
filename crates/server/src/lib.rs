// crates/server/src/lib.rs
//! fetchd server library.
//!
//! Wraps the external media-fetching tool in cancellable background jobs and
//! serves them over a small Axum HTTP API.

pub mod error;
pub mod jobs;
pub mod logging;
pub mod metrics;
pub mod routes;
pub mod state;

pub use error::*;
pub use jobs::{FetchError, JobOrchestrator};
pub use metrics::init_metrics;
pub use routes::api_routes;
pub use state::AppState;

use std::sync::Arc;

use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Create the Axum application around an existing orchestrator.
///
/// This sets up:
/// - API routes (jobs, downloads, health, metrics)
/// - CORS (allows any origin)
/// - Request tracing
pub fn create_app(orchestrator: Arc<JobOrchestrator>) -> Router {
    let state = AppState::new(orchestrator);

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .merge(api_routes(state))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}
