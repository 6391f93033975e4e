// crates/server/src/routes/health.rs
//! Health check endpoint for the API.

use std::sync::Arc;

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use serde::Serialize;

use crate::jobs::{HealthReport, HealthStatus};
use crate::state::AppState;

/// Response for the health check endpoint.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    #[serde(flatten)]
    pub report: HealthReport,
    pub version: String,
    pub uptime_secs: u64,
}

/// GET /api/health - Health check endpoint.
///
/// 200 when the tool, the download directory, and free disk space are all
/// fine; 503 (with the same body) otherwise.
pub async fn health_check(
    State(state): State<Arc<AppState>>,
) -> (StatusCode, Json<HealthResponse>) {
    let report = state.orchestrator.health().await;
    let code = match report.status {
        HealthStatus::Healthy => StatusCode::OK,
        HealthStatus::Degraded => StatusCode::SERVICE_UNAVAILABLE,
    };
    (
        code,
        Json(HealthResponse {
            report,
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_secs: state.uptime_secs(),
        }),
    )
}

/// Create the health routes router.
pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/health", get(health_check))
}
