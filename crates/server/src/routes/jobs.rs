// crates/server/src/routes/jobs.rs
//! API routes for download jobs.
//!
//! - POST   /jobs              - Submit a download
//! - GET    /jobs/{id}         - Snapshot of one job
//! - GET    /jobs/{id}/stream  - SSE snapshots until the job ends
//! - POST   /jobs/{id}/cancel  - Request cancellation
//! - DELETE /jobs/{id}         - Purge a finished job and its file

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use fetchd_core::JobId;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;

use crate::error::{ApiError, ApiResult};
use crate::jobs::{CancelAck, JobStatus, JobView};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitRequest {
    #[serde(default)]
    pub url: String,
    #[serde(default, alias = "format_id")]
    pub format_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResponse {
    pub job_id: JobId,
    pub status: JobStatus,
}

/// POST /api/jobs - Validate and queue a download.
async fn submit_job(
    State(state): State<Arc<AppState>>,
    body: Result<Json<SubmitRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<SubmitResponse>)> {
    let Json(req) = body.map_err(|rejection| ApiError::BadRequest(rejection.body_text()))?;
    let job_id = state
        .orchestrator
        .submit(req.url.trim(), req.format_id.trim())?;
    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitResponse {
            job_id,
            status: JobStatus::Queued,
        }),
    ))
}

/// GET /api/jobs/{id}
async fn get_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<JobView>> {
    Ok(Json(state.orchestrator.snapshot(&id)?))
}

/// POST /api/jobs/{id}/cancel - Acknowledged immediately; the job reaches
/// `cancelled` asynchronously.
async fn cancel_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<(StatusCode, Json<CancelAck>)> {
    Ok((StatusCode::ACCEPTED, Json(state.orchestrator.cancel(&id)?)))
}

/// DELETE /api/jobs/{id}
async fn purge_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    state.orchestrator.purge(&id)?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /api/jobs/{id}/stream - SSE of job snapshots.
///
/// Emits the current snapshot first, then one event per change, and ends
/// after the first terminal snapshot.
async fn stream_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>>> {
    let (initial, mut rx) = state.orchestrator.subscribe(&id)?;
    let orchestrator = Arc::clone(&state.orchestrator);

    let stream = async_stream::stream! {
        let mut view = initial;
        loop {
            let terminal = view.status.is_terminal();
            yield Ok(snapshot_event(&view));
            if terminal {
                break;
            }
            view = match rx.recv().await {
                Ok(next) => next,
                Err(RecvError::Lagged(n)) => {
                    tracing::debug!(job_id = %view.id, skipped = n, "SSE client lagged; resending snapshot");
                    match orchestrator.snapshot(view.id.as_str()) {
                        Ok(current) => current,
                        Err(_) => break,
                    }
                }
                Err(RecvError::Closed) => break,
            };
        }
    };

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    ))
}

fn snapshot_event(view: &JobView) -> Event {
    let data = serde_json::to_string(view).unwrap_or_default();
    Event::default().event(view.status.as_str()).data(data)
}

/// Build the jobs router.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/jobs", post(submit_job))
        .route("/jobs/{id}", get(get_job).delete(purge_job))
        .route("/jobs/{id}/cancel", post(cancel_job))
        .route("/jobs/{id}/stream", get(stream_job))
}
