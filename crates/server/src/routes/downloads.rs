// crates/server/src/routes/downloads.rs
//! Artifact download endpoint.

use std::path::Path as FsPath;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, HeaderValue};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tokio_util::io::ReaderStream;

use crate::error::{ApiError, ApiResult};
use crate::jobs::FetchError;
use crate::state::AppState;

/// Content type by file extension; unknown types are served as raw bytes.
pub fn mime_for(path: &FsPath) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    match ext.as_str() {
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "mkv" => "video/x-matroska",
        "mp3" => "audio/mpeg",
        "m4a" => "audio/mp4",
        "opus" => "audio/opus",
        _ => "application/octet-stream",
    }
}

/// GET /api/downloads/{id} - Stream the finished artifact as an attachment.
async fn serve_download(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    let path = state.orchestrator.resolve_artifact(&id)?;
    let file = tokio::fs::File::open(&path).await.map_err(FetchError::Io)?;
    let len = file.metadata().await.map_err(FetchError::Io)?.len();

    let filename = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| ApiError::Internal(format!("unnamed artifact: {}", path.display())))?;
    let disposition = HeaderValue::from_str(&format!("attachment; filename=\"{filename}\""))
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    tracing::info!(job_id = %id, bytes = len, "serving artifact");
    Ok((
        [
            (header::CONTENT_TYPE, HeaderValue::from_static(mime_for(&path))),
            (header::CONTENT_DISPOSITION, disposition),
            (header::CONTENT_LENGTH, HeaderValue::from(len)),
        ],
        Body::from_stream(ReaderStream::new(file)),
    )
        .into_response())
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/downloads/{id}", get(serve_download))
}
