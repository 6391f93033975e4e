// crates/server/src/error.rs
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::jobs::FetchError;

/// Structured JSON error response for API errors
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct ErrorResponse {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            details: None,
        }
    }

    pub fn with_details(error: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            details: Some(details.into()),
        }
    }
}

/// API error types that map to HTTP status codes
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_response) = match &self {
            ApiError::Fetch(err) => fetch_error_response(err),
            ApiError::BadRequest(msg) => {
                tracing::warn!(message = %msg, "Bad request");
                (
                    StatusCode::BAD_REQUEST,
                    ErrorResponse::with_details("Bad request", msg.clone()),
                )
            }
            ApiError::Internal(msg) => {
                tracing::error!(message = %msg, "Internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorResponse::new("Internal server error"),
                )
            }
        };

        (status, Json(error_response)).into_response()
    }
}

fn fetch_error_response(err: &FetchError) -> (StatusCode, ErrorResponse) {
    match err {
        FetchError::InvalidInput(reason) => {
            tracing::warn!(reason = %reason, "Invalid input");
            (
                StatusCode::BAD_REQUEST,
                ErrorResponse::with_details("Invalid input", reason.to_string()),
            )
        }
        FetchError::NotFound(id) => (
            StatusCode::NOT_FOUND,
            ErrorResponse::with_details("Job not found", format!("Job ID: {id}")),
        ),
        FetchError::AlreadyTerminal(status) => (
            StatusCode::CONFLICT,
            ErrorResponse::with_details("Job already finished", format!("Status: {status}")),
        ),
        FetchError::NotReady(status) => (
            StatusCode::CONFLICT,
            ErrorResponse::with_details("Download not ready", format!("Status: {status}")),
        ),
        FetchError::NotTerminal(status) => (
            StatusCode::CONFLICT,
            ErrorResponse::with_details("Job still active", format!("Status: {status}")),
        ),
        FetchError::Capacity => {
            tracing::warn!("Job queue full");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                ErrorResponse::new("Server busy, try again later"),
            )
        }
        FetchError::ShuttingDown => (
            StatusCode::SERVICE_UNAVAILABLE,
            ErrorResponse::new("Server shutting down"),
        ),
        FetchError::PathEscape => {
            tracing::error!("Refused to serve artifact outside the download directory");
            (
                StatusCode::BAD_REQUEST,
                ErrorResponse::new("Invalid download"),
            )
        }
        FetchError::Io(source) => {
            tracing::error!(error = %source, "Storage error");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorResponse::new("Storage error"),
            )
        }
    }
}

/// Result type alias for API handlers
pub type ApiResult<T> = Result<T, ApiError>;
