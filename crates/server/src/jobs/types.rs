// crates/server/src/jobs/types.rs
//! Types for the download job system.

use chrono::{DateTime, Utc};
use fetchd_core::JobId;
use serde::Serialize;

/// Lifecycle of a download job. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Cancelling,
    Cancelled,
    Complete,
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Cancelling => "cancelling",
            Self::Cancelled => "cancelled",
            Self::Complete => "complete",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Cancelled | Self::Complete | Self::Failed)
    }

    /// Whether `self -> next` is an allowed edge of the lifecycle graph.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Queued, Running)
                | (Queued, Cancelled)
                | (Queued, Failed)
                | (Running, Cancelling)
                | (Running, Complete)
                | (Running, Failed)
                | (Cancelling, Cancelled)
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable snapshot of one job, sent to pollers and SSE subscribers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobView {
    pub id: JobId,
    pub status: JobStatus,
    pub progress_percent: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eta_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// Acknowledgement of a cancel request. Cancellation itself is asynchronous.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelAck {
    pub id: JobId,
    /// Status observed when the request was recorded.
    pub status: JobStatus,
}
