// crates/server/src/jobs/state.rs
//! Mutable state for a single download job.

use std::path::PathBuf;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use fetchd_core::{FailureKind, JobId, ProgressUpdate};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use super::types::{JobStatus, JobView};

/// Fields that change over a job's life. Status and progress live under the
/// same lock so a snapshot is never torn.
#[derive(Debug)]
struct RecordFields {
    status: JobStatus,
    percent: f64,
    speed: Option<String>,
    eta: Option<String>,
    failure: Option<FailureKind>,
    completed_at: Option<DateTime<Utc>>,
    output_path: Option<PathBuf>,
}

/// Per-job state container.
///
/// Only the job's worker drives transitions; any number of readers may take
/// snapshots. Every transition method returns `false` (and changes nothing)
/// when the edge is not allowed from the current status.
pub struct JobRecord {
    id: JobId,
    source: String,
    format: String,
    created_at: DateTime<Utc>,
    fields: RwLock<RecordFields>,
    cancel: CancellationToken,
    updates_tx: broadcast::Sender<JobView>,
}

/// Returned by [`JobRecord::request_cancel`] for a job that already ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlreadyTerminal(pub JobStatus);

impl JobRecord {
    pub fn new(id: JobId, source: String, format: String) -> Self {
        let (updates_tx, _) = broadcast::channel(64);
        Self {
            id,
            source,
            format,
            created_at: Utc::now(),
            fields: RwLock::new(RecordFields {
                status: JobStatus::Queued,
                percent: 0.0,
                speed: None,
                eta: None,
                failure: None,
                completed_at: None,
                output_path: None,
            }),
            cancel: CancellationToken::new(),
            updates_tx,
        }
    }

    pub fn id(&self) -> &JobId {
        &self.id
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn format(&self) -> &str {
        &self.format
    }

    pub fn status(&self) -> JobStatus {
        self.read_fields().status
    }

    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.read_fields().completed_at
    }

    /// Artifact location, present only once the job is complete.
    pub fn output_path(&self) -> Option<PathBuf> {
        self.read_fields().output_path.clone()
    }

    /// Token observed by the worker. Cancelling it is the only way a request
    /// handler influences a running job.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Record a cancel request. Idempotent for `queued`, `running` and
    /// `cancelling`; a terminal job is left untouched.
    pub fn request_cancel(&self) -> Result<JobStatus, AlreadyTerminal> {
        let fields = self.write_fields();
        if fields.status.is_terminal() {
            return Err(AlreadyTerminal(fields.status));
        }
        self.cancel.cancel();
        self.publish(&fields);
        Ok(fields.status)
    }

    /// `queued -> running`, once a slot has been acquired.
    pub fn mark_running(&self) -> bool {
        self.transition(JobStatus::Running, |_| {})
    }

    /// Merge recognised progress fields. Only applies while running; the
    /// percentage never moves backwards and absent fields keep their value.
    pub fn apply_progress(&self, update: &ProgressUpdate) -> bool {
        if update.is_empty() {
            return false;
        }
        let mut fields = self.write_fields();
        if fields.status != JobStatus::Running {
            return false;
        }
        if let Some(percent) = update.percent {
            fields.percent = fields.percent.max(percent);
        }
        if let Some(speed) = &update.speed {
            fields.speed = Some(speed.clone());
        }
        if let Some(eta) = &update.eta {
            fields.eta = Some(eta.clone());
        }
        self.publish(&fields);
        true
    }

    /// `running -> cancelling`, right before the child is terminated.
    pub fn begin_cancelling(&self) -> bool {
        self.transition(JobStatus::Cancelling, |_| {})
    }

    /// `queued | cancelling -> cancelled`.
    pub fn mark_cancelled(&self) -> bool {
        self.transition(JobStatus::Cancelled, |_| {})
    }

    /// `running -> complete` with the located artifact.
    pub fn complete(&self, path: PathBuf) -> bool {
        self.transition(JobStatus::Complete, |fields| {
            fields.percent = 100.0;
            fields.eta = None;
            fields.output_path = Some(path);
        })
    }

    /// `queued | running -> failed`.
    pub fn fail(&self, failure: FailureKind) -> bool {
        self.transition(JobStatus::Failed, |fields| {
            fields.failure = Some(failure);
        })
    }

    /// Current snapshot plus a receiver for every later change.
    ///
    /// Both are taken under one read lock, so the receiver never yields a
    /// view older than the returned snapshot.
    pub fn subscribe(&self) -> (JobView, broadcast::Receiver<JobView>) {
        let fields = self.read_fields();
        let rx = self.updates_tx.subscribe();
        (self.view(&fields), rx)
    }

    pub fn snapshot(&self) -> JobView {
        self.view(&self.read_fields())
    }

    fn view(&self, fields: &RecordFields) -> JobView {
        JobView {
            id: self.id.clone(),
            status: fields.status,
            progress_percent: fields.percent,
            speed_text: fields.speed.clone(),
            eta_text: fields.eta.clone(),
            error_detail: fields.failure.as_ref().map(|f| f.to_string()),
            cancel_requested: self.cancel.is_cancelled(),
            created_at: self.created_at,
            completed_at: fields.completed_at,
        }
    }

    /// Whether this job ended before `cutoff`.
    pub fn expired_before(&self, cutoff: DateTime<Utc>) -> bool {
        let fields = self.read_fields();
        fields.status.is_terminal() && fields.completed_at.is_some_and(|t| t < cutoff)
    }

    fn transition(&self, next: JobStatus, apply: impl FnOnce(&mut RecordFields)) -> bool {
        let mut fields = self.write_fields();
        if !fields.status.can_transition_to(next) {
            tracing::debug!(
                job_id = %self.id,
                from = %fields.status,
                to = %next,
                "ignored disallowed status transition"
            );
            return false;
        }
        fields.status = next;
        apply(&mut fields);
        if next.is_terminal() {
            fields.completed_at = Some(Utc::now());
        }
        self.publish(&fields);
        true
    }

    /// Send a view of `fields` to subscribers. Callers hold the write lock,
    /// which keeps sends in the same order as the changes they describe.
    fn publish(&self, fields: &RecordFields) {
        // No subscribers is fine.
        let _ = self.updates_tx.send(self.view(fields));
    }

    fn read_fields(&self) -> RwLockReadGuard<'_, RecordFields> {
        self.fields.read().unwrap_or_else(|e| {
            tracing::error!(job_id = %self.id, "RwLock poisoned reading job record: {e}");
            e.into_inner()
        })
    }

    fn write_fields(&self) -> RwLockWriteGuard<'_, RecordFields> {
        self.fields.write().unwrap_or_else(|e| {
            tracing::error!(job_id = %self.id, "RwLock poisoned writing job record: {e}");
            e.into_inner()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fetchd_core::ToolFailure;

    fn record() -> JobRecord {
        JobRecord::new(
            JobId::generate(),
            "https://youtu.be/dQw4w9WgXcQ".to_string(),
            "18".to_string(),
        )
    }

    fn percent(p: f64) -> ProgressUpdate {
        ProgressUpdate {
            percent: Some(p),
            ..Default::default()
        }
    }

    #[test]
    fn test_record_lifecycle() {
        let rec = record();
        let snap = rec.snapshot();
        assert_eq!(snap.status, JobStatus::Queued);
        assert_eq!(snap.progress_percent, 0.0);
        assert!(snap.completed_at.is_none());

        assert!(rec.mark_running());
        assert!(rec.apply_progress(&percent(10.0)));
        assert!(rec.complete(PathBuf::from("/srv/downloads/x.mp4")));

        let snap = rec.snapshot();
        assert_eq!(snap.status, JobStatus::Complete);
        assert_eq!(snap.progress_percent, 100.0);
        assert!(snap.completed_at.is_some());
        assert_eq!(rec.output_path(), Some(PathBuf::from("/srv/downloads/x.mp4")));
    }

    #[test]
    fn test_terminal_records_never_transition_again() {
        let rec = record();
        assert!(rec.mark_running());
        assert!(rec.fail(FailureKind::Timeout));
        let completed_at = rec.completed_at();

        assert!(!rec.complete(PathBuf::from("/tmp/x.mp4")));
        assert!(!rec.fail(FailureKind::ArtifactMissing));
        assert!(!rec.mark_cancelled());
        assert!(!rec.apply_progress(&percent(50.0)));

        assert_eq!(rec.status(), JobStatus::Failed);
        assert_eq!(rec.completed_at(), completed_at);
        assert_eq!(rec.output_path(), None);
        assert_eq!(rec.snapshot().error_detail.as_deref(), Some("Download timed out"));
    }

    #[test]
    fn test_progress_is_monotonic_and_merges_fields() {
        let rec = record();
        rec.mark_running();
        rec.apply_progress(&ProgressUpdate {
            percent: Some(40.0),
            speed: Some("1MiB/s".into()),
            eta: Some("00:10".into()),
        });
        rec.apply_progress(&percent(12.0));

        let snap = rec.snapshot();
        assert_eq!(snap.progress_percent, 40.0);
        assert_eq!(snap.speed_text.as_deref(), Some("1MiB/s"));
        assert_eq!(snap.eta_text.as_deref(), Some("00:10"));

        assert!(!rec.apply_progress(&ProgressUpdate::default()));
        assert_eq!(rec.snapshot(), snap);
    }

    #[test]
    fn test_progress_ignored_unless_running() {
        let rec = record();
        assert!(!rec.apply_progress(&percent(5.0)));
        assert_eq!(rec.snapshot().progress_percent, 0.0);
    }

    #[test]
    fn test_cancel_request_on_terminal_job_has_no_effect() {
        let rec = record();
        rec.mark_running();
        rec.fail(ToolFailure::Unavailable.into());

        assert_eq!(rec.request_cancel(), Err(AlreadyTerminal(JobStatus::Failed)));
        assert!(!rec.is_cancel_requested());
    }

    #[test]
    fn test_cancel_request_is_idempotent() {
        let rec = record();
        assert_eq!(rec.request_cancel(), Ok(JobStatus::Queued));
        assert_eq!(rec.request_cancel(), Ok(JobStatus::Queued));
        assert!(rec.is_cancel_requested());
        assert!(rec.snapshot().cancel_requested);
    }

    #[test]
    fn test_cancel_path() {
        let rec = record();
        rec.mark_running();
        assert!(!rec.mark_cancelled(), "running cannot jump straight to cancelled");
        assert!(rec.begin_cancelling());
        assert!(rec.mark_cancelled());
        assert_eq!(rec.status(), JobStatus::Cancelled);
        assert!(rec.completed_at().is_some());
    }

    #[test]
    fn test_expired_before() {
        let rec = record();
        assert!(!rec.expired_before(Utc::now() + chrono::Duration::hours(1)));
        rec.mark_cancelled();
        assert!(rec.expired_before(Utc::now() + chrono::Duration::hours(1)));
        assert!(!rec.expired_before(Utc::now() - chrono::Duration::hours(1)));
    }

    #[tokio::test]
    async fn test_subscribers_see_transitions() {
        let rec = record();
        let (initial, mut rx) = rec.subscribe();
        assert_eq!(initial.status, JobStatus::Queued);
        rec.mark_running();
        rec.apply_progress(&percent(20.0));

        assert_eq!(rx.recv().await.unwrap().status, JobStatus::Running);
        assert_eq!(rx.recv().await.unwrap().progress_percent, 20.0);
    }

    #[test]
    fn test_published_progress_stays_ordered_under_cancel_requests() {
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::sync::Arc;
        use tokio::sync::broadcast::error::TryRecvError;

        let rec = Arc::new(record());
        rec.mark_running();
        let (initial, mut rx) = rec.subscribe();
        let done = Arc::new(AtomicBool::new(false));

        let writer = {
            let rec = Arc::clone(&rec);
            let done = Arc::clone(&done);
            std::thread::spawn(move || {
                for i in 1..=20_000u32 {
                    rec.apply_progress(&percent(f64::from(i) / 200.0));
                }
                done.store(true, Ordering::SeqCst);
            })
        };
        let canceller = {
            let rec = Arc::clone(&rec);
            let done = Arc::clone(&done);
            std::thread::spawn(move || {
                while !done.load(Ordering::SeqCst) {
                    let _ = rec.request_cancel();
                }
            })
        };

        let mut last = initial.progress_percent;
        let mut received = 0usize;
        loop {
            match rx.try_recv() {
                Ok(view) => {
                    assert!(
                        view.progress_percent >= last,
                        "progress went from {last} to {}",
                        view.progress_percent
                    );
                    last = view.progress_percent;
                    received += 1;
                }
                Err(TryRecvError::Lagged(_)) => {}
                Err(TryRecvError::Empty) if done.load(Ordering::SeqCst) => break,
                Err(TryRecvError::Empty) => std::thread::yield_now(),
                Err(TryRecvError::Closed) => break,
            }
        }

        writer.join().unwrap();
        canceller.join().unwrap();
        while let Ok(view) = rx.try_recv() {
            assert!(view.progress_percent >= last);
            last = view.progress_percent;
        }
        assert!(received > 0);
        assert!(rec.is_cancel_requested());
        assert_eq!(rec.snapshot().progress_percent, 100.0);
    }
}
