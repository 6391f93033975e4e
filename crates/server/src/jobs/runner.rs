// crates/server/src/jobs/runner.rs
//! Central orchestrator that owns every download job.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use fetchd_core::{
    validate_format_id, validate_locator, ArtifactStore, ConfigError, FailureKind, FetchConfig,
    FetchTool, JobId, ResolveError, ToolProbe,
};
use serde::Serialize;
use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::error::FetchError;
use super::state::JobRecord;
use super::types::{CancelAck, JobStatus, JobView};
use super::worker::Worker;
use crate::metrics::{adjust_running_jobs, record_job_finished, record_job_submitted, record_sweep};

/// Outcome of one expiry sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub jobs_removed: usize,
    pub files_removed: usize,
    pub files_failed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
}

/// Health of the orchestrator and the resources it depends on.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: HealthStatus,
    pub tool: ToolProbe,
    pub download_dir: bool,
    pub disk_space: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub free_disk_bytes: Option<u64>,
    pub active_jobs: usize,
}

/// Owns the job registry, the concurrency gate, and the sweep.
///
/// One instance per process, shared through `Arc`. `submit` never waits on a
/// job; everything else reads or flags records without blocking on a child.
pub struct JobOrchestrator {
    config: FetchConfig,
    tool: Arc<FetchTool>,
    store: Arc<ArtifactStore>,
    worker: Arc<Worker>,
    jobs: RwLock<HashMap<JobId, Arc<JobRecord>>>,
    slots: Arc<Semaphore>,
    /// Submitted jobs whose task has not yet finished.
    in_flight: Arc<AtomicUsize>,
    shutdown: CancellationToken,
}

impl JobOrchestrator {
    /// Open the managed directory and build the orchestrator.
    pub fn new(config: FetchConfig) -> Result<Self, ConfigError> {
        let store = ArtifactStore::open(&config.download_dir).map_err(|source| {
            ConfigError::DownloadDir {
                path: config.download_dir.clone(),
                source,
            }
        })?;
        let store = Arc::new(store);
        let tool = Arc::new(FetchTool::new(&config.tool_path));
        let worker = Arc::new(Worker::new(
            Arc::clone(&tool),
            Arc::clone(&store),
            config.job_timeout,
            config.kill_grace,
        ));

        Ok(Self {
            slots: Arc::new(Semaphore::new(config.max_concurrent)),
            config,
            tool,
            store,
            worker,
            jobs: RwLock::new(HashMap::new()),
            in_flight: Arc::new(AtomicUsize::new(0)),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &FetchConfig {
        &self.config
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    pub fn tool(&self) -> &FetchTool {
        &self.tool
    }

    /// Validate inputs, register a `queued` job, and hand it to the pool.
    ///
    /// Must be called from within a tokio runtime.
    pub fn submit(&self, source: &str, format: &str) -> Result<JobId, FetchError> {
        let source = validate_locator(source, &self.config.allowed_hosts)?;
        let format = validate_format_id(format)?.to_string();
        if self.shutdown.is_cancelled() {
            return Err(FetchError::ShuttingDown);
        }

        let limit = self
            .config
            .queue_capacity
            .map(|cap| cap.saturating_add(self.config.max_concurrent));
        self.in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| match limit {
                Some(limit) if n >= limit => None,
                _ => Some(n + 1),
            })
            .map_err(|_| {
                tracing::warn!(limit = ?limit, "rejecting submission: job queue is full");
                FetchError::Capacity
            })?;

        let record = {
            let mut jobs = self.write_jobs();
            let mut id = JobId::generate();
            while jobs.contains_key(&id) {
                tracing::warn!(job_id = %id, "job id collision; regenerating");
                id = JobId::generate();
            }
            let record = Arc::new(JobRecord::new(id.clone(), source, format));
            jobs.insert(id, Arc::clone(&record));
            record
        };
        tracing::info!(job_id = %record.id(), source = record.source(), format = record.format(), "job queued");
        record_job_submitted();

        let slots = Arc::clone(&self.slots);
        let worker = Arc::clone(&self.worker);
        let in_flight = Arc::clone(&self.in_flight);
        let task_record = Arc::clone(&record);
        tokio::spawn(async move {
            run_queued(task_record, slots, worker).await;
            in_flight.fetch_sub(1, Ordering::SeqCst);
        });

        Ok(record.id().clone())
    }

    /// Immutable copy of a job's status and progress.
    pub fn snapshot(&self, id: &str) -> Result<JobView, FetchError> {
        Ok(self.lookup(id)?.snapshot())
    }

    /// Ask a job to stop. The worker observes the request asynchronously.
    pub fn cancel(&self, id: &str) -> Result<CancelAck, FetchError> {
        let record = self.lookup(id)?;
        let status = record
            .request_cancel()
            .map_err(|terminal| FetchError::AlreadyTerminal(terminal.0))?;
        tracing::info!(job_id = %record.id(), status = %status, "cancel requested");
        Ok(CancelAck {
            id: record.id().clone(),
            status,
        })
    }

    /// On-disk artifact of a `complete` job.
    pub fn resolve_artifact(&self, id: &str) -> Result<PathBuf, FetchError> {
        let record = self.lookup(id)?;
        let status = record.status();
        if status != JobStatus::Complete {
            return Err(FetchError::NotReady(status));
        }
        self.store
            .resolve(record.id().as_str())
            .map_err(|e| match e {
                ResolveError::InvalidId => FetchError::NotFound(id.to_string()),
                ResolveError::NotFound { id } => FetchError::NotFound(id),
                ResolveError::PathEscape { .. } => FetchError::PathEscape,
                ResolveError::Io { source, .. } => FetchError::Io(source),
            })
    }

    /// Remove a terminal job and its files immediately.
    pub fn purge(&self, id: &str) -> Result<(), FetchError> {
        let job_id = JobId::parse(id)?;
        let record = {
            let mut jobs = self.write_jobs();
            let record = jobs
                .get(&job_id)
                .cloned()
                .ok_or_else(|| FetchError::NotFound(id.to_string()))?;
            let status = record.status();
            if !status.is_terminal() {
                return Err(FetchError::NotTerminal(status));
            }
            jobs.remove(&job_id);
            record
        };
        self.discard_files(&record);
        tracing::info!(job_id = %record.id(), "job purged");
        Ok(())
    }

    /// Drop terminal jobs that ended more than `retention` ago, with their files.
    pub fn sweep_expired(&self, retention: Duration) -> SweepReport {
        self.sweep_expired_at(Utc::now(), retention)
    }

    /// [`sweep_expired`](Self::sweep_expired) against an explicit clock.
    pub fn sweep_expired_at(&self, now: DateTime<Utc>, retention: Duration) -> SweepReport {
        let mut report = SweepReport::default();
        let Some(cutoff) = chrono::Duration::from_std(retention)
            .ok()
            .and_then(|window| now.checked_sub_signed(window))
        else {
            return report;
        };

        let expired: Vec<Arc<JobRecord>> = self
            .read_jobs()
            .values()
            .filter(|r| r.expired_before(cutoff))
            .cloned()
            .collect();

        for record in expired {
            let (removed, failed) = self.discard_files(&record);
            report.files_removed += removed;
            report.files_failed += failed;
            if self.write_jobs().remove(record.id()).is_some() {
                report.jobs_removed += 1;
                tracing::info!(job_id = %record.id(), "expired job removed");
            }
        }

        if report.jobs_removed > 0 || report.files_failed > 0 {
            tracing::info!(
                jobs_removed = report.jobs_removed,
                files_removed = report.files_removed,
                files_failed = report.files_failed,
                "expiry sweep finished"
            );
        }
        record_sweep(report.jobs_removed);
        report
    }

    /// Run [`sweep_expired`](Self::sweep_expired) every `sweep_interval`
    /// until [`shutdown`](Self::shutdown).
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(this.config.sweep_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick completes immediately.
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = this.shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        this.sweep_expired(this.config.retention);
                    }
                }
            }
            tracing::debug!("expiry sweeper stopped");
        })
    }

    /// Number of jobs not yet in a terminal status.
    pub fn active_count(&self) -> usize {
        self.read_jobs().values().filter(|r| !r.is_terminal()).count()
    }

    pub async fn health(&self) -> HealthReport {
        let tool = self.tool.probe().await;
        let download_dir = self.store.is_available();
        let free_disk_bytes = self.store.available_space();
        let disk_space = self.config.min_free_disk_bytes == 0
            || free_disk_bytes.is_some_and(|free| free > self.config.min_free_disk_bytes);
        let active_jobs = self.active_count();

        let status = if tool.available && download_dir && disk_space {
            HealthStatus::Healthy
        } else {
            HealthStatus::Degraded
        };
        HealthReport {
            status,
            tool,
            download_dir,
            disk_space,
            free_disk_bytes,
            active_jobs,
        }
    }

    /// Subscribe to snapshots of one job.
    pub fn subscribe(&self, id: &str) -> Result<(JobView, broadcast::Receiver<JobView>), FetchError> {
        Ok(self.lookup(id)?.subscribe())
    }

    /// Refuse new work and cancel every non-terminal job, then wait up to
    /// `grace` for their tasks to finish.
    pub async fn shutdown(&self, grace: Duration) {
        self.shutdown.cancel();
        let pending: Vec<Arc<JobRecord>> = self
            .read_jobs()
            .values()
            .filter(|r| !r.is_terminal())
            .cloned()
            .collect();
        for record in &pending {
            let _ = record.request_cancel();
        }
        if !pending.is_empty() {
            tracing::info!(jobs = pending.len(), "cancelling jobs for shutdown");
        }

        let drained = tokio::time::timeout(grace, async {
            while self.in_flight.load(Ordering::SeqCst) > 0 {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await;
        if drained.is_err() {
            tracing::warn!(
                remaining = self.in_flight.load(Ordering::SeqCst),
                "shutdown grace elapsed with jobs still running"
            );
        }
    }

    fn lookup(&self, id: &str) -> Result<Arc<JobRecord>, FetchError> {
        let job_id = JobId::parse(id)?;
        self.read_jobs()
            .get(&job_id)
            .cloned()
            .ok_or_else(|| FetchError::NotFound(id.to_string()))
    }

    /// Best-effort removal of a job's artifact and partial files.
    fn discard_files(&self, record: &JobRecord) -> (usize, usize) {
        let mut removed = 0;
        let mut failed = 0;
        if let Some(path) = record.output_path() {
            match self.store.remove_artifact(&path) {
                Ok(true) => removed += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(job_id = %record.id(), path = %path.display(), error = %e, "failed to delete artifact");
                    failed += 1;
                }
            }
        }
        let leftovers = self.store.remove_partials(record.id());
        (removed + leftovers.removed, failed + leftovers.failed)
    }

    fn read_jobs(&self) -> RwLockReadGuard<'_, HashMap<JobId, Arc<JobRecord>>> {
        self.jobs.read().unwrap_or_else(|e| {
            tracing::error!("RwLock poisoned reading jobs map: {e}");
            e.into_inner()
        })
    }

    fn write_jobs(&self) -> RwLockWriteGuard<'_, HashMap<JobId, Arc<JobRecord>>> {
        self.jobs.write().unwrap_or_else(|e| {
            tracing::error!("RwLock poisoned writing jobs map: {e}");
            e.into_inner()
        })
    }
}

/// Wait for a slot (or a cancel), then run the job on its own task so a
/// panic inside the worker still ends the job in `failed`.
async fn run_queued(record: Arc<JobRecord>, slots: Arc<Semaphore>, worker: Arc<Worker>) {
    let token = record.cancel_token();
    let permit = tokio::select! {
        biased;
        _ = token.cancelled() => None,
        permit = Arc::clone(&slots).acquire_owned() => permit.ok(),
    };
    let Some(_permit) = permit else {
        record.mark_cancelled();
        record_job_finished("cancelled", Duration::ZERO);
        tracing::info!(job_id = %record.id(), "job cancelled while queued");
        return;
    };

    if !record.mark_running() {
        return;
    }
    adjust_running_jobs(1.0);
    let running = Arc::clone(&record);
    let outcome = tokio::spawn(async move { worker.execute(&running).await }).await;
    adjust_running_jobs(-1.0);
    if let Err(e) = outcome {
        tracing::error!(job_id = %record.id(), error = %e, "job task aborted");
        let failure = FailureKind::Internal {
            reason: e.to_string(),
        };
        record_job_finished(failure.label(), Duration::ZERO);
        record.fail(failure);
    }
}
