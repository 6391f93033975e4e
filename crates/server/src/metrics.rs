// crates/server/src/metrics.rs
//! Prometheus metrics for the job system.
//!
//! - `init_metrics` installs the global recorder once at startup
//! - `record_*` helpers are no-ops until then, so library code and tests can
//!   call them freely
//! - `render_metrics` backs `GET /api/metrics`

use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Global Prometheus handle for rendering metrics.
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder.
///
/// Returns `true` if initialization succeeded, `false` if already initialized.
pub fn init_metrics() -> bool {
    if PROMETHEUS_HANDLE.get().is_some() {
        return false;
    }

    let recorder = PrometheusBuilder::new().build_recorder();
    let handle = recorder.handle();

    if metrics::set_global_recorder(recorder).is_err() {
        tracing::warn!("Failed to set global metrics recorder (already set)");
        return false;
    }
    if PROMETHEUS_HANDLE.set(handle).is_err() {
        tracing::warn!("Failed to store Prometheus handle (already set)");
    }

    describe_metrics();
    tracing::info!("Prometheus metrics initialized");
    true
}

fn describe_metrics() {
    describe_counter!("fetchd_jobs_submitted_total", "Jobs accepted by submit");
    describe_counter!(
        "fetchd_jobs_finished_total",
        "Jobs that reached a terminal status, by outcome"
    );
    describe_histogram!(
        "fetchd_job_duration_seconds",
        "Time from slot acquisition to terminal status"
    );
    describe_gauge!("fetchd_jobs_active", "Jobs currently holding an execution slot");
    describe_counter!(
        "fetchd_sweep_removed_total",
        "Expired jobs removed by the retention sweep"
    );
}

/// Render current metrics in Prometheus text format.
///
/// Returns `None` if metrics are not initialized.
pub fn render_metrics() -> Option<String> {
    PROMETHEUS_HANDLE.get().map(|h| h.render())
}

pub fn record_job_submitted() {
    counter!("fetchd_jobs_submitted_total").increment(1);
}

/// Record a job reaching a terminal status.
///
/// `outcome` is `complete`, `cancelled`, or a failure label.
pub fn record_job_finished(outcome: &'static str, duration: Duration) {
    counter!("fetchd_jobs_finished_total", "status" => outcome).increment(1);
    histogram!("fetchd_job_duration_seconds", "status" => outcome).record(duration.as_secs_f64());
}

pub fn adjust_running_jobs(delta: f64) {
    gauge!("fetchd_jobs_active").increment(delta);
}

pub fn record_sweep(removed: usize) {
    if removed > 0 {
        counter!("fetchd_sweep_removed_total").increment(removed as u64);
    }
}
