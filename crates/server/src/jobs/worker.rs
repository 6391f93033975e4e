// crates/server/src/jobs/worker.rs
//! Runs one download job from spawn to terminal status.

use std::collections::VecDeque;
use std::io;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::{Duration, Instant};

use fetchd_core::{
    classify_failure, parse_progress_line, ArtifactStore, DownloadRequest, FailureKind, FetchTool,
    ResolveError,
};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Child;

use super::state::JobRecord;
use crate::metrics::record_job_finished;

/// Non-progress output lines kept for failure classification.
const TAIL_LINES: usize = 50;

/// Longest output line kept; the rest of a longer line is discarded.
const MAX_LINE_BYTES: usize = 16 * 1024;

/// How the read/wait phase ended.
enum RunEnd {
    Exited(io::Result<ExitStatus>),
    Cancelled,
    TimedOut,
}

/// Executes jobs. Shared by every task the orchestrator spawns.
pub struct Worker {
    tool: Arc<FetchTool>,
    store: Arc<ArtifactStore>,
    timeout: Duration,
    kill_grace: Duration,
}

impl Worker {
    pub fn new(
        tool: Arc<FetchTool>,
        store: Arc<ArtifactStore>,
        timeout: Duration,
        kill_grace: Duration,
    ) -> Self {
        Self {
            tool,
            store,
            timeout,
            kill_grace,
        }
    }

    /// Drive a `running` job to a terminal status. Never panics on tool
    /// misbehaviour; every outcome lands in the record.
    pub async fn execute(&self, record: &JobRecord) {
        let started = Instant::now();
        let id = record.id();
        let token = record.cancel_token();

        if token.is_cancelled() {
            record.begin_cancelling();
            record.mark_cancelled();
            record_job_finished("cancelled", started.elapsed());
            return;
        }

        let template = self.store.output_template(id);
        let request = DownloadRequest {
            source: record.source(),
            format: record.format(),
            output_template: &template,
        };

        let (mut child, output) = match self.tool.spawn_download(&request) {
            Ok(spawned) => spawned,
            Err(e) => {
                tracing::error!(
                    job_id = %id,
                    binary = %self.tool.binary().display(),
                    error = %e,
                    "failed to spawn download tool"
                );
                let failure = FailureKind::ToolUnavailable {
                    reason: e.to_string(),
                };
                record_job_finished(failure.label(), started.elapsed());
                record.fail(failure);
                return;
            }
        };
        tracing::info!(job_id = %id, pid = ?child.id(), format = record.format(), "download started");

        let deadline = tokio::time::sleep(self.timeout);
        tokio::pin!(deadline);

        let mut tail: VecDeque<String> = VecDeque::with_capacity(TAIL_LINES);
        let mut lines = OutputLines::new(output);
        let end = loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break RunEnd::Cancelled,
                _ = &mut deadline => break RunEnd::TimedOut,
                next = lines.next_line() => match next {
                    Ok(Some(bytes)) => self.consume_line(record, &bytes, &mut tail),
                    done => {
                        if let Err(e) = done {
                            tracing::warn!(job_id = %id, error = %e, "lost tool output; waiting for exit");
                        }
                        break tokio::select! {
                            biased;
                            _ = token.cancelled() => RunEnd::Cancelled,
                            _ = &mut deadline => RunEnd::TimedOut,
                            status = child.wait() => RunEnd::Exited(status),
                        };
                    }
                },
            }
        };

        let label = match end {
            RunEnd::Cancelled => {
                record.begin_cancelling();
                self.terminate(record, &mut child).await;
                record.mark_cancelled();
                self.store.remove_partials(id);
                tracing::info!(job_id = %id, "download cancelled");
                "cancelled"
            }
            RunEnd::TimedOut => {
                tracing::warn!(
                    job_id = %id,
                    timeout_secs = self.timeout.as_secs(),
                    "download exceeded its time limit"
                );
                self.terminate(record, &mut child).await;
                self.fail_and_clean(record, FailureKind::Timeout)
            }
            RunEnd::Exited(Err(e)) => {
                tracing::error!(job_id = %id, error = %e, "lost track of download process");
                self.terminate(record, &mut child).await;
                self.fail_and_clean(
                    record,
                    FailureKind::Internal {
                        reason: e.to_string(),
                    },
                )
            }
            RunEnd::Exited(Ok(status)) if status.success() => self.finish_success(record),
            RunEnd::Exited(Ok(status)) => {
                let failure = classify_failure(tail.make_contiguous());
                tracing::warn!(
                    job_id = %id,
                    exit = ?status.code(),
                    reason = %failure,
                    "download tool failed"
                );
                self.fail_and_clean(record, failure.into())
            }
        };
        record_job_finished(label, started.elapsed());
    }

    fn consume_line(&self, record: &JobRecord, bytes: &[u8], tail: &mut VecDeque<String>) {
        let line = String::from_utf8_lossy(bytes);
        let line = line.trim_end_matches('\r');
        if line.trim().is_empty() {
            return;
        }
        tracing::trace!(job_id = %record.id(), line, "tool output");

        let update = parse_progress_line(line);
        record.apply_progress(&update);
        if update.percent.is_some() {
            return;
        }
        if tail.len() == TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line.to_string());
    }

    fn finish_success(&self, record: &JobRecord) -> &'static str {
        let id = record.id();
        match self.store.resolve(id.as_str()) {
            Ok(path) => {
                tracing::info!(job_id = %id, path = %path.display(), "download complete");
                record.complete(path);
                "complete"
            }
            Err(ResolveError::NotFound { .. }) => {
                tracing::error!(job_id = %id, "tool reported success but no artifact was found");
                self.fail_and_clean(record, FailureKind::ArtifactMissing)
            }
            Err(ResolveError::PathEscape { .. }) => {
                self.fail_and_clean(record, FailureKind::PathEscape)
            }
            Err(e) => {
                tracing::error!(job_id = %id, error = %e, "cannot resolve artifact");
                self.fail_and_clean(
                    record,
                    FailureKind::Internal {
                        reason: e.to_string(),
                    },
                )
            }
        }
    }

    fn fail_and_clean(&self, record: &JobRecord, failure: FailureKind) -> &'static str {
        let label = failure.label();
        record.fail(failure);
        self.store.remove_partials(record.id());
        label
    }

    /// SIGTERM the process group, then SIGKILL once the grace period runs out.
    /// Returns only after the child has been reaped.
    async fn terminate(&self, record: &JobRecord, child: &mut Child) {
        #[cfg(unix)]
        if let Some(pid) = child.id() {
            use nix::sys::signal::{killpg, Signal};
            use nix::unistd::Pid;

            let group = Pid::from_raw(pid as i32);
            if let Err(e) = killpg(group, Signal::SIGTERM) {
                tracing::debug!(job_id = %record.id(), error = %e, "SIGTERM to process group failed");
            }
            if tokio::time::timeout(self.kill_grace, child.wait()).await.is_ok() {
                return;
            }
            tracing::warn!(
                job_id = %record.id(),
                grace_secs = self.kill_grace.as_secs(),
                "download tool ignored SIGTERM; killing"
            );
            let _ = killpg(group, Signal::SIGKILL);
        }

        if let Err(e) = child.kill().await {
            tracing::debug!(job_id = %record.id(), error = %e, "kill after exit");
        }
    }
}

/// Newline-delimited reader over the tool's combined output. Lines longer
/// than [`MAX_LINE_BYTES`] are truncated rather than buffered whole.
struct OutputLines<R> {
    reader: BufReader<R>,
    line: Vec<u8>,
}

impl<R: AsyncRead + Unpin> OutputLines<R> {
    fn new(inner: R) -> Self {
        Self {
            reader: BufReader::new(inner),
            line: Vec::new(),
        }
    }

    /// Next line without its newline, or `None` at end of output. A final
    /// unterminated line is still returned.
    async fn next_line(&mut self) -> io::Result<Option<Vec<u8>>> {
        loop {
            let available = self.reader.fill_buf().await?;
            if available.is_empty() {
                if self.line.is_empty() {
                    return Ok(None);
                }
                return Ok(Some(std::mem::take(&mut self.line)));
            }

            let newline = available.iter().position(|&b| b == b'\n');
            let end = newline.unwrap_or(available.len());
            let room = MAX_LINE_BYTES.saturating_sub(self.line.len());
            self.line.extend_from_slice(&available[..end.min(room)]);
            self.reader.consume(newline.map_or(end, |i| i + 1));

            if newline.is_some() {
                return Ok(Some(std::mem::take(&mut self.line)));
            }
        }
    }
}
