//! Shared helpers for integration tests: fake download tools written as shell
//! scripts, and an orchestrator wired to them.

#![allow(dead_code)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use fetchd_core::{FetchConfig, HostPolicy, JobId};
use fetchd_server::jobs::{JobOrchestrator, JobView};
use tempfile::TempDir;

pub const SOURCE: &str = "https://www.youtube.com/watch?v=dQw4w9WgXcQ";

/// Answers `--version`, logs every download spawn, and resolves the output
/// template (argument 6) to an `.mp4` path in `$out`.
const PRELUDE: &str = r#"#!/bin/sh
if [ "$1" = "--version" ]; then echo 2024.08.06; exit 0; fi
echo "$$" >> "__SPAWN_LOG__"
out=$(printf '%s' "$6" | sed 's/%(ext)s/mp4/')
"#;

/// Writes progress, then the artifact, then exits 0.
pub const SUCCESS: &str = r#"
echo "[download]  10.0% of 1.00MiB at 1.00MiB/s ETA 00:01"
echo "[youtube] some unrelated chatter"
echo "[download]  55.5% of 1.00MiB at 2.00MiB/s ETA 00:00"
printf 'data' > "$out"
echo "[download] 100% of 1.00MiB in 00:00:01 at 1.00MiB/s"
"#;

/// Like `SUCCESS` but takes about a second.
pub const SLOW_SUCCESS: &str = r#"
echo "[download]  10.0% of 1.00MiB at 1.00MiB/s ETA 00:01"
sleep 1
printf 'data' > "$out"
"#;

/// Fails with a recognised signature on stderr.
pub const UNAVAILABLE: &str = r#"
echo "[youtube] dQw4w9WgXcQ: Downloading webpage"
echo "ERROR: [youtube] dQw4w9WgXcQ: Video unavailable" >&2
exit 1
"#;

/// Fails with an unrecognised error.
pub const GENERIC_FAILURE: &str = r#"
echo "ERROR: HTTP Error 403: Forbidden" >&2
exit 1
"#;

/// Interleaves error lines on both streams; the stderr one is written last.
pub const INTERLEAVED_FAILURE: &str = r#"
echo "ERROR: stale warning from an earlier retry"
echo "[download]  12.0% of 1.00MiB"
echo "ERROR: HTTP Error 429: Too Many Requests" >&2
exit 1
"#;

/// Emits a very long line without a newline before normal progress.
pub const LONG_LINE: &str = r#"
head -c 200000 /dev/zero | tr '\0' 'x'
echo
echo "[download]  50.0% of 1.00MiB"
printf 'data' > "$out"
"#;

/// Exits 0 without producing a file.
pub const NO_ARTIFACT: &str = r#"
echo "[download] 100% of 1.00MiB"
"#;

/// Leaves a partial file and never finishes.
pub const HANG: &str = r#"
printf 'partial' > "$out.part"
echo "[download]   5.0% of 1.00MiB at 1.00KiB/s ETA 16:00"
sleep 30
"#;

/// Ignores SIGTERM, so only SIGKILL stops it.
pub const STUBBORN: &str = r#"
trap '' TERM
printf 'partial' > "$out.part"
echo "[download]   5.0% of 1.00MiB"
while true; do sleep 1; done
"#;

pub struct Harness {
    pub dir: TempDir,
    pub orchestrator: Arc<JobOrchestrator>,
}

impl Harness {
    /// Orchestrator whose tool runs `body` after the shared prelude.
    pub fn new(body: &str, tune: impl FnOnce(&mut FetchConfig)) -> Self {
        let dir = TempDir::new().unwrap();
        let tool = write_tool(dir.path(), body);

        let mut config = FetchConfig {
            download_dir: dir.path().join("downloads"),
            tool_path: tool,
            max_concurrent: 3,
            job_timeout: Duration::from_secs(20),
            kill_grace: Duration::from_millis(500),
            allowed_hosts: HostPolicy::default(),
            min_free_disk_bytes: 0,
            ..FetchConfig::default()
        };
        tune(&mut config);

        let orchestrator = Arc::new(JobOrchestrator::new(config).unwrap());
        Self { dir, orchestrator }
    }

    pub fn downloads(&self) -> PathBuf {
        self.orchestrator.store().root().to_path_buf()
    }

    /// PIDs of every download process the fake tool started.
    pub fn spawned(&self) -> Vec<i32> {
        std::fs::read_to_string(self.dir.path().join("spawn.log"))
            .unwrap_or_default()
            .lines()
            .filter_map(|l| l.trim().parse().ok())
            .collect()
    }

    /// Files in the download directory whose name starts with the job id.
    pub fn files_for(&self, id: &JobId) -> Vec<String> {
        std::fs::read_dir(self.downloads())
            .unwrap()
            .flatten()
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|name| name.starts_with(id.as_str()))
            .collect()
    }

    pub async fn wait_for(&self, id: &JobId, pred: impl Fn(&JobView) -> bool) -> JobView {
        for _ in 0..500 {
            let view = self.orchestrator.snapshot(id.as_str()).unwrap();
            if pred(&view) {
                return view;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("job {id} never reached the expected state");
    }

    pub async fn wait_terminal(&self, id: &JobId) -> JobView {
        self.wait_for(id, |v| v.status.is_terminal()).await
    }
}

fn write_tool(dir: &Path, body: &str) -> PathBuf {
    let log = dir.join("spawn.log");
    let script = PRELUDE.replace("__SPAWN_LOG__", &log.to_string_lossy()) + body;
    let path = dir.join("fake-yt-dlp");
    std::fs::write(&path, script).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Whether a process with this PID still exists.
pub fn process_alive(pid: i32) -> bool {
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok()
}
