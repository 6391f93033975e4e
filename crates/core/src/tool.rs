// crates/core/src/tool.rs
//! Adapter for the external media-fetching tool (`yt-dlp` by default).
//!
//! Builds the download command line, probes the binary for health checks, and
//! classifies failure output into a fixed vocabulary.

use std::ffi::OsString;
use std::io;
use std::os::fd::OwnedFd;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use serde::Serialize;
use tokio::net::unix::pipe;
use tokio::process::{Child, Command};

use crate::error::ToolFailure;

/// Timeout for the `--version` probe.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// PATH used when the server itself has none.
const FALLBACK_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// Longest error tail echoed back in a generic failure message.
const MAX_TAIL_CHARS: usize = 200;

/// Known failure signatures, checked in order against the captured output.
const FAILURE_SIGNATURES: &[(&str, ToolFailure)] = &[
    ("Sign in to confirm your age", ToolFailure::AgeRestricted),
    ("Private video", ToolFailure::Unavailable),
    ("Video unavailable", ToolFailure::Unavailable),
    ("Unsupported URL", ToolFailure::UnsupportedSource),
    ("Unable to extract", ToolFailure::UnrecognizedOutput),
    ("unable to parse", ToolFailure::UnrecognizedOutput),
    ("No space left on device", ToolFailure::StorageFull),
];

/// Result of probing the tool binary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolProbe {
    pub available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// One download invocation.
#[derive(Debug, Clone, Copy)]
pub struct DownloadRequest<'a> {
    pub source: &'a str,
    pub format: &'a str,
    pub output_template: &'a Path,
}

/// Handle to the tool binary.
#[derive(Debug, Clone)]
pub struct FetchTool {
    binary: PathBuf,
    scratch_home: PathBuf,
}

impl FetchTool {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            scratch_home: std::env::temp_dir(),
        }
    }

    /// Directory exported as `HOME` to the child.
    pub fn with_scratch_home(mut self, home: impl Into<PathBuf>) -> Self {
        self.scratch_home = home.into();
        self
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    /// Argument list for a download. Never passed through a shell.
    pub fn download_args(request: &DownloadRequest<'_>) -> Vec<OsString> {
        vec![
            "-f".into(),
            request.format.into(),
            "--newline".into(),
            "--no-playlist".into(),
            "-o".into(),
            request.output_template.as_os_str().to_owned(),
            "--".into(),
            request.source.into(),
        ]
    }

    /// Download command with a minimal environment and its own process group
    /// so the whole tree can be signalled. Output handles are left to the
    /// caller.
    pub fn download_command(&self, request: &DownloadRequest<'_>) -> Command {
        let mut cmd = self.base_command();
        cmd.args(Self::download_args(request));
        cmd.process_group(0);
        cmd
    }

    /// Spawn a download with stdout and stderr sharing one pipe, so the
    /// returned reader yields lines in the order the tool wrote them.
    pub fn spawn_download(&self, request: &DownloadRequest<'_>) -> io::Result<(Child, pipe::Receiver)> {
        let (reader, writer) = io::pipe()?;
        let mut cmd = self.download_command(request);
        cmd.stdout(writer.try_clone()?).stderr(writer);
        let child = cmd.spawn()?;
        // Release our copies of the write end; EOF then means the tool's
        // process tree has closed its output.
        drop(cmd);
        let output = pipe::Receiver::from_owned_fd(OwnedFd::from(reader))?;
        Ok((child, output))
    }

    /// Run `--version` with a short timeout.
    pub async fn probe(&self) -> ToolProbe {
        let mut cmd = self.base_command();
        cmd.arg("--version")
            .stdout(Stdio::piped())
            .stderr(Stdio::null());

        let output = match tokio::time::timeout(PROBE_TIMEOUT, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                tracing::debug!(binary = %self.binary.display(), error = %e, "tool probe: spawn failed");
                return ToolProbe {
                    available: false,
                    version: None,
                };
            }
            Err(_) => {
                tracing::warn!(binary = %self.binary.display(), "tool probe: timed out");
                return ToolProbe {
                    available: false,
                    version: None,
                };
            }
        };

        if !output.status.success() {
            return ToolProbe {
                available: false,
                version: None,
            };
        }
        let version = String::from_utf8_lossy(&output.stdout).trim().to_string();
        ToolProbe {
            available: true,
            version: (!version.is_empty()).then_some(version),
        }
    }

    fn base_command(&self) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.env_clear()
            .env(
                "PATH",
                std::env::var_os("PATH").unwrap_or_else(|| FALLBACK_PATH.into()),
            )
            .env("HOME", &self.scratch_home)
            .env("LANG", "C.UTF-8")
            .env("PYTHONUNBUFFERED", "1")
            .stdin(Stdio::null())
            .kill_on_drop(true);
        cmd
    }
}

/// Classify the captured output of a failed run.
///
/// Unrecognised failures keep a short, sanitised tail of the last error line.
pub fn classify_failure<S: AsRef<str>>(output: &[S]) -> ToolFailure {
    for (needle, failure) in FAILURE_SIGNATURES {
        if output.iter().any(|line| line.as_ref().contains(needle)) {
            return failure.clone();
        }
    }

    let last = output
        .iter()
        .rev()
        .map(|l| l.as_ref().trim())
        .find(|l| l.starts_with("ERROR"))
        .or_else(|| output.iter().rev().map(|l| l.as_ref().trim()).find(|l| !l.is_empty()))
        .unwrap_or("unknown error");
    ToolFailure::Other {
        tail: sanitize_tail(last),
    }
}

fn sanitize_tail(line: &str) -> String {
    let line = line.strip_prefix("ERROR:").unwrap_or(line).trim();
    let mut tail: String = line
        .chars()
        .filter(|c| !c.is_control())
        .take(MAX_TAIL_CHARS)
        .collect();
    if line.chars().count() > MAX_TAIL_CHARS {
        tail.push('…');
    }
    tail
}
