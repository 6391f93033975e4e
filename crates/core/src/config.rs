// crates/core/src/config.rs
//! Process-wide configuration, read once at startup from the environment.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::validate::HostPolicy;

const GIB: u64 = 1024 * 1024 * 1024;

/// Orchestrator settings. Injected at construction; never renegotiated.
#[derive(Debug, Clone)]
pub struct FetchConfig {
    /// Managed storage root for artifacts.
    pub download_dir: PathBuf,
    /// Number of jobs that may execute at once.
    pub max_concurrent: usize,
    /// Hard cap on jobs waiting for a slot. `None` queues without limit.
    pub queue_capacity: Option<usize>,
    /// How long terminal jobs and their files are kept.
    pub retention: Duration,
    /// Period of the expiry sweep.
    pub sweep_interval: Duration,
    /// Wall-clock ceiling for one tool run.
    pub job_timeout: Duration,
    /// Delay between the graceful and the forceful kill.
    pub kill_grace: Duration,
    /// Tool binary (looked up on PATH when not absolute).
    pub tool_path: PathBuf,
    pub allowed_hosts: HostPolicy,
    /// Below this much free space the health check reports degraded.
    pub min_free_disk_bytes: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            download_dir: PathBuf::from("./downloads"),
            max_concurrent: 3,
            queue_capacity: None,
            retention: Duration::from_secs(24 * 3600),
            sweep_interval: Duration::from_secs(3600),
            job_timeout: Duration::from_secs(300),
            kill_grace: Duration::from_secs(5),
            tool_path: PathBuf::from("yt-dlp"),
            allowed_hosts: HostPolicy::default(),
            min_free_disk_bytes: 5 * GIB,
        }
    }
}

impl FetchConfig {
    /// Read configuration from process environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup (testable).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let max_concurrent = parse_or(&get, "MAX_CONCURRENT", defaults.max_concurrent)?;
        if max_concurrent == 0 {
            return Err(ConfigError::InvalidValue {
                var: "MAX_CONCURRENT",
                value: "0".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }

        let queue_capacity = match get("QUEUE_CAPACITY") {
            Some(raw) => Some(parse_value("QUEUE_CAPACITY", &raw)?),
            None => None,
        };

        let retention_hours: u64 = parse_or(&get, "FILE_RETENTION_HOURS", 24)?;
        let sweep_secs: u64 = parse_or(&get, "SWEEP_INTERVAL_SECS", defaults.sweep_interval.as_secs())?;
        let timeout_secs: u64 = parse_or(&get, "YTDLP_TIMEOUT", defaults.job_timeout.as_secs())?;
        let grace_secs: u64 = parse_or(&get, "KILL_GRACE_SECS", defaults.kill_grace.as_secs())?;
        let min_free_gb: u64 = parse_or(&get, "MIN_FREE_DISK_GB", 5)?;

        if sweep_secs == 0 {
            return Err(ConfigError::InvalidValue {
                var: "SWEEP_INTERVAL_SECS",
                value: "0".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                var: "YTDLP_TIMEOUT",
                value: "0".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }

        let retention_secs = scaled("FILE_RETENTION_HOURS", retention_hours, 3600)?;
        let min_free_disk_bytes = scaled("MIN_FREE_DISK_GB", min_free_gb, GIB)?;

        Ok(Self {
            download_dir: get("DOWNLOAD_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.download_dir),
            max_concurrent,
            queue_capacity,
            retention: Duration::from_secs(retention_secs),
            sweep_interval: Duration::from_secs(sweep_secs),
            job_timeout: Duration::from_secs(timeout_secs),
            kill_grace: Duration::from_secs(grace_secs),
            tool_path: get("YTDLP_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.tool_path),
            allowed_hosts: get("ALLOWED_HOSTS")
                .map(|raw| HostPolicy::parse(&raw))
                .unwrap_or(defaults.allowed_hosts),
            min_free_disk_bytes,
        })
    }
}

fn parse_value<T>(var: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        var,
        value: raw.to_string(),
        reason: e.to_string(),
    })
}

/// `value * unit`, rejecting values too large to represent.
fn scaled(var: &'static str, value: u64, unit: u64) -> Result<u64, ConfigError> {
    value.checked_mul(unit).ok_or_else(|| ConfigError::InvalidValue {
        var,
        value: value.to_string(),
        reason: "value too large".to_string(),
    })
}

fn parse_or<T, G>(get: &G, var: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(var) {
        Some(raw) => parse_value(var, &raw),
        None => Ok(default),
    }
}
