// crates/core/src/validate.rs
//! Input validation for everything that ends up on a subprocess argument list
//! or in a filesystem path.

use std::sync::OnceLock;

use regex_lite::Regex;
use url::Url;

use crate::error::ValidationError;

/// Maximum accepted length of a source locator.
pub const MAX_LOCATOR_LEN: usize = 500;

/// Maximum accepted length of a format selector.
pub const MAX_FORMAT_LEN: usize = 64;

/// Length of a job id: 16 random bytes, URL-safe base64 without padding.
pub const JOB_ID_LEN: usize = 22;

/// Hosts accepted when no explicit allowlist is configured.
pub const DEFAULT_ALLOWED_HOSTS: &[&str] = &[
    "youtube.com",
    "youtu.be",
    "m.youtube.com",
    "www.youtube.com",
];

/// Which source hosts may be submitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostPolicy {
    Any,
    Allow(Vec<String>),
}

impl Default for HostPolicy {
    fn default() -> Self {
        Self::Allow(DEFAULT_ALLOWED_HOSTS.iter().map(|h| h.to_string()).collect())
    }
}

impl HostPolicy {
    /// Parse a comma-separated host list. `*` means any host.
    pub fn parse(raw: &str) -> Self {
        let hosts: Vec<String> = raw
            .split(',')
            .map(|h| h.trim().to_ascii_lowercase())
            .filter(|h| !h.is_empty())
            .collect();
        if hosts.iter().any(|h| h == "*") {
            Self::Any
        } else {
            Self::Allow(hosts)
        }
    }

    pub fn permits(&self, host: &str) -> bool {
        match self {
            Self::Any => true,
            Self::Allow(hosts) => hosts.iter().any(|h| h.eq_ignore_ascii_case(host)),
        }
    }
}

fn format_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9+_-]+$").expect("valid format id regex"))
}

fn job_id_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_-]{22}$").expect("valid job id regex"))
}

/// Validate a source locator and return its normalized form.
///
/// Only absolute `http`/`https` URLs whose host passes `policy` are accepted.
pub fn validate_locator(raw: &str, policy: &HostPolicy) -> Result<String, ValidationError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(ValidationError::EmptyLocator);
    }
    if raw.len() > MAX_LOCATOR_LEN {
        return Err(ValidationError::LocatorTooLong {
            max: MAX_LOCATOR_LEN,
        });
    }

    let url = Url::parse(raw).map_err(|e| ValidationError::MalformedLocator {
        reason: e.to_string(),
    })?;

    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(ValidationError::UnsupportedScheme {
            scheme: url.scheme().to_string(),
        });
    }

    let host = url.host_str().ok_or_else(|| ValidationError::MalformedLocator {
        reason: "missing host".to_string(),
    })?;
    if !policy.permits(host) {
        return Err(ValidationError::HostNotAllowed {
            host: host.to_string(),
        });
    }

    Ok(url.to_string())
}

/// Validate a format selector against the narrow allowlist.
pub fn validate_format_id(raw: &str) -> Result<&str, ValidationError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(ValidationError::EmptyFormat);
    }
    if raw.len() > MAX_FORMAT_LEN {
        return Err(ValidationError::FormatTooLong {
            max: MAX_FORMAT_LEN,
        });
    }
    if !format_regex().is_match(raw) {
        return Err(ValidationError::UnsafeFormat);
    }
    Ok(raw)
}

/// Check a job id against the strict fixed-length pattern.
pub fn is_valid_job_id(raw: &str) -> bool {
    job_id_regex().is_match(raw)
}
