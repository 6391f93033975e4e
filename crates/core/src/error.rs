// crates/core/src/error.rs
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while validating caller-supplied inputs.
///
/// All of these are detected before any subprocess or filesystem work.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("source locator is empty")]
    EmptyLocator,

    #[error("source locator exceeds {max} characters")]
    LocatorTooLong { max: usize },

    #[error("source locator is not a valid URL: {reason}")]
    MalformedLocator { reason: String },

    #[error("unsupported URL scheme: {scheme}")]
    UnsupportedScheme { scheme: String },

    #[error("host is not supported: {host}")]
    HostNotAllowed { host: String },

    #[error("format id is empty")]
    EmptyFormat,

    #[error("format id exceeds {max} characters")]
    FormatTooLong { max: usize },

    #[error("format id contains characters outside [A-Za-z0-9+_-]")]
    UnsafeFormat,

    #[error("invalid job id")]
    InvalidJobId,
}

/// Errors from the output path resolver.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("invalid job id")]
    InvalidId,

    #[error("no artifact found for job {id}")]
    NotFound { id: String },

    #[error("artifact {path} escapes managed root {root}")]
    PathEscape { path: PathBuf, root: PathBuf },

    #[error("IO error accessing {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ResolveError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Errors raised while loading configuration at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: {value:?} ({reason})")]
    InvalidValue {
        var: &'static str,
        value: String,
        reason: String,
    },

    #[error("cannot prepare download directory {path}: {source}")]
    DownloadDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Sub-kinds of a non-zero tool exit, recognised by fixed output signatures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ToolFailure {
    #[error("Age-restricted video (not supported)")]
    AgeRestricted,

    #[error("Video is unavailable or private")]
    Unavailable,

    #[error("URL not recognized as a supported source")]
    UnsupportedSource,

    #[error("Download tool output unreadable (try updating)")]
    UnrecognizedOutput,

    #[error("Storage full - contact admin")]
    StorageFull,

    #[error("Download failed: {tail}")]
    Other { tail: String },
}

/// Why a job ended in `failed`.
///
/// `Display` is the fixed-vocabulary message shown to callers; internal
/// reasons carried by some variants are for logs only.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FailureKind {
    #[error("Download tool unavailable")]
    ToolUnavailable { reason: String },

    #[error(transparent)]
    ExternalTool(#[from] ToolFailure),

    #[error("Download timed out")]
    Timeout,

    #[error("artifact missing after reported success")]
    ArtifactMissing,

    #[error("Downloaded file rejected")]
    PathEscape,

    #[error("Internal error")]
    Internal { reason: String },
}

impl FailureKind {
    /// Short machine-readable label, used for metrics and structured logs.
    pub fn label(&self) -> &'static str {
        match self {
            Self::ToolUnavailable { .. } => "tool_unavailable",
            Self::ExternalTool(ToolFailure::AgeRestricted) => "age_restricted",
            Self::ExternalTool(ToolFailure::Unavailable) => "unavailable",
            Self::ExternalTool(ToolFailure::UnsupportedSource) => "unsupported_source",
            Self::ExternalTool(ToolFailure::UnrecognizedOutput) => "unrecognized_output",
            Self::ExternalTool(ToolFailure::StorageFull) => "storage_full",
            Self::ExternalTool(ToolFailure::Other { .. }) => "tool_error",
            Self::Timeout => "timeout",
            Self::ArtifactMissing => "artifact_missing",
            Self::PathEscape => "path_escape",
            Self::Internal { .. } => "internal",
        }
    }
}
