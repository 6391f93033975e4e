// crates/core/src/store.rs
//! Managed artifact directory: output naming, artifact resolution, and
//! partial-file cleanup.
//!
//! Every file the tool writes for a job shares the `{job_id}.` stem, which is
//! the only link between a job and its files on disk.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use sysinfo::Disks;

use crate::error::ResolveError;
use crate::ids::JobId;
use crate::validate::is_valid_job_id;

/// Suffixes the tool uses for in-flight or intermediate files.
const PARTIAL_SUFFIXES: &[&str] = &[".part", ".ytdl", ".temp", ".tmp"];

/// Result of a best-effort cleanup pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub removed: usize,
    pub failed: usize,
}

/// The managed storage root.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    /// Create the directory if needed and pin its canonical path.
    pub fn open(dir: impl AsRef<Path>) -> io::Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let root = dir.canonicalize()?;
        Ok(Self { root })
    }

    /// Canonical absolute path of the managed root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn is_available(&self) -> bool {
        self.root.is_dir()
    }

    /// Output template handed to the tool: `{root}/{id}.%(ext)s`.
    pub fn output_template(&self, id: &JobId) -> PathBuf {
        self.root.join(format!("{id}.%(ext)s"))
    }

    /// Locate the single finished artifact for `id`.
    pub fn resolve(&self, id: &str) -> Result<PathBuf, ResolveError> {
        if !is_valid_job_id(id) {
            return Err(ResolveError::InvalidId);
        }

        let candidates: Vec<PathBuf> = self
            .stem_entries(id)?
            .into_iter()
            .filter(|p| !is_partial(p))
            .collect();

        let Some(first) = candidates.first() else {
            return Err(ResolveError::NotFound { id: id.to_string() });
        };
        if candidates.len() > 1 {
            tracing::warn!(
                job_id = %id,
                count = candidates.len(),
                chosen = %first.display(),
                "multiple artifacts share one job id"
            );
        }

        let canonical = first
            .canonicalize()
            .map_err(|e| ResolveError::io(first, e))?;
        if !canonical.starts_with(&self.root) {
            tracing::error!(
                job_id = %id,
                path = %canonical.display(),
                root = %self.root.display(),
                "artifact path escapes managed root"
            );
            return Err(ResolveError::PathEscape {
                path: canonical,
                root: self.root.clone(),
            });
        }
        Ok(canonical)
    }

    /// Remove every file sharing the job's stem. Errors are logged, not raised.
    pub fn remove_partials(&self, id: &JobId) -> CleanupReport {
        let mut report = CleanupReport::default();
        let entries = match self.stem_entries(id.as_str()) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(job_id = %id, error = %e, "cannot list partial files");
                report.failed += 1;
                return report;
            }
        };

        for path in entries {
            match fs::remove_file(&path) {
                Ok(()) => report.removed += 1,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!(job_id = %id, path = %path.display(), error = %e, "failed to remove partial file");
                    report.failed += 1;
                }
            }
        }
        if report.removed > 0 {
            tracing::debug!(job_id = %id, removed = report.removed, "removed partial files");
        }
        report
    }

    /// Delete a finished artifact. Returns `false` when it was already gone.
    ///
    /// Paths outside the managed root are refused.
    pub fn remove_artifact(&self, path: &Path) -> io::Result<bool> {
        if !path.starts_with(&self.root) {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("{} is outside the managed root", path.display()),
            ));
        }
        match fs::remove_file(path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Free bytes on the filesystem holding the root, if it can be determined.
    pub fn available_space(&self) -> Option<u64> {
        let disks = Disks::new_with_refreshed_list();
        disks
            .list()
            .iter()
            .filter(|d| self.root.starts_with(d.mount_point()))
            .max_by_key(|d| d.mount_point().as_os_str().len())
            .map(|d| d.available_space())
    }

    /// Entries in the root named `{id}.<something>`, sorted by name.
    fn stem_entries(&self, id: &str) -> Result<Vec<PathBuf>, ResolveError> {
        let prefix = format!("{id}.");
        let entries = fs::read_dir(&self.root).map_err(|e| ResolveError::io(&self.root, e))?;

        let mut matches: Vec<PathBuf> = entries
            .flatten()
            .filter(|entry| {
                let name = entry.file_name();
                let name = name.to_string_lossy();
                name.len() > prefix.len() && name.starts_with(&prefix)
            })
            .map(|entry| entry.path())
            .collect();
        matches.sort();
        Ok(matches)
    }
}

fn is_partial(path: &Path) -> bool {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    PARTIAL_SUFFIXES.iter().any(|s| name.ends_with(s)) || name.contains(".part-Frag")
}
