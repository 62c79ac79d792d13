//! Artifact removal, scoped by parent directory.
//!
//! Nothing outside the temp root or the output root is ever deleted.

use std::collections::HashSet;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, SystemTime};

use log::{debug, info, warn};
use walkdir::WalkDir;

use crate::error::Result;
use crate::job::Job;

/// Lexical normalization: drops `.` and resolves `..` without touching the disk
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

fn resolve(path: &Path) -> PathBuf {
    fs::canonicalize(path).unwrap_or_else(|_| normalize(path))
}

/// True when `path`'s parent directory is exactly `root`
pub fn is_within(path: &Path, root: &Path) -> bool {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => resolve(parent) == resolve(root),
        _ => false,
    }
}

/// Delete `path` if it is a file directly inside `temp_root`.
///
/// Returns whether something was removed.
pub fn remove_temp_artifact(path: &Path, temp_root: &Path) -> Result<bool> {
    if !is_within(path, temp_root) {
        warn!(
            "Refusing to delete {}: not inside temp root {}",
            path.display(),
            temp_root.display()
        );
        return Ok(false);
    }
    if !path.is_file() {
        return Ok(false);
    }
    fs::remove_file(path)?;
    debug!("Removed temp artifact {}", path.display());
    Ok(true)
}

/// Remove a job's temp artifacts and the output files named after it
pub fn remove_job_artifacts(job: &Job, temp_root: &Path, output_root: &Path) -> Result<usize> {
    let mut removed = 0;
    for path in job.temp_artifacts() {
        if remove_temp_artifact(path, temp_root)? {
            removed += 1;
        }
    }

    if output_root.is_dir() {
        for entry in fs::read_dir(output_root)? {
            let path = entry?.path();
            let owned = path
                .file_name()
                .and_then(|n| n.to_str())
                .map_or(false, |name| name.starts_with(&job.id));
            if owned && path.is_file() && is_within(&path, output_root) {
                fs::remove_file(&path)?;
                debug!("Removed output {}", path.display());
                removed += 1;
            }
        }
    }

    if removed > 0 {
        info!("Job {}: removed {} artifact(s)", job.id, removed);
    }
    Ok(removed)
}

/// Delete temp-root files older than `max_age`, sparing any whose name mentions an active job
pub async fn cleanup_stale_temp_files(
    temp_root: &Path,
    max_age: Duration,
    active_job_ids: &HashSet<String>,
) -> Result<usize> {
    if !temp_root.exists() {
        return Ok(0);
    }

    let root = temp_root.to_path_buf();
    let active = active_job_ids.clone();
    let stale = tokio::task::spawn_blocking(move || {
        let now = SystemTime::now();
        let mut stale = Vec::new();
        for entry in WalkDir::new(&root).min_depth(1).max_depth(1).follow_links(false) {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    warn!("Error reading temp entry: {}", e);
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy();
            if active.iter().any(|id| name.contains(id.as_str())) {
                continue;
            }
            let age = entry
                .metadata()
                .ok()
                .and_then(|m| m.modified().ok())
                .and_then(|modified| now.duration_since(modified).ok());
            if age.map_or(false, |age| age >= max_age) {
                stale.push(entry.path().to_path_buf());
            }
        }
        stale
    })
    .await
    .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;

    let mut cleaned = 0;
    for path in stale {
        match remove_temp_artifact(&path, temp_root) {
            Ok(true) => {
                info!("Removed stale temp file {}", path.display());
                cleaned += 1;
            }
            Ok(false) => {}
            Err(e) => warn!("Failed to remove stale temp file {}: {}", path.display(), e),
        }
    }
    Ok(cleaned)
}
