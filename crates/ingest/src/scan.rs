use std::path::{Path, PathBuf};
use std::time::Duration;
use log::{debug, info, warn};

use crate::error::{IngestError, Result};

/// Result of scanning a staging entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanResult {
    /// File should be processed (path, size in bytes)
    Candidate(PathBuf, u64),
    /// File should be left alone this pass (path, reason)
    Skipped(PathBuf, String),
}

fn has_media_extension(path: &Path, extensions: &[String]) -> bool {
    path.extension()
        .and_then(|s| s.to_str())
        .map(|ext| extensions.iter().any(|e| e.eq_ignore_ascii_case(ext)))
        .unwrap_or(false)
}

/// List eligible media files in the staging directory, sorted by name.
///
/// With a non-zero `stability_wait`, every file is stat'ed twice around a
/// single sleep and files still growing are skipped for this pass.
pub async fn discover(staging_dir: &Path, extensions: &[String], stability_wait: Duration) -> Result<Vec<ScanResult>> {
    let unreadable = |source: std::io::Error| IngestError::StagingUnreadable {
        dir: staging_dir.to_path_buf(),
        source,
    };

    let mut found = Vec::new();
    for entry in std::fs::read_dir(staging_dir).map_err(unreadable)? {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warn!("Error reading staging entry: {}", e);
                continue;
            }
        };
        let path = entry.path();

        // Skip directories and anything else that is not a plain file
        let metadata = match entry.metadata() {
            Ok(m) if m.is_file() => m,
            Ok(_) => continue,
            Err(e) => {
                warn!("Failed to stat {}: {}", path.display(), e);
                continue;
            }
        };

        if !has_media_extension(&path, extensions) {
            debug!("Ignoring non-media file: {}", path.display());
            continue;
        }

        found.push((path, metadata.len()));
    }

    found.sort_by(|a, b| a.0.file_name().cmp(&b.0.file_name()));

    if found.is_empty() {
        debug!("No media files in {}", staging_dir.display());
        return Ok(Vec::new());
    }

    if !stability_wait.is_zero() {
        debug!("Checking stability of {} file(s)", found.len());
        tokio::time::sleep(stability_wait).await;
    }

    let mut results = Vec::with_capacity(found.len());
    for (path, size0) in found {
        if stability_wait.is_zero() {
            results.push(ScanResult::Candidate(path, size0));
            continue;
        }

        match std::fs::metadata(&path) {
            Ok(m) if m.len() == size0 => results.push(ScanResult::Candidate(path, size0)),
            Ok(_) => results.push(ScanResult::Skipped(path, "file still being written".to_string())),
            Err(e) => results.push(ScanResult::Skipped(path, format!("vanished during scan: {}", e))),
        }
    }

    let candidates = results
        .iter()
        .filter(|r| matches!(r, ScanResult::Candidate(..)))
        .count();
    info!(
        "Scan of {}: {} candidate(s), {} skipped",
        staging_dir.display(),
        candidates,
        results.len() - candidates
    );
    Ok(results)
}
