//! Full-tree reconciliation: walks the watch root, asks the server which
//! files differ, and enqueues `UPLOAD` tasks for anything that doesn't
//! match. Run to completion and exit; this is the tool an operator
//! reaches for after a crash, or after restoring the watch directory from
//! backup, to bring the server back in sync without waiting for live
//! filesystem events.

use std::path::Path;

use tracing::{info, instrument, warn};

use crate::paths;
use crate::store::{TaskExtra, TaskStore};
use crate::uploader::Uploader;

/// Integrity status strings the server may report; anything other than
/// `MATCH` (including a failed call, reported as `UNKNOWN`) means the
/// file should be (re-)uploaded.
const MATCH_STATUS: &str = "MATCH";

/// Walks `root` recursively and enqueues an `UPLOAD` task for every file
/// whose content does not match what the server already has. Returns the
/// number of files scanned and the number enqueued.
#[instrument(skip(store, uploader), fields(root = %root.display()))]
pub async fn run(root: &Path, store: &TaskStore, uploader: &dyn Uploader) -> (u64, u64) {
    let mut scanned = 0u64;
    let mut enqueued = 0u64;

    for entry in walk_files(root) {
        if paths::should_ignore(&entry) {
            continue;
        }
        if paths::is_placeholder(&entry) && entry.metadata().map(|m| m.len()).unwrap_or(0) == 0 {
            continue;
        }

        let Some(rel_path) = paths::relative_path(&entry, root) else {
            continue;
        };
        let Some(md5) = paths::fingerprint(&entry) else {
            warn!(path = %entry.display(), "could not fingerprint file during rescan, skipping");
            continue;
        };

        scanned += 1;

        let status = uploader
            .check_integrity(&rel_path, &md5)
            .await
            .and_then(|body| {
                body.get("status")
                    .and_then(|s| s.as_str())
                    .map(ToString::to_string)
            })
            .unwrap_or_else(|| "UNKNOWN".to_string());

        if status == MATCH_STATUS {
            continue;
        }

        let mtime = entry
            .metadata()
            .ok()
            .and_then(|m| m.modified().ok())
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map_or(0.0, |d| d.as_secs_f64());

        let local_path = entry.to_string_lossy().to_string();
        let extra = TaskExtra::Upload { md5, mtime };
        if store.add(&local_path, &rel_path, extra).await.is_ok() {
            enqueued += 1;
        }
    }

    info!(scanned, enqueued, "rescan complete");
    (scanned, enqueued)
}

/// Recursively lists regular files under `root`, skipping ignored
/// directories entirely rather than descending into them.
fn walk_files(root: &Path) -> Vec<std::path::PathBuf> {
    let mut files = Vec::new();
    let mut stack = vec![root.to_path_buf()];

    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if paths::should_ignore(&path) {
                continue;
            }
            match entry.file_type() {
                Ok(ft) if ft.is_dir() => stack.push(path),
                Ok(ft) if ft.is_file() => files.push(path),
                _ => {}
            }
        }
    }

    files
}
