//! Deferred cleanup of per-process temp directories.
//!
//! A process marks its own temp directory with [`RECYCLE_MARKER`] when it
//! exits. A later run scans the temp root and deletes marked directories
//! that have not been modified for [`RECYCLE_AFTER`]. Deletions are
//! detached tasks: nobody waits for them, and one cut short by process exit
//! is simply retried by a future run.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use log::{debug, info};

pub const RECYCLE_MARKER: &str = "recycle.now";

/// Directories untouched for longer than this are deleted.
pub const RECYCLE_AFTER: Duration = Duration::from_secs(48 * 60 * 60);

/// Write the recycle marker into `temp`.
pub fn mark_for_recycling(temp: &Path) -> std::io::Result<()> {
    std::fs::write(temp.join(RECYCLE_MARKER), "True")
}

/// Marked directories directly under `temp_root` whose modification time is
/// older than `max_age` at `now`.
///
/// The directory's own mtime decides, not the marker's.
pub fn find_recyclable(temp_root: &Path, max_age: Duration, now: SystemTime) -> Vec<PathBuf> {
    let entries = match std::fs::read_dir(temp_root) {
        Ok(entries) => entries,
        Err(e) => {
            debug!("[recycle] Cannot scan {:?}: {}", temp_root, e);
            return Vec::new();
        }
    };

    entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|folder| folder.join(RECYCLE_MARKER).is_file())
        .filter(|folder| {
            let Ok(changed) = std::fs::metadata(folder).and_then(|m| m.modified()) else {
                return false;
            };
            now.duration_since(changed)
                .map(|age| age > max_age)
                .unwrap_or(false)
        })
        .collect()
}

/// Schedule deletion of every recyclable directory and return them.
///
/// Must be called from within a tokio runtime. Each deletion runs as its
/// own detached task; its outcome is only logged.
pub fn recycle_stale(temp_root: &Path, max_age: Duration) -> Vec<PathBuf> {
    let stale = find_recyclable(temp_root, max_age, SystemTime::now());
    for folder in &stale {
        info!("[recycle] Removing stale temp folder {:?}", folder);
        let folder = folder.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::fs::remove_dir_all(&folder).await {
                debug!("[recycle] Failed to remove {:?}: {}", folder, e);
            }
        });
    }
    stale
}

/// Run the recycling scan in the background, fire-and-forget.
pub fn start_temp_recycling(temp_root: PathBuf) {
    tokio::spawn(async move {
        let scheduled = recycle_stale(&temp_root, RECYCLE_AFTER);
        debug!(
            "[recycle] Scan of {:?} scheduled {} deletions",
            temp_root,
            scheduled.len()
        );
    });
}
