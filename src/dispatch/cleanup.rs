//! Pre-flight cleanup run before a worker is created or repaired.
//!
//! Every step here is idempotent and best-effort. A dispatch that crashed
//! halfway can leave an orphan session, an empty directory in the worker
//! home or a dangling worktree reference; the next dispatch for the same
//! name clears them.

use std::path::Path;

use crate::adapters::{Rig, Sessions, Worktrees};
use crate::lock::RUNTIME_DIR;

pub fn orphan_state(
    rig: &Rig,
    worker: &str,
    home: &Path,
    sessions: &dyn Sessions,
    worktrees: &dyn Worktrees,
) {
    let session = sessions.session_name(&rig.name, worker);
    match sessions.terminate(&session) {
        Ok(true) => tracing::info!(%session, "cleaned up orphan session"),
        Ok(false) => {}
        Err(e) => tracing::debug!(%session, error = %e, "orphan session check failed"),
    }

    for dir in empty_children(home) {
        match std::fs::remove_dir(&dir) {
            Ok(()) => tracing::info!(path = %dir.display(), "cleaned up empty worker directory"),
            Err(e) => tracing::warn!(path = %dir.display(), error = %e, "could not remove empty worker directory"),
        }
    }

    if let Err(e) = worktrees.prune(rig) {
        tracing::debug!(rig = %rig.name, error = %e, "worktree prune failed");
    }
}

/// Empty directories directly under the home. The runtime dir holds the
/// dispatch lock and is never a candidate.
fn empty_children(home: &Path) -> Vec<std::path::PathBuf> {
    let Ok(entries) = std::fs::read_dir(home) else {
        return Vec::new();
    };
    entries
        .filter_map(Result::ok)
        .filter(|e| e.file_name() != RUNTIME_DIR)
        .map(|e| e.path())
        .filter(|p| is_empty_dir(p))
        .collect()
}

fn is_empty_dir(path: &Path) -> bool {
    std::fs::read_dir(path).is_ok_and(|mut entries| entries.next().is_none())
}
