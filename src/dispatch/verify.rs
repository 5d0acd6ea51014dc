//! Structural checks run after each mutation of a worker.

use std::io;
use std::path::Path;

use crate::adapters::Sessions;

/// The clone must be a directory with git metadata (`.git` file or dir).
pub fn worktree_exists(clone_path: &Path) -> Result<(), String> {
    match std::fs::metadata(clone_path) {
        Ok(meta) if !meta.is_dir() => {
            return Err(format!("worktree path is not a directory: {}", clone_path.display()));
        }
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(format!("worktree directory does not exist: {}", clone_path.display()));
        }
        Err(e) => return Err(format!("checking worktree directory: {e}")),
    }
    match std::fs::symlink_metadata(clone_path.join(".git")) {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Err(format!(
            "worktree missing .git (not a valid git worktree): {}",
            clone_path.display()
        )),
        Err(e) => Err(format!("checking .git: {e}")),
    }
}

/// After start: the clone is still there and the session is alive.
pub fn spawned(clone_path: &Path, session: &str, sessions: &dyn Sessions) -> anyhow::Result<()> {
    if !clone_path.join(".git").exists() {
        anyhow::bail!("worktree disappeared: {} (missing .git)", clone_path.display());
    }
    if !sessions.has_session(session)? {
        anyhow::bail!("session disappeared: {session}");
    }
    Ok(())
}
