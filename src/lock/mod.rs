//! Agent identity locking.
//!
//! A worker identity is claimed by writing `<worker>/.runtime/agent.lock`,
//! a small JSON record naming the owning PID, when it was acquired, the
//! session it belongs to and the host it was written on. The file alone is
//! not proof of ownership: every reader cross-checks the PID against the
//! live process table and treats a dead owner as stale.
//!
//! Locks written on a different host cannot be checked, so they are never
//! considered stale. Only [`IdentityLock::force_release`] removes them.

pub mod liveness;

use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::fsutil;

/// Directory under a worker home holding runtime records.
pub const RUNTIME_DIR: &str = ".runtime";
/// File name of the identity lock inside [`RUNTIME_DIR`].
pub const LOCK_FILE: &str = "agent.lock";

/// Who holds a lock, as seen from the current process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Holder {
    /// The current process.
    Us,
    /// Another live process on this host.
    Live,
    /// A process on this host that no longer exists.
    Stale,
    /// A process on a different host; liveness unknown.
    Foreign,
}

/// Persisted lock record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    pub pid: u32,
    pub acquired_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub session_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub hostname: String,
}

impl LockInfo {
    /// Classify the holder. An empty hostname is treated as local.
    pub fn holder(&self) -> Holder {
        let ours = liveness::hostname();
        if !self.hostname.is_empty() && !ours.is_empty() && self.hostname != ours {
            return Holder::Foreign;
        }
        if self.pid == std::process::id() {
            Holder::Us
        } else if liveness::process_exists(self.pid) {
            Holder::Live
        } else {
            Holder::Stale
        }
    }

    /// True when the owning process is local and dead.
    pub fn is_stale(&self) -> bool {
        self.holder() == Holder::Stale
    }
}

impl fmt::Display for LockInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PID {}", self.pid)?;
        if self.holder() == Holder::Foreign {
            write!(f, " on host {}", self.hostname)?;
        }
        write!(
            f,
            " (session: {}, acquired: {})",
            self.session_id,
            self.acquired_at.to_rfc3339_opts(SecondsFormat::Secs, true)
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("worker is locked by another agent: {info}")]
    Locked { info: LockInfo },

    #[error("worker is not locked")]
    NotLocked,

    #[error("invalid lock file {}: {source}", path.display())]
    Invalid {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("{action} {}: {source}", path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        source: io::Error,
    },
}

/// Identity lock for one worker directory.
#[derive(Debug, Clone)]
pub struct IdentityLock {
    worker_dir: PathBuf,
    lock_path: PathBuf,
}

impl IdentityLock {
    pub fn new(worker_dir: impl Into<PathBuf>) -> Self {
        let worker_dir = worker_dir.into();
        let lock_path = worker_dir.join(RUNTIME_DIR).join(LOCK_FILE);
        Self {
            worker_dir,
            lock_path,
        }
    }

    pub fn worker_dir(&self) -> &Path {
        &self.worker_dir
    }

    pub fn path(&self) -> &Path {
        &self.lock_path
    }

    /// Claim the identity for the current process.
    ///
    /// The lock file is created exclusively, so of several concurrent
    /// claimants exactly one wins. Stale locks are removed and the claim
    /// retried. Re-acquiring from the owning process refreshes the timestamp
    /// and session. A live holder, or any holder on another host, yields
    /// [`LockError::Locked`].
    pub fn acquire(&self, session_id: &str) -> Result<(), LockError> {
        for _ in 0..ACQUIRE_ATTEMPTS {
            match fsutil::create_json_exclusive(&self.lock_path, &record(session_id)) {
                Ok(()) => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
                Err(source) => {
                    return Err(LockError::Io {
                        action: "creating lock file",
                        path: self.lock_path.clone(),
                        source,
                    });
                }
            }
            let info = match self.read() {
                Ok(info) => info,
                Err(LockError::NotLocked) => continue,
                Err(e) => return Err(e),
            };
            match info.holder() {
                Holder::Us => return self.write(session_id),
                Holder::Live | Holder::Foreign => return Err(LockError::Locked { info }),
                Holder::Stale => {
                    tracing::info!(
                        lock = %self.lock_path.display(),
                        pid = info.pid,
                        "removing stale identity lock"
                    );
                    self.remove_if_unchanged(&info)?;
                }
            }
        }
        Err(LockError::Locked { info: self.read()? })
    }

    /// Remove the lock only if it still holds `expected`. Another claimant
    /// may have replaced the stale record since it was read.
    fn remove_if_unchanged(&self, expected: &LockInfo) -> Result<(), LockError> {
        match self.read() {
            Ok(current) if current == *expected => self.release(),
            Ok(_) | Err(LockError::NotLocked) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Acquire and return a guard that releases the lock when dropped.
    pub fn acquire_guard(self, session_id: &str) -> Result<LockGuard, LockError> {
        self.acquire(session_id)?;
        Ok(LockGuard { lock: self })
    }

    /// Delete the lock file. A missing file is not an error.
    pub fn release(&self) -> Result<(), LockError> {
        fsutil::remove_if_exists(&self.lock_path).map_err(|source| LockError::Io {
            action: "removing lock file",
            path: self.lock_path.clone(),
            source,
        })
    }

    /// Read the current record without changing it.
    pub fn read(&self) -> Result<LockInfo, LockError> {
        let data = match fs::read(&self.lock_path) {
            Ok(d) => d,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(LockError::NotLocked),
            Err(source) => {
                return Err(LockError::Io {
                    action: "reading lock file",
                    path: self.lock_path.clone(),
                    source,
                });
            }
        };
        serde_json::from_slice(&data).map_err(|source| LockError::Invalid {
            path: self.lock_path.clone(),
            source,
        })
    }

    /// Succeeds when the worker is free or held by us; stale locks are
    /// removed along the way.
    pub fn check(&self) -> Result<(), LockError> {
        let info = match self.read() {
            Ok(info) => info,
            Err(LockError::NotLocked) => return Ok(()),
            Err(e) => return Err(e),
        };
        match info.holder() {
            Holder::Stale => {
                let _ = self.release();
                Ok(())
            }
            Holder::Us => Ok(()),
            Holder::Live | Holder::Foreign => Err(LockError::Locked { info }),
        }
    }

    /// Human-readable lock state.
    pub fn status(&self) -> String {
        let info = match self.read() {
            Ok(info) => info,
            Err(LockError::NotLocked) => return "unlocked".to_string(),
            Err(e) => return format!("error: {e}"),
        };
        match info.holder() {
            Holder::Stale => format!("stale (dead PID {})", info.pid),
            Holder::Us => "locked (by us)".to_string(),
            Holder::Live => format!(
                "locked by PID {} (session: {})",
                info.pid, info.session_id
            ),
            Holder::Foreign => format!(
                "locked by PID {} on host {} (session: {})",
                info.pid, info.hostname, info.session_id
            ),
        }
    }

    /// Remove the lock regardless of holder. Recovery tooling only.
    pub fn force_release(&self) -> Result<(), LockError> {
        self.release()
    }

    fn write(&self, session_id: &str) -> Result<(), LockError> {
        fsutil::write_json_atomic(&self.lock_path, &record(session_id)).map_err(|source| LockError::Io {
            action: "writing lock file",
            path: self.lock_path.clone(),
            source,
        })
    }
}

/// Claim attempts before giving up on a lock that keeps changing hands.
const ACQUIRE_ATTEMPTS: usize = 3;

fn record(session_id: &str) -> LockInfo {
    LockInfo {
        pid: std::process::id(),
        acquired_at: Utc::now(),
        session_id: session_id.to_string(),
        hostname: liveness::hostname().to_string(),
    }
}

/// Releases the wrapped lock on drop.
#[derive(Debug)]
pub struct LockGuard {
    lock: IdentityLock,
}

impl LockGuard {
    pub const fn lock(&self) -> &IdentityLock {
        &self.lock
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = self.lock.release() {
            tracing::warn!(error = %e, "failed to release identity lock");
        }
    }
}

/// Walk `root` and collect every `.runtime/agent.lock`, keyed by worker dir.
///
/// Unreadable directories and malformed lock files are skipped. `.git`
/// directories are not descended into.
pub fn find_all_locks(root: &Path) -> BTreeMap<PathBuf, LockInfo> {
    let mut locks = BTreeMap::new();
    let mut stack = vec![root.to_path_buf()];

    while let Some(dir) = stack.pop() {
        let Ok(entries) = fs::read_dir(&dir) else {
            continue;
        };
        let in_runtime = dir.file_name() == Some(OsStr::new(RUNTIME_DIR));
        for entry in entries.flatten() {
            let Ok(file_type) = entry.file_type() else {
                continue;
            };
            if file_type.is_dir() {
                if entry.file_name() != ".git" {
                    stack.push(entry.path());
                }
            } else if file_type.is_file() && in_runtime && entry.file_name() == LOCK_FILE {
                if let Some(worker_dir) = dir.parent() {
                    if let Ok(info) = IdentityLock::new(worker_dir).read() {
                        locks.insert(worker_dir.to_path_buf(), info);
                    }
                }
            }
        }
    }

    locks
}

/// Remove every stale lock under `root`. Returns how many were removed.
pub fn clean_stale_locks(root: &Path) -> usize {
    find_all_locks(root)
        .into_iter()
        .filter(|(_, info)| info.is_stale())
        .filter(|(dir, _)| IdentityLock::new(dir).release().is_ok())
        .count()
}

#[cfg(test)]
mod tests {
    use std::process::{Child, Command};

    use super::*;

    fn dead_pid() -> u32 {
        let mut child = Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        pid
    }

    struct Sleeper(Child);

    impl Sleeper {
        fn spawn() -> Self {
            Self(Command::new("sleep").arg("30").spawn().unwrap())
        }
        fn pid(&self) -> u32 {
            self.0.id()
        }
    }

    impl Drop for Sleeper {
        fn drop(&mut self) {
            let _ = self.0.kill();
            let _ = self.0.wait();
        }
    }

    fn plant(lock: &IdentityLock, pid: u32, session: &str, host: &str) {
        let info = LockInfo {
            pid,
            acquired_at: Utc::now(),
            session_id: session.to_string(),
            hostname: host.to_string(),
        };
        fsutil::write_json_atomic(lock.path(), &info).unwrap();
    }

    #[test]
    fn acquire_fresh_writes_our_pid() {
        let dir = tempfile::tempdir().unwrap();
        let lock = IdentityLock::new(dir.path());

        lock.acquire("gt-rig-toast").unwrap();

        let info = lock.read().unwrap();
        assert_eq!(info.pid, std::process::id());
        assert_eq!(info.session_id, "gt-rig-toast");
        assert_eq!(info.hostname, liveness::hostname());
        assert!(dir.path().join(".runtime/agent.lock").exists());
    }

    #[test]
    fn stale_lock_replaced_by_another_claimant_is_kept() {
        let dir = tempfile::tempdir().unwrap();
        let lock = IdentityLock::new(dir.path());
        let dead = dead_pid();
        plant(&lock, dead, "old", "");
        let stale = lock.read().unwrap();

        let owner = Sleeper::spawn();
        plant(&lock, owner.pid(), "winner", "");
        lock.remove_if_unchanged(&stale).unwrap();
        assert_eq!(lock.read().unwrap().session_id, "winner");

        let err = lock.acquire("loser").unwrap_err();
        assert!(matches!(err, LockError::Locked { .. }));
        assert_eq!(lock.read().unwrap().pid, owner.pid());
    }

    #[test]
    fn acquire_leaves_unreadable_lock_alone() {
        let dir = tempfile::tempdir().unwrap();
        let lock = IdentityLock::new(dir.path());
        fsutil::write_atomic(lock.path(), b"{not json").unwrap();

        assert!(matches!(lock.acquire("s"), Err(LockError::Invalid { .. })));
        assert_eq!(std::fs::read(lock.path()).unwrap(), b"{not json");
    }

    #[test]
    fn reacquire_from_same_process_refreshes_session() {
        let dir = tempfile::tempdir().unwrap();
        let lock = IdentityLock::new(dir.path());

        lock.acquire("session-a").unwrap();
        lock.acquire("session-b").unwrap();

        assert_eq!(lock.read().unwrap().session_id, "session-b");
    }

    #[test]
    fn acquire_conflicts_with_live_owner() {
        let dir = tempfile::tempdir().unwrap();
        let lock = IdentityLock::new(dir.path());
        let owner = Sleeper::spawn();
        plant(&lock, owner.pid(), "other-session", liveness::hostname());

        let err = lock.acquire("mine").unwrap_err();

        match &err {
            LockError::Locked { info } => assert_eq!(info.pid, owner.pid()),
            other => panic!("expected Locked, got {other:?}"),
        }
        let msg = err.to_string();
        assert!(msg.contains(&format!("PID {}", owner.pid())), "{msg}");
        assert!(msg.contains("other-session"), "{msg}");
        assert_eq!(lock.read().unwrap().pid, owner.pid(), "holder must be untouched");
    }

    #[test]
    fn acquire_replaces_stale_lock() {
        let dir = tempfile::tempdir().unwrap();
        let lock = IdentityLock::new(dir.path());
        plant(&lock, dead_pid(), "old", "");

        lock.acquire("new").unwrap();

        let info = lock.read().unwrap();
        assert_eq!(info.pid, std::process::id());
        assert_eq!(info.session_id, "new");
    }

    #[test]
    fn check_heals_stale_lock() {
        let dir = tempfile::tempdir().unwrap();
        let lock = IdentityLock::new(dir.path());
        plant(&lock, dead_pid(), "old", liveness::hostname());

        lock.check().unwrap();

        assert!(matches!(lock.read(), Err(LockError::NotLocked)));
    }

    #[test]
    fn check_reports_live_owner() {
        let dir = tempfile::tempdir().unwrap();
        let lock = IdentityLock::new(dir.path());
        let owner = Sleeper::spawn();
        plant(&lock, owner.pid(), "s1", "");

        let err = lock.check().unwrap_err();
        assert!(matches!(err, LockError::Locked { ref info } if info.pid == owner.pid()));
    }

    #[test]
    fn check_passes_when_unlocked_or_ours() {
        let dir = tempfile::tempdir().unwrap();
        let lock = IdentityLock::new(dir.path());
        lock.check().unwrap();
        lock.acquire("s").unwrap();
        lock.check().unwrap();
    }

    #[test]
    fn foreign_host_lock_is_never_stale() {
        if liveness::hostname().is_empty() {
            return;
        }
        let root = tempfile::tempdir().unwrap();
        let lock = IdentityLock::new(root.path().join("worker"));
        plant(&lock, dead_pid(), "remote", "some-other-host.invalid");

        assert!(lock.check().is_err());
        assert!(lock.acquire("mine").is_err());
        assert!(lock.status().contains("on host some-other-host.invalid"));
        assert_eq!(clean_stale_locks(root.path()), 0);

        lock.force_release().unwrap();
        lock.acquire("mine").unwrap();
    }

    #[test]
    fn read_distinguishes_not_locked_and_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let lock = IdentityLock::new(dir.path());
        assert!(matches!(lock.read(), Err(LockError::NotLocked)));

        fs::create_dir_all(dir.path().join(RUNTIME_DIR)).unwrap();
        fs::write(lock.path(), "{not json").unwrap();
        assert!(matches!(lock.read(), Err(LockError::Invalid { .. })));
        assert!(lock.status().starts_with("error:"));
    }

    #[test]
    fn release_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let lock = IdentityLock::new(dir.path());
        lock.release().unwrap();
        lock.acquire("s").unwrap();
        lock.release().unwrap();
        lock.release().unwrap();
        assert!(!lock.path().exists());
    }

    #[test]
    fn status_strings() {
        let dir = tempfile::tempdir().unwrap();
        let lock = IdentityLock::new(dir.path());
        assert_eq!(lock.status(), "unlocked");

        lock.acquire("s").unwrap();
        assert_eq!(lock.status(), "locked (by us)");

        let pid = dead_pid();
        plant(&lock, pid, "s", "");
        assert_eq!(lock.status(), format!("stale (dead PID {pid})"));

        let owner = Sleeper::spawn();
        plant(&lock, owner.pid(), "busy", "");
        assert_eq!(
            lock.status(),
            format!("locked by PID {} (session: busy)", owner.pid())
        );
    }

    #[test]
    fn guard_releases_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = {
            let guard = IdentityLock::new(dir.path()).acquire_guard("s").unwrap();
            assert!(guard.lock().path().exists());
            guard.lock().path().to_path_buf()
        };
        assert!(!path.exists());
    }

    #[test]
    fn find_and_clean_locks_across_tree() {
        let root = tempfile::tempdir().unwrap();
        let live = IdentityLock::new(root.path().join("rig/polecats/toast"));
        let stale = IdentityLock::new(root.path().join("rig/polecats/nux"));
        let misplaced = root.path().join("rig/agent.lock");
        live.acquire("live").unwrap();
        plant(&stale, dead_pid(), "dead", "");
        fs::write(&misplaced, "{}").unwrap();

        let locks = find_all_locks(root.path());
        assert_eq!(locks.len(), 2);
        assert!(locks.contains_key(live.worker_dir()));
        assert!(locks.contains_key(stale.worker_dir()));

        assert_eq!(clean_stale_locks(root.path()), 1);
        assert!(live.path().exists());
        assert!(!stale.path().exists());
    }

    #[test]
    fn find_all_locks_missing_root_is_empty() {
        let root = tempfile::tempdir().unwrap();
        assert!(find_all_locks(&root.path().join("missing")).is_empty());
    }
}
