use std::path::{Path, PathBuf};

use clap::Subcommand;
use serde::Serialize;

use crate::config::resolve_town_root;
use crate::lock::{self, IdentityLock, LockError, LockInfo};

#[derive(Debug, Subcommand)]
pub enum LockCommand {
    /// Show who holds a worker's lock
    Status {
        /// Worker home directory
        worker_dir: PathBuf,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Remove a worker's lock regardless of holder
    Release {
        /// Worker home directory
        worker_dir: PathBuf,
    },
    /// Remove locks whose holder process is gone
    Clean {
        /// Directory to scan (default: town root)
        root: Option<PathBuf>,
    },
    /// List every lock under a directory
    List {
        /// Directory to scan (default: town root)
        root: Option<PathBuf>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Debug, Serialize)]
struct LockEntry {
    worker_dir: PathBuf,
    status: String,
    stale: bool,
    #[serde(flatten)]
    info: LockInfo,
}

impl LockCommand {
    pub fn execute(&self, town_root: Option<&Path>) -> anyhow::Result<()> {
        match self {
            Self::Status { worker_dir, json } => status(worker_dir, *json),
            Self::Release { worker_dir } => release(worker_dir),
            Self::Clean { root } => {
                let root = scan_root(root.as_deref(), town_root)?;
                let removed = lock::clean_stale_locks(&root);
                println!("Removed {removed} stale lock(s) under {}", root.display());
                Ok(())
            }
            Self::List { root, json } => {
                let root = scan_root(root.as_deref(), town_root)?;
                list(&root, *json)
            }
        }
    }
}

fn scan_root(root: Option<&Path>, town_root: Option<&Path>) -> anyhow::Result<PathBuf> {
    match root {
        Some(root) => Ok(root.to_path_buf()),
        None => resolve_town_root(town_root),
    }
}

fn status(worker_dir: &Path, json: bool) -> anyhow::Result<()> {
    let lock = IdentityLock::new(worker_dir);
    let status = lock.status();
    if json {
        let info = lock.read().ok();
        let out = serde_json::json!({
            "worker_dir": worker_dir,
            "status": status,
            "lock": info,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        println!("{}: {status}", worker_dir.display());
    }
    Ok(())
}

fn release(worker_dir: &Path) -> anyhow::Result<()> {
    let lock = IdentityLock::new(worker_dir);
    match lock.read() {
        Ok(info) => {
            lock.force_release()?;
            tracing::info!(worker_dir = %worker_dir.display(), holder = %info, "lock force-released");
            println!("Released lock on {} (was {info})", worker_dir.display());
        }
        Err(LockError::NotLocked) => println!("{} is not locked", worker_dir.display()),
        Err(e @ LockError::Invalid { .. }) => {
            tracing::warn!(error = %e, "removing unreadable lock");
            lock.force_release()?;
            println!("Removed unreadable lock on {}", worker_dir.display());
        }
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

fn list(root: &Path, json: bool) -> anyhow::Result<()> {
    let entries: Vec<LockEntry> = lock::find_all_locks(root)
        .into_iter()
        .map(|(worker_dir, info)| LockEntry {
            status: IdentityLock::new(&worker_dir).status(),
            stale: info.is_stale(),
            worker_dir,
            info,
        })
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }
    if entries.is_empty() {
        println!("No locks under {}", root.display());
        return Ok(());
    }
    for entry in &entries {
        println!("{}  {}", entry.worker_dir.display(), entry.status);
    }
    Ok(())
}
