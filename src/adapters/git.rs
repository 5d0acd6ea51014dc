use std::path::{Path, PathBuf};

use anyhow::Context;

use crate::fsutil;
use crate::lock::{Holder, IdentityLock, LockError, RUNTIME_DIR};
use crate::subprocess::Tool;

use super::{AddOptions, AdapterError, Rig, WORKERS_DIR, WorkStatus, Worker, Worktrees, is_valid_worker_name};

/// File under a worker's runtime dir naming its hooked bead. Cleared when the
/// bead is unslung, which makes the name reusable.
pub const HOOK_FILE: &str = "hook";

/// Git worktrees under `<rig>/polecats/<name>/<rig>`, one branch per worker.
#[derive(Debug, Clone)]
pub struct GitWorktrees {
    pool: Vec<String>,
}

impl GitWorktrees {
    pub const fn new(pool: Vec<String>) -> Self {
        Self { pool }
    }

    fn worker(rig: &Rig, name: &str) -> Result<Worker, AdapterError> {
        if !is_valid_worker_name(name) {
            return Err(AdapterError::InvalidWorkerName(name.to_string()));
        }
        let home = rig.worker_home(name);
        Ok(Worker {
            name: name.to_string(),
            rig: rig.name.clone(),
            clone_path: home.join(&rig.name),
            home,
            branch: branch_name(name),
        })
    }

    /// A name is free unless its agent is running, or its home holds a hook
    /// or a live lock.
    fn is_free(rig: &Rig, name: &str, busy: &dyn Fn(&str) -> bool) -> bool {
        if busy(name) {
            return false;
        }
        let home = rig.worker_home(name);
        if !home.exists() {
            return true;
        }
        if home.join(RUNTIME_DIR).join(HOOK_FILE).exists() {
            return false;
        }
        match IdentityLock::new(&home).read() {
            Ok(info) => info.holder() == Holder::Stale,
            Err(LockError::NotLocked) => true,
            Err(_) => false,
        }
    }

    fn add(rig: &Rig, worker: &Worker, opts: &AddOptions) -> anyhow::Result<()> {
        std::fs::create_dir_all(&worker.home)
            .with_context(|| format!("creating {}", worker.home.display()))?;
        let base = baseline(rig);
        git(&rig.path)
            .args(&["worktree", "add", "-B", &worker.branch])
            .arg(worker.clone_path.to_string_lossy())
            .arg(&base)
            .run_ok()
            .with_context(|| format!("adding worktree for {} from {base}", worker.name))?;
        write_hook(&worker.home, opts.hook_bead.as_deref())
    }

    fn remove_clone(rig: &Rig, worker: &Worker, force: bool) -> anyhow::Result<()> {
        if !worker.clone_path.exists() {
            return Ok(());
        }
        let mut cmd = git(&rig.path).args(&["worktree", "remove"]);
        if force {
            cmd = cmd.arg("--force");
        }
        let result = cmd.arg(worker.clone_path.to_string_lossy()).run_ok();
        match result {
            Ok(_) => Ok(()),
            Err(e) if force => {
                tracing::warn!(worker = %worker.name, error = %e, "git worktree remove failed, deleting directory");
                std::fs::remove_dir_all(&worker.clone_path)
                    .with_context(|| format!("removing {}", worker.clone_path.display()))
            }
            Err(e) => Err(e.context(format!("removing worktree {}", worker.clone_path.display()))),
        }
    }
}

impl Worktrees for GitWorktrees {
    fn allocate_name(&self, rig: &Rig, busy: &dyn Fn(&str) -> bool) -> anyhow::Result<String> {
        let Some(first) = self.pool.first() else {
            anyhow::bail!("worker name pool is empty");
        };
        if let Some(name) = self
            .pool
            .iter()
            .filter(|n| is_valid_worker_name(n))
            .find(|n| Self::is_free(rig, n, busy))
        {
            return Ok(name.clone());
        }
        if !is_valid_worker_name(first) {
            return Err(AdapterError::InvalidWorkerName(first.clone()).into());
        }
        (2..)
            .map(|n| format!("{first}-{n}"))
            .find(|name| Self::is_free(rig, name, busy))
            .context("no free worker name")
    }

    fn get(&self, rig: &Rig, name: &str) -> anyhow::Result<Option<Worker>> {
        let worker = Self::worker(rig, name)?;
        Ok(worker.clone_path.is_dir().then_some(worker))
    }

    fn create(&self, rig: &Rig, name: &str, opts: &AddOptions) -> anyhow::Result<Worker> {
        let worker = Self::worker(rig, name)?;
        Self::add(rig, &worker, opts)?;
        Ok(worker)
    }

    fn repair(
        &self,
        rig: &Rig,
        name: &str,
        force: bool,
        opts: &AddOptions,
    ) -> anyhow::Result<Worker> {
        let worker = Self::worker(rig, name)?;
        Self::remove_clone(rig, &worker, force)?;
        self.prune(rig)?;
        Self::add(rig, &worker, opts)?;
        Ok(worker)
    }

    fn remove(&self, rig: &Rig, name: &str, force: bool) -> anyhow::Result<()> {
        let worker = Self::worker(rig, name)?;
        Self::remove_clone(rig, &worker, force)?;
        if worker.home.exists() {
            std::fs::remove_dir_all(&worker.home)
                .with_context(|| format!("removing {}", worker.home.display()))?;
        }
        if let Err(e) = self.prune(rig) {
            tracing::warn!(error = %e, "git worktree prune failed");
        }
        if let Err(e) = git(&rig.path).args(&["branch", "-D", &worker.branch]).run_ok() {
            tracing::debug!(branch = %worker.branch, error = %e, "branch not deleted");
        }
        Ok(())
    }

    fn uncommitted_work(&self, worker: &Worker) -> anyhow::Result<WorkStatus> {
        let output = git(&worker.clone_path)
            .args(&["status", "--porcelain"])
            .run_ok()
            .with_context(|| format!("checking status of {}", worker.clone_path.display()))?;
        Ok(parse_porcelain(&output.stdout))
    }

    fn unmerged_change(&self, rig: &Rig, worker: &Worker) -> anyhow::Result<Option<String>> {
        let remote_branch = format!("origin/{}", worker.branch);
        let exists = git(&rig.path)
            .args(&["rev-parse", "--verify", "--quiet"])
            .arg(format!("refs/remotes/{remote_branch}"))
            .run()?
            .success();
        if !exists {
            return Ok(None);
        }
        let range = format!("origin/{}..{remote_branch}", rig.default_branch);
        let output = git(&rig.path)
            .args(&["rev-list", "--count", &range])
            .run_ok()
            .with_context(|| format!("counting commits in {range}"))?;
        let ahead: u64 = output.stdout.trim().parse().unwrap_or(0);
        Ok((ahead > 0).then(|| {
            format!(
                "{remote_branch} ({ahead} commit{} not on {})",
                if ahead == 1 { "" } else { "s" },
                rig.default_branch
            )
        }))
    }

    fn prune(&self, rig: &Rig) -> anyhow::Result<()> {
        git(&rig.path)
            .args(&["worktree", "prune"])
            .run_ok()
            .map(|_| ())
            .context("pruning worktrees")
    }

    fn release_hook(&self, rig: &Rig, bead: &str) -> anyhow::Result<Vec<String>> {
        let workers_dir = rig.path.join(WORKERS_DIR);
        let entries = match std::fs::read_dir(&workers_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(anyhow::Error::new(e).context(format!("listing {}", workers_dir.display())));
            }
        };

        let mut released = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            let hook = entry.path().join(RUNTIME_DIR).join(HOOK_FILE);
            let Ok(content) = std::fs::read_to_string(&hook) else {
                continue;
            };
            if content.trim() == bead {
                write_hook(&entry.path(), None)?;
                tracing::info!(rig = %rig.name, worker = %name, %bead, "hook cleared");
                released.push(name);
            }
        }
        released.sort();
        Ok(released)
    }
}

fn git(dir: &Path) -> Tool {
    Tool::new("git").arg("-C").arg(dir.to_string_lossy())
}

fn branch_name(worker: &str) -> String {
    format!("polecat/{worker}")
}

/// Latest baseline to branch from: `origin/<default>` after a best-effort
/// fetch, or the local default branch when there is no usable remote.
fn baseline(rig: &Rig) -> String {
    let has_origin = git(&rig.path)
        .args(&["remote", "get-url", "origin"])
        .run()
        .is_ok_and(|o| o.success());
    if has_origin {
        if let Err(e) = git(&rig.path).args(&["fetch", "origin", &rig.default_branch]).run_ok() {
            tracing::warn!(rig = %rig.name, error = %e, "fetch failed, using last known baseline");
        }
        let remote = format!("origin/{}", rig.default_branch);
        let known = git(&rig.path)
            .args(&["rev-parse", "--verify", "--quiet", &remote])
            .run()
            .is_ok_and(|o| o.success());
        if known {
            return remote;
        }
    }
    rig.default_branch.clone()
}

fn write_hook(home: &Path, bead: Option<&str>) -> anyhow::Result<()> {
    let path: PathBuf = home.join(RUNTIME_DIR).join(HOOK_FILE);
    match bead {
        Some(bead) => fsutil::write_atomic(&path, format!("{bead}\n").as_bytes()),
        None => fsutil::remove_if_exists(&path),
    }
    .with_context(|| format!("writing {}", path.display()))
}

fn parse_porcelain(output: &str) -> WorkStatus {
    let mut status = WorkStatus::default();
    for line in output.lines().filter(|l| l.len() >= 2) {
        let code = &line[..2];
        if code == "??" {
            status.untracked += 1;
        } else if code.contains('A') {
            status.added += 1;
        } else if code.contains('D') {
            status.deleted += 1;
        } else {
            status.modified += 1;
        }
    }
    status
}
