//! Collaborators the dispatcher drives: rig registry, worktrees, sessions,
//! issue store, accounts, event log, operator notifications and auxiliary
//! config. Each is a trait so the dispatcher can be exercised against fakes;
//! the submodules hold the production implementations.

mod accounts;
mod beads;
mod events;
mod git;
mod mcp;
mod notify;
mod rigs;
mod tmux;

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;

pub use accounts::ConfigAccounts;
pub use beads::BdIssueStore;
pub use events::JsonlEventLog;
pub use git::GitWorktrees;
pub use mcp::McpMaterializer;
pub use notify::CommandNotifier;
pub use rigs::ConfigRigs;
pub use tmux::TmuxSessions;

/// Directory under a rig holding worker homes.
pub const WORKERS_DIR: &str = "polecats";

/// A rig: one source repository and its pool of workers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Rig {
    pub name: String,
    pub path: PathBuf,
    pub default_branch: String,
    /// Issue-store prefix for worker agent ids.
    pub prefix: String,
}

impl Rig {
    /// Home directory of a worker, whether or not it exists yet.
    pub fn worker_home(&self, worker: &str) -> PathBuf {
        self.path.join(WORKERS_DIR).join(worker)
    }

    /// Issue-store identity of a worker, e.g. `gt-gastown-polecat-nux`.
    pub fn agent_id(&self, worker: &str) -> String {
        format!("{}-{}-polecat-{worker}", self.prefix, self.name)
    }
}

/// Worker names map to one directory under `polecats/`, so they may not be
/// empty, `.` or `..`, or contain a path separator.
pub fn is_valid_worker_name(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains(['/', '\\', '\0'])
}

pub trait RigRegistry {
    fn get_rig(&self, name: &str) -> anyhow::Result<Option<Rig>>;
    fn list_rigs(&self) -> anyhow::Result<Vec<Rig>>;
}

/// An existing worker's on-disk identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Worker {
    pub name: String,
    pub rig: String,
    pub home: PathBuf,
    pub clone_path: PathBuf,
    pub branch: String,
}

#[derive(Debug, Clone, Default)]
pub struct AddOptions {
    /// Bead hooked to the worker at creation time.
    pub hook_bead: Option<String>,
}

/// Uncommitted changes in a worker's working copy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkStatus {
    pub modified: usize,
    pub added: usize,
    pub deleted: usize,
    pub untracked: usize,
}

impl WorkStatus {
    pub const fn is_clean(&self) -> bool {
        self.modified == 0 && self.added == 0 && self.deleted == 0 && self.untracked == 0
    }
}

impl fmt::Display for WorkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_clean() {
            return f.write_str("clean");
        }
        let parts: Vec<String> = [
            (self.modified, "modified"),
            (self.added, "added"),
            (self.deleted, "deleted"),
            (self.untracked, "untracked"),
        ]
        .into_iter()
        .filter(|(n, _)| *n > 0)
        .map(|(n, label)| format!("{n} {label}"))
        .collect();
        f.write_str(&parts.join(", "))
    }
}

/// Working-copy manager for a rig's workers.
pub trait Worktrees {
    /// Pick a worker name for the next dispatch, skipping names for which
    /// `busy` reports a running agent.
    fn allocate_name(&self, rig: &Rig, busy: &dyn Fn(&str) -> bool) -> anyhow::Result<String>;
    fn get(&self, rig: &Rig, name: &str) -> anyhow::Result<Option<Worker>>;
    fn create(&self, rig: &Rig, name: &str, opts: &AddOptions) -> anyhow::Result<Worker>;
    /// Discard the working copy and recreate it from the latest baseline.
    fn repair(&self, rig: &Rig, name: &str, force: bool, opts: &AddOptions)
    -> anyhow::Result<Worker>;
    fn remove(&self, rig: &Rig, name: &str, force: bool) -> anyhow::Result<()>;
    fn uncommitted_work(&self, worker: &Worker) -> anyhow::Result<WorkStatus>;
    /// Outstanding unmerged change on the worker's branch, if any.
    fn unmerged_change(&self, rig: &Rig, worker: &Worker) -> anyhow::Result<Option<String>>;
    /// Drop working-copy references whose directories are gone.
    fn prune(&self, rig: &Rig) -> anyhow::Result<()>;
    /// Clear the hook marker of every worker hooked to `bead`. Returns the
    /// names of the workers released.
    fn release_hook(&self, rig: &Rig, bead: &str) -> anyhow::Result<Vec<String>>;
}

#[derive(Debug, Clone)]
pub struct StartRequest {
    pub session: String,
    pub work_dir: PathBuf,
    pub command: String,
    pub env: Vec<(String, String)>,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("rate limit detected while starting session")]
    RateLimited {
        output: String,
        retry_after: Option<Duration>,
    },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Execution session backend.
pub trait Sessions {
    fn session_name(&self, rig: &str, worker: &str) -> String;
    fn has_session(&self, session: &str) -> anyhow::Result<bool>;
    /// False when the session exists but its agent process is gone.
    fn is_agent_alive(&self, session: &str) -> anyhow::Result<bool>;
    fn start(&self, req: &StartRequest) -> Result<(), SessionError>;
    /// Kill the session and its process tree. Returns false if there was none.
    fn terminate(&self, session: &str) -> anyhow::Result<bool>;
}

/// What the issue store knows about a bead.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BeadInfo {
    pub id: String,
    pub title: String,
    pub status: String,
    pub assignee: String,
}

pub const STATUS_HOOKED: &str = "hooked";
pub const STATUS_CLOSED: &str = "closed";

pub trait IssueStore {
    /// Bead currently hooked to an agent, if any.
    fn hooked_bead(&self, agent_id: &str) -> anyhow::Result<Option<String>>;
    fn set_hook(&self, agent_id: &str, bead: &str) -> anyhow::Result<()>;
    fn show(&self, bead: &str) -> anyhow::Result<BeadInfo>;
    /// Status back to open, assignee cleared.
    fn reopen(&self, bead: &str) -> anyhow::Result<()>;
}

/// Execution credentials for a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub handle: String,
    pub config_dir: PathBuf,
    pub auth_token: Option<String>,
    pub base_url: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error("account {0:?} is not configured")]
    UnknownAccount(String),
    #[error("account {handle:?} has no usable credentials: {reason}")]
    InvalidCredentials { handle: String, reason: String },
    #[error("invalid worker name {0:?}")]
    InvalidWorkerName(String),
}

pub trait Accounts {
    /// Explicit handle, else the configured default, else no account.
    fn resolve(&self, handle: Option<&str>) -> anyhow::Result<Option<Account>>;
    fn validate(&self, account: &Account) -> anyhow::Result<()>;
}

pub trait EventLog {
    fn log(&self, kind: &str, actor: &str, payload: serde_json::Value) -> anyhow::Result<()>;
}

pub trait Notifier {
    fn notify(&self, to: &str, subject: &str, body: &str) -> anyhow::Result<()>;
}

/// Writes per-worker auxiliary config before a session starts.
pub trait Materializer {
    fn materialize(&self, home: &Path, rig: &str, worker: &str) -> anyhow::Result<()>;
}
