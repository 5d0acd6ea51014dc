//! Dispatcher: routes a bead to a worker in a rig, creating or repairing the
//! worker as needed, and starts its session.
//!
//! The flow is not transactional. It starts with idempotent cleanup and ends
//! with verification, so repeated dispatches after a crash converge instead of
//! needing a rollback log. The only rollback is removing a worker whose fresh
//! worktree fails verification.

mod cleanup;
mod error;
mod unsling;
mod verify;


use std::time::Duration;

use serde::Serialize;

use crate::adapters::{
    Account, Accounts, AddOptions, BdIssueStore, CommandNotifier, ConfigAccounts, ConfigRigs,
    EventLog, GitWorktrees, IssueStore, JsonlEventLog, Materializer, McpMaterializer, Notifier,
    Rig, RigRegistry, SessionError, Sessions, StartRequest, TmuxSessions, Worker, Worktrees,
    is_valid_worker_name,
};
use crate::config::{AgentsConfig, Town};
use crate::lock::{IdentityLock, LockError};
use crate::ratelimit::{RateLimitTracker, format_wait};

pub use error::{DispatchError, ErrorKind, Step, StepContext};
pub use unsling::{UnslingError, Unslung, unsling};

/// Actor recorded on events this crate emits.
pub const ACTOR: &str = "sling";

/// Source recorded on rate limits observed while starting a session.
pub const RATE_LIMIT_SOURCE: &str = "spawn";

#[derive(Debug, Clone, Default)]
pub struct DispatchOptions {
    /// Bead to hook onto the worker.
    pub hook_bead: Option<String>,
    /// Reuse a worker even if its working copy has uncommitted edits.
    pub force: bool,
    pub account: Option<String>,
    pub agent: Option<String>,
}

/// Handle returned by a successful dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SpawnedWorker {
    pub rig: String,
    pub worker: String,
    pub clone_path: std::path::PathBuf,
    pub session: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account: Option<String>,
    pub agent: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hook_bead: Option<String>,
}

/// Everything the dispatcher drives.
pub struct Collaborators {
    pub rigs: Box<dyn RigRegistry>,
    pub worktrees: Box<dyn Worktrees>,
    pub sessions: Box<dyn Sessions>,
    pub issues: Box<dyn IssueStore>,
    pub accounts: Box<dyn Accounts>,
    pub events: Box<dyn EventLog>,
    pub notifier: Box<dyn Notifier>,
    pub materializer: Box<dyn Materializer>,
}

impl Collaborators {
    /// Production collaborators for a town.
    pub fn for_town(town: &Town) -> Self {
        let cfg = &town.config;
        Self {
            rigs: Box::new(ConfigRigs::new(town.clone())),
            worktrees: Box::new(GitWorktrees::new(cfg.names.pool.clone())),
            sessions: Box::new(TmuxSessions::new(
                &cfg.session.prefix,
                Duration::from_secs(cfg.session.start_timeout_secs),
            )),
            issues: Box::new(BdIssueStore::new(&town.root)),
            accounts: Box::new(ConfigAccounts::new(cfg.accounts.clone())),
            events: Box::new(JsonlEventLog::new(&town.root, &town.name())),
            notifier: Box::new(CommandNotifier::new(cfg.notify.command.clone(), &town.root)),
            materializer: Box::new(McpMaterializer::new(cfg.mcp.servers.clone())),
        }
    }
}

pub struct Dispatcher {
    c: Collaborators,
    agents: AgentsConfig,
}

impl Dispatcher {
    pub const fn new(collaborators: Collaborators, agents: AgentsConfig) -> Self {
        Self {
            c: collaborators,
            agents,
        }
    }

    pub fn for_town(town: &Town) -> Self {
        Self::new(Collaborators::for_town(town), town.config.agents.clone())
    }

    fn rig(&self, name: &str) -> Result<Rig, DispatchError> {
        self.c
            .rigs
            .get_rig(name)
            .at(Step::ResolveRig)?
            .ok_or_else(|| DispatchError::UnknownRig(name.to_string()))
    }

    /// Dispatch to a worker in `rig_name`, creating or repairing it as needed,
    /// and make sure its session is running.
    pub fn spawn_worker(
        &self,
        rig_name: &str,
        opts: &DispatchOptions,
    ) -> Result<SpawnedWorker, DispatchError> {
        let rig = self.rig(rig_name)?;

        let tracker = RateLimitTracker::new(&rig.path);
        match tracker.load() {
            Ok(()) if tracker.should_defer() => {
                return Err(DispatchError::Backoff {
                    rig: rig.name,
                    wait: tracker.time_until_ready(),
                });
            }
            Ok(()) => {}
            Err(e) => tracing::warn!(rig = %rig.name, error = %e, "ignoring unreadable rate limit state"),
        }

        let sessions = self.c.sessions.as_ref();
        let busy = |worker: &str| agent_running(sessions, &sessions.session_name(&rig.name, worker));
        let name = self
            .c
            .worktrees
            .allocate_name(&rig, &busy)
            .at(Step::AllocateName)?;
        tracing::info!(rig = %rig.name, worker = %name, "allocated worker");

        let session = self.c.sessions.session_name(&rig.name, &name);
        let home = rig.worker_home(&name);
        let _guard = IdentityLock::new(&home)
            .acquire_guard(&session)
            .map_err(|source| match source {
                LockError::Locked { .. } => DispatchError::Locked {
                    worker: name.clone(),
                    home: home.clone(),
                    source,
                },
                other => DispatchError::step(Step::Lock, other),
            })?;

        cleanup::orphan_state(
            &rig,
            &name,
            &home,
            self.c.sessions.as_ref(),
            self.c.worktrees.as_ref(),
        );

        let worker = self.prepare_worker(&rig, &name, opts)?;

        if let Err(reason) = verify::worktree_exists(&worker.clone_path) {
            if let Err(e) = self.c.worktrees.remove(&rig, &name, true) {
                tracing::warn!(worker = %name, error = %e, "rollback of unverified worker failed");
            }
            return Err(DispatchError::Integrity {
                rig: rig.name,
                worker: name,
                reason,
            });
        }

        let agent_id = rig.agent_id(&name);
        if let Some(bead) = &opts.hook_bead {
            if let Err(e) = self.ensure_hook(&agent_id, bead) {
                tracing::warn!(%agent_id, %bead, error = %e, "could not verify hook");
            }
        }

        let account = self
            .c
            .accounts
            .resolve(opts.account.as_deref())
            .at(Step::ResolveAccount)?;
        if let Some(account) = &account {
            self.c.accounts.validate(account).at(Step::ValidateAccount)?;
            tracing::info!(account = %account.handle, "using account");
        }

        if let Err(e) = self.c.materializer.materialize(&worker.home, &rig.name, &name) {
            tracing::warn!(worker = %name, error = %e, "could not materialize auxiliary config");
        }

        let running = self.session_reusable(&session, &agent_id, opts.hook_bead.as_deref())?;

        let (agent, command) = self.agents.command(opts.agent.as_deref()).at(Step::ResolveAgent)?;
        if !running {
            tracing::info!(rig = %rig.name, worker = %name, %session, %agent, "starting session");
            let req = StartRequest {
                session: session.clone(),
                work_dir: worker.clone_path.clone(),
                command,
                env: session_env(&rig, &name, &agent_id, opts.hook_bead.as_deref(), account.as_ref()),
            };
            match self.c.sessions.start(&req) {
                Ok(()) => {}
                Err(SessionError::RateLimited { retry_after, .. }) => {
                    let handle = account.as_ref().map_or("", |a| a.handle.as_str());
                    self.record_rate_limit(&tracker, &rig, &name, handle, retry_after);
                    return Err(DispatchError::RateLimited {
                        session,
                        retry_after,
                    });
                }
                Err(SessionError::Other(e)) => return Err(DispatchError::step(Step::StartSession, e)),
            }
        }

        verify::spawned(&worker.clone_path, &session, self.c.sessions.as_ref())
            .at(Step::VerifySpawn)?;

        if tracker.state().limited {
            tracker.record_success();
            if let Err(e) = tracker.save() {
                tracing::warn!(rig = %rig.name, error = %e, "could not reset rate limit state");
            }
        }

        let payload = serde_json::json!({
            "rig": rig.name,
            "worker": name,
            "session": session,
            "bead": opts.hook_bead,
        });
        if let Err(e) = self.c.events.log("spawn", ACTOR, payload) {
            tracing::warn!(error = %e, "could not log spawn event");
        }
        tracing::info!(rig = %rig.name, worker = %name, "worker spawned");

        Ok(SpawnedWorker {
            rig: rig.name,
            worker: name,
            clone_path: worker.clone_path,
            session,
            account: account.map(|a| a.handle),
            agent,
            hook_bead: opts.hook_bead.clone(),
        })
    }

    /// Create the worker, or vet and repair an existing one.
    fn prepare_worker(
        &self,
        rig: &Rig,
        name: &str,
        opts: &DispatchOptions,
    ) -> Result<Worker, DispatchError> {
        let add = AddOptions {
            hook_bead: opts.hook_bead.clone(),
        };
        let Some(existing) = self.c.worktrees.get(rig, name).at(Step::LookupWorker)? else {
            tracing::info!(worker = %name, "creating worker");
            return self.c.worktrees.create(rig, name, &add).at(Step::Create);
        };

        if !opts.force {
            match self.c.worktrees.uncommitted_work(&existing) {
                Ok(status) if !status.is_clean() => {
                    return Err(DispatchError::UncommittedWork {
                        worker: name.to_string(),
                        status,
                    });
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(worker = %name, error = %e, "could not check for uncommitted work"),
            }
        }

        // Force waives the uncommitted-work guard only.
        match self.c.worktrees.unmerged_change(rig, &existing) {
            Ok(Some(change)) => {
                return Err(DispatchError::UnmergedChange {
                    rig: rig.name.clone(),
                    worker: name.to_string(),
                    change,
                });
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(worker = %name, error = %e, "could not check for unmerged change"),
        }

        tracing::info!(worker = %name, "repairing stale worker with fresh worktree");
        self.c
            .worktrees
            .repair(rig, name, opts.force, &add)
            .at(Step::Repair)
    }

    fn ensure_hook(&self, agent_id: &str, bead: &str) -> anyhow::Result<()> {
        if self.c.issues.hooked_bead(agent_id)?.as_deref() == Some(bead) {
            return Ok(());
        }
        tracing::info!(%agent_id, %bead, "setting hook");
        self.c.issues.set_hook(agent_id, bead)
    }

    /// Whether an existing session can be kept. Zombies and sessions bound
    /// to other work are killed.
    fn session_reusable(
        &self,
        session: &str,
        agent_id: &str,
        wanted: Option<&str>,
    ) -> Result<bool, DispatchError> {
        if !self.c.sessions.has_session(session).at(Step::CheckSession)? {
            return Ok(false);
        }

        let alive = self.c.sessions.is_agent_alive(session).unwrap_or_else(|e| {
            tracing::debug!(%session, error = %e, "agent liveness unknown");
            true
        });
        let stale_hook = match self.c.issues.hooked_bead(agent_id) {
            Ok(Some(hooked)) if Some(hooked.as_str()) != wanted => Some(hooked),
            Ok(_) => None,
            Err(e) => {
                tracing::debug!(%agent_id, error = %e, "could not read hook");
                None
            }
        };

        if alive && stale_hook.is_none() {
            return Ok(true);
        }
        match stale_hook {
            Some(hooked) => tracing::info!(%session, %hooked, "session holds other work, killing it"),
            None => tracing::info!(%session, "zombie session, killing it"),
        }
        if let Err(e) = self.c.sessions.terminate(session) {
            tracing::warn!(%session, error = %e, "could not kill session");
        }
        Ok(false)
    }

    fn record_rate_limit(
        &self,
        tracker: &RateLimitTracker,
        rig: &Rig,
        worker: &str,
        account: &str,
        retry_after: Option<Duration>,
    ) {
        // Another process may have recorded hits since admission.
        if let Err(e) = tracker.load() {
            tracing::warn!(rig = %rig.name, error = %e, "reloading rate limit state");
        }
        tracker.record_rate_limit(RATE_LIMIT_SOURCE, account);
        if let Err(e) = tracker.save() {
            tracing::warn!(rig = %rig.name, error = %e, "could not persist rate limit");
        }
        let state = tracker.state();
        tracing::warn!(
            rig = %rig.name,
            %worker,
            hits = state.consecutive_hits,
            backoff = %format_wait(tracker.time_until_ready()),
            "rate limit detected during spawn"
        );

        let subject = format!("RATE_LIMITED worker:{worker}");
        let mut body = format!(
            "Account: {account}\nSource: {RATE_LIMIT_SOURCE}\nWorker: {worker}\nRig: {}\n",
            rig.name
        );
        if let Some(wait) = retry_after {
            body.push_str(&format!("Retry-After: {}\n", format_wait(wait)));
        }
        if let Err(e) = self.c.notifier.notify(&format!("{}/witness", rig.name), &subject, &body) {
            tracing::warn!(error = %e, "could not notify operator of rate limit");
        }
    }

    /// Operator removal of a worker: kill its session, delete its worktree
    /// and home. A live dispatch lock blocks removal unless `force`.
    pub fn remove_worker(&self, rig_name: &str, worker: &str, force: bool) -> Result<(), DispatchError> {
        if !is_valid_worker_name(worker) {
            return Err(DispatchError::InvalidWorker(worker.to_string()));
        }
        let rig = self.rig(rig_name)?;
        let home = rig.worker_home(worker);
        let lock = IdentityLock::new(&home);
        match lock.check() {
            Ok(()) | Err(LockError::NotLocked) => {}
            Err(source @ LockError::Locked { .. }) if !force => {
                return Err(DispatchError::Locked {
                    worker: worker.to_string(),
                    home,
                    source,
                });
            }
            Err(LockError::Locked { info }) => {
                tracing::warn!(%worker, holder = %info, "force-removing locked worker");
            }
            Err(e) => tracing::warn!(%worker, error = %e, "ignoring unreadable lock"),
        }

        let session = self.c.sessions.session_name(&rig.name, worker);
        if self.c.sessions.terminate(&session).at(Step::CheckSession)? {
            tracing::info!(%session, "killed session");
        }
        self.c.worktrees.remove(&rig, worker, force).at(Step::Remove)?;
        if let Err(e) = lock.force_release() {
            tracing::debug!(%worker, error = %e, "lock already gone");
        }
        Ok(())
    }

    /// Unsling `bead` and clear its hook marker on whichever workers hold
    /// it, so their names can be allocated again.
    pub fn unsling(&self, bead: &str, force: bool) -> Result<Unslung, UnslingError> {
        let mut result = unsling(self.c.issues.as_ref(), bead, force)?;
        let rigs = self.c.rigs.list_rigs().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "could not list rigs to clear hook markers");
            Vec::new()
        });
        for rig in rigs {
            match self.c.worktrees.release_hook(&rig, bead) {
                Ok(workers) => result
                    .released
                    .extend(workers.into_iter().map(|w| format!("{}/{w}", rig.name))),
                Err(e) => tracing::warn!(rig = %rig.name, %bead, error = %e, "could not clear hook marker"),
            }
        }
        Ok(result)
    }
}

/// A session counts as running only while its agent process is alive;
/// zombie sessions leave the name free for cleanup to reclaim.
fn agent_running(sessions: &dyn Sessions, session: &str) -> bool {
    match sessions.has_session(session) {
        Ok(true) => sessions.is_agent_alive(session).unwrap_or_else(|e| {
            tracing::debug!(%session, error = %e, "agent liveness unknown");
            true
        }),
        Ok(false) => false,
        Err(e) => {
            tracing::debug!(%session, error = %e, "session check failed");
            false
        }
    }
}

fn session_env(
    rig: &Rig,
    worker: &str,
    agent_id: &str,
    hook: Option<&str>,
    account: Option<&Account>,
) -> Vec<(String, String)> {
    let mut env = vec![
        ("SLING_RIG".to_string(), rig.name.clone()),
        ("SLING_WORKER".to_string(), worker.to_string()),
        ("BD_ACTOR".to_string(), agent_id.to_string()),
    ];
    if let Some(hook) = hook {
        env.push(("SLING_HOOK".to_string(), hook.to_string()));
    }
    if let Some(account) = account {
        env.push((
            "CLAUDE_CONFIG_DIR".to_string(),
            account.config_dir.to_string_lossy().into_owned(),
        ));
        if let Some(token) = &account.auth_token {
            env.push(("ANTHROPIC_AUTH_TOKEN".to_string(), token.clone()));
        }
        if let Some(url) = &account.base_url {
            env.push(("ANTHROPIC_BASE_URL".to_string(), url.clone()));
        }
    }
    env
}
