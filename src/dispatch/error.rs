use std::fmt;
use std::time::Duration;

use crate::adapters::WorkStatus;
use crate::lock::LockError;
use crate::ratelimit::format_wait;

/// Dispatch stage a wrapped failure came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    ResolveRig,
    AllocateName,
    Lock,
    LookupWorker,
    Create,
    Repair,
    ResolveAccount,
    ValidateAccount,
    ResolveAgent,
    CheckSession,
    StartSession,
    VerifySpawn,
    Remove,
}

impl Step {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ResolveRig => "resolving rig",
            Self::AllocateName => "allocating worker name",
            Self::Lock => "locking worker",
            Self::LookupWorker => "looking up worker",
            Self::Create => "creating worker",
            Self::Repair => "repairing stale worker",
            Self::ResolveAccount => "resolving account",
            Self::ValidateAccount => "validating account",
            Self::ResolveAgent => "resolving agent",
            Self::CheckSession => "checking session",
            Self::StartSession => "starting session",
            Self::VerifySpawn => "verifying spawn",
            Self::Remove => "removing worker",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse classification callers branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Backoff active; retry after the reported wait. Nothing was mutated.
    AdmissionDenied,
    /// Needs caller action: wait, force, or resolve by hand.
    Conflict,
    Validation,
    /// Verification failed; the worker was rolled back.
    Integrity,
    Failed,
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("rig '{0}' not found")]
    UnknownRig(String),

    #[error("invalid worker name {0:?}: expected a single path component")]
    InvalidWorker(String),

    #[error("rate limit backoff active for {rig}, retry in {}", format_wait(*wait))]
    Backoff { rig: String, wait: Duration },

    #[error("worker '{worker}' is in use\nHint: wait for the holder to finish, or 'sling lock release {}' if it is gone", home.display())]
    Locked {
        worker: String,
        home: std::path::PathBuf,
        #[source]
        source: LockError,
    },

    #[error("worker '{worker}' has uncommitted work: {status}\nUse --force to proceed anyway")]
    UncommittedWork { worker: String, status: WorkStatus },

    #[error(
        "worker '{worker}' has unmerged change: {change}\nWait for it to merge before respawning, or abandon it with:\n  sling worker remove --force {rig}/{worker}"
    )]
    UnmergedChange {
        rig: String,
        worker: String,
        change: String,
    },

    #[error(
        "worktree verification failed for {worker}: {reason}\nHint: try 'sling worker remove --force {rig}/{worker}' to clean up"
    )]
    Integrity {
        rig: String,
        worker: String,
        reason: String,
    },

    #[error("rate limit detected while starting {session}{}", retry_hint(*retry_after))]
    RateLimited {
        session: String,
        retry_after: Option<Duration>,
    },

    #[error("{step}")]
    Step {
        step: Step,
        #[source]
        source: anyhow::Error,
    },
}

fn retry_hint(retry_after: Option<Duration>) -> String {
    retry_after.map_or_else(
        || "; dispatch to this rig is backing off".to_string(),
        |d| format!("; provider asked to retry in {}", format_wait(d)),
    )
}

impl DispatchError {
    pub fn step(step: Step, source: impl Into<anyhow::Error>) -> Self {
        Self::Step {
            step,
            source: source.into(),
        }
    }

    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Backoff { .. } | Self::RateLimited { .. } => ErrorKind::AdmissionDenied,
            Self::Locked { .. } | Self::UncommittedWork { .. } | Self::UnmergedChange { .. } => {
                ErrorKind::Conflict
            }
            Self::UnknownRig(_) | Self::InvalidWorker(_) => ErrorKind::Validation,
            Self::Integrity { .. } => ErrorKind::Integrity,
            Self::Step { step, .. } => match step {
                Step::ResolveAccount | Step::ValidateAccount | Step::ResolveAgent => {
                    ErrorKind::Validation
                }
                Step::VerifySpawn => ErrorKind::Integrity,
                _ => ErrorKind::Failed,
            },
        }
    }

    /// Stage tag of a wrapped failure.
    pub const fn failed_step(&self) -> Option<Step> {
        match self {
            Self::Step { step, .. } => Some(*step),
            _ => None,
        }
    }
}

/// Attach a [`Step`] to a collaborator failure.
pub trait StepContext<T> {
    fn at(self, step: Step) -> Result<T, DispatchError>;
}

impl<T, E: Into<anyhow::Error>> StepContext<T> for Result<T, E> {
    fn at(self, step: Step) -> Result<T, DispatchError> {
        self.map_err(|e| DispatchError::step(step, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_errors_keep_their_cause() {
        let err = DispatchError::step(Step::Create, anyhow::anyhow!("disk full"));
        assert_eq!(err.to_string(), "creating worker");
        assert_eq!(err.failed_step(), Some(Step::Create));
        assert_eq!(err.kind(), ErrorKind::Failed);
        let chained = format!("{:#}", anyhow::Error::new(err));
        assert_eq!(chained, "creating worker: disk full");
    }

    #[test]
    fn messages_carry_wait_or_hint() {
        let backoff = DispatchError::Backoff {
            rig: "gastown".into(),
            wait: Duration::from_secs(90),
        };
        assert_eq!(backoff.kind(), ErrorKind::AdmissionDenied);
        assert!(backoff.to_string().contains("retry in 1m30s"));

        let integrity = DispatchError::Integrity {
            rig: "gastown".into(),
            worker: "nux".into(),
            reason: "missing .git".into(),
        };
        assert_eq!(integrity.kind(), ErrorKind::Integrity);
        assert!(integrity.to_string().contains("sling worker remove --force gastown/nux"));
    }

    #[test]
    fn account_failures_are_validation() {
        let err = DispatchError::step(Step::ValidateAccount, anyhow::anyhow!("no creds"));
        assert_eq!(err.kind(), ErrorKind::Validation);
    }
}
