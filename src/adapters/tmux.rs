use std::time::Duration;

use anyhow::Context;

use crate::ratelimit::{detect_rate_limit, extract_retry_after};
use crate::subprocess::Tool;

use super::{SessionError, Sessions, StartRequest};

/// How long a fresh session runs before its pane is checked for rate limit chatter.
const STARTUP_SETTLE: Duration = Duration::from_secs(2);

/// Pane commands that mean the agent exited and left a bare shell behind.
const SHELLS: &[&str] = &["bash", "zsh", "sh", "fish", "dash", "ksh"];

/// Worker sessions hosted in detached tmux sessions.
#[derive(Debug, Clone)]
pub struct TmuxSessions {
    prefix: String,
    start_timeout: Duration,
}

impl TmuxSessions {
    pub fn new(prefix: &str, start_timeout: Duration) -> Self {
        Self {
            prefix: prefix.to_string(),
            start_timeout,
        }
    }

    fn capture(session: &str) -> anyhow::Result<String> {
        Ok(tmux()
            .args(&["capture-pane", "-p", "-S", "-50", "-t"])
            .arg(pane_target(session))
            .run_ok()?
            .stdout)
    }

    fn pane_pids(session: &str) -> anyhow::Result<Vec<u32>> {
        let output = tmux()
            .args(&["list-panes", "-F", "#{pane_pid}", "-t"])
            .arg(pane_target(session))
            .run_ok()?;
        Ok(output
            .stdout
            .lines()
            .filter_map(|l| l.trim().parse().ok())
            .collect())
    }
}

impl Sessions for TmuxSessions {
    fn session_name(&self, rig: &str, worker: &str) -> String {
        format!("{}-{rig}-{worker}", self.prefix)
    }

    fn has_session(&self, session: &str) -> anyhow::Result<bool> {
        Ok(tmux()
            .args(&["has-session", "-t"])
            .arg(exact(session))
            .run()?
            .success())
    }

    fn is_agent_alive(&self, session: &str) -> anyhow::Result<bool> {
        let output = tmux()
            .args(&["display-message", "-p", "-t"])
            .arg(pane_target(session))
            .arg("#{pane_current_command}")
            .run_ok()
            .with_context(|| format!("inspecting session {session}"))?;
        Ok(!is_shell(output.stdout.trim()))
    }

    fn start(&self, req: &StartRequest) -> Result<(), SessionError> {
        let mut cmd = tmux()
            .args(&["new-session", "-d", "-s", &req.session, "-c"])
            .arg(req.work_dir.to_string_lossy())
            .timeout(self.start_timeout);
        for (k, v) in &req.env {
            cmd = cmd.arg("-e").arg(format!("{k}={v}"));
        }
        let output = cmd.arg(&req.command).run()?;
        if !output.success() {
            let chatter = output.combined();
            if detect_rate_limit(&chatter) {
                return Err(rate_limited(chatter));
            }
            return Err(anyhow::anyhow!(
                "tmux new-session failed (exit {}): {}",
                output.exit_code,
                output.stderr.trim()
            )
            .into());
        }

        std::thread::sleep(STARTUP_SETTLE);
        match Self::capture(&req.session) {
            Ok(pane) if detect_rate_limit(&pane) => {
                if let Err(e) = self.terminate(&req.session) {
                    tracing::warn!(session = %req.session, error = %e, "could not kill rate-limited session");
                }
                Err(rate_limited(pane))
            }
            Ok(_) => Ok(()),
            Err(e) => {
                tracing::debug!(session = %req.session, error = %e, "pane capture failed");
                Ok(())
            }
        }
    }

    fn terminate(&self, session: &str) -> anyhow::Result<bool> {
        if !self.has_session(session)? {
            return Ok(false);
        }
        for pid in Self::pane_pids(session).unwrap_or_default() {
            let pid = pid.to_string();
            // Children first so nothing is reparented and left running.
            let _ = Tool::new("pkill").args(&["-TERM", "-P", &pid]).run();
            let _ = Tool::new("kill").args(&["-TERM", &pid]).run();
        }
        tmux()
            .args(&["kill-session", "-t"])
            .arg(exact(session))
            .run_ok()
            .with_context(|| format!("killing session {session}"))?;
        Ok(true)
    }
}

fn tmux() -> Tool {
    Tool::new("tmux")
}

fn exact(session: &str) -> String {
    format!("={session}")
}

fn pane_target(session: &str) -> String {
    format!("={session}:")
}

fn is_shell(command: &str) -> bool {
    command.is_empty() || SHELLS.contains(&command.trim_start_matches('-'))
}

fn rate_limited(output: String) -> SessionError {
    let wait = extract_retry_after(&output);
    SessionError::RateLimited {
        retry_after: (!wait.is_zero()).then_some(wait),
        output,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_names_follow_prefix() {
        let sessions = TmuxSessions::new("gt", Duration::from_secs(1));
        assert_eq!(sessions.session_name("gastown", "nux"), "gt-gastown-nux");
    }

    #[test]
    fn bare_shells_mean_dead_agent() {
        assert!(is_shell("bash"));
        assert!(is_shell("-zsh"));
        assert!(is_shell(""));
        assert!(!is_shell("claude"));
        assert!(!is_shell("node"));
    }

    #[test]
    fn rate_limited_carries_retry_hint() {
        match rate_limited("429 Too Many Requests, retry after 30 seconds".into()) {
            SessionError::RateLimited { retry_after, .. } => {
                assert_eq!(retry_after, Some(Duration::from_secs(30)));
            }
            SessionError::Other(e) => panic!("unexpected: {e}"),
        }
        match rate_limited("overloaded".into()) {
            SessionError::RateLimited { retry_after, .. } => assert_eq!(retry_after, None),
            SessionError::Other(e) => panic!("unexpected: {e}"),
        }
    }
}
