use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;

use crate::subprocess::Tool;

use super::Notifier;

const NOTIFY_TIMEOUT: Duration = Duration::from_secs(30);

/// Operator channel reached through a configured command, invoked as
/// `<command...> <to> -s <subject> -m <body>` from the town root.
#[derive(Debug, Clone)]
pub struct CommandNotifier {
    command: Vec<String>,
    dir: PathBuf,
}

impl CommandNotifier {
    pub fn new(command: Vec<String>, dir: &Path) -> Self {
        Self {
            command,
            dir: dir.to_path_buf(),
        }
    }
}

impl Notifier for CommandNotifier {
    fn notify(&self, to: &str, subject: &str, body: &str) -> anyhow::Result<()> {
        let Some((program, rest)) = self.command.split_first() else {
            tracing::warn!(%to, %subject, "no notify command configured; operator not notified");
            return Ok(());
        };
        let mut cmd = Tool::new(program).current_dir(&self.dir).timeout(NOTIFY_TIMEOUT);
        for arg in rest {
            cmd = cmd.arg(arg);
        }
        cmd.args(&[to, "-s", subject, "-m", body])
            .run_ok()
            .with_context(|| format!("notifying {to}"))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unconfigured_notifier_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        CommandNotifier::new(Vec::new(), dir.path())
            .notify("gastown/witness", "subject", "body")
            .unwrap();
    }

    #[test]
    fn passes_address_subject_and_body() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("sent");
        let script = format!("printf '%s|' \"$@\" > {}", out.display());
        let notifier = CommandNotifier::new(
            vec!["sh".into(), "-c".into(), script, "notify".into()],
            dir.path(),
        );
        notifier.notify("gastown/witness", "RATE_LIMITED", "Rig: gastown").unwrap();

        let sent = std::fs::read_to_string(out).unwrap();
        assert_eq!(sent, "gastown/witness|-s|RATE_LIMITED|-m|Rig: gastown|");
    }

    #[test]
    fn failing_command_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let notifier = CommandNotifier::new(vec!["false".into()], dir.path());
        assert!(notifier.notify("a", "b", "c").is_err());
    }
}
