use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Deserialize;

use crate::subprocess::Tool;

use super::{BeadInfo, IssueStore};

/// Issue store backed by the `bd` CLI, run from the town root.
#[derive(Debug, Clone)]
pub struct BdIssueStore {
    dir: PathBuf,
}

#[derive(Debug, Deserialize)]
struct BdIssue {
    id: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    assignee: Option<String>,
    #[serde(default)]
    hook_bead: Option<String>,
}

/// `bd show --json` prints either one issue or a list of them.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ShowOutput {
    One(BdIssue),
    Many(Vec<BdIssue>),
}

impl BdIssueStore {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
        }
    }

    fn bd(&self) -> Tool {
        Tool::new("bd").current_dir(&self.dir)
    }

    fn show_raw(&self, id: &str) -> anyhow::Result<BdIssue> {
        let output = self
            .bd()
            .args(&["show", id, "--json"])
            .run_ok()
            .with_context(|| format!("bead {id} not found"))?;
        output
            .parse_json::<ShowOutput>()
            .and_then(ShowOutput::first)
            .with_context(|| format!("parsing bd show {id}"))
    }
}

impl ShowOutput {
    fn first(self) -> anyhow::Result<BdIssue> {
        match self {
            Self::One(issue) => Ok(issue),
            Self::Many(issues) => issues.into_iter().next().context("empty result"),
        }
    }
}

impl IssueStore for BdIssueStore {
    fn hooked_bead(&self, agent_id: &str) -> anyhow::Result<Option<String>> {
        Ok(self
            .show_raw(agent_id)?
            .hook_bead
            .filter(|b| !b.is_empty()))
    }

    fn set_hook(&self, agent_id: &str, bead: &str) -> anyhow::Result<()> {
        self.bd()
            .args(&["slot", "set", agent_id, "hook", bead])
            .run_ok()
            .with_context(|| format!("setting hook of {agent_id} to {bead}"))?;
        Ok(())
    }

    fn show(&self, bead: &str) -> anyhow::Result<BeadInfo> {
        let issue = self.show_raw(bead)?;
        Ok(BeadInfo {
            id: issue.id,
            title: issue.title,
            status: issue.status,
            assignee: issue.assignee.unwrap_or_default(),
        })
    }

    fn reopen(&self, bead: &str) -> anyhow::Result<()> {
        self.bd()
            .args(&["update", bead, "--status", "open", "--assignee", ""])
            .run_ok()
            .with_context(|| format!("reopening {bead}"))?;
        Ok(())
    }
}
