use serde::Serialize;

use crate::adapters::{IssueStore, STATUS_CLOSED, STATUS_HOOKED};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Unslung {
    pub bead: String,
    pub previous_agent: String,
    pub was_incomplete: bool,
    /// Workers whose hook marker was cleared, as `<rig>/<worker>`.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub released: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum UnslingError {
    #[error("bead id is required")]
    MissingBead,

    #[error("bead {0} not found")]
    NotFound(String, #[source] anyhow::Error),

    #[error("hooked work {bead} is incomplete ({title}), use --force to unsling anyway")]
    Incomplete { bead: String, title: String },

    #[error("updating bead status")]
    Update(#[source] anyhow::Error),
}

/// Take a bead off its worker's hook: status back to open, assignee cleared.
///
/// Incomplete work is only released with `force`. Beads that are not
/// currently hooked are left as they are.
pub fn unsling(issues: &dyn IssueStore, bead: &str, force: bool) -> Result<Unslung, UnslingError> {
    if bead.is_empty() {
        return Err(UnslingError::MissingBead);
    }
    let info = issues
        .show(bead)
        .map_err(|e| UnslingError::NotFound(bead.to_string(), e))?;

    let was_incomplete = info.status != STATUS_CLOSED;
    if was_incomplete && !force {
        return Err(UnslingError::Incomplete {
            bead: bead.to_string(),
            title: info.title,
        });
    }

    if info.status == STATUS_HOOKED {
        issues.reopen(bead).map_err(UnslingError::Update)?;
        tracing::info!(%bead, previous = %info.assignee, "unslung");
    }

    Ok(Unslung {
        bead: bead.to_string(),
        previous_agent: info.assignee,
        was_incomplete,
        released: Vec::new(),
    })
}
