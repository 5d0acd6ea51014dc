use std::path::Path;

use clap::Args;

use crate::config::Town;
use crate::dispatch::Dispatcher;

#[derive(Debug, Args)]
pub struct UnslingArgs {
    /// Bead to take off its worker's hook
    pub bead: String,
    /// Unsling even if the work is incomplete
    #[arg(long)]
    pub force: bool,
    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

impl UnslingArgs {
    pub fn execute(&self, town_root: Option<&Path>) -> anyhow::Result<()> {
        let town = Town::discover(town_root)?;
        let result = Dispatcher::for_town(&town)
            .unsling(&self.bead, self.force)
            .map_err(super::unsling_exit_error)?;

        if self.json {
            println!("{}", serde_json::to_string_pretty(&result)?);
            return Ok(());
        }
        if result.previous_agent.is_empty() {
            println!("Unslung {}", result.bead);
        } else {
            println!("Unslung {} from {}", result.bead, result.previous_agent);
        }
        if result.was_incomplete {
            println!("  Note: work was incomplete");
        }
        for worker in &result.released {
            println!("  Released {worker}");
        }
        Ok(())
    }
}
