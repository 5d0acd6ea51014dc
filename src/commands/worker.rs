use std::path::Path;

use clap::Subcommand;

use crate::adapters::is_valid_worker_name;
use crate::config::Town;
use crate::dispatch::Dispatcher;
use crate::error::ExitError;

#[derive(Debug, Subcommand)]
pub enum WorkerCommand {
    /// Kill a worker's session and delete its worktree and home
    Remove {
        /// Worker as <rig>/<name>
        target: String,
        /// Remove even if the worker is locked or has unpushed work
        #[arg(long)]
        force: bool,
    },
}

impl WorkerCommand {
    pub fn execute(&self, town_root: Option<&Path>) -> anyhow::Result<()> {
        match self {
            Self::Remove { target, force } => {
                let (rig, name) = parse_target(target)?;
                let town = Town::discover(town_root)?;
                Dispatcher::for_town(&town)
                    .remove_worker(rig, name, *force)
                    .map_err(super::dispatch_exit_error)?;
                println!("Removed worker {rig}/{name}");
                Ok(())
            }
        }
    }
}

fn parse_target(target: &str) -> Result<(&str, &str), ExitError> {
    match target.split_once('/') {
        Some((rig, name)) if !rig.is_empty() && is_valid_worker_name(name) => Ok((rig, name)),
        _ => Err(ExitError::Config(format!(
            "invalid worker {target:?}, expected <rig>/<name>"
        ))),
    }
}
