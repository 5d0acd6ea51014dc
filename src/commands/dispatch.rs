use std::path::Path;

use clap::Args;

use crate::config::Town;
use crate::dispatch::{DispatchOptions, Dispatcher};

#[derive(Debug, Args)]
pub struct DispatchArgs {
    /// Rig to dispatch into
    pub rig: String,
    /// Bead to hook onto the worker
    #[arg(long)]
    pub bead: Option<String>,
    /// Reuse a worker even if it has uncommitted work
    #[arg(long)]
    pub force: bool,
    /// Account handle to run the agent under
    #[arg(long)]
    pub account: Option<String>,
    /// Agent preset from [agents.commands]
    #[arg(long)]
    pub agent: Option<String>,
    /// Print the spawned worker as JSON
    #[arg(long)]
    pub json: bool,
}

impl DispatchArgs {
    pub fn execute(&self, town_root: Option<&Path>) -> anyhow::Result<()> {
        let town = Town::discover(town_root)?;
        let dispatcher = Dispatcher::for_town(&town);
        let opts = DispatchOptions {
            hook_bead: self.bead.clone(),
            force: self.force,
            account: self.account.clone(),
            agent: self.agent.clone(),
        };

        let spawned = dispatcher
            .spawn_worker(&self.rig, &opts)
            .map_err(super::dispatch_exit_error)?;

        if self.json {
            println!("{}", serde_json::to_string_pretty(&spawned)?);
            return Ok(());
        }
        println!("Dispatched {}/{}", spawned.rig, spawned.worker);
        println!("  Session: {}", spawned.session);
        println!("  Clone:   {}", spawned.clone_path.display());
        println!("  Agent:   {}", spawned.agent);
        if let Some(account) = &spawned.account {
            println!("  Account: {account}");
        }
        if let Some(bead) = &spawned.hook_bead {
            println!("  Hook:    {bead}");
        }
        Ok(())
    }
}
