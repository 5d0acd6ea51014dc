use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use sling::commands;
use sling::commands::dispatch::DispatchArgs;
use sling::commands::lock::LockCommand;
use sling::commands::rate_limit::RateLimitArgs;
use sling::commands::unsling::UnslingArgs;
use sling::commands::worker::WorkerCommand;
use sling::config::TOWN_ROOT_ENV;
use sling::{error, telemetry};

#[derive(Debug, Parser)]
#[command(
    name = "sling",
    version,
    about = "Dispatch work to AI worker agents across a town of rigs"
)]
struct Cli {
    /// Town root directory (default: search upward for town.toml)
    #[arg(long, global = true, env = TOWN_ROOT_ENV)]
    town_root: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Dispatch to a worker in a rig and start its session
    Dispatch(DispatchArgs),
    /// Show or clear a rig's rate limit backoff
    RateLimit(RateLimitArgs),
    /// Inspect and recover worker identity locks
    Lock {
        #[command(subcommand)]
        command: LockCommand,
    },
    /// Manage workers
    Worker {
        #[command(subcommand)]
        command: WorkerCommand,
    },
    /// Take a bead off its worker's hook
    Unsling(UnslingArgs),
    /// Print the JSON Schema for town.toml
    Schema,
}

impl Commands {
    const fn name(&self) -> &'static str {
        match self {
            Self::Dispatch(_) => "dispatch",
            Self::RateLimit(_) => "rate-limit",
            Self::Lock { .. } => "lock",
            Self::Worker { .. } => "worker",
            Self::Unsling(_) => "unsling",
            Self::Schema => "schema",
        }
    }
}

fn main() -> ExitCode {
    telemetry::init();

    let cli = Cli::parse();

    let _span = tracing::info_span!("command", name = cli.command.name()).entered();

    let town_root = cli.town_root.as_deref();
    let result = match &cli.command {
        Commands::Dispatch(args) => args.execute(town_root),
        Commands::RateLimit(args) => args.execute(town_root),
        Commands::Lock { command } => command.execute(town_root),
        Commands::Worker { command } => command.execute(town_root),
        Commands::Unsling(args) => args.execute(town_root),
        Commands::Schema => commands::schema::run_schema(),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            if let Some(exit_err) = e.downcast_ref::<error::ExitError>() {
                exit_err.exit_code()
            } else {
                ExitCode::FAILURE
            }
        }
    }
}
