//! fleetgridd: the fleetgrid daemon and operator CLI.
//!
//! One binary for both sides of fleetgrid:
//! - `run` starts the scheduler workers, the cleanup collector, the
//!   status aggregator and the control API against the local state store
//! - `rollout`, `target`, `filter`, `action` and `cleanup` operate on the
//!   same store. The store admits one process at a time, so while a
//!   daemon holds it these commands are forwarded to its control API.
//!
//! # Usage
//!
//! ```text
//! fleetgridd --config /etc/fleetgrid.toml run --workers 4
//! fleetgridd rollout create fw-2-1 --filter 'tag==beta' --distribution fw-2.1 --groups 10,20,70
//! fleetgridd rollout start fw-2-1
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use fleetgrid_core::FleetConfig;
use fleetgrid_state::{StateError, StateStore};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

mod api;
mod client;
mod commands;
mod daemon;

use commands::Request;
use commands::action::DeviceAction;
use commands::rollout::RolloutAction;
use commands::target::{FilterAction, TargetAction};

const DEFAULT_LOG_FILTER: &str = "info,fleetgridd=debug,fleetgrid=debug";

#[derive(Parser)]
#[command(
    name = "fleetgridd",
    about = "fleetgrid: staged rollouts for device fleets",
    version,
    propagate_version = true
)]
struct Cli {
    /// Path to fleetgrid.toml. Built-in defaults are used when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Data directory, overrides [store].data_dir.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Log as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduler, cleanup collector and status aggregator.
    Run {
        /// Scheduler workers, overrides [scheduler].workers.
        #[arg(long)]
        workers: Option<u32>,
    },
    /// Create and control rollouts.
    Rollout {
        #[command(subcommand)]
        action: RolloutAction,
    },
    /// Manage the target registry.
    Target {
        #[command(subcommand)]
        action: TargetAction,
    },
    /// Manage saved target filters.
    Filter {
        #[command(subcommand)]
        action: FilterAction,
    },
    /// Report action status as a device would.
    Action {
        #[command(subcommand)]
        action: DeviceAction,
    },
    /// Run one cleanup pass over deleted rollouts.
    Cleanup,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let mut config = match &cli.config {
        Some(path) => FleetConfig::from_file(path)?,
        None => FleetConfig::default(),
    };
    if let Some(dir) = cli.data_dir {
        config.store.data_dir = dir;
    }

    std::fs::create_dir_all(&config.store.data_dir)?;

    let request = match cli.command {
        Command::Run { workers } => {
            if let Some(workers) = workers {
                config.scheduler.workers = workers;
            }
            let db_path = config.db_path();
            let store = StateStore::open(&db_path)?;
            info!(path = ?db_path, "state store opened");
            return daemon::run(store, config).await;
        }
        Command::Rollout { action } => Request::Rollout(action),
        Command::Target { action } => Request::Target(action),
        Command::Filter { action } => Request::Filter(action),
        Command::Action { action } => Request::Action(action),
        Command::Cleanup => Request::Cleanup,
    };
    println!("{}", dispatch(&config, request).await?);
    Ok(())
}

/// Run a command in-process, or through the daemon when it holds the store.
async fn dispatch(config: &FleetConfig, request: Request) -> anyhow::Result<String> {
    let db_path = config.db_path();
    match StateStore::open(&db_path) {
        Ok(store) => {
            debug!(path = ?db_path, "state store opened");
            request.execute(&store, config)
        }
        Err(StateError::Locked(_)) => {
            debug!(addr = %config.api.listen, "state store held by a daemon, forwarding");
            client::forward(config.api.listen, config.api.timeout(), &request).await
        }
        Err(e) => Err(e.into()),
    }
}

fn init_tracing(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}
