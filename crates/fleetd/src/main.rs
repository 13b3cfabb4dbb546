//! fleetd — the fleetgrid daemon.
//!
//! Single binary that assembles the fleetgrid subsystems:
//! - State store (redb)
//! - Fleet-size orchestrator (pool sizing + fleet managers)
//! - Lifecycle reconciler
//! - REST API + Prometheus metrics
//!
//! # Usage
//!
//! ```text
//! fleetd run --config fleet.toml --data-dir /var/lib/fleetgrid
//! fleetd tick --config fleet.toml
//! fleetd scale-pool win-compile --config fleet.toml
//! fleetd check-config --config fleet.toml
//! ```

mod daemon;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "fleetd", about = "fleetgrid daemon")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the control loops and the API server until interrupted.
    Run {
        /// Path to fleet.toml.
        #[arg(long, default_value = "fleet.toml")]
        config: PathBuf,

        /// Data directory for persistent state.
        #[arg(long, default_value = "/var/lib/fleetgrid")]
        data_dir: PathBuf,

        /// Port to listen on (overrides `api.port`).
        #[arg(long)]
        port: Option<u16>,
    },
    /// Evaluate every pool once and print the report.
    Tick {
        #[arg(long, default_value = "fleet.toml")]
        config: PathBuf,

        #[arg(long, default_value = "/var/lib/fleetgrid")]
        data_dir: PathBuf,
    },
    /// Size and scale one pool now and print the result.
    ScalePool {
        /// Pool id.
        id: String,

        #[arg(long, default_value = "fleet.toml")]
        config: PathBuf,

        #[arg(long, default_value = "/var/lib/fleetgrid")]
        data_dir: PathBuf,
    },
    /// Parse and validate fleet.toml, then print it normalized.
    CheckConfig {
        #[arg(long, default_value = "fleet.toml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,fleetd=debug,fleetgrid=debug"));
    if cli.log_json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    match cli.command {
        Command::Run {
            config,
            data_dir,
            port,
        } => daemon::run(&config, &data_dir, port).await,
        Command::Tick { config, data_dir } => {
            let report = daemon::tick_once(&config, &data_dir).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Command::ScalePool {
            id,
            config,
            data_dir,
        } => {
            let result = daemon::scale_pool_once(&config, &data_dir, &id).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(())
        }
        Command::CheckConfig { config } => {
            let config = daemon::load_config(&config)?;
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
    }
}
