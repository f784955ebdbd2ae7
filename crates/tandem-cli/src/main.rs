//! Tandem - Multi-cluster failover client
//!
//! Inspect a combined failover configuration or exercise it against
//! simulated in-memory clusters.

mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tandem_core::Configuration;
use tracing::debug;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::commands::{info::InfoArgs, simulate::SimulateArgs};

#[derive(Parser)]
#[command(name = "tandem")]
#[command(author = "Tandem Team")]
#[command(version = tandem_core::VERSION)]
#[command(about = "Multi-cluster failover client for key-value stores", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (TOML)
    #[arg(short, long, global = true, env = "TANDEM_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, env = "TANDEM_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the resolved cluster layout and thresholds
    Info(InfoArgs),

    /// Run reads and writes against simulated clusters
    Simulate(SimulateArgs),

    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .init();

    match cli.command {
        Commands::Info(args) => commands::info::run(load_config(cli.config)?, args),
        Commands::Simulate(args) => commands::simulate::run(load_config(cli.config)?, args).await,
        Commands::Version => {
            println!("tandem {}", tandem_core::VERSION);
            Ok(())
        }
    }
}

/// Load the configuration file, if any, then apply `TANDEM_*` overrides
fn load_config(path: Option<PathBuf>) -> anyhow::Result<Configuration> {
    let config = match path {
        Some(path) => {
            debug!("Loading configuration from {}", path.display());
            let mut config = Configuration::from_file(&path)?;
            config.apply_env_overrides(std::env::vars());
            config
        }
        None => Configuration::from_env(),
    };
    Ok(config)
}
