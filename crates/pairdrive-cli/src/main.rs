//! Pairdrive CLI
//!
//! Thin binary over the engine: loads the configuration, initialises the
//! process-wide observability pieces, and runs the sync root.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;

use commands::{config::ConfigCommand, sync::SyncCommand};

#[derive(Debug, Parser)]
#[command(name = "pairdrive", version, about = "Two-way cloud drive synchronization")]
pub struct Cli {
    /// Use an alternate config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Verbose output (can be repeated: -v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Synchronize the configured root with the remote drive
    Sync(SyncCommand),
    /// Show the effective configuration
    #[command(subcommand)]
    Config(ConfigCommand),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(pairdrive_core::config::Config::default_path);
    let config = pairdrive_core::config::Config::load_or_default(&config_path);

    let default_level = match cli.verbose {
        0 => config.logging.level.clone(),
        1 => "debug".to_string(),
        _ => "trace".to_string(),
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    match cli.command {
        Commands::Sync(cmd) => cmd.run(config).await,
        Commands::Config(cmd) => cmd.run(config, &config_path),
    }
}
