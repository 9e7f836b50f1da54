//! # sync-cli
//!
//! CLI tool for exercising the convo-sync engine.
//!
//! ## Commands
//!
//! - `demo`: Run a two-participant conversation against the in-memory backend
//! - `config`: Print the effective engine configuration
//!
//! ## Example
//!
//! ```bash
//! # Play the scripted conversation and print what the second participant sees
//! convo-sync demo
//!
//! # Same, with a custom configuration
//! convo-sync --config engine.toml demo --quiet
//!
//! # Show the configuration the engine would run with
//! convo-sync --config engine.toml config
//! ```

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;
mod config;

use commands::{demo, show_config};

/// CLI tool for exercising the convo-sync engine.
#[derive(Parser, Debug)]
#[command(name = "convo-sync")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Engine configuration file (TOML); defaults apply when omitted
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a scripted two-participant conversation in memory
    Demo {
        /// Only print the final conversation, not each step
        #[arg(long, short)]
        quiet: bool,
    },

    /// Print the effective engine configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "convo_sync=info,convo_sync_client=warn".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let engine_config = config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Demo { quiet } => {
            demo::run(engine_config, quiet).await?;
        }
        Commands::Config => {
            show_config::run(&engine_config)?;
        }
    }

    Ok(())
}
