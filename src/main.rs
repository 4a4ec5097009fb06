//! CodeTether worker binary
//!
//! `worker` connects to the broker and processes tasks, `ralph` drives a PRD
//! to completion locally, `config` manages the config file.

use clap::Parser;
use codetether_worker::cli::{self, Cli, Command};
use codetether_worker::config::Config;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = match cli.log_level.as_deref() {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    match cli.command {
        Command::Worker(args) => {
            let config = Config::load().await?;
            cli::worker::run(args, config).await
        }
        Command::Ralph(args) => {
            let config = Config::load().await?;
            cli::ralph::execute(args, config).await
        }
        Command::Config(args) => cli::config::execute(args).await,
    }
}
