//! CLI command definitions and handlers

pub mod config;
pub mod ralph;
pub mod worker;

use crate::config::AutoApprovePolicy;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// CodeTether worker - PRD-driven Ralph loop and distributed task worker
#[derive(Parser, Debug)]
#[command(name = "codetether-worker")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Log level (overrides RUST_LOG)
    #[arg(long, global = true, value_parser = ["trace", "debug", "info", "warn", "error"])]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Connect to the broker and process tasks
    Worker(WorkerArgs),

    /// Autonomous PRD-driven agent loop (Ralph)
    Ralph(RalphArgs),

    /// Manage configuration
    Config(ConfigArgs),
}

#[derive(Parser, Debug, Clone)]
pub struct WorkerArgs {
    /// Broker URL
    #[arg(short, long, env = "CODETETHER_SERVER")]
    pub server: Option<String>,

    /// Authentication token
    #[arg(short, long, env = "CODETETHER_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Worker name
    #[arg(short, long, env = "CODETETHER_WORKER_NAME")]
    pub name: Option<String>,

    /// Comma-separated list of codebase paths
    #[arg(short, long, value_delimiter = ',')]
    pub codebases: Vec<PathBuf>,

    /// Auto-approve policy for tool permission prompts
    #[arg(long, value_enum)]
    pub auto_approve: Option<AutoApprovePolicy>,

    /// Session server the executor drives
    #[arg(long, env = "CODETETHER_SESSION_URL")]
    pub session_url: Option<String>,

    /// Email for task reports
    #[arg(short, long, env = "CODETETHER_NOTIFY_EMAIL")]
    pub email: Option<String>,

    /// Push notification endpoint URL
    #[arg(long, env = "CODETETHER_PUSH_URL")]
    pub push_url: Option<String>,

    /// Hostname to bind the worker HTTP server
    #[arg(long, default_value = "0.0.0.0", env = "CODETETHER_WORKER_HOST")]
    pub hostname: String,

    /// Port for the worker HTTP server (health/readiness probes)
    #[arg(long, default_value = "8080", env = "CODETETHER_WORKER_PORT")]
    pub port: u16,

    /// Disable the worker HTTP server
    #[arg(long, env = "CODETETHER_WORKER_HTTP_DISABLED")]
    pub no_http_server: bool,
}

#[derive(Parser, Debug)]
pub struct RalphArgs {
    /// Action to perform
    #[arg(value_parser = ["run", "status", "create-prd"])]
    pub action: String,

    /// Path to prd.json file (defaults to config, then prd.json)
    #[arg(short, long)]
    pub prd: Option<PathBuf>,

    /// Feature name (for create-prd)
    #[arg(short, long)]
    pub feature: Option<String>,

    /// Project name (for create-prd)
    #[arg(long = "project-name")]
    pub project_name: Option<String>,

    /// Maximum iterations (defaults to config)
    #[arg(long)]
    pub max_iterations: Option<usize>,

    /// Agent command; the prompt is written to its stdin
    #[arg(long)]
    pub agent_command: Option<String>,

    /// Quality gate command (defaults to the PRD's quality checks)
    #[arg(long)]
    pub gate: Option<String>,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Parser, Debug)]
pub struct ConfigArgs {
    /// Show current configuration
    #[arg(long)]
    pub show: bool,

    /// Initialize default configuration
    #[arg(long)]
    pub init: bool,

    /// Set a configuration value
    #[arg(long)]
    pub set: Option<String>,
}
