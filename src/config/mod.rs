//! Configuration system
//!
//! Handles loading configuration from multiple sources:
//! - Global config (~/.config/codetether-worker/config.toml)
//! - Project config (./codetether.toml or .codetether/config.toml)
//! - Environment variables (CODETETHER_*, SENDGRID_API_KEY)

use crate::ralph::RalphConfig;
use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs;

pub const DEFAULT_SERVER_URL: &str = "https://api.codetether.run";
pub const DEFAULT_SESSION_URL: &str = "http://127.0.0.1:4096";

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Default model to use (provider/model format)
    #[serde(default)]
    pub default_model: Option<String>,

    /// Agent configurations
    #[serde(default)]
    pub agents: HashMap<String, AgentConfig>,

    /// Worker settings
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Notification channels
    #[serde(default)]
    pub notifications: NotificationsConfig,

    /// Ralph loop settings
    #[serde(default)]
    pub ralph: RalphConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AgentConfig {
    /// Model override for this agent
    #[serde(default)]
    pub model: Option<String>,

    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Broker URL
    #[serde(default)]
    pub server_url: Option<String>,

    /// Bearer token for the broker
    #[serde(default)]
    pub token: Option<String>,

    /// Worker name
    #[serde(default)]
    pub name: Option<String>,

    /// Auto-approve policy
    #[serde(default)]
    pub auto_approve: AutoApprovePolicy,

    /// Codebases to register
    #[serde(default)]
    pub codebases: Vec<PathBuf>,

    /// Session server the executor drives
    #[serde(default)]
    pub session_url: Option<String>,

    /// Delay before reconnecting after the stream closes cleanly
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,

    /// Delay before retrying a failed connection
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

impl std::fmt::Debug for WorkerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerConfig")
            .field("server_url", &self.server_url)
            .field("token", &self.token.as_ref().map(|_| "<REDACTED>"))
            .field("name", &self.name)
            .field("auto_approve", &self.auto_approve)
            .field("codebases", &self.codebases)
            .field("session_url", &self.session_url)
            .field("reconnect_delay_ms", &self.reconnect_delay_ms)
            .field("retry_delay_ms", &self.retry_delay_ms)
            .finish()
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            server_url: None,
            token: None,
            name: None,
            auto_approve: AutoApprovePolicy::default(),
            codebases: Vec::new(),
            session_url: None,
            reconnect_delay_ms: default_reconnect_delay_ms(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

fn default_reconnect_delay_ms() -> u64 {
    1_000
}

fn default_retry_delay_ms() -> u64 {
    5_000
}

/// Tool permission policy for session prompts
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum AutoApprovePolicy {
    All,
    #[default]
    Safe,
    None,
}

/// Read-only capabilities approved under the `safe` policy
const SAFE_TOOLS: &[&str] = &["read", "glob", "grep", "list", "websearch", "lsp"];

impl AutoApprovePolicy {
    pub fn allows(&self, tool: &str) -> bool {
        match self {
            Self::All => true,
            Self::None => false,
            Self::Safe => {
                let normalized: String = tool
                    .chars()
                    .filter(|c| *c != '_' && *c != '-')
                    .flat_map(char::to_lowercase)
                    .collect();
                SAFE_TOOLS
                    .iter()
                    .any(|safe| normalized == *safe || (*safe == "lsp" && normalized.starts_with("lsp")))
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::All => "all",
            Self::Safe => "safe",
            Self::None => "none",
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct NotificationsConfig {
    /// Post lifecycle events to the broker's monitor feed
    #[serde(default = "default_true")]
    pub monitor: bool,

    /// Webhook that receives every event as JSON
    #[serde(default)]
    pub push_url: Option<String>,

    /// Recipient for email summaries
    #[serde(default)]
    pub email_to: Option<String>,

    #[serde(default = "default_email_from")]
    pub email_from: String,

    #[serde(default)]
    pub sendgrid_api_key: Option<String>,

    /// Mail API override (defaults to SendGrid)
    #[serde(default)]
    pub email_endpoint: Option<String>,
}

impl std::fmt::Debug for NotificationsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationsConfig")
            .field("monitor", &self.monitor)
            .field("push_url", &self.push_url)
            .field("email_to", &self.email_to)
            .field("email_from", &self.email_from)
            .field(
                "sendgrid_api_key",
                &self.sendgrid_api_key.as_ref().map(|_| "<REDACTED>"),
            )
            .field("email_endpoint", &self.email_endpoint)
            .finish()
    }
}

impl Default for NotificationsConfig {
    fn default() -> Self {
        Self {
            monitor: true,
            push_url: None,
            email_to: None,
            email_from: default_email_from(),
            sendgrid_api_key: None,
            email_endpoint: None,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_email_from() -> String {
    "worker@codetether.run".to_string()
}

impl Config {
    /// Load configuration from all sources (global, project, env)
    pub async fn load() -> Result<Self> {
        let mut layers = Vec::new();

        // Load global config
        if let Some(global_path) = Self::global_config_path() {
            if global_path.exists() {
                layers.push(Self::read_table(&global_path).await?);
            }
        }

        // Load project config
        for name in ["codetether.toml", ".codetether/config.toml"] {
            let path = PathBuf::from(name);
            if path.exists() {
                layers.push(Self::read_table(&path).await?);
            }
        }

        let mut config = Self::from_layers(layers)?;

        // Apply environment overrides
        config.apply_env();

        Ok(config)
    }

    /// Build a config from file layers, later layers winning key by key
    pub fn from_layers(layers: impl IntoIterator<Item = toml::Table>) -> Result<Self> {
        let mut merged = toml::Table::new();
        for layer in layers {
            merge_tables(&mut merged, layer);
        }
        toml::Value::Table(merged)
            .try_into()
            .context("Invalid configuration")
    }

    async fn read_table(path: &Path) -> Result<toml::Table> {
        let content = fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        content
            .parse::<toml::Table>()
            .with_context(|| format!("Invalid config in {}", path.display()))
    }

    async fn read_file(path: &Path) -> Result<Self> {
        let table = Self::read_table(path).await?;
        Self::from_layers([table])
    }

    /// Get the global config directory path
    pub fn global_config_path() -> Option<PathBuf> {
        ProjectDirs::from("ai", "codetether", "codetether-worker")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Initialize default configuration file
    pub async fn init_default() -> Result<()> {
        if let Some(path) = Self::global_config_path() {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).await?;
            }
            let content = toml::to_string_pretty(&Self::default())?;
            fs::write(&path, content).await?;
            tracing::info!("Created config at {:?}", path);
        }
        Ok(())
    }

    /// Set a configuration value and persist it to the global config
    pub async fn set(key: &str, value: &str) -> Result<()> {
        let mut config = match Self::global_config_path() {
            Some(path) if path.exists() => Self::read_file(&path).await?,
            _ => Self::default(),
        };
        config.set_value(key, value)?;

        if let Some(path) = Self::global_config_path() {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).await?;
            }
            fs::write(&path, toml::to_string_pretty(&config)?).await?;
        }
        Ok(())
    }

    /// Apply a single `key=value` assignment
    pub fn set_value(&mut self, key: &str, value: &str) -> Result<()> {
        let some = || Some(value.to_string());
        match key {
            "default_model" => self.default_model = some(),
            "worker.server_url" => self.worker.server_url = some(),
            "worker.token" => self.worker.token = some(),
            "worker.name" => self.worker.name = some(),
            "worker.session_url" => self.worker.session_url = some(),
            "worker.auto_approve" => {
                self.worker.auto_approve = match value {
                    "all" => AutoApprovePolicy::All,
                    "safe" => AutoApprovePolicy::Safe,
                    "none" => AutoApprovePolicy::None,
                    _ => anyhow::bail!("Invalid auto_approve policy: {}", value),
                }
            }
            "worker.reconnect_delay_ms" => self.worker.reconnect_delay_ms = value.parse()?,
            "worker.retry_delay_ms" => self.worker.retry_delay_ms = value.parse()?,
            "notifications.monitor" => self.notifications.monitor = parse_bool(value)?,
            "notifications.push_url" => self.notifications.push_url = some(),
            "notifications.email_to" => self.notifications.email_to = some(),
            "notifications.email_from" => self.notifications.email_from = value.to_string(),
            "notifications.sendgrid_api_key" => self.notifications.sendgrid_api_key = some(),
            "ralph.max_iterations" => self.ralph.max_iterations = value.parse()?,
            "ralph.agent_command" => self.ralph.agent_command = value.to_string(),
            "ralph.agent_timeout_secs" => self.ralph.agent_timeout_secs = value.parse()?,
            "ralph.quality_gate" => self.ralph.quality_gate = some(),
            "ralph.gate_timeout_secs" => self.ralph.gate_timeout_secs = Some(value.parse()?),
            "ralph.auto_commit" => self.ralph.auto_commit = parse_bool(value)?,
            "ralph.fail_on_agent_exit_status" => {
                self.ralph.fail_on_agent_exit_status = parse_bool(value)?
            }
            _ => {
                if let Some(agent) = key
                    .strip_prefix("agents.")
                    .and_then(|rest| rest.strip_suffix(".model"))
                {
                    self.agents.entry(agent.to_string()).or_default().model = some();
                } else {
                    anyhow::bail!("Unknown config key: {}", key);
                }
            }
        }
        Ok(())
    }

    /// Apply environment variable overrides
    fn apply_env(&mut self) {
        self.apply_env_from(|key| std::env::var(key).ok());
    }

    fn apply_env_from(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(val) = var("CODETETHER_DEFAULT_MODEL") {
            self.default_model = Some(val);
        }
        if let Some(val) = var("CODETETHER_SERVER") {
            self.worker.server_url = Some(val);
        }
        if let Some(val) = var("CODETETHER_TOKEN") {
            self.worker.token = Some(val);
        }
        if let Some(val) = var("CODETETHER_WORKER_NAME") {
            self.worker.name = Some(val);
        }
        if let Some(val) = var("CODETETHER_SESSION_URL") {
            self.worker.session_url = Some(val);
        }
        if let Some(val) = var("CODETETHER_PUSH_URL") {
            self.notifications.push_url = Some(val);
        }
        if let Some(val) = var("CODETETHER_NOTIFY_EMAIL") {
            self.notifications.email_to = Some(val);
        }
        if let Some(val) = var("SENDGRID_API_KEY") {
            self.notifications.sendgrid_api_key = Some(val);
        }
    }

    /// Model for a task: explicit override, then the agent's model, then the default
    pub fn resolve_model(&self, explicit: Option<&str>, agent: Option<&str>) -> Option<String> {
        explicit
            .map(str::to_string)
            .or_else(|| {
                agent
                    .and_then(|name| self.agents.get(name))
                    .and_then(|a| a.model.clone())
            })
            .or_else(|| self.default_model.clone())
    }
}

fn parse_bool(value: &str) -> Result<bool> {
    let normalized = value.trim().to_ascii_lowercase();
    match normalized.as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => anyhow::bail!("Invalid boolean value: {}", value),
    }
}

/// Recursive table merge; scalars and arrays in `overlay` replace those in `base`
fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        let nested = match (base.get_mut(&key), &value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                merge_tables(existing, incoming.clone());
                true
            }
            _ => false,
        };
        if !nested {
            base.insert(key, value);
        }
    }
}
