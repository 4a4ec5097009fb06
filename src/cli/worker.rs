//! `worker` command: connect to the broker and process tasks until interrupted

use super::WorkerArgs;
use crate::a2a::client::BrokerClient;
use crate::a2a::worker::{Worker, WorkerOptions};
use crate::a2a::WorkerIdentity;
use crate::config::{Config, DEFAULT_SERVER_URL, DEFAULT_SESSION_URL};
use crate::notify::{EmailTarget, MonitorTarget, NotificationConfig, Notifier};
use crate::opencode::OpenCodeClient;
use crate::session::TaskExecutor;
use crate::worker_server::{self, WorkerServerState};
use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Worker settings after CLI flags are laid over config
#[derive(Debug, Clone)]
pub struct ResolvedWorker {
    pub server: String,
    pub token: Option<String>,
    pub name: String,
    pub codebases: Vec<String>,
    pub session_url: String,
}

pub fn resolve(args: &WorkerArgs, config: &Config) -> Result<ResolvedWorker> {
    let worker = &config.worker;
    let server = args
        .server
        .clone()
        .or_else(|| worker.server_url.clone())
        .unwrap_or_else(|| DEFAULT_SERVER_URL.to_string());

    let mut paths: Vec<PathBuf> = if args.codebases.is_empty() {
        worker.codebases.clone()
    } else {
        args.codebases.clone()
    };
    if paths.is_empty() {
        paths.push(std::env::current_dir()?);
    }

    Ok(ResolvedWorker {
        server: server.trim_end_matches('/').to_string(),
        token: args.token.clone().or_else(|| worker.token.clone()),
        name: args
            .name
            .clone()
            .or_else(|| worker.name.clone())
            .unwrap_or_else(|| format!("codetether-{}", std::process::id())),
        codebases: paths.iter().map(|p| p.display().to_string()).collect(),
        session_url: args
            .session_url
            .clone()
            .or_else(|| worker.session_url.clone())
            .unwrap_or_else(|| DEFAULT_SESSION_URL.to_string()),
    })
}

pub fn notification_config(
    args: &WorkerArgs,
    config: &Config,
    resolved: &ResolvedWorker,
    worker_id: &str,
) -> NotificationConfig {
    let notify = &config.notifications;
    let monitor = notify.monitor.then(|| MonitorTarget {
        server: resolved.server.clone(),
        token: resolved.token.clone(),
        worker_id: worker_id.to_string(),
    });

    let email_to = args.email.clone().or_else(|| notify.email_to.clone());
    let email = match (email_to, notify.sendgrid_api_key.clone()) {
        (Some(to), Some(api_key)) => Some(EmailTarget {
            api_key,
            to,
            from: notify.email_from.clone(),
            endpoint: notify.email_endpoint.clone(),
        }),
        (Some(_), None) => {
            tracing::warn!("Email notifications requested but SENDGRID_API_KEY is not set");
            None
        }
        _ => None,
    };

    NotificationConfig {
        monitor,
        push_url: args.push_url.clone().or_else(|| notify.push_url.clone()),
        email,
    }
}

pub async fn run(args: WorkerArgs, config: Config) -> Result<()> {
    let resolved = resolve(&args, &config)?;
    let identity = WorkerIdentity::generate(resolved.name.clone(), resolved.codebases.clone());
    let worker_id = identity.worker_id.clone();

    let broker = BrokerClient::new(resolved.server.clone(), identity)
        .with_token(resolved.token.clone());

    let notify_config = notification_config(&args, &config, &resolved, &worker_id);
    let notifier = Notifier::from_config(&notify_config);
    tracing::info!(channels = ?notifier.channel_names(), "Notification channels");

    let config = Arc::new(config);
    let backend = Arc::new(OpenCodeClient::new(resolved.session_url.clone()));
    let mut executor = TaskExecutor::new(backend, Arc::clone(&config));
    if let Some(policy) = args.auto_approve {
        executor = executor.with_policy(policy);
    }
    tracing::info!("Session server: {}", resolved.session_url);

    let options = WorkerOptions {
        reconnect_delay: Duration::from_millis(config.worker.reconnect_delay_ms),
        retry_delay: Duration::from_millis(config.worker.retry_delay_ms),
    };
    let worker = Arc::new(Worker::new(broker, Arc::new(executor), notifier).with_options(options));

    if !args.no_http_server {
        let addr = format!("{}:{}", args.hostname, args.port);
        let state = WorkerServerState {
            worker_id,
            connected: worker.connected_flag(),
            processing: worker.processing().clone(),
        };
        tokio::spawn(async move {
            if let Err(e) = worker_server::start(&addr, state).await {
                tracing::error!(error = %e, "Worker HTTP server failed");
            }
        });
    }

    tokio::select! {
        result = Arc::clone(&worker).run() => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutting down worker");
            worker.announce_stopped().await;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::{Cli, Command};
    use clap::Parser;

    fn worker_args(extra: &[&str]) -> WorkerArgs {
        let mut argv = vec!["codetether-worker", "worker"];
        argv.extend_from_slice(extra);
        match Cli::try_parse_from(argv).unwrap().command {
            Command::Worker(args) => args,
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn flags_override_config() {
        let mut config = Config::default();
        config.worker.server_url = Some("http://from-config/".into());
        config.worker.name = Some("cfg-name".into());
        config.worker.codebases = vec![PathBuf::from("/cfg")];

        let args = worker_args(&["--server", "http://from-flag/", "--codebases", "/flag"]);
        let resolved = resolve(&args, &config).unwrap();
        assert_eq!(resolved.server, "http://from-flag");
        assert_eq!(resolved.name, "cfg-name");
        assert_eq!(resolved.codebases, vec!["/flag".to_string()]);
        assert_eq!(resolved.session_url, DEFAULT_SESSION_URL);
    }

    #[test]
    fn email_requires_api_key() {
        let mut config = Config::default();
        config.notifications.monitor = false;
        let args = worker_args(&["--server", "http://b", "--email", "ops@example.com"]);
        let resolved = resolve(&args, &config).unwrap();

        let without_key = notification_config(&args, &config, &resolved, "wrk_1");
        assert!(without_key.email.is_none());
        assert!(without_key.monitor.is_none());

        config.notifications.sendgrid_api_key = Some("sg-key".into());
        let with_key = notification_config(&args, &config, &resolved, "wrk_1");
        let email = with_key.email.unwrap();
        assert_eq!(email.to, "ops@example.com");
        assert_eq!(email.from, "worker@codetether.run");
    }

    #[test]
    fn monitor_targets_the_broker() {
        let config = Config::default();
        let args = worker_args(&["--server", "http://b", "--token", "t0k"]);
        let resolved = resolve(&args, &config).unwrap();
        let notify = notification_config(&args, &config, &resolved, "wrk_9");
        let monitor = notify.monitor.unwrap();
        assert_eq!(monitor.server, "http://b");
        assert_eq!(monitor.token.as_deref(), Some("t0k"));
        assert_eq!(monitor.worker_id, "wrk_9");
    }
}
