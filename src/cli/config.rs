//! Configuration management commands

use super::ConfigArgs;
use crate::config::Config;
use anyhow::Result;

pub async fn execute(args: ConfigArgs) -> Result<()> {
    if args.show {
        let config = Config::load().await?;
        let mut shown = config.clone();
        // Never print secrets
        if shown.worker.token.is_some() {
            shown.worker.token = Some("<REDACTED>".to_string());
        }
        if shown.notifications.sendgrid_api_key.is_some() {
            shown.notifications.sendgrid_api_key = Some("<REDACTED>".to_string());
        }
        println!("{}", toml::to_string_pretty(&shown)?);
        return Ok(());
    }

    if args.init {
        Config::init_default().await?;
        println!("Configuration initialized");
        return Ok(());
    }

    if let Some(kv) = args.set {
        let Some((key, value)) = kv.split_once('=') else {
            anyhow::bail!("Invalid format. Use: --set key=value");
        };
        Config::set(key.trim(), value.trim()).await?;
        println!("Set {} = {}", key.trim(), value.trim());
        return Ok(());
    }

    // Default: show help
    println!("Use --show, --init, or --set key=value");
    Ok(())
}
