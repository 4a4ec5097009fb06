//! `ralph` command: run a PRD, show its status, or scaffold a new one

use super::RalphArgs;
use crate::config::Config;
use crate::ralph::{
    Prd, ProcessAgent, RalphEvent, RalphLoop, RalphStatus, create_prd_template, status_markdown,
};
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

pub async fn execute(args: RalphArgs, config: Config) -> Result<()> {
    let prd_path = args
        .prd
        .clone()
        .unwrap_or_else(|| PathBuf::from(&config.ralph.prd_path));

    match args.action.as_str() {
        "create-prd" => create_prd(&args, &prd_path).await,
        "status" => status(&args, &prd_path, &config).await,
        "run" => run(args, prd_path, config).await,
        other => anyhow::bail!("Unknown ralph action: {}", other),
    }
}

async fn create_prd(args: &RalphArgs, prd_path: &Path) -> Result<()> {
    if prd_path.exists() {
        anyhow::bail!("{} already exists", prd_path.display());
    }
    let project = args.project_name.as_deref().unwrap_or("my-project");
    let feature = args.feature.as_deref().unwrap_or("new-feature");
    let prd = create_prd_template(project, feature);
    prd.save(prd_path).await?;
    println!("Created {}", prd_path.display());
    Ok(())
}

async fn status(args: &RalphArgs, prd_path: &Path, config: &Config) -> Result<()> {
    let prd = Prd::load(prd_path).await?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&prd)?);
    } else {
        println!("{}", status_markdown(&prd, 0, config.ralph.max_iterations));
    }
    Ok(())
}

async fn run(args: RalphArgs, prd_path: PathBuf, config: Config) -> Result<()> {
    let mut ralph_config = config.ralph.clone();
    if let Some(max) = args.max_iterations {
        ralph_config.max_iterations = max;
    }
    if let Some(cmd) = args.agent_command {
        ralph_config.agent_command = cmd;
    }
    if args.gate.is_some() {
        ralph_config.quality_gate = args.gate;
    }

    let agent = Arc::new(ProcessAgent::from_config(&ralph_config));
    let (event_tx, mut event_rx) = mpsc::channel(64);
    let (cancel_tx, cancel_rx) = watch::channel(false);

    let mut ralph = RalphLoop::new(prd_path, ralph_config, agent)
        .await
        .context("Failed to initialize Ralph loop")?
        .with_event_tx(event_tx)
        .with_cancel(cancel_rx);

    let printer = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            match event {
                RalphEvent::Started {
                    project,
                    total_stories,
                    max_iterations,
                } => println!(
                    "Ralph: {} ({} stories, up to {} iterations)",
                    project, total_stories, max_iterations
                ),
                RalphEvent::IterationStarted {
                    iteration,
                    max_iterations,
                } => println!("\n=== Iteration {}/{} ===", iteration, max_iterations),
                RalphEvent::StoryStarted { story_id } => println!("Working on {}", story_id),
                RalphEvent::StoryQualityCheck {
                    check_name, passed, ..
                } => println!(
                    "  {} {}",
                    if passed { "[pass]" } else { "[fail]" },
                    check_name
                ),
                RalphEvent::StoryComplete {
                    story_id,
                    passed,
                    commit,
                } => match (passed, commit) {
                    (true, Some(hash)) => println!("{} passed ({})", story_id, hash),
                    (true, None) => println!("{} passed (nothing to commit)", story_id),
                    (false, _) => println!("{} failed", story_id),
                },
                RalphEvent::Complete { .. } => {}
            }
        }
    });

    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, stopping after the current agent is killed");
            let _ = cancel_tx.send(true);
        }
    });

    let state = ralph.run().await?;
    ctrl_c.abort();
    drop(ralph);
    let _ = printer.await;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&state)?);
    } else {
        println!(
            "\n{}",
            status_markdown(&state.prd, state.current_iteration, state.max_iterations)
        );
    }

    if state.status != RalphStatus::Completed {
        anyhow::bail!(
            "Ralph finished {}: {}/{} stories passed",
            state.status.as_str(),
            state.prd.passed_count(),
            state.prd.user_stories.len()
        );
    }
    Ok(())
}
