//! Git helpers for the Ralph loop

use anyhow::{Context, Result};
use std::path::Path;
use tokio::process::Command;
use tracing::info;

async fn git(dir: &Path, args: &[&str]) -> Result<std::process::Output> {
    Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .await
        .with_context(|| format!("Could not run git {}", args.join(" ")))
}

/// Check out `branch`, creating it when it does not exist yet
pub async fn checkout_branch(dir: &Path, branch: &str) -> Result<()> {
    let output = git(dir, &["checkout", branch]).await?;
    if output.status.success() {
        return Ok(());
    }

    let output = git(dir, &["checkout", "-b", branch]).await?;
    if !output.status.success() {
        anyhow::bail!(
            "git checkout -b {} failed: {}",
            branch,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(())
}

/// Stage every change and commit it.
///
/// Returns `None` when nothing is staged, so re-running with an unchanged
/// tree never produces an empty commit.
pub async fn commit_all(dir: &Path, message: &str) -> Result<Option<String>> {
    let add = git(dir, &["add", "-A"]).await?;
    if !add.status.success() {
        anyhow::bail!(
            "git add failed: {}",
            String::from_utf8_lossy(&add.stderr).trim()
        );
    }

    let diff = git(dir, &["diff", "--cached", "--quiet"]).await?;
    match diff.status.code() {
        Some(0) => {
            info!("Nothing staged, skipping commit");
            return Ok(None);
        }
        Some(1) => {}
        _ => anyhow::bail!(
            "git diff --cached failed: {}",
            String::from_utf8_lossy(&diff.stderr).trim()
        ),
    }

    let commit = git(dir, &["commit", "-m", message]).await?;
    if !commit.status.success() {
        anyhow::bail!(
            "git commit failed: {}",
            String::from_utf8_lossy(&commit.stderr).trim()
        );
    }

    let head = git(dir, &["rev-parse", "HEAD"]).await?;
    let hash = String::from_utf8_lossy(&head.stdout).trim().to_string();
    info!(commit = %hash, "Committed: {}", message);
    Ok(Some(hash))
}
