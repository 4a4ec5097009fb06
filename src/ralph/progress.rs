//! Append-only progress log (progress.txt)
//!
//! The file is the only memory carried between iterations: every prompt
//! embeds its full contents.

use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;

use super::types::ProgressEntry;

pub struct ProgressLog {
    path: PathBuf,
}

impl ProgressLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Full log contents, empty when nothing has been written yet
    pub async fn read(&self) -> anyhow::Result<String> {
        match fs::read_to_string(&self.path).await {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn append(&self, entry: &ProgressEntry) -> anyhow::Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(format_entry(entry).as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

pub fn format_entry(entry: &ProgressEntry) -> String {
    let notes = if entry.notes.trim().is_empty() {
        "(none)"
    } else {
        entry.notes.trim()
    };
    format!(
        "\n---\n\n## Iteration {} - {} ({})\n\n**Status:** {}\n\n### Learnings\n{}\n",
        entry.iteration,
        entry.story_id,
        entry.timestamp.to_rfc3339(),
        entry.status.as_str(),
        notes
    )
}
