//! PRD persistence
//!
//! Saves go through a sibling temp file and a rename so a concurrent reader
//! sees either the old document or the new one, never a partial write.

use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;

use super::types::Prd;

#[derive(Debug, Error)]
pub enum PrdError {
    #[error("PRD I/O error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("PRD at {} could not be parsed: {reason}", .path.display())]
    Parse { path: PathBuf, reason: String },

    #[error("PRD at {} is invalid: {reason}", .path.display())]
    Invalid { path: PathBuf, reason: String },

    #[error("PRD could not be serialized: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl Prd {
    /// Load a PRD from a JSON file
    pub async fn load(path: &Path) -> Result<Self, PrdError> {
        let content = fs::read_to_string(path).await.map_err(|source| PrdError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content, path)
    }

    /// Parse and validate PRD content
    pub fn parse(content: &str, path: &Path) -> Result<Self, PrdError> {
        let prd: Prd = serde_json::from_str(content).map_err(|e| PrdError::Parse {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        prd.validate().map_err(|reason| PrdError::Invalid {
            path: path.to_path_buf(),
            reason,
        })?;
        Ok(prd)
    }

    /// Save the PRD to a JSON file, replacing it atomically
    pub async fn save(&self, path: &Path) -> Result<(), PrdError> {
        let content = serde_json::to_string_pretty(self)?;
        let tmp = temp_path(path);
        let io_err = |source| PrdError::Io {
            path: path.to_path_buf(),
            source,
        };

        fs::write(&tmp, content).await.map_err(io_err)?;
        if let Err(e) = fs::rename(&tmp, path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(io_err(e));
        }
        Ok(())
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "prd.json".into());
    name.push(".tmp");
    path.with_file_name(name)
}
