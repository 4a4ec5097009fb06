//! Ralph types - PRD and state structures

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// A user story in the PRD
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserStory {
    /// Unique identifier (e.g., "US-001")
    pub id: String,

    /// Short title
    pub title: String,

    /// Full description
    #[serde(default)]
    pub description: String,

    /// Acceptance criteria
    #[serde(default, alias = "acceptance_criteria")]
    pub acceptance_criteria: Vec<String>,

    /// Story priority (lower runs first)
    #[serde(default = "default_priority")]
    pub priority: i64,

    /// Whether this story passes its quality gate
    #[serde(default)]
    pub passes: bool,

    /// Learnings recorded when the story passed
    #[serde(default)]
    pub notes: String,
}

fn default_priority() -> i64 {
    1
}

/// The full PRD structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Prd {
    /// Project name
    pub project: String,

    /// Feature being implemented
    #[serde(default)]
    pub feature: String,

    /// Git branch name for this PRD
    #[serde(default, alias = "branch_name")]
    pub branch_name: String,

    /// Free-form description
    #[serde(default)]
    pub description: String,

    /// Version of the PRD format
    #[serde(default = "default_version")]
    pub version: String,

    /// User stories to implement
    #[serde(default, alias = "user_stories")]
    pub user_stories: Vec<UserStory>,

    /// Technical requirements
    #[serde(default, alias = "technical_requirements")]
    pub technical_requirements: Vec<String>,

    /// Quality checks to run when no gate command is configured
    #[serde(default, alias = "quality_checks")]
    pub quality_checks: QualityChecks,
}

fn default_version() -> String {
    "1.0".to_string()
}

/// Quality checks configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QualityChecks {
    #[serde(default)]
    pub typecheck: Option<String>,

    #[serde(default)]
    pub lint: Option<String>,

    #[serde(default)]
    pub test: Option<String>,

    #[serde(default)]
    pub build: Option<String>,
}

impl QualityChecks {
    /// Configured checks in execution order
    pub fn commands(&self) -> Vec<(&'static str, String)> {
        [
            ("typecheck", &self.typecheck),
            ("lint", &self.lint),
            ("test", &self.test),
            ("build", &self.build),
        ]
        .into_iter()
        .filter_map(|(name, cmd)| cmd.clone().map(|c| (name, c)))
        .collect()
    }
}

impl Prd {
    /// Lowest-priority incomplete story. Ties resolve to PRD order.
    pub fn next_story(&self) -> Option<&UserStory> {
        self.user_stories
            .iter()
            .filter(|s| !s.passes)
            .min_by_key(|s| s.priority)
    }

    pub fn completed_stories(&self) -> Vec<&UserStory> {
        self.user_stories.iter().filter(|s| s.passes).collect()
    }

    pub fn remaining_stories(&self) -> Vec<&UserStory> {
        self.user_stories.iter().filter(|s| !s.passes).collect()
    }

    /// Get count of passed stories
    pub fn passed_count(&self) -> usize {
        self.user_stories.iter().filter(|s| s.passes).count()
    }

    /// Check if all stories are complete
    pub fn is_complete(&self) -> bool {
        self.user_stories.iter().all(|s| s.passes)
    }

    /// Mark a story as passed and attach notes. Returns false for unknown ids.
    pub fn mark_passed(&mut self, story_id: &str, notes: &str) -> bool {
        match self.user_stories.iter_mut().find(|s| s.id == story_id) {
            Some(story) => {
                story.passes = true;
                story.notes = notes.to_string();
                true
            }
            None => false,
        }
    }

    /// Story ids must be unique and non-empty
    pub fn validate(&self) -> Result<(), String> {
        let mut seen = std::collections::HashSet::new();
        for story in &self.user_stories {
            if story.id.trim().is_empty() {
                return Err(format!("story '{}' has an empty id", story.title));
            }
            if !seen.insert(story.id.as_str()) {
                return Err(format!("duplicate story id '{}'", story.id));
            }
        }
        Ok(())
    }
}

/// Ralph execution status
///
/// `Paused` is part of the persisted vocabulary but no transition produces it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RalphStatus {
    Running,
    Completed,
    Failed,
    Paused,
}

impl RalphStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Paused => "paused",
        }
    }
}

/// Ralph execution state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RalphState {
    pub prd: Prd,
    pub current_iteration: usize,
    pub max_iterations: usize,
    #[serde(default)]
    pub progress_log: Vec<ProgressEntry>,
    pub started_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
    pub status: RalphStatus,
    pub prd_path: PathBuf,
    pub working_dir: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    Started,
    Completed,
    Failed,
    Skipped,
}

impl ProgressStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

/// A progress log entry. Entries are only ever appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEntry {
    pub timestamp: DateTime<Utc>,
    pub story_id: String,
    pub status: ProgressStatus,
    #[serde(default)]
    pub notes: String,
    pub iteration: usize,
}

/// Ralph configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RalphConfig {
    /// Path to prd.json
    #[serde(default = "default_prd_path")]
    pub prd_path: String,

    /// Maximum iterations
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,

    /// Path to progress.txt, relative to the working directory
    #[serde(default = "default_progress_path")]
    pub progress_path: String,

    /// Shell command that runs the coding agent; the prompt is written to its stdin
    #[serde(default = "default_agent_command")]
    pub agent_command: String,

    /// Ceiling for a single agent run
    #[serde(default = "default_agent_timeout_secs")]
    pub agent_timeout_secs: u64,

    /// Gate command. When unset the PRD's quality checks are used.
    #[serde(default)]
    pub quality_gate: Option<String>,

    /// Optional ceiling for each gate command. Unbounded when unset.
    #[serde(default)]
    pub gate_timeout_secs: Option<u64>,

    /// Whether to commit after a story passes its gate
    #[serde(default = "default_auto_commit")]
    pub auto_commit: bool,

    /// Upper bound for learnings stored per progress entry
    #[serde(default = "default_max_learnings_chars")]
    pub max_learnings_chars: usize,

    /// Fail a story whose agent exits non-zero without a marker, before
    /// the gate runs. Off: the gate decides.
    #[serde(default)]
    pub fail_on_agent_exit_status: bool,
}

fn default_prd_path() -> String {
    "prd.json".to_string()
}
fn default_max_iterations() -> usize {
    10
}
fn default_progress_path() -> String {
    "progress.txt".to_string()
}
fn default_agent_command() -> String {
    "opencode run".to_string()
}
fn default_agent_timeout_secs() -> u64 {
    600
}
fn default_auto_commit() -> bool {
    true
}
fn default_max_learnings_chars() -> usize {
    1000
}

impl Default for RalphConfig {
    fn default() -> Self {
        Self {
            prd_path: default_prd_path(),
            max_iterations: default_max_iterations(),
            progress_path: default_progress_path(),
            agent_command: default_agent_command(),
            agent_timeout_secs: default_agent_timeout_secs(),
            quality_gate: None,
            gate_timeout_secs: None,
            auto_commit: default_auto_commit(),
            max_learnings_chars: default_max_learnings_chars(),
            fail_on_agent_exit_status: false,
        }
    }
}
