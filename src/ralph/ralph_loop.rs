//! Ralph loop - the core autonomous execution loop

use super::agent::{AgentRunner, AgentTermination};
use super::git;
use super::progress::ProgressLog;
use super::types::*;
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Progress events emitted while the loop runs
#[derive(Debug, Clone)]
pub enum RalphEvent {
    Started {
        project: String,
        total_stories: usize,
        max_iterations: usize,
    },
    IterationStarted {
        iteration: usize,
        max_iterations: usize,
    },
    StoryStarted {
        story_id: String,
    },
    StoryQualityCheck {
        story_id: String,
        check_name: String,
        passed: bool,
    },
    StoryComplete {
        story_id: String,
        passed: bool,
        commit: Option<String>,
    },
    Complete {
        status: RalphStatus,
        passed: usize,
        total: usize,
    },
}

/// Outcome of a single iteration
#[derive(Debug, Clone)]
pub struct IterationResult {
    pub story_id: String,
    pub passed: bool,
    pub commit: Option<String>,
    pub learnings: String,
    pub error: Option<String>,
}

/// Completion marker found in agent output
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionMarker {
    Complete,
    Blocked(String),
    Missing,
}

struct GateOutcome {
    passed: bool,
    summary: String,
}

/// The main Ralph executor
pub struct RalphLoop {
    state: RalphState,
    config: RalphConfig,
    agent: Arc<dyn AgentRunner>,
    progress: ProgressLog,
    event_tx: Option<mpsc::Sender<RalphEvent>>,
    cancel: watch::Receiver<bool>,
}

impl RalphLoop {
    /// Create a new Ralph loop for the PRD at `prd_path`
    pub async fn new(
        prd_path: PathBuf,
        config: RalphConfig,
        agent: Arc<dyn AgentRunner>,
    ) -> anyhow::Result<Self> {
        let prd = Prd::load(&prd_path).await?;

        // Work next to the PRD unless it lives in the current directory
        let working_dir = match prd_path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => std::env::current_dir()?,
        };

        info!(
            "Loaded PRD: {} - {} ({} stories)",
            prd.project,
            prd.feature,
            prd.user_stories.len()
        );

        let now = Utc::now();
        let state = RalphState {
            prd,
            current_iteration: 0,
            max_iterations: config.max_iterations,
            progress_log: Vec::new(),
            started_at: now,
            last_updated_at: now,
            status: RalphStatus::Running,
            prd_path,
            working_dir: working_dir.clone(),
        };
        let (_never, cancel) = watch::channel(false);

        Ok(Self {
            state,
            progress: ProgressLog::new(working_dir.join(&config.progress_path)),
            config,
            agent,
            event_tx: None,
            cancel,
        })
    }

    /// Attach an event channel
    pub fn with_event_tx(mut self, tx: mpsc::Sender<RalphEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    /// Attach an external cancellation signal; sending `true` stops the loop
    pub fn with_cancel(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = cancel;
        self
    }

    /// Non-blocking send of a Ralph event
    fn try_send_event(&self, event: RalphEvent) {
        if let Some(ref tx) = self.event_tx {
            let _ = tx.try_send(event);
        }
    }

    fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Run the loop until every story passes, the budget runs out, or the
    /// run is cancelled
    pub async fn run(&mut self) -> anyhow::Result<RalphState> {
        self.state.status = RalphStatus::Running;
        self.state.started_at = Utc::now();

        self.try_send_event(RalphEvent::Started {
            project: self.state.prd.project.clone(),
            total_stories: self.state.prd.user_stories.len(),
            max_iterations: self.state.max_iterations,
        });

        if !self.state.prd.branch_name.is_empty() {
            info!("Switching to branch: {}", self.state.prd.branch_name);
            git::checkout_branch(&self.state.working_dir, &self.state.prd.branch_name).await?;
        }

        loop {
            if self.is_cancelled() {
                warn!("Ralph run cancelled");
                break;
            }

            let story = match self.state.prd.next_story() {
                Some(s) => s.clone(),
                None => {
                    info!("All stories complete!");
                    self.state.status = RalphStatus::Completed;
                    break;
                }
            };

            if self.state.current_iteration >= self.state.max_iterations {
                break;
            }

            self.state.current_iteration += 1;
            info!(
                "=== Ralph iteration {} of {} ===",
                self.state.current_iteration, self.state.max_iterations
            );
            self.try_send_event(RalphEvent::IterationStarted {
                iteration: self.state.current_iteration,
                max_iterations: self.state.max_iterations,
            });

            self.run_iteration(&story).await?;
            self.state.last_updated_at = Utc::now();
        }

        if self.state.status == RalphStatus::Running {
            self.state.status = if self.state.prd.is_complete() {
                RalphStatus::Completed
            } else {
                RalphStatus::Failed
            };
        }
        self.state.last_updated_at = Utc::now();

        info!(
            "Ralph finished: {:?}, {}/{} stories passed",
            self.state.status,
            self.state.prd.passed_count(),
            self.state.prd.user_stories.len()
        );

        self.try_send_event(RalphEvent::Complete {
            status: self.state.status,
            passed: self.state.prd.passed_count(),
            total: self.state.prd.user_stories.len(),
        });

        Ok(self.state.clone())
    }

    /// Run one iteration against `story`.
    ///
    /// Story-level failures (blocked, gate, timeout, cancellation) come back
    /// as an unpassed result; only persistence errors are returned as `Err`.
    pub async fn run_iteration(&mut self, story: &UserStory) -> anyhow::Result<IterationResult> {
        info!(story_id = %story.id, "Working on story: {}", story.title);
        self.try_send_event(RalphEvent::StoryStarted {
            story_id: story.id.clone(),
        });

        let progress = self.progress.read().await.unwrap_or_else(|e| {
            warn!(
                path = %self.progress.path().display(),
                error = %e,
                "Could not read progress log"
            );
            String::new()
        });
        let prompt = build_prompt(&self.state.prd, story, &progress);

        let run = self
            .agent
            .run(&prompt, &self.state.working_dir, self.cancel.clone())
            .await;

        let (output, mut failure) = match run {
            Err(e) => (String::new(), Some(format!("agent failed: {}", e))),
            Ok(out) => {
                let failure = match out.termination {
                    AgentTermination::TimedOut => Some(format!(
                        "agent timed out after {}s",
                        self.config.agent_timeout_secs
                    )),
                    AgentTermination::Cancelled => Some("agent run cancelled".to_string()),
                    AgentTermination::Exited { success } => match parse_completion(&out.output) {
                        CompletionMarker::Blocked(reason) => Some(format!("blocked: {}", reason)),
                        CompletionMarker::Complete => None,
                        CompletionMarker::Missing
                            if !success && self.config.fail_on_agent_exit_status =>
                        {
                            Some("agent exited with a failure status".to_string())
                        }
                        CompletionMarker::Missing => None,
                    },
                };
                (out.output, failure)
            }
        };

        if failure.is_none() {
            let gate = self.run_quality_gate(&story.id).await;
            if !gate.passed {
                warn!(story_id = %story.id, "Story failed quality gate");
                failure = Some(format!("quality gate failed: {}", gate.summary));
            }
        }

        let mut commit = None;
        if failure.is_none() && self.config.auto_commit {
            let message = format!("feat({}): {}", story.id, story.title);
            match git::commit_all(&self.state.working_dir, &message).await {
                Ok(hash) => commit = hash,
                Err(e) => warn!(story_id = %story.id, error = %e, "Commit failed"),
            }
        }

        let extracted = extract_learnings(&output);
        let notes = match &failure {
            Some(reason) if extracted.is_empty() => reason.clone(),
            Some(reason) => format!("{}\n{}", reason, extracted),
            None => extracted,
        };
        let learnings = truncate_chars(&notes, self.config.max_learnings_chars);

        let passed = failure.is_none();
        let entry = ProgressEntry {
            timestamp: Utc::now(),
            story_id: story.id.clone(),
            status: if passed {
                ProgressStatus::Completed
            } else {
                ProgressStatus::Failed
            },
            notes: learnings.clone(),
            iteration: self.state.current_iteration,
        };
        self.progress.append(&entry).await?;
        self.state.progress_log.push(entry);

        if passed {
            info!(story_id = %story.id, "Story passed");
            self.state.prd.mark_passed(&story.id, &learnings);
            self.state.prd.save(&self.state.prd_path).await?;
        } else {
            warn!(
                story_id = %story.id,
                reason = failure.as_deref().unwrap_or_default(),
                "Story failed"
            );
        }

        self.try_send_event(RalphEvent::StoryComplete {
            story_id: story.id.clone(),
            passed,
            commit: commit.clone(),
        });

        Ok(IterationResult {
            story_id: story.id.clone(),
            passed,
            commit,
            learnings,
            error: failure,
        })
    }

    /// Run the configured gate command, or the PRD's checks in order.
    /// Every check runs so all failures are reported together.
    async fn run_quality_gate(&self, story_id: &str) -> GateOutcome {
        let checks = match &self.config.quality_gate {
            Some(cmd) => vec![("gate", cmd.clone())],
            None => self.state.prd.quality_checks.commands(),
        };
        let timeout = self.config.gate_timeout_secs.map(Duration::from_secs);

        let mut failures = Vec::new();
        for (name, command) in checks {
            debug!("Running {} check: {}", name, command);
            let (passed, detail) =
                run_check(&command, &self.state.working_dir, timeout).await;

            self.try_send_event(RalphEvent::StoryQualityCheck {
                story_id: story_id.to_string(),
                check_name: name.to_string(),
                passed,
            });

            if !passed {
                warn!(
                    check = %name,
                    error_summary = %truncate_chars(&detail, 300),
                    "{} check failed",
                    name
                );
                failures.push(format!("{}: {}", name, detail));
            }
        }

        GateOutcome {
            passed: failures.is_empty(),
            summary: failures.join("\n"),
        }
    }

    /// Format status as markdown
    pub fn status_markdown(&self) -> String {
        status_markdown(
            &self.state.prd,
            self.state.current_iteration,
            self.state.max_iterations,
        )
    }
}

async fn run_check(command: &str, dir: &Path, timeout: Option<Duration>) -> (bool, String) {
    let child = Command::new("/bin/sh")
        .arg("-c")
        .arg(command)
        .current_dir(dir)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output();

    let output = match timeout {
        Some(limit) => match tokio::time::timeout(limit, child).await {
            Ok(res) => res,
            Err(_) => return (false, format!("timed out after {}s", limit.as_secs())),
        },
        None => child.await,
    };

    match output {
        Ok(output) if output.status.success() => (true, String::new()),
        Ok(output) => {
            let combined = format!(
                "{}\n{}",
                String::from_utf8_lossy(&output.stdout),
                String::from_utf8_lossy(&output.stderr)
            );
            let errors: Vec<&str> = combined
                .lines()
                .filter(|line| {
                    line.starts_with("error") || line.contains("error:") || line.contains("error[")
                })
                .take(5)
                .collect();
            let summary = if errors.is_empty() {
                format!("exited with {}", output.status)
            } else {
                errors.join("\n")
            };
            (false, summary)
        }
        Err(e) => (false, format!("could not run '{}': {}", command, e)),
    }
}

/// Build the prompt for one iteration. The progress log is the only state
/// carried over from earlier iterations.
pub fn build_prompt(prd: &Prd, story: &UserStory, progress: &str) -> String {
    let bullet = |items: Vec<String>| {
        if items.is_empty() {
            "None yet".to_string()
        } else {
            items.join("\n")
        }
    };

    let criteria = bullet(
        story
            .acceptance_criteria
            .iter()
            .map(|c| format!("- {}", c))
            .collect(),
    );
    let completed = bullet(
        prd.completed_stories()
            .into_iter()
            .map(|s| format!("- {}: {}", s.id, s.title))
            .collect(),
    );
    let remaining = bullet(
        prd.remaining_stories()
            .into_iter()
            .filter(|s| s.id != story.id)
            .map(|s| format!("- {}: {} (priority {})", s.id, s.title, s.priority))
            .collect(),
    );
    let progress = if progress.trim().is_empty() {
        "None yet"
    } else {
        progress.trim()
    };

    format!(
        r#"# PRD: {project} - {feature}

{prd_description}

## Current Story: {id} - {title}

{description}

### Acceptance Criteria:
{criteria}

## Completed Stories:
{completed}

## Remaining Stories:
{remaining}

## Progress Log:
{progress}

## Instructions:
1. Implement only the current story
2. Verify every acceptance criterion
3. Record what you learned under a `## Learnings` heading
4. End with `STORY_COMPLETE: {id}` when done
5. If you cannot finish, end with `STORY_BLOCKED: <reason>`
"#,
        project = prd.project,
        feature = prd.feature,
        prd_description = prd.description,
        id = story.id,
        title = story.title,
        description = story.description,
        criteria = criteria,
        completed = completed,
        remaining = remaining,
        progress = progress,
    )
}

/// Find the completion marker. A blocked marker wins over a complete one.
pub fn parse_completion(output: &str) -> CompletionMarker {
    let mut complete = false;
    for line in output.lines() {
        let normalized = line.to_ascii_lowercase().replace('_', " ");
        if let Some(pos) = normalized.find("story blocked:") {
            let reason = line[pos + "story blocked:".len()..].trim();
            return CompletionMarker::Blocked(reason.to_string());
        }
        if normalized.contains("story complete") {
            complete = true;
        }
    }
    if complete {
        CompletionMarker::Complete
    } else {
        CompletionMarker::Missing
    }
}

/// Pull learnings out of agent output: an explicit learnings section if
/// present, else the first error line
pub fn extract_learnings(output: &str) -> String {
    let mut section: Vec<&str> = Vec::new();
    let mut in_section = false;

    for line in output.lines() {
        let trimmed = line.trim();
        if in_section {
            let lower = trimmed.to_ascii_lowercase().replace('_', " ");
            if trimmed.starts_with('#')
                || lower.contains("story complete")
                || lower.contains("story blocked:")
            {
                break;
            }
            if !trimmed.is_empty() {
                section.push(trimmed);
            }
        } else if let Some(rest) = learnings_heading(trimmed) {
            in_section = true;
            if !rest.is_empty() {
                section.push(rest);
            }
        }
    }

    if !section.is_empty() {
        return section.join("\n");
    }

    output
        .lines()
        .map(str::trim)
        .find(|l| l.to_ascii_lowercase().contains("error"))
        .unwrap_or_default()
        .to_string()
}

fn learnings_heading(line: &str) -> Option<&str> {
    let stripped = line.trim_start_matches(|c: char| c == '#' || c == '*' || c.is_whitespace());
    if !stripped.to_ascii_lowercase().starts_with("learnings") {
        return None;
    }
    let rest = &stripped["learnings".len()..];
    Some(
        rest.trim_start_matches(|c: char| c == ':' || c == '*' || c.is_whitespace())
            .trim(),
    )
}

fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max).collect();
    out.push_str("...");
    out
}

/// Render PRD progress as markdown
pub fn status_markdown(prd: &Prd, iteration: usize, max_iterations: usize) -> String {
    let status = if prd.is_complete() {
        "# Ralph Complete!"
    } else {
        "# Ralph Status"
    };

    let stories: Vec<String> = prd
        .user_stories
        .iter()
        .map(|s| {
            let check = if s.passes { "[x]" } else { "[ ]" };
            format!("- {} {}: {} (priority {})", check, s.id, s.title, s.priority)
        })
        .collect();

    format!(
        "{}\n\n**Project:** {}\n**Feature:** {}\n**Progress:** {}/{} stories\n**Iterations:** {}/{}\n\n## Stories\n{}",
        status,
        prd.project,
        prd.feature,
        prd.passed_count(),
        prd.user_stories.len(),
        iteration,
        max_iterations,
        stories.join("\n")
    )
}

/// Create a sample PRD template
pub fn create_prd_template(project: &str, feature: &str) -> Prd {
    Prd {
        project: project.to_string(),
        feature: feature.to_string(),
        branch_name: format!("feature/{}", feature.to_lowercase().replace(' ', "-")),
        description: String::new(),
        version: "1.0".to_string(),
        user_stories: vec![UserStory {
            id: "US-001".to_string(),
            title: "First user story".to_string(),
            description: "Description of what needs to be implemented".to_string(),
            acceptance_criteria: vec!["Criterion 1".to_string(), "Criterion 2".to_string()],
            priority: 1,
            passes: false,
            notes: String::new(),
        }],
        technical_requirements: Vec::new(),
        quality_checks: QualityChecks {
            typecheck: Some("cargo check".to_string()),
            lint: Some("cargo clippy".to_string()),
            test: Some("cargo test".to_string()),
            build: None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn complete_marker_is_detected() {
        assert_eq!(
            parse_completion("did things\nSTORY_COMPLETE: S1\n"),
            CompletionMarker::Complete
        );
        assert_eq!(parse_completion("Story complete."), CompletionMarker::Complete);
    }

    #[test]
    fn blocked_marker_carries_reason_and_wins() {
        let out = "STORY_COMPLETE: S1\nSTORY_BLOCKED: missing DATABASE_URL\n";
        assert_eq!(
            parse_completion(out),
            CompletionMarker::Blocked("missing DATABASE_URL".to_string())
        );
    }

    #[test]
    fn no_marker_is_missing() {
        assert_eq!(parse_completion("just chatter"), CompletionMarker::Missing);
    }

    #[test]
    fn learnings_section_is_extracted() {
        let out = "work\n## Learnings\n- tests live in tests/\n- use tokio::test\n\nSTORY_COMPLETE: S1";
        assert_eq!(
            extract_learnings(out),
            "- tests live in tests/\n- use tokio::test"
        );
    }

    #[test]
    fn inline_learnings_line_is_extracted() {
        assert_eq!(
            extract_learnings("**Learnings:** prefer axum extractors"),
            "prefer axum extractors"
        );
    }

    #[test]
    fn error_line_is_fallback_learning() {
        let out = "compiling\nerror[E0432]: unresolved import `foo`\nmore";
        assert_eq!(
            extract_learnings(out),
            "error[E0432]: unresolved import `foo`"
        );
        assert_eq!(extract_learnings("all good"), "");
    }

    #[test]
    fn truncation_is_char_safe() {
        assert_eq!(truncate_chars("héllo wörld", 5), "héllo...");
        assert_eq!(truncate_chars("short", 10), "short");
    }

    #[test]
    fn prompt_lists_completed_remaining_and_progress() {
        let mut prd = create_prd_template("demo", "Login");
        let mut second = prd.user_stories[0].clone();
        second.id = "US-002".to_string();
        second.title = "Second".to_string();
        second.priority = 2;
        let mut third = second.clone();
        third.id = "US-003".to_string();
        third.title = "Third".to_string();
        prd.user_stories.push(second.clone());
        prd.user_stories.push(third);
        prd.mark_passed("US-001", "");

        let prompt = build_prompt(&prd, &second, "## Iteration 1 - US-001");
        assert!(prompt.contains("## Current Story: US-002 - Second"));
        assert!(prompt.contains("## Completed Stories:\n- US-001: First user story"));
        assert!(prompt.contains("- US-003: Third (priority 2)"));
        assert!(!prompt.contains("- US-002: Second (priority 2)"));
        assert!(prompt.contains("## Iteration 1 - US-001"));
        assert!(prompt.contains("STORY_COMPLETE: US-002"));
    }

    #[test]
    fn status_markdown_shows_checkboxes() {
        let mut prd = create_prd_template("demo", "Login");
        prd.mark_passed("US-001", "");
        let md = status_markdown(&prd, 1, 10);
        assert!(md.starts_with("# Ralph Complete!"));
        assert!(md.contains("- [x] US-001"));
        assert!(md.contains("**Iterations:** 1/10"));
    }
}
