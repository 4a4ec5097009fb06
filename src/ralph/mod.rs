//! Ralph - Autonomous PRD-driven agent loop
//!
//! Implementation of Geoffrey Huntley's ralph pattern:
//! `while :; do cat PROMPT.md | llm; done`
//!
//! Ralph works one user story per iteration, each in a fresh agent process.
//! A story passes only when its quality gate passes; the append-only
//! progress log is the only memory carried between iterations.

mod agent;
mod git;
mod prd_store;
mod progress;
mod ralph_loop;
mod types;

pub use agent::*;
pub use git::{checkout_branch, commit_all};
pub use prd_store::PrdError;
pub use progress::{ProgressLog, format_entry};
pub use ralph_loop::*;
pub use types::*;
