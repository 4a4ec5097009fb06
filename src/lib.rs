//! CodeTether worker
//!
//! Runs PRD-driven agent loops (Ralph) locally, and serves as a distributed
//! worker that claims tasks from the CodeTether broker, executes them in
//! agent sessions, and reports results.

pub mod a2a;
pub mod cli;
pub mod config;
pub mod notify;
pub mod opencode;
pub mod ralph;
pub mod session;
pub mod worker_server;
