//! Worker HTTP Server
//!
//! Minimal HTTP server for the worker that provides:
//! - /health - liveness probe
//! - /ready - readiness probe, OK while the offer stream is open
//! - /worker/status - worker id, connection state and in-flight task ids

use crate::a2a::registry::ProcessingSet;
use anyhow::Result;
use axum::{Json, Router, extract::State, http::StatusCode, routing::get};
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Worker server state shared across handlers
#[derive(Clone)]
pub struct WorkerServerState {
    pub worker_id: String,
    /// Set by the worker while the offer stream is connected
    pub connected: Arc<AtomicBool>,
    pub processing: ProcessingSet,
}

impl WorkerServerState {
    pub fn is_ready(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

pub fn router(state: WorkerServerState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/worker/status", get(worker_status))
        .with_state(state)
}

/// Start the worker HTTP server
pub async fn start(addr: &str, state: WorkerServerState) -> Result<()> {
    tracing::info!("Starting worker HTTP server on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Worker HTTP server listening on http://{}", addr);

    axum::serve(listener, router(state)).await?;
    Ok(())
}

/// Health check - always returns OK if the server is running
async fn health() -> &'static str {
    "ok"
}

async fn ready(State(state): State<WorkerServerState>) -> (StatusCode, &'static str) {
    if state.is_ready() {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not connected")
    }
}

async fn worker_status(State(state): State<WorkerServerState>) -> Json<WorkerStatusResponse> {
    Json(WorkerStatusResponse {
        worker_id: state.worker_id.clone(),
        connected: state.is_ready(),
        in_flight: state.processing.snapshot(),
    })
}

#[derive(Serialize)]
struct WorkerStatusResponse {
    worker_id: String,
    connected: bool,
    in_flight: Vec<String>,
}
