//! Health and status handlers

use crate::api::rest::state::{AppState, ResourceSummary};
use axum::{extract::State, Json};
use serde::Serialize;

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthCheckResponse {
    pub status: String,
    pub version: String,
    pub uptime: String,
}

/// Health check endpoint
pub async fn health_check(State(state): State<AppState>) -> Json<HealthCheckResponse> {
    Json(HealthCheckResponse {
        status: "healthy".to_string(),
        version: state.version.clone(),
        uptime: state.uptime(),
    })
}

/// Daemon status response
#[derive(Debug, Serialize)]
pub struct DaemonStatusResponse {
    pub status: String,
    pub version: String,
    pub uptime: String,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub registered_reconcilers: usize,
    pub running_reconcilers: usize,
    pub resources: Vec<ResourceSummary>,
}

/// Daemon status endpoint
pub async fn daemon_status(State(state): State<AppState>) -> Json<DaemonStatusResponse> {
    let status = if state.registry.is_shutting_down().await {
        "shutting_down"
    } else {
        "running"
    };

    Json(DaemonStatusResponse {
        status: status.to_string(),
        version: state.version.clone(),
        uptime: state.uptime(),
        started_at: state.started_at,
        registered_reconcilers: state.registry.len().await,
        running_reconcilers: state.tracker.len(),
        resources: state.resources.as_ref().clone(),
    })
}
