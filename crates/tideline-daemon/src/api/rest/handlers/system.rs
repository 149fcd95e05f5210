//! Process-level handlers

use crate::api::rest::state::AppState;
use axum::{extract::State, Json};
use serde::Serialize;

/// Response body for shutdown requests
#[derive(Debug, Serialize)]
pub struct ShutdownResponse {
    pub status: String,
    pub message: String,
    pub reconcilers: usize,
}

/// Ask every reconciler to finish its current message and stop, then stop
/// the control server
pub async fn shutdown_daemon(State(state): State<AppState>) -> Json<ShutdownResponse> {
    let reconcilers = state.registry.shutdown_all().await;
    state.shutdown_tx.send_replace(true);

    Json(ShutdownResponse {
        status: "accepted".to_string(),
        message: "Shutdown signal sent".to_string(),
        reconcilers,
    })
}
