//! Application state for API handlers

use serde::Serialize;
use std::sync::Arc;
use tideline_engine::{ShutdownRegistry, TaskTracker};
use tokio::sync::watch;

/// Resource type served by this daemon
#[derive(Debug, Clone, Serialize)]
pub struct ResourceSummary {
    pub name: String,
    pub stream: String,
    pub workers: usize,
}

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// Shutdown channels of every reconciler
    pub registry: ShutdownRegistry,

    /// Wait group of running reconcilers
    pub tracker: TaskTracker,

    /// Resource types being reconciled
    pub resources: Arc<Vec<ResourceSummary>>,

    /// Daemon version
    pub version: String,

    /// Daemon start time
    pub started_at: chrono::DateTime<chrono::Utc>,

    /// Graceful shutdown signal for the control server
    pub shutdown_tx: Arc<watch::Sender<bool>>,
}

impl AppState {
    /// Create new application state
    pub fn new(
        registry: ShutdownRegistry,
        tracker: TaskTracker,
        resources: Vec<ResourceSummary>,
        shutdown_tx: watch::Sender<bool>,
    ) -> Self {
        Self {
            registry,
            tracker,
            resources: Arc::new(resources),
            version: env!("CARGO_PKG_VERSION").to_string(),
            started_at: chrono::Utc::now(),
            shutdown_tx: Arc::new(shutdown_tx),
        }
    }

    /// Get uptime as a human-readable string
    pub fn uptime(&self) -> String {
        let secs = (chrono::Utc::now() - self.started_at).num_seconds();

        if secs < 60 {
            format!("{}s", secs)
        } else if secs < 3600 {
            format!("{}m {}s", secs / 60, secs % 60)
        } else if secs < 86400 {
            format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
        } else {
            format!("{}d {}h", secs / 86400, (secs % 86400) / 3600)
        }
    }
}
