//! Graceful shutdown coordination
//!
//! Every reconciler registers for a shutdown channel and holds a ticket on a
//! shared [`TaskTracker`] while it runs. Broadcasting shutdown lets each loop
//! finish its current message and stop at the top of the next iteration; the
//! tracker drains once every reconciler has closed its subscription and
//! returned its ticket.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, RwLock};

pub use tokio_util::task::{task_tracker::TaskTrackerToken, TaskTracker};

/// Registry of reconciler shutdown channels
#[derive(Debug, Clone, Default)]
pub struct ShutdownRegistry {
    senders: Arc<RwLock<Vec<watch::Sender<bool>>>>,
    shutting_down: Arc<AtomicBool>,
}

impl ShutdownRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a reconciler and return its shutdown channel
    ///
    /// The channel retains the last value, so a shutdown broadcast before the
    /// reconciler first looks is not lost. Channels of reconcilers that have
    /// stopped are dropped here.
    pub async fn register(&self) -> watch::Receiver<bool> {
        let mut senders = self.senders.write().await;
        senders.retain(|tx| !tx.is_closed());

        let (tx, rx) = watch::channel(self.shutting_down.load(Ordering::SeqCst));
        senders.push(tx);
        rx
    }

    /// Signal shutdown to every registered reconciler
    ///
    /// Returns how many reconcilers were still listening.
    pub async fn shutdown_all(&self) -> usize {
        let senders = self.senders.read().await;
        self.shutting_down.store(true, Ordering::SeqCst);
        let listening = senders.iter().filter(|tx| tx.send(true).is_ok()).count();

        tracing::info!(
            registered = senders.len(),
            listening,
            "Shutdown broadcast to reconcilers"
        );
        listening
    }

    /// Number of reconcilers still listening
    pub async fn len(&self) -> usize {
        self.senders
            .read()
            .await
            .iter()
            .filter(|tx| !tx.is_closed())
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Whether shutdown has been broadcast
    pub async fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }
}
