//! Process interrupt handling
//!
//! [`Interrupts`] is a latch set once when the process receives SIGINT or
//! SIGTERM. While a message is being processed, an [`InterruptGuard`] races
//! that latch against the end of the iteration. Exactly one side wins: either
//! the iteration stands the guard down, or the interrupt fires first and the
//! guard runs its cleanup (unlock and requeue) so the object is not left
//! locked while the process exits.

use std::future::Future;
use std::sync::Arc;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

/// Process-wide interrupt latch
#[derive(Debug, Clone)]
pub struct Interrupts {
    tx: Arc<watch::Sender<bool>>,
}

impl Interrupts {
    /// A latch that is only set by [`Interrupts::trigger`]
    pub fn manual() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// A latch set by SIGINT or SIGTERM
    ///
    /// Must be called from within a tokio runtime.
    pub fn from_os_signals() -> Self {
        let interrupts = Self::manual();
        let latch = interrupts.clone();

        tokio::spawn(async move {
            interrupt_signal().await;
            latch.trigger();
        });

        interrupts
    }

    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    /// Wait until the latch is set
    pub async fn triggered(&self) {
        let mut rx = self.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.wait_for(|fired| *fired).await;
    }
}

impl Default for Interrupts {
    fn default() -> Self {
        Self::manual()
    }
}

async fn interrupt_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, interrupting reconcilers");
        }
        _ = terminate => {
            tracing::info!("Received terminate signal, interrupting reconcilers");
        }
    }
}

/// Per-iteration race between an interrupt and normal completion
pub struct InterruptGuard {
    stand_down: Option<oneshot::Sender<()>>,
    handle: JoinHandle<bool>,
}

impl InterruptGuard {
    /// Spawn the race; `on_interrupt` runs only if the interrupt wins
    pub fn arm<F, Fut>(interrupts: &Interrupts, on_interrupt: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut rx = interrupts.subscribe();
        let (stand_down, mut stand_down_rx) = oneshot::channel();

        let handle = tokio::spawn(async move {
            let interrupted = async move { rx.wait_for(|fired| *fired).await.is_ok() };

            tokio::select! {
                biased;
                _ = &mut stand_down_rx => false,
                true = interrupted => {
                    on_interrupt().await;
                    true
                }
            }
        });

        Self {
            stand_down: Some(stand_down),
            handle,
        }
    }

    /// End the race from the iteration side
    ///
    /// Returns `true` if the interrupt had already won, in which case the
    /// cleanup has completed and the caller must not settle the message
    /// itself.
    pub async fn stand_down(mut self) -> bool {
        if let Some(tx) = self.stand_down.take() {
            let _ = tx.send(());
        }

        match (&mut self.handle).await {
            Ok(fired) => fired,
            Err(e) => {
                tracing::warn!(error = %e, "Interrupt guard task failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_stand_down_before_interrupt_skips_cleanup() {
        let interrupts = Interrupts::manual();
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();

        let guard = InterruptGuard::arm(&interrupts, move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(!guard.stand_down().await);
        interrupts.trigger();
        tokio::task::yield_now().await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_interrupt_wins_when_triggered_first() {
        let interrupts = Interrupts::manual();
        interrupts.trigger();

        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let guard = InterruptGuard::arm(&interrupts, move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        // Let the guard task observe the latch before standing down.
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        assert!(guard.stand_down().await);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_dropped_guard_task_terminates() {
        let interrupts = Interrupts::manual();
        let guard = InterruptGuard::arm(&interrupts, || async {});
        let InterruptGuard { stand_down, handle } = guard;
        drop(stand_down);

        assert!(!handle.await.unwrap());
    }

    #[tokio::test]
    async fn test_triggered_resolves_after_trigger() {
        let interrupts = Interrupts::manual();
        let waiter = interrupts.clone();
        let task = tokio::spawn(async move { waiter.triggered().await });

        interrupts.trigger();
        task.await.unwrap();
        assert!(interrupts.is_triggered());
    }
}
