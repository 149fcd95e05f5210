//! Server setup and lifecycle management

use crate::api::create_router;
use crate::api::rest::state::AppState;
use crate::config::DaemonConfig;
use crate::error::{DaemonError, DaemonResult};
use crate::supervisor::{Backends, Supervisor};
use tideline_engine::Interrupts;
use tokio::net::TcpListener;
use tokio::sync::watch;

/// Tideline daemon server
pub struct Server {
    config: DaemonConfig,
    supervisor: Supervisor,
    interrupts: Interrupts,
}

impl Server {
    /// Connect backends and start every configured reconciler
    pub async fn new(config: DaemonConfig) -> DaemonResult<Self> {
        let interrupts = Interrupts::from_os_signals();
        let backends = Backends::connect(&config).await?;
        let supervisor = Supervisor::start(&config, backends, interrupts.clone()).await?;

        Ok(Self {
            config,
            supervisor,
            interrupts,
        })
    }

    /// Serve the control API until shutdown is requested, then drain the
    /// reconcilers
    pub async fn run(self) -> DaemonResult<()> {
        let addr = self.config.server.listen_addr;

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let state = AppState::new(
            self.supervisor.registry().clone(),
            self.supervisor.tracker().clone(),
            self.supervisor.resources().to_vec(),
            shutdown_tx,
        );

        let app = create_router(state, self.config.server.enable_cors);
        let listener = TcpListener::bind(addr).await?;

        tracing::info!("Tideline daemon listening on {}", addr);

        let interrupts = self.interrupts.clone();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                tokio::select! {
                    _ = interrupts.triggered() => {
                        tracing::info!("Received interrupt, initiating graceful shutdown");
                    }
                    _ = shutdown_rx.wait_for(|requested| *requested) => {
                        tracing::info!("Shutdown requested over the control API");
                    }
                }
            })
            .await
            .map_err(|e| DaemonError::Server(e.to_string()))?;

        tracing::info!("Tideline daemon shutting down");

        self.supervisor.shutdown().await;
        self.supervisor.wait().await;

        Ok(())
    }
}
