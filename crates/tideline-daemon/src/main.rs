//! Tideline Daemon - queue-driven reconciler host
//!
//! The daemon provides:
//! - One or more reconciler workers per configured resource type
//! - Distributed per-object locking over a shared lock store
//! - A control API for health, status and graceful shutdown

use clap::Parser;
use tideline_daemon::{DaemonConfig, DaemonError, DaemonResult, Server};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Tideline Daemon CLI
#[derive(Parser)]
#[command(name = "tidelined")]
#[command(about = "Tideline Daemon - queue-driven reconciler host", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "TIDELINE_CONFIG")]
    config: Option<String>,

    /// Listen address of the control API
    #[arg(short, long, env = "TIDELINE_LISTEN_ADDR")]
    listen: Option<String>,

    /// Log level
    #[arg(long, env = "TIDELINE_LOG_LEVEL")]
    log_level: Option<String>,

    /// Enable JSON logging
    #[arg(long, env = "TIDELINE_LOG_JSON")]
    json: bool,
}

#[tokio::main]
async fn main() -> DaemonResult<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = DaemonConfig::load(cli.config.as_deref())?;

    // Override with CLI args
    if let Some(listen) = &cli.listen {
        config.server.listen_addr = listen
            .parse()
            .map_err(|e| DaemonError::Config(format!("Invalid listen address: {}", e)))?;
    }
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }
    if cli.json {
        config.logging.json = true;
    }

    // Initialize tracing
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| config.logging.level.clone().into());

    if config.logging.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    config.validate()?;

    // Print startup banner
    println!(
        r#"
  _____ _     _      _ _
 |_   _(_) __| | ___| (_)_ __   ___
   | | | |/ _` |/ _ \ | | '_ \ / _ \
   | | | | (_| |  __/ | | | | |  __/
   |_| |_|\__,_|\___|_|_|_| |_|\___|

  Reconciler host
  Version: {}
  Resources: {}
  Listening: {}
"#,
        env!("CARGO_PKG_VERSION"),
        config
            .resources
            .iter()
            .map(|r| r.name.as_str())
            .collect::<Vec<_>>()
            .join(", "),
        config.server.listen_addr
    );

    // Create and run server
    let server = Server::new(config).await?;
    server.run().await
}
