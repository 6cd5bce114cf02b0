mod config;
mod crash;
mod handler;
mod notify;
mod registry;
mod session;
mod supervisor;

use crate::config::ClientConfig;
use crate::notify::CommandNotifier;
use crate::supervisor::Supervisor;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = load_config()?;

    // Initialize logging
    init_logging(&config);

    info!("page v{} starting...", env!("CARGO_PKG_VERSION"));

    let notifier = Arc::new(CommandNotifier::new(&config.notify.command));

    // Ctrl-C asks the active session to quit cleanly
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Interrupted, shutting down");
                let _ = shutdown_tx.send(true);
            }
            Err(e) => {
                error!("Failed to listen for Ctrl-C: {}", e);
                // keep the sender alive so the session is not told to stop
                std::future::pending::<()>().await;
            }
        }
    });

    let mut supervisor = Supervisor::new(config, notifier);
    supervisor.run(shutdown_rx).await?;

    info!("Bye");
    Ok(())
}

fn load_config() -> anyhow::Result<ClientConfig> {
    // Explicit path wins
    if let Some(path) = std::env::args().nth(1) {
        return ClientConfig::from_file(&path)
            .map_err(|e| anyhow::anyhow!("Failed to load config from {}: {}", path, e));
    }

    for path in ["configs/page.toml", "page.toml", "config.json"] {
        if std::path::Path::new(path).exists() {
            return ClientConfig::from_file(path)
                .map_err(|e| anyhow::anyhow!("Failed to load config from {}: {}", path, e));
        }
    }

    Err(anyhow::anyhow!(
        "No config file found (tried configs/page.toml, page.toml, config.json)"
    ))
}

fn init_logging(config: &ClientConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.log_level));

    if config.logging.json_logs {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .init();
    }
}
