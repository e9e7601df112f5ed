//! Resource Manager daemon
//!
//! Runs the platform monitor, the allocation pool, and the pressure
//! detector as one process, optionally restoring a state snapshot at boot
//! and persisting one at shutdown.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use manager_lib::manager::ResourceManager;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod config;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting resource-manager");

    let config = config::ManagerConfig::load()?;
    info!(
        instance = %config.instance,
        strategy = %config.strategy,
        "Manager configured"
    );

    let manager = Arc::new(
        ResourceManager::builder()
            .instance(config.instance.clone())
            .monitor_config(config.monitor_config())
            .allocator_config(config.allocator_config())
            .pressure_config(config.pressure_config())
            .build()
            .context("invalid manager configuration")?,
    );

    if let Some(path) = config.state_path.as_deref().map(Path::new) {
        if path.exists() {
            match manager.load_state_from(path).await {
                Ok(()) => info!(path = %path.display(), "State snapshot restored"),
                Err(error) => warn!(
                    path = %path.display(),
                    error = %error,
                    "Snapshot rejected, starting fresh"
                ),
            }
        }
    }

    manager.start().await;

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    manager.stop().await;

    if let Some(path) = config.state_path.as_deref().map(Path::new) {
        manager
            .save_state_to(path)
            .await
            .context("failed to persist state snapshot")?;
        info!(path = %path.display(), "State snapshot written");
    }

    Ok(())
}
