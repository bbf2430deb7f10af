//! reproxy
//!
//! Pooled TCP reverse proxy.
//!
//! This service:
//! - Keeps a pool of pre-connected bridges to every configured backend
//! - Accepts client connections on one listener
//! - Pairs each client with a bridge, round robin across backends
//! - Relays bytes both ways and recycles the bridge slot afterwards

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use reproxy::{Config, Dispatcher, Listener, TcpConnector};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to REPROXY_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting reproxy");
    info!(
        listen_addr = %config.listen_addr,
        backends = config.backends.len(),
        min_pool_size = config.min_pool_size,
        max_pool_size = config.max_pool_size,
        "Configuration loaded"
    );

    let connector = Arc::new(TcpConnector::with_timeout(config.connect_timeout));
    let dispatcher = Dispatcher::new(config.dispatcher_config(), connector)
        .context("invalid dispatcher configuration")?;
    let (handle, dispatcher_task) = dispatcher.spawn();

    for address in &config.backends {
        handle
            .add_backend(address.as_str())
            .await
            .context("dispatcher stopped during startup")?;
    }

    let listener = Listener::bind(config.listener_config(), handle.clone())
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    let listener = Arc::new(listener);

    tokio::select! {
        result = Arc::clone(&listener).run() => {
            if let Err(e) = result {
                error!(error = %e, "Listener error");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
    }

    handle.shutdown().await;
    if let Err(e) = dispatcher_task.await {
        error!(error = %e, "Dispatcher task failed");
    }

    info!("reproxy stopped");
    Ok(())
}
