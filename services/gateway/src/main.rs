//! mgw gateway
//!
//! Protocol-detecting TCP gateway for messaging brokers.
//!
//! This service:
//! - Accepts client connections on one port
//! - Identifies STOMP, AMQP and MQTT clients from their first bytes
//! - Snoops the handshake for virtual host and identity
//! - Picks a registered backend and relays the connection to it
//! - Keeps the backend registry in sync with an external document

use std::sync::Arc;

use anyhow::{Context, Result};
use mgw_gateway::config::Config;
use mgw_gateway::proxy::{balancer, Gateway, Listener, ServiceRegistry};
use mgw_gateway::sync;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to MGW_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting mgw gateway");
    info!(
        bind_addr = %config.bind_addr,
        protocols = ?config.protocols,
        load_balancer = %config.load_balancer,
        max_connections = config.max_connections,
        registry_source = ?config.registry_source.as_ref().map(ToString::to_string),
        "Configuration loaded"
    );

    let registry = Arc::new(ServiceRegistry::new());

    let sync_handle = config.registry_source.clone().map(|source| {
        let registry = Arc::clone(&registry);
        let poll_interval = config.registry_poll_interval;
        tokio::spawn(async move {
            if let Err(e) = sync::run_registry_sync_loop(source, registry, poll_interval).await {
                error!(error = %e, "Registry sync loop failed");
            }
        })
    });

    let balancer = balancer::from_strategy(config.load_balancer, config.sticky_capacity);
    let gateway = Arc::new(Gateway::new(
        config.protocol_set()?,
        Arc::clone(&registry),
        balancer,
        config.gateway_config(),
    ));

    let listener = Listener::bind(config.listener_config(), gateway)
        .await
        .with_context(|| format!("Failed to bind listener on {}", config.bind_addr))?;
    let shutdown = listener.shutdown_handle();

    let mut listener_handle = tokio::spawn(listener.run());

    tokio::select! {
        result = &mut listener_handle => {
            if let Some(handle) = sync_handle {
                handle.abort();
            }
            return result.context("Listener task failed")?.context("Listener failed");
        }
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for shutdown signal")?;
            info!("Shutdown signal received");
        }
    }

    shutdown.shutdown();
    if let Some(handle) = sync_handle {
        handle.abort();
    }
    listener_handle
        .await
        .context("Listener task failed")?
        .context("Listener failed")?;

    info!("mgw gateway stopped");
    Ok(())
}
