//! sockmux
//!
//! Single-port proxy that works out per connection whether the client
//! speaks SOCKS5, HTTP CONNECT or TLS.
//!
//! This service:
//! - Generates an ephemeral self-signed CA at startup
//! - Accepts TCP connections on one listener (port 1080 by default)
//! - Classifies each connection by its first byte
//! - Terminates TLS and classifies the decrypted stream again
//! - Runs SOCKS5 CONNECT sessions or hands connections to the HTTP proxy

use std::sync::Arc;

use anyhow::{Context, Result};
use sockmux_proxy::{
    Config, DispatchServer, HttpProxyHandler, Listener, ListenerConfig, SocksHandler,
};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to SOCKMUX_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting sockmux");
    info!(
        listen_addr = %config.listen_addr,
        cert_hosts = ?config.cert_hosts,
        max_tls_depth = config.max_tls_depth,
        max_connections = config.max_connections,
        "Configuration loaded"
    );

    // No TLS termination is possible without the CA, so failure is fatal.
    let ca = sockmux_certs::generate(&config.ca_params())
        .context("Failed to provision TLS certificate")?;

    let (http_handler, http_server) = HttpProxyHandler::new();
    let dispatcher = Arc::new(DispatchServer::new(
        SocksHandler::new(),
        http_handler,
        &ca,
        config.max_tls_depth,
    )?);

    let mut listener_config = ListenerConfig::new(config.listen_addr);
    listener_config.max_connections = config.max_connections;

    let listener = Listener::bind(listener_config, dispatcher)
        .await
        .with_context(|| format!("Failed to bind {}", config.listen_addr))?;
    let listener = Arc::new(listener);
    let bound_addr = listener.local_addr()?;

    // The HTTP engine must be running before the first connection arrives.
    let http_handle = tokio::spawn(async move {
        if let Err(e) = http_server.start(bound_addr).await {
            error!(error = %e, "HTTP proxy engine failed");
        }
    });

    tokio::select! {
        result = Arc::clone(&listener).run() => {
            if let Err(e) = result {
                error!(error = %e, "Listener error");
                return Err(e.into());
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
    }

    http_handle.abort();
    info!("sockmux stopped");
    Ok(())
}
