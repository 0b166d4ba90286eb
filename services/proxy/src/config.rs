//! Proxy configuration (env-driven).

use std::net::SocketAddr;

use anyhow::{Context, Result};
use sockmux_certs::{CaParams, DEFAULT_HOST, DEFAULT_ORGANIZATION};

use crate::proxy::{DEFAULT_MAX_CONNECTIONS, DEFAULT_MAX_TLS_DEPTH};

/// Default listen address.
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:1080";

/// Upper bound for `SOCKMUX_MAX_TLS_DEPTH`.
pub const MAX_TLS_DEPTH_LIMIT: usize = 16;

/// Proxy configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address of the single listening socket.
    pub listen_addr: SocketAddr,

    /// SAN hosts for the generated certificate.
    pub cert_hosts: Vec<String>,

    /// Subject organization for the generated certificate.
    pub cert_organization: String,

    /// Maximum nested TLS terminations per connection.
    pub max_tls_depth: usize,

    /// Maximum concurrent connections.
    pub max_connections: usize,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through `lookup`, which returns a variable's value
    /// if set.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let listen_addr = lookup("SOCKMUX_LISTEN_ADDR")
            .unwrap_or_else(|| DEFAULT_LISTEN_ADDR.to_string())
            .parse()
            .context("SOCKMUX_LISTEN_ADDR must be a socket address (example: 0.0.0.0:1080).")?;

        let cert_hosts: Vec<String> = lookup("SOCKMUX_CERT_HOST")
            .unwrap_or_else(|| DEFAULT_HOST.to_string())
            .split(',')
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .map(str::to_string)
            .collect();
        if cert_hosts.is_empty() {
            anyhow::bail!("SOCKMUX_CERT_HOST must name at least one host.");
        }

        let cert_organization = lookup("SOCKMUX_CERT_ORG")
            .unwrap_or_else(|| DEFAULT_ORGANIZATION.to_string());

        let max_tls_depth: usize = lookup("SOCKMUX_MAX_TLS_DEPTH")
            .map(|v| v.parse())
            .transpose()
            .context("SOCKMUX_MAX_TLS_DEPTH must be an integer.")?
            .unwrap_or(DEFAULT_MAX_TLS_DEPTH)
            .clamp(1, MAX_TLS_DEPTH_LIMIT);

        let max_connections: usize = lookup("SOCKMUX_MAX_CONNECTIONS")
            .map(|v| v.parse())
            .transpose()
            .context("SOCKMUX_MAX_CONNECTIONS must be an integer.")?
            .unwrap_or(DEFAULT_MAX_CONNECTIONS)
            .max(1);

        let log_level = lookup("SOCKMUX_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            listen_addr,
            cert_hosts,
            cert_organization,
            max_tls_depth,
            max_connections,
            log_level,
        })
    }

    /// Parameters for the generated certificate.
    pub fn ca_params(&self) -> CaParams {
        CaParams {
            hosts: self.cert_hosts.clone(),
            organization: self.cert_organization.clone(),
        }
    }
}
