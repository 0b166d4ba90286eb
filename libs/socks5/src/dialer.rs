//! Outbound connection establishment for CONNECT requests.

use std::fmt;
use std::io;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tracing::debug;

use crate::address::SessionAddress;
use crate::conn::BoxedConn;

/// Network family passed to a [`Dialer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Tcp,
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Network::Tcp => f.write_str("tcp"),
        }
    }
}

/// Opens outbound connections on behalf of a session.
///
/// Injected into [`crate::SocksSession`] so tests can substitute a stub that
/// reports an arbitrary local address.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, network: Network, target: &SessionAddress) -> io::Result<BoxedConn>;
}

/// Dials targets directly over TCP, resolving hostnames through the system
/// resolver.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpDialer;

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, network: Network, target: &SessionAddress) -> io::Result<BoxedConn> {
        debug!(network = %network, target = %target, "Dialing target");
        let stream = TcpStream::connect((target.host.as_str(), target.port)).await?;
        Ok(Box::new(stream))
    }
}
