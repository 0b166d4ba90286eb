//! Protocol handlers a dispatched connection can be handed to.

use std::fmt;
use std::sync::Arc;

use sockmux_socks5::{BoxedConn, Dialer, SocksError, SocksSession, TcpDialer};
use thiserror::Error;
use tracing::debug;

use super::http_proxy::HttpProxyHandler;

/// Errors returned by a handler for one connection.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// SOCKS5 method negotiation failed.
    #[error("couldn't handle socks connection request: {0}")]
    SocksHandshake(SocksError),

    /// SOCKS5 request failed.
    #[error("couldn't handle socks request: {0}")]
    SocksRequest(SocksError),

    /// SOCKS5 relay ended.
    #[error("socks relay ended with {0}")]
    SocksRelay(SocksError),

    /// The HTTP proxy engine is no longer accepting connections.
    #[error("http proxy engine is not running")]
    HttpProxyClosed,
}

impl HandlerError {
    /// Short reason code for log fields.
    pub fn reason_code(&self) -> &'static str {
        match self {
            HandlerError::SocksHandshake(e)
            | HandlerError::SocksRequest(e)
            | HandlerError::SocksRelay(e) => e.reason_code(),
            HandlerError::HttpProxyClosed => "http_proxy_closed",
        }
    }

    /// True when the connection ended because a peer closed its side.
    pub fn is_end_of_stream(&self) -> bool {
        matches!(self, HandlerError::SocksRelay(e) if e.is_end_of_stream())
    }
}

/// The handler chosen for a connection.
///
/// Adding a protocol means adding a variant here and a classification rule
/// in the dispatcher.
#[derive(Clone)]
pub enum Handler {
    Socks(SocksHandler),
    Http(HttpProxyHandler),
}

impl Handler {
    /// Drive `conn` to completion.
    pub async fn handle(&self, conn: BoxedConn) -> Result<(), HandlerError> {
        match self {
            Handler::Socks(handler) => handler.handle(conn).await,
            Handler::Http(handler) => handler.handle(conn),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Handler::Socks(_) => "socks5",
            Handler::Http(_) => "http",
        }
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Runs a SOCKS5 session per connection.
#[derive(Clone)]
pub struct SocksHandler {
    dialer: Arc<dyn Dialer>,
}

impl SocksHandler {
    /// Create a handler that dials targets directly over TCP.
    pub fn new() -> Self {
        Self::with_dialer(Arc::new(TcpDialer))
    }

    /// Create a handler with a custom dialer.
    pub fn with_dialer(dialer: Arc<dyn Dialer>) -> Self {
        Self { dialer }
    }

    /// Negotiate, execute the CONNECT request and relay until either side
    /// stops.
    ///
    /// The relay never ends cleanly, so a session that got as far as relaying
    /// always returns [`HandlerError::SocksRelay`].
    pub async fn handle(&self, conn: BoxedConn) -> Result<(), HandlerError> {
        let mut session = SocksSession::new(conn, Arc::clone(&self.dialer));

        session.start().await.map_err(HandlerError::SocksHandshake)?;
        let target = session.request().await.map_err(HandlerError::SocksRequest)?;
        debug!(target = %target, "SOCKS5 CONNECT established");

        Err(HandlerError::SocksRelay(session.relay().await))
    }
}

impl Default for SocksHandler {
    fn default() -> Self {
        Self::new()
    }
}
