//! First-byte protocol classification.
//!
//! Every accepted connection is classified by its first byte:
//!
//! | Byte   | Protocol                         |
//! |--------|----------------------------------|
//! | `0x05` | SOCKS5                           |
//! | `0x16` | TLS handshake, terminated here   |
//! | `'C'`  | HTTP `CONNECT`                   |
//!
//! After TLS termination the decrypted stream is classified again, so SOCKS5
//! or HTTP (or another TLS layer) can ride inside TLS. Nesting is capped at
//! `max_tls_depth` terminations.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use sockmux_certs::GeneratedCa;
use sockmux_socks5::{BoxedConn, Conn, SOCKS_VERSION};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tracing::debug;

use super::handler::{Handler, SocksHandler};
use super::http_proxy::HttpProxyHandler;
use super::peek::PeekedConnection;

/// TLS record type for handshake messages.
pub const TLS_HANDSHAKE: u8 = 0x16;

/// First byte of an HTTP `CONNECT` request line.
pub const HTTP_CONNECT: u8 = b'C';

/// Default cap on nested TLS terminations per connection.
pub const DEFAULT_MAX_TLS_DEPTH: usize = 4;

/// Errors that prevent a connection from being dispatched.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The first byte could not be read.
    #[error("couldn't read version: {0}")]
    ReadVersion(io::Error),

    /// The first byte matched no protocol.
    #[error("unknown protocol version {0:#04x}")]
    UnknownProtocol(u8),

    /// The client's TLS handshake failed.
    #[error("tls handshake failed: {0}")]
    TlsHandshake(io::Error),

    /// More nested TLS layers than allowed.
    #[error("tls nested deeper than {max} layers")]
    TlsNestingTooDeep { max: usize },

    /// The provisioned certificate could not be loaded.
    #[error("tls configuration error: {0}")]
    TlsConfig(String),
}

impl DispatchError {
    /// Short reason code for log fields.
    pub fn reason_code(&self) -> &'static str {
        match self {
            DispatchError::ReadVersion(_) => "read_version_failed",
            DispatchError::UnknownProtocol(_) => "unknown_protocol",
            DispatchError::TlsHandshake(_) => "tls_handshake_failed",
            DispatchError::TlsNestingTooDeep { .. } => "tls_nesting_too_deep",
            DispatchError::TlsConfig(_) => "tls_config",
        }
    }
}

/// Protocol selected by the first byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Socks,
    Tls,
    Http,
}

/// Classify a connection by its first byte.
pub fn classify(byte: u8) -> Option<Protocol> {
    match byte {
        SOCKS_VERSION => Some(Protocol::Socks),
        TLS_HANDSHAKE => Some(Protocol::Tls),
        HTTP_CONNECT => Some(Protocol::Http),
        _ => None,
    }
}

/// A dispatched connection.
pub struct Dispatched {
    /// Handler that owns the rest of the stream.
    pub handler: Handler,
    /// Stream positioned before the sniffed byte.
    pub conn: BoxedConn,
    /// Number of TLS layers terminated on the way.
    pub tls_layers: usize,
}

/// Routes accepted connections to the SOCKS5 or HTTP handler.
///
/// Built once at startup and shared read-only by every connection task.
pub struct DispatchServer {
    socks: SocksHandler,
    http: HttpProxyHandler,
    acceptor: TlsAcceptor,
    max_tls_depth: usize,
}

impl DispatchServer {
    /// Create a dispatcher terminating TLS with the given certificate.
    pub fn new(
        socks: SocksHandler,
        http: HttpProxyHandler,
        ca: &GeneratedCa,
        max_tls_depth: usize,
    ) -> Result<Self, DispatchError> {
        let config = tls_server_config(ca)?;
        Ok(Self {
            socks,
            http,
            acceptor: TlsAcceptor::from(Arc::new(config)),
            max_tls_depth,
        })
    }

    /// Classify `conn` and pick its handler.
    ///
    /// The returned stream replays the classified byte on its first read.
    pub async fn new_connection<C: Conn>(&self, conn: C) -> Result<Dispatched, DispatchError> {
        let mut conn: BoxedConn = Box::new(conn);
        let mut tls_layers = 0;

        loop {
            let mut version = [0u8; 1];
            match conn.read(&mut version).await {
                Ok(0) => {
                    return Err(DispatchError::ReadVersion(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection closed before first byte",
                    )))
                }
                Ok(_) => {}
                Err(e) => return Err(DispatchError::ReadVersion(e)),
            }

            let peeked = PeekedConnection::new(conn, version[0]);

            let handler = match classify(peeked.peeked_byte()) {
                Some(Protocol::Socks) => {
                    debug!(tls_layers, "SOCKS5 connection");
                    Handler::Socks(self.socks.clone())
                }
                Some(Protocol::Http) => {
                    debug!(tls_layers, "HTTP connection");
                    Handler::Http(self.http.clone())
                }
                Some(Protocol::Tls) => {
                    if tls_layers >= self.max_tls_depth {
                        return Err(DispatchError::TlsNestingTooDeep {
                            max: self.max_tls_depth,
                        });
                    }
                    debug!(tls_layers, "TLS connection");
                    let stream = self
                        .acceptor
                        .accept(peeked)
                        .await
                        .map_err(DispatchError::TlsHandshake)?;
                    tls_layers += 1;
                    conn = Box::new(TerminatedTls(stream));
                    continue;
                }
                None => return Err(DispatchError::UnknownProtocol(peeked.peeked_byte())),
            };

            return Ok(Dispatched {
                handler,
                conn: Box::new(peeked),
                tls_layers,
            });
        }
    }
}

/// Build the termination config: TLS 1.2 only, no client authentication.
fn tls_server_config(ca: &GeneratedCa) -> Result<ServerConfig, DispatchError> {
    let certs = rustls_pemfile::certs(&mut ca.cert_pem.as_bytes())
        .collect::<Result<Vec<CertificateDer<'static>>, _>>()
        .map_err(|e| DispatchError::TlsConfig(format!("invalid certificate PEM: {e}")))?;

    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut ca.key_pem.as_bytes())
        .map_err(|e| DispatchError::TlsConfig(format!("invalid key PEM: {e}")))?
        .ok_or_else(|| DispatchError::TlsConfig("no private key in PEM".to_string()))?;

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    ServerConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS12])
        .map_err(|e| DispatchError::TlsConfig(e.to_string()))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| DispatchError::TlsConfig(e.to_string()))
}

/// A TLS session terminated by the dispatcher.
struct TerminatedTls<C>(TlsStream<C>);

impl<C: AsyncRead + AsyncWrite + Unpin> AsyncRead for TerminatedTls<C> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().0).poll_read(cx, buf)
    }
}

impl<C: AsyncRead + AsyncWrite + Unpin> AsyncWrite for TerminatedTls<C> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().0).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().0).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().0).poll_shutdown(cx)
    }
}

impl<C: Conn> Conn for TerminatedTls<C> {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.0.get_ref().0.local_addr()
    }
}
