//! TCP listener and per-connection driving.
//!
//! The accept loop runs on its own task and never waits on a connection:
//! each accepted stream gets a task that dispatches it and then runs the
//! chosen handler until the connection ends.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use sockmux_socks5::Conn;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info, warn, Instrument};

use super::dispatcher::DispatchServer;
use super::handler::Handler;

/// Default maximum concurrent connections per listener.
pub const DEFAULT_MAX_CONNECTIONS: usize = 10000;

/// Configuration for a listener.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
}

impl ListenerConfig {
    /// Create a new listener configuration.
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            max_connections: DEFAULT_MAX_CONNECTIONS,
        }
    }
}

/// Statistics for a listener.
#[derive(Debug, Default)]
pub struct ListenerStats {
    /// Total connections accepted.
    pub connections_accepted: AtomicU64,
    /// Connections currently open, including those held by the HTTP engine.
    pub connections_active: AtomicU64,
    /// Total connections closed.
    pub connections_closed: AtomicU64,
    /// Connections rejected due to max limit.
    pub connections_rejected: AtomicU64,
    /// Connections handed to the SOCKS5 handler.
    pub socks_dispatched: AtomicU64,
    /// Connections handed to the HTTP proxy.
    pub http_dispatched: AtomicU64,
    /// TLS layers terminated across all connections.
    pub tls_terminated: AtomicU64,
    /// Connections closed because dispatch failed.
    pub dispatch_failed: AtomicU64,
}

/// The proxy's TCP listener.
pub struct Listener {
    /// The TCP listener.
    listener: TcpListener,
    /// Dispatcher shared by every connection task.
    dispatcher: Arc<DispatchServer>,
    /// Connection semaphore for limiting concurrent connections.
    conn_semaphore: Arc<Semaphore>,
    /// Statistics.
    stats: Arc<ListenerStats>,
}

impl Listener {
    /// Bind a new listener.
    pub async fn bind(config: ListenerConfig, dispatcher: Arc<DispatchServer>) -> io::Result<Self> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        let local_addr = listener.local_addr()?;

        info!(
            bind_addr = %local_addr,
            max_connections = config.max_connections,
            "Listener bound"
        );

        Ok(Self {
            conn_semaphore: Arc::new(Semaphore::new(config.max_connections)),
            listener,
            dispatcher,
            stats: Arc::new(ListenerStats::default()),
        })
    }

    /// Get the local address this listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Get listener statistics.
    pub fn stats(&self) -> &ListenerStats {
        &self.stats
    }

    /// Run the listener, accepting and handling connections.
    pub async fn run(self: Arc<Self>) -> io::Result<()> {
        let local_addr = self.listener.local_addr()?;
        info!(bind_addr = %local_addr, "Listener started");

        loop {
            match self.listener.accept().await {
                Ok((stream, peer_addr)) => {
                    // Try to acquire a permit
                    let permit = match self.conn_semaphore.clone().try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => {
                            self.stats
                                .connections_rejected
                                .fetch_add(1, Ordering::Relaxed);
                            warn!(peer_addr = %peer_addr, "Connection rejected: max connections reached");
                            continue;
                        }
                    };

                    self.stats
                        .connections_accepted
                        .fetch_add(1, Ordering::Relaxed);

                    // The permit travels with the stream, so a connection
                    // handed to the HTTP engine stays counted until hyper
                    // drops it.
                    let stream = TrackedConn::new(stream, permit, Arc::clone(&self.stats));
                    let listener = Arc::clone(&self);

                    tokio::spawn(
                        async move { listener.handle_connection(stream).await }
                            .instrument(tracing::info_span!("connection", peer = %peer_addr)),
                    );
                }
                Err(e) => {
                    error!(error = %e, "Accept error");
                    // Brief sleep to avoid tight loop on persistent errors
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    /// Dispatch a single connection and run its handler.
    async fn handle_connection(&self, stream: TrackedConn<TcpStream>) {
        let dispatched = match self.dispatcher.new_connection(stream).await {
            Ok(dispatched) => dispatched,
            Err(e) => {
                self.stats.dispatch_failed.fetch_add(1, Ordering::Relaxed);
                debug!(
                    reason = e.reason_code(),
                    error = %e,
                    "Couldn't handle connection"
                );
                return;
            }
        };

        self.stats
            .tls_terminated
            .fetch_add(dispatched.tls_layers as u64, Ordering::Relaxed);
        match &dispatched.handler {
            Handler::Socks(_) => self.stats.socks_dispatched.fetch_add(1, Ordering::Relaxed),
            Handler::Http(_) => self.stats.http_dispatched.fetch_add(1, Ordering::Relaxed),
        };

        let handler = dispatched.handler;
        match handler.handle(dispatched.conn).await {
            Ok(()) => debug!(handler = handler.name(), "Connection handed off"),
            Err(e) if e.is_end_of_stream() => {
                debug!(handler = handler.name(), "Connection closed by peer")
            }
            Err(e) => debug!(
                handler = handler.name(),
                reason = e.reason_code(),
                error = %e,
                "Connection ended with error"
            ),
        }
    }
}

/// An accepted stream holding its connection permit.
///
/// Dropping it, wherever that happens, releases the permit and marks the
/// connection closed.
struct TrackedConn<C> {
    inner: C,
    _permit: OwnedSemaphorePermit,
    stats: Arc<ListenerStats>,
}

impl<C> TrackedConn<C> {
    fn new(inner: C, permit: OwnedSemaphorePermit, stats: Arc<ListenerStats>) -> Self {
        stats.connections_active.fetch_add(1, Ordering::Relaxed);
        Self {
            inner,
            _permit: permit,
            stats,
        }
    }
}

impl<C> Drop for TrackedConn<C> {
    fn drop(&mut self) {
        self.stats.connections_active.fetch_sub(1, Ordering::Relaxed);
        self.stats.connections_closed.fetch_add(1, Ordering::Relaxed);
    }
}

impl<C: AsyncRead + Unpin> AsyncRead for TrackedConn<C> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

impl<C: AsyncWrite + Unpin> AsyncWrite for TrackedConn<C> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

impl<C: Conn> Conn for TrackedConn<C> {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }
}
