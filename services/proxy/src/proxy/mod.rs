//! Single-port protocol-multiplexing proxy.
//!
//! This module provides:
//! - TCP listener management
//! - First-byte protocol dispatch with replay of the sniffed byte
//! - TLS termination with re-dispatch of the decrypted stream
//! - SOCKS5 and HTTP proxy handlers
//!
//! ## Architecture
//!
//! ```text
//! Client -> Listener -> DispatchServer --0x05--> SocksHandler -> target
//!                          |    ^      --'C'---> HttpProxyHandler -> HttpProxyServer
//!                          |    |
//!                          +0x16+ (TLS terminated, classify again)
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! let ca = sockmux_certs::generate(&CaParams::default())?;
//! let (http, http_server) = HttpProxyHandler::new();
//! let dispatcher = Arc::new(DispatchServer::new(SocksHandler::new(), http, &ca, 4)?);
//! let listener = Arc::new(Listener::bind(ListenerConfig::new(bind_addr), dispatcher).await?);
//!
//! tokio::spawn(http_server.start(listener.local_addr()?));
//! listener.run().await?;
//! ```

mod dispatcher;
mod handler;
mod http_proxy;
mod listener;
mod peek;

pub use dispatcher::{
    classify, DispatchError, DispatchServer, Dispatched, Protocol, DEFAULT_MAX_TLS_DEPTH,
    HTTP_CONNECT, TLS_HANDSHAKE,
};
pub use handler::{Handler, HandlerError, SocksHandler};
pub use http_proxy::{HttpProxyHandler, HttpProxyServer};
pub use listener::{Listener, ListenerConfig, ListenerStats, DEFAULT_MAX_CONNECTIONS};
pub use peek::PeekedConnection;
