//! SOCKS5 protocol engine.
//!
//! This library provides:
//! - The [`Conn`] capability shared by every stream the proxy hands around
//! - SOCKS5 method negotiation (no-auth only)
//! - CONNECT request parsing for IPv4 and domain-name targets
//! - The success reply encoder
//! - The bidirectional relay used once CONNECT succeeds
//!
//! ## Session lifecycle
//!
//! ```text
//! Start (method negotiation) -> Request (CONNECT) -> Relay -> Closed
//! ```
//!
//! Any failure aborts the session. No SOCKS failure reply is written; the
//! caller drops both connections and the client observes an abrupt close.
//!
//! ## Usage
//!
//! ```ignore
//! let mut session = SocksSession::new(stream, Arc::new(TcpDialer));
//! session.start().await?;
//! let target = session.request().await?;
//! let reason = session.relay().await;
//! ```

mod address;
mod conn;
mod dialer;
mod error;
mod relay;
mod session;

pub use address::{
    AddressType, Command, SessionAddress, AUTH_NO_AUTH, REPLY_SUCCEEDED, RESERVED, SOCKS_VERSION,
};
pub use conn::{BoxedConn, Conn};
pub use dialer::{Dialer, Network, TcpDialer};
pub use error::SocksError;
pub use relay::{relay, Direction, RELAY_BUFFER_SIZE};
pub use session::SocksSession;
