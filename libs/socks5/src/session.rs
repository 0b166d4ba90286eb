//! SOCKS5 session state machine.
//!
//! Per RFC 1928, restricted to what the proxy supports:
//! - Method negotiation: only "no authentication required"
//! - Requests: CONNECT to IPv4 or domain-name targets
//! - Replies: success only; failures close the connection
//!
//! Each protocol field is read with `read_exact`, so nothing past the
//! current field is consumed.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::address::{
    AddressType, Command, SessionAddress, AUTH_NO_AUTH, REPLY_SUCCEEDED, RESERVED, SOCKS_VERSION,
};
use crate::conn::BoxedConn;
use crate::dialer::{Dialer, Network};
use crate::error::SocksError;
use crate::relay::relay;

/// One client's SOCKS5 conversation.
///
/// `remote` stays `None` until the CONNECT success reply has been written.
pub struct SocksSession<C> {
    con: C,
    remote: Option<BoxedConn>,
    dialer: Arc<dyn Dialer>,
}

impl<C> SocksSession<C>
where
    C: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    /// Create a session over a client connection.
    pub fn new(con: C, dialer: Arc<dyn Dialer>) -> Self {
        Self {
            con,
            remote: None,
            dialer,
        }
    }

    /// The outbound connection, once CONNECT has succeeded.
    pub fn remote(&self) -> Option<&BoxedConn> {
        self.remote.as_ref()
    }

    /// Negotiate the authentication method.
    ///
    /// Writes `05 00` when the client offers no-auth; otherwise fails without
    /// writing anything.
    pub async fn start(&mut self) -> Result<(), SocksError> {
        let version = self.con.read_u8().await?;
        if version != SOCKS_VERSION {
            return Err(SocksError::UnsupportedVersion(version));
        }

        let method_count = self.con.read_u8().await?;
        if method_count == 0 {
            return Err(SocksError::NoMethods);
        }

        let mut methods = vec![0u8; method_count as usize];
        self.con.read_exact(&mut methods).await?;

        if !methods.contains(&AUTH_NO_AUTH) {
            return Err(SocksError::NoAcceptableMethod { offered: methods });
        }

        self.con.write_all(&[SOCKS_VERSION, AUTH_NO_AUTH]).await?;
        self.con.flush().await?;
        Ok(())
    }

    /// Read one request and execute it.
    ///
    /// Only CONNECT is executed; the returned address is the target that was
    /// dialed.
    pub async fn request(&mut self) -> Result<SessionAddress, SocksError> {
        let version = self.con.read_u8().await?;
        if version != SOCKS_VERSION {
            return Err(SocksError::UnsupportedVersion(version));
        }

        // CMD, RSV, ATYP
        let mut header = [0u8; 3];
        self.con.read_exact(&mut header).await?;
        let [command, _reserved, address_type] = header;

        let target = self.read_address(address_type).await?;

        match Command::from_byte(command) {
            Some(Command::Connect) => {
                self.connect(&target).await?;
                Ok(target)
            }
            Some(Command::Bind) | Some(Command::UdpAssociate) | None => {
                Err(SocksError::UnsupportedCommand { command, target })
            }
        }
    }

    /// Relay bytes until the target-to-client direction ends.
    ///
    /// Consumes the session; both connections are dropped when this returns.
    pub async fn relay(self) -> SocksError {
        match self.remote {
            Some(remote) => relay(self.con, remote).await,
            None => SocksError::NotConnected,
        }
    }

    async fn read_address(&mut self, address_type: u8) -> Result<SessionAddress, SocksError> {
        match AddressType::from_byte(address_type) {
            Some(AddressType::Ipv4) => {
                let mut octets = [0u8; 4];
                self.con.read_exact(&mut octets).await?;
                let port = self.con.read_u16().await?;
                Ok(SessionAddress::from_ipv4(octets, port))
            }
            Some(AddressType::DomainName) => {
                let len = self.con.read_u8().await?;
                let mut name = vec![0u8; len as usize];
                self.con.read_exact(&mut name).await?;
                let host = String::from_utf8(name).map_err(|_| SocksError::InvalidDomainName)?;
                let port = self.con.read_u16().await?;
                Ok(SessionAddress::new(host, port))
            }
            Some(AddressType::Ipv6) | None => Err(SocksError::UnsupportedAddressType(address_type)),
        }
    }

    async fn connect(&mut self, target: &SessionAddress) -> Result<(), SocksError> {
        let remote = self
            .dialer
            .dial(Network::Tcp, target)
            .await
            .map_err(|source| SocksError::Dial {
                target: target.clone(),
                source,
            })?;

        let bind_addr = remote.local_addr()?;
        debug!(target = %target, bind_addr = %bind_addr, "Connected to target");

        let reply = encode_success_reply(bind_addr);
        self.con.write_all(&reply).await?;
        self.con.flush().await?;

        self.remote = Some(remote);
        Ok(())
    }
}

/// Encode a success reply carrying the outbound socket's local address.
///
/// The reply always uses the IPv4 address type. IPv4-mapped IPv6 addresses
/// are unmapped; any other IPv6 address is reported as 0.0.0.0.
pub(crate) fn encode_success_reply(bind_addr: SocketAddr) -> [u8; 10] {
    let ip = match bind_addr.ip() {
        IpAddr::V4(v4) => v4,
        IpAddr::V6(v6) => v6.to_ipv4_mapped().unwrap_or(Ipv4Addr::UNSPECIFIED),
    };
    let [a, b, c, d] = ip.octets();
    let [port_hi, port_lo] = bind_addr.port().to_be_bytes();

    [
        SOCKS_VERSION,
        REPLY_SUCCEEDED,
        RESERVED,
        AddressType::Ipv4.as_byte(),
        a,
        b,
        c,
        d,
        port_hi,
        port_lo,
    ]
}
