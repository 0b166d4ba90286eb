//! SOCKS5 wire constants and target addressing (RFC 1928).

use std::fmt;
use std::net::Ipv4Addr;

/// Protocol version marker, first byte of every SOCKS5 message.
pub const SOCKS_VERSION: u8 = 0x05;

/// "No authentication required" method code.
pub const AUTH_NO_AUTH: u8 = 0x00;

/// Reply code for a successful request.
pub const REPLY_SUCCEEDED: u8 = 0x00;

/// Reserved byte value.
pub const RESERVED: u8 = 0x00;

/// Request command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Connect,
    Bind,
    UdpAssociate,
}

impl Command {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Self::Connect),
            0x02 => Some(Self::Bind),
            0x03 => Some(Self::UdpAssociate),
            _ => None,
        }
    }
}

/// Address type of a request target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressType {
    Ipv4,
    DomainName,
    Ipv6,
}

impl AddressType {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Self::Ipv4),
            0x03 => Some(Self::DomainName),
            0x04 => Some(Self::Ipv6),
            _ => None,
        }
    }

    pub fn as_byte(self) -> u8 {
        match self {
            Self::Ipv4 => 0x01,
            Self::DomainName => 0x03,
            Self::Ipv6 => 0x04,
        }
    }
}

/// Target of a request: a dotted-quad or hostname plus port.
///
/// Only lives for the duration of request handling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionAddress {
    pub host: String,
    pub port: u16,
}

impl SessionAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Build a target from an IPv4 address as read off the wire.
    pub fn from_ipv4(octets: [u8; 4], port: u16) -> Self {
        Self::new(Ipv4Addr::from(octets).to_string(), port)
    }
}

impl fmt::Display for SessionAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}
