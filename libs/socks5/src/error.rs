//! Error types for SOCKS5 sessions.

use std::io;

use thiserror::Error;

use crate::address::SessionAddress;
use crate::relay::Direction;

/// Errors that end a SOCKS5 session.
#[derive(Debug, Error)]
pub enum SocksError {
    /// Version byte other than 0x05.
    #[error("unsupported SOCKS version {0:#04x}")]
    UnsupportedVersion(u8),

    /// Method count of zero.
    #[error("client should provide at least one authentication method")]
    NoMethods,

    /// "No authentication" was not among the offered methods.
    #[error("no suitable authentication mechanism (offered {offered:02x?})")]
    NoAcceptableMethod { offered: Vec<u8> },

    /// IPv6 or an unknown address type.
    #[error("address type {0:#04x} not supported")]
    UnsupportedAddressType(u8),

    /// Domain name bytes were not valid UTF-8.
    #[error("domain name is not valid UTF-8")]
    InvalidDomainName,

    /// BIND, UDP ASSOCIATE or an unknown command.
    #[error("command {command:#04x} not supported (target {target})")]
    UnsupportedCommand { command: u8, target: SessionAddress },

    /// The outbound connection could not be opened.
    #[error("couldn't connect to {target}: {source}")]
    Dial {
        target: SessionAddress,
        source: io::Error,
    },

    /// Relay requested before a successful CONNECT.
    #[error("no remote connection established")]
    NotConnected,

    /// One relay direction failed or reached end of stream.
    #[error("{direction} relay ended: {source}")]
    Relay {
        direction: Direction,
        source: io::Error,
    },

    /// IO error while reading or writing protocol fields.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl SocksError {
    /// Short reason code for log fields.
    pub fn reason_code(&self) -> &'static str {
        match self {
            SocksError::UnsupportedVersion(_) => "unsupported_version",
            SocksError::NoMethods => "no_methods",
            SocksError::NoAcceptableMethod { .. } => "no_acceptable_method",
            SocksError::UnsupportedAddressType(_) => "unsupported_address_type",
            SocksError::InvalidDomainName => "invalid_domain_name",
            SocksError::UnsupportedCommand { .. } => "unsupported_command",
            SocksError::Dial { .. } => "dial_failed",
            SocksError::NotConnected => "not_connected",
            SocksError::Relay { .. } => "relay_ended",
            SocksError::Io(_) => "io_error",
        }
    }

    /// True when the session ended because a peer closed its side cleanly.
    pub fn is_end_of_stream(&self) -> bool {
        match self {
            SocksError::Relay { source, .. } => source.kind() == io::ErrorKind::UnexpectedEof,
            _ => false,
        }
    }
}
