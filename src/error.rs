//! Error types for Socksferry
//!
//! This module defines all custom error types used throughout the application.

use std::io;
use thiserror::Error;

/// Main error type for Socksferry operations
#[derive(Error, Debug)]
pub enum FerryError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed SOCKS5 address field (bad ATYP, bad length, truncated buffer)
    #[error("Malformed address: {0}")]
    MalformedAddress(String),

    /// SOCKS5 protocol violation (bad version byte, rejected auth, bad framing)
    #[error("Protocol violation: {0}")]
    Protocol(String),

    /// Upstream proxy returned a non-success SOCKS5 reply code
    #[error("Upstream rejected request: {0}")]
    Rejected(ReplyCode),

    /// Could not reach the upstream proxy or the final target
    #[error("Upstream unreachable: {0}")]
    UpstreamUnreachable(String),

    /// Auto-proxy mode with no server selected in the registry
    #[error("No server selected")]
    NoServerSelected,

    /// Subscription body matched no known format
    #[error("Unsupported subscription format")]
    UnsupportedFormat,

    /// Deadline exceeded on a relay leg or UDP response wait
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Forwarder start requested while already running
    #[error("Forwarder already running")]
    AlreadyRunning,

    /// Forwarder stop requested while not running
    #[error("Forwarder not running")]
    NotRunning,
}

/// Convenience alias used throughout the protocol and relay paths.
pub type Result<T> = std::result::Result<T, FerryError>;

/// Reply codes for SOCKS5 protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReplyCode {
    /// Command succeeded
    Succeeded = 0x00,
    /// General SOCKS server failure
    GeneralFailure = 0x01,
    /// Connection not allowed by ruleset
    ConnectionNotAllowed = 0x02,
    /// Network unreachable
    NetworkUnreachable = 0x03,
    /// Host unreachable
    HostUnreachable = 0x04,
    /// Connection refused
    ConnectionRefused = 0x05,
    /// TTL expired
    TtlExpired = 0x06,
    /// Command not supported
    CommandNotSupported = 0x07,
    /// Address type not supported
    AddressTypeNotSupported = 0x08,
}

impl ReplyCode {
    /// True for the success code.
    pub fn is_success(self) -> bool {
        self == ReplyCode::Succeeded
    }
}

impl std::fmt::Display for ReplyCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            ReplyCode::Succeeded => "succeeded",
            ReplyCode::GeneralFailure => "general SOCKS server failure",
            ReplyCode::ConnectionNotAllowed => "connection not allowed by ruleset",
            ReplyCode::NetworkUnreachable => "network unreachable",
            ReplyCode::HostUnreachable => "host unreachable",
            ReplyCode::ConnectionRefused => "connection refused",
            ReplyCode::TtlExpired => "TTL expired",
            ReplyCode::CommandNotSupported => "command not supported",
            ReplyCode::AddressTypeNotSupported => "address type not supported",
        };
        write!(f, "{} (0x{:02x})", text, *self as u8)
    }
}

impl From<ReplyCode> for u8 {
    fn from(code: ReplyCode) -> Self {
        code as u8
    }
}

impl TryFrom<u8> for ReplyCode {
    type Error = FerryError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x00 => Ok(ReplyCode::Succeeded),
            0x01 => Ok(ReplyCode::GeneralFailure),
            0x02 => Ok(ReplyCode::ConnectionNotAllowed),
            0x03 => Ok(ReplyCode::NetworkUnreachable),
            0x04 => Ok(ReplyCode::HostUnreachable),
            0x05 => Ok(ReplyCode::ConnectionRefused),
            0x06 => Ok(ReplyCode::TtlExpired),
            0x07 => Ok(ReplyCode::CommandNotSupported),
            0x08 => Ok(ReplyCode::AddressTypeNotSupported),
            other => Err(FerryError::Protocol(format!(
                "unknown SOCKS5 reply code: 0x{:02x}",
                other
            ))),
        }
    }
}

impl From<&io::Error> for ReplyCode {
    fn from(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionRefused => ReplyCode::ConnectionRefused,
            io::ErrorKind::TimedOut => ReplyCode::HostUnreachable,
            io::ErrorKind::AddrNotAvailable => ReplyCode::HostUnreachable,
            io::ErrorKind::PermissionDenied => ReplyCode::ConnectionNotAllowed,
            _ => ReplyCode::GeneralFailure,
        }
    }
}
