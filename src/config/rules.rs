//! Forwarding rule and relay configuration types.

use crate::error::{FerryError, Result};
use crate::socks::addr::Address;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Transport protocol of a forwarding rule.
///
/// A closed enumeration: anything other than `"tcp"` or `"udp"` is rejected
/// at configuration parse time instead of falling through string
/// comparisons at dispatch time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// TCP stream forwarding
    Tcp,
    /// UDP datagram forwarding
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
        }
    }
}

impl FromStr for Protocol {
    type Err = FerryError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            other => Err(FerryError::Config(format!(
                "unsupported protocol: {} (expected tcp or udp)",
                other
            ))),
        }
    }
}

/// One port-forwarding rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForwardRule {
    /// Unique id within the rule set
    pub id: String,
    /// Transport protocol
    pub protocol: Protocol,
    /// Local listen address, e.g. `127.0.0.1:8080`
    pub local_addr: String,
    /// Remote target address, e.g. `example.com:80`
    pub remote_addr: String,
    /// Whether the rule is started at launch
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

impl ForwardRule {
    /// Parse the remote target into a SOCKS5 address.
    pub fn remote_address(&self) -> Result<Address> {
        parse_host_port(&self.remote_addr)
    }
}

/// Split `host:port` into a SOCKS5 address, preferring the IP forms when the
/// host parses as a literal.
pub fn parse_host_port(s: &str) -> Result<Address> {
    if let Ok(sock) = s.parse() {
        return Ok(Address::Ip(sock));
    }
    let (host, port) = s
        .rsplit_once(':')
        .ok_or_else(|| FerryError::Config(format!("address missing port: {}", s)))?;
    let port: u16 = port
        .parse()
        .map_err(|_| FerryError::Config(format!("invalid port in address: {}", s)))?;
    if host.is_empty() {
        return Err(FerryError::Config(format!("address missing host: {}", s)));
    }
    Ok(Address::domain(host, port))
}

/// Fixed upstream proxy used by normal-mode rules.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Proxy address, e.g. `proxy.example.com:1080`
    pub addr: String,
    /// Auth username
    #[serde(default)]
    pub username: Option<String>,
    /// Auth password
    #[serde(default)]
    pub password: Option<String>,
}

/// Relay deadlines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Hard cap on the total duration of one TCP relay, in seconds.
    ///
    /// This is not an idle timeout: a transfer still moving data is cut off
    /// once the cap elapses.
    #[serde(default = "default_tcp_timeout")]
    pub tcp_timeout_secs: u64,
    /// How long to keep a UDP exchange pending before silently expiring it,
    /// in seconds.
    #[serde(default = "default_udp_response_timeout")]
    pub udp_response_timeout_secs: u64,
}

fn default_tcp_timeout() -> u64 {
    30
}

fn default_udp_response_timeout() -> u64 {
    5
}

impl Default for RelayConfig {
    fn default() -> Self {
        RelayConfig {
            tcp_timeout_secs: default_tcp_timeout(),
            udp_response_timeout_secs: default_udp_response_timeout(),
        }
    }
}

impl RelayConfig {
    /// TCP relay cap as a [`Duration`].
    pub fn tcp_timeout(&self) -> Duration {
        Duration::from_secs(self.tcp_timeout_secs)
    }

    /// UDP response deadline as a [`Duration`].
    pub fn udp_response_timeout(&self) -> Duration {
        Duration::from_secs(self.udp_response_timeout_secs)
    }
}
