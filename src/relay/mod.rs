//! Relay engine
//!
//! Owns the listener lifecycles for forwarding rules and the byte-pump used
//! by every TCP tunnel. A [`Forwarder`] is built from one rule plus a mode
//! and runs independently of its siblings.

mod tcp;
mod udp;

pub use tcp::TcpForwarder;
pub use udp::UdpForwarder;

use crate::config::{ForwardRule, Protocol, RelayConfig};
use crate::error::{FerryError, Result};
use crate::registry::ServerRegistry;
use crate::socks::Socks5Client;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

/// How a forwarder reaches its upstream.
#[derive(Clone)]
pub enum ForwarderMode {
    /// Tunnel every session through one fixed proxy.
    Normal {
        /// Client for the configured proxy
        client: Socks5Client,
    },
    /// Act as a local SOCKS5 server and tunnel through whichever registry
    /// server is selected at request time.
    Auto {
        /// Shared server registry
        registry: Arc<dyn ServerRegistry>,
    },
}

impl std::fmt::Debug for ForwarderMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ForwarderMode::Normal { client } => f
                .debug_struct("Normal")
                .field("proxy", &client.proxy_addr())
                .finish(),
            ForwarderMode::Auto { .. } => f.debug_struct("Auto").finish_non_exhaustive(),
        }
    }
}

/// One running (or stopped) forwarding rule.
#[derive(Debug)]
pub enum Forwarder {
    /// TCP stream forwarding
    Tcp(TcpForwarder),
    /// UDP datagram forwarding
    Udp(UdpForwarder),
}

impl Forwarder {
    /// Build a forwarder for `rule`.
    ///
    /// UDP rules need a fixed proxy for the association, so combining a UDP
    /// rule with auto-proxy mode is a configuration error.
    pub fn from_rule(rule: &ForwardRule, mode: ForwarderMode, relay: &RelayConfig) -> Result<Self> {
        match (rule.protocol, mode) {
            (Protocol::Tcp, mode) => Ok(Forwarder::Tcp(TcpForwarder::new(
                rule.clone(),
                mode,
                relay.tcp_timeout(),
            ))),
            (Protocol::Udp, ForwarderMode::Normal { client }) => Ok(Forwarder::Udp(
                UdpForwarder::new(rule.clone(), client, relay.udp_response_timeout()),
            )),
            (Protocol::Udp, ForwarderMode::Auto { .. }) => Err(FerryError::Config(format!(
                "rule {}: auto-proxy mode serves TCP only",
                rule.id
            ))),
        }
    }

    /// The id of the rule this forwarder serves.
    pub fn rule_id(&self) -> &str {
        match self {
            Forwarder::Tcp(f) => f.rule_id(),
            Forwarder::Udp(f) => f.rule_id(),
        }
    }

    /// Bind the local endpoint and begin serving.
    pub async fn start(&self) -> Result<()> {
        match self {
            Forwarder::Tcp(f) => f.start().await,
            Forwarder::Udp(f) => f.start().await,
        }
    }

    /// Stop serving and release the local endpoint.
    ///
    /// In-flight sessions are asked to wind down; new ones are refused
    /// immediately.
    pub async fn stop(&self) -> Result<()> {
        match self {
            Forwarder::Tcp(f) => f.stop().await,
            Forwarder::Udp(f) => f.stop().await,
        }
    }

    /// Whether the forwarder is currently serving.
    pub fn is_running(&self) -> bool {
        match self {
            Forwarder::Tcp(f) => f.is_running(),
            Forwarder::Udp(f) => f.is_running(),
        }
    }
}

/// Pump bytes both ways between `local` and `remote` until either side
/// closes, either leg fails, or the hard cap elapses.
///
/// The cap bounds the total lifetime of the session, not idle time: a
/// transfer still moving data is cut off when it fires. EOF and leg errors
/// both count as a normal end of session.
pub async fn relay_streams<L, R>(local: L, remote: R, cap: Duration) -> Result<()>
where
    L: AsyncRead + AsyncWrite + Unpin + Send,
    R: AsyncRead + AsyncWrite + Unpin + Send,
{
    let (mut local_read, mut local_write) = tokio::io::split(local);
    let (mut remote_read, mut remote_write) = tokio::io::split(remote);

    let transfer = async {
        tokio::select! {
            result = tokio::io::copy(&mut local_read, &mut remote_write) => ("outbound", result),
            result = tokio::io::copy(&mut remote_read, &mut local_write) => ("inbound", result),
        }
    };

    match tokio::time::timeout(cap, transfer).await {
        Ok((direction, Ok(bytes))) => {
            debug!("relay finished, {} leg closed after {} bytes", direction, bytes);
            Ok(())
        }
        Ok((direction, Err(e))) => {
            debug!("relay finished, {} leg failed: {}", direction, e);
            Ok(())
        }
        Err(_) => Err(FerryError::Timeout(format!(
            "relay exceeded the {}s session cap",
            cap.as_secs()
        ))),
    }
}
