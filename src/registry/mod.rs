//! Upstream server registry
//!
//! Holds the pool of candidate upstream SOCKS5 servers the auto-proxy mode
//! selects from. The registry is the single owner of selection state: every
//! reader goes through its API, and at most one server is selected at a
//! time. Persistence is the caller's responsibility.

use crate::error::{FerryError, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::RwLock;

/// Sub-protocol a server speaks.
///
/// Only SOCKS5 servers are dialable; the other kinds are carried as
/// subscription metadata (credentials and cipher names included) without a
/// protocol implementation behind them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerProtocol {
    /// Plain SOCKS5, optionally with username/password auth
    Socks5,
    /// VMess link metadata
    Vmess,
    /// Shadowsocks link metadata
    Shadowsocks,
    /// ShadowsocksR link metadata
    ShadowsocksR,
}

impl fmt::Display for ServerProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerProtocol::Socks5 => write!(f, "socks5"),
            ServerProtocol::Vmess => write!(f, "vmess"),
            ServerProtocol::Shadowsocks => write!(f, "shadowsocks"),
            ServerProtocol::ShadowsocksR => write!(f, "shadowsocksr"),
        }
    }
}

/// One upstream server record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpstreamServer {
    /// Deterministic identity, see [`server_id`]
    pub id: String,
    /// Display name
    pub name: String,
    /// Host (IP or domain)
    pub addr: String,
    /// Port
    pub port: u16,
    /// Auth username (empty when unauthenticated)
    #[serde(default)]
    pub username: String,
    /// Auth password (empty when unauthenticated)
    #[serde(default)]
    pub password: String,
    /// Sub-protocol
    pub protocol: ServerProtocol,
    /// Cipher name for shadowsocks-family metadata
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    /// Last measured latency in milliseconds (0 = unmeasured)
    #[serde(default)]
    pub delay_ms: u32,
    /// Eligible for use
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Currently selected for auto-proxy mode
    #[serde(default)]
    pub selected: bool,
}

fn default_enabled() -> bool {
    true
}

impl UpstreamServer {
    /// Build a SOCKS5 server record with the deterministic id and default
    /// runtime state.
    pub fn socks5(name: impl Into<String>, addr: impl Into<String>, port: u16, username: impl Into<String>, password: impl Into<String>) -> Self {
        let addr = addr.into();
        let username = username.into();
        UpstreamServer {
            id: server_id(&addr, port, &username, ServerProtocol::Socks5),
            name: name.into(),
            addr,
            port,
            username,
            password: password.into(),
            protocol: ServerProtocol::Socks5,
            method: None,
            delay_ms: 0,
            enabled: true,
            selected: false,
        }
    }

    /// The `host:port` endpoint string for dialing.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.addr, self.port)
    }
}

/// Deterministic server id: hex SHA-256 over the identity fields.
///
/// A pure function of (addr, port, auth identity, protocol), so re-ingesting
/// the same logical server always produces the same id and upserts merge
/// instead of duplicating.
pub fn server_id(addr: &str, port: u16, username: &str, protocol: ServerProtocol) -> String {
    let digest = Sha256::new()
        .chain_update(addr.as_bytes())
        .chain_update(b":")
        .chain_update(port.to_string().as_bytes())
        .chain_update(b":")
        .chain_update(username.as_bytes())
        .chain_update(b":")
        .chain_update(protocol.to_string().as_bytes())
        .finalize();
    digest[..16].iter().map(|b| format!("{:02x}", b)).collect()
}

/// Read surface the relay engine and its callers share.
///
/// Implementations must make reads atomic with respect to writes: the
/// selected server observed by a concurrent auto-proxy request is always a
/// complete record, never a torn one.
pub trait ServerRegistry: Send + Sync {
    /// All known servers.
    fn list(&self) -> Vec<UpstreamServer>;

    /// Look up a server by id.
    fn get(&self, id: &str) -> Option<UpstreamServer>;

    /// The currently selected server, if any.
    fn get_selected(&self) -> Option<UpstreamServer>;

    /// Insert or merge a server by id. Existing `selected` and `delay_ms`
    /// values survive the merge.
    fn upsert(&self, server: UpstreamServer);

    /// Remove a server. Returns false when the id is unknown. Running
    /// sessions that already resolved this server are unaffected.
    fn remove(&self, id: &str) -> bool;

    /// Mark one server selected, clearing any previous selection.
    fn select(&self, id: &str) -> Result<()>;

    /// Clear the selection entirely.
    fn clear_selection(&self);

    /// Record a measured latency.
    fn set_delay(&self, id: &str, delay_ms: u32) -> Result<()>;
}

/// In-memory registry guarded by an `RwLock`.
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    servers: RwLock<Vec<UpstreamServer>>,
}

impl MemoryRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry pre-populated with `servers` (ids are trusted).
    pub fn with_servers(servers: Vec<UpstreamServer>) -> Self {
        MemoryRegistry {
            servers: RwLock::new(servers),
        }
    }
}

impl ServerRegistry for MemoryRegistry {
    fn list(&self) -> Vec<UpstreamServer> {
        self.servers.read().unwrap().clone()
    }

    fn get(&self, id: &str) -> Option<UpstreamServer> {
        self.servers.read().unwrap().iter().find(|s| s.id == id).cloned()
    }

    fn get_selected(&self) -> Option<UpstreamServer> {
        self.servers.read().unwrap().iter().find(|s| s.selected).cloned()
    }

    fn upsert(&self, mut server: UpstreamServer) {
        let mut servers = self.servers.write().unwrap();
        if let Some(existing) = servers.iter_mut().find(|s| s.id == server.id) {
            server.selected = existing.selected;
            server.delay_ms = existing.delay_ms;
            *existing = server;
        } else {
            servers.push(server);
        }
    }

    fn remove(&self, id: &str) -> bool {
        let mut servers = self.servers.write().unwrap();
        let before = servers.len();
        servers.retain(|s| s.id != id);
        servers.len() != before
    }

    fn select(&self, id: &str) -> Result<()> {
        let mut servers = self.servers.write().unwrap();
        if !servers.iter().any(|s| s.id == id) {
            return Err(FerryError::Config(format!("unknown server id: {}", id)));
        }
        for s in servers.iter_mut() {
            s.selected = s.id == id;
        }
        Ok(())
    }

    fn clear_selection(&self) {
        for s in self.servers.write().unwrap().iter_mut() {
            s.selected = false;
        }
    }

    fn set_delay(&self, id: &str, delay_ms: u32) -> Result<()> {
        let mut servers = self.servers.write().unwrap();
        match servers.iter_mut().find(|s| s.id == id) {
            Some(s) => {
                s.delay_ms = delay_ms;
                Ok(())
            }
            None => Err(FerryError::Config(format!("unknown server id: {}", id))),
        }
    }
}
