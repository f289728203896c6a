//! # Socksferry - SOCKS5 Port Forwarding Engine
//!
//! Socksferry forwards local TCP and UDP endpoints through upstream SOCKS5
//! proxies. Each forwarding rule binds a local address and tunnels its
//! traffic to a fixed remote target, either through one configured proxy or,
//! in auto-proxy mode, through whichever server is currently selected in
//! the server registry.
//!
//! ## Features
//!
//! - **TCP Forwarding**: per-rule accept loop, one relay task per connection
//! - **UDP Forwarding**: one UDP ASSOCIATE per rule, shared by all clients
//! - **Auto-Proxy Mode**: the local listener is itself a SOCKS5 server,
//!   resolving the upstream per request from the selected registry server
//! - **Subscription Ingestion**: normalizes subscription payloads (base64,
//!   JSON array, or mixed link lines) into upstream-server records
//!
//! ## Usage
//!
//! ```rust,ignore
//! use socksferry::config::load_config;
//! use socksferry::relay::{Forwarder, ForwarderMode};
//! use socksferry::socks::Socks5Client;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config("config.toml")?;
//!     let client = Socks5Client::new(config.proxy.addr.clone());
//!
//!     for rule in config.rules.iter().filter(|r| r.enabled) {
//!         let mode = ForwarderMode::Normal { client: client.clone() };
//!         Forwarder::from_rule(rule, mode, &config.relay)?.start().await?;
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! local client -> forwarder listener -> SOCKS5 client handler -> proxy -> target
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod config;
pub mod error;
pub mod registry;
pub mod relay;
pub mod socks;
pub mod subscription;

// Re-export commonly used items
pub use config::{load_config, Config};
pub use error::{FerryError, ReplyCode, Result};
pub use relay::{Forwarder, ForwarderMode};

/// Version of the Socksferry library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Name of the application
pub const NAME: &str = env!("CARGO_PKG_NAME");
