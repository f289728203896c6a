//! SOCKS5 protocol implementation
//!
//! Wire-level pieces shared by both sides of the engine: the address codec,
//! the UDP datagram codec, the outbound client handler, and the minimal
//! inbound server used by auto-proxy mode.

pub mod addr;
pub mod client;
pub mod consts;
pub mod server;
pub mod udp_packet;

pub use addr::Address;
pub use client::{Credentials, Socks5Client};
pub use server::serve_auto_proxy;
pub use udp_packet::UdpPacket;
