//! UDP datagram encapsulation for SOCKS5
//!
//! Handles the header wrapped around every datagram exchanged with a SOCKS5
//! relay:
//!
//! ```text
//! +----+------+------+----------+----------+----------+
//! |RSV | FRAG | ATYP | DST.ADDR | DST.PORT |   DATA   |
//! +----+------+------+----------+----------+----------+
//! | 2  |  1   |  1   | Variable |    2     | Variable |
//! +----+------+------+----------+----------+----------+
//! ```
//!
//! The header is variable-length: stripping it from a response requires
//! decoding the actual ATYP rather than assuming the 10-byte IPv4 layout.

use crate::error::{FerryError, Result};
use crate::socks::addr::Address;
use bytes::{BufMut, Bytes, BytesMut};

/// A SOCKS5-encapsulated UDP datagram.
#[derive(Debug, Clone)]
pub struct UdpPacket {
    /// Fragment number (0 for standalone datagrams)
    pub frag: u8,
    /// Target (outbound) or source (inbound) address
    pub addr: Address,
    /// Payload
    pub data: Bytes,
}

impl UdpPacket {
    /// Create an unfragmented datagram.
    pub fn new(addr: Address, data: Bytes) -> Self {
        UdpPacket { frag: 0, addr, data }
    }

    /// True for fragments of a larger datagram.
    pub fn is_fragmented(&self) -> bool {
        self.frag != 0
    }

    /// Encode the datagram, header first.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = BytesMut::with_capacity(4 + self.addr.encoded_len() + self.data.len());
        buf.put_u16(0); // RSV
        buf.put_u8(self.frag);

        let mut addr_bytes = Vec::with_capacity(self.addr.encoded_len());
        self.addr.encode_to(&mut addr_bytes)?;
        buf.extend_from_slice(&addr_bytes);
        buf.extend_from_slice(&self.data);
        Ok(buf.to_vec())
    }

    /// Parse a datagram, computing the header length from the actual ATYP.
    pub fn parse(raw: &[u8]) -> Result<UdpPacket> {
        if raw.len() < 4 {
            return Err(FerryError::Protocol(format!(
                "UDP datagram too short: {} bytes",
                raw.len()
            )));
        }

        let rsv = u16::from_be_bytes([raw[0], raw[1]]);
        if rsv != 0 {
            return Err(FerryError::Protocol(format!(
                "non-zero RSV field in UDP header: {}",
                rsv
            )));
        }
        let frag = raw[2];

        let (addr, consumed) = Address::decode(&raw[3..])?;
        let data = Bytes::copy_from_slice(&raw[3 + consumed..]);

        Ok(UdpPacket { frag, addr, data })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn test_encode_ipv4_layout() {
        let packet = UdpPacket::new(
            Address::ipv4(Ipv4Addr::new(10, 0, 0, 1), 80),
            Bytes::from_static(b"test"),
        );
        let encoded = packet.encode().unwrap();

        // RSV (2) + FRAG (1) + ATYP (1) + IPv4 (4) + PORT (2) + DATA (4)
        assert_eq!(encoded.len(), 14);
        assert_eq!(&encoded[0..2], &[0, 0]);
        assert_eq!(encoded[2], 0);
        assert_eq!(encoded[3], 0x01);
        assert_eq!(&encoded[4..8], &[10, 0, 0, 1]);
        assert_eq!(&encoded[8..10], &80u16.to_be_bytes());
        assert_eq!(&encoded[10..], b"test");
    }

    #[test]
    fn test_encode_domain_layout() {
        let packet = UdpPacket::new(
            Address::domain("test.com", 443),
            Bytes::from_static(b"hi"),
        );
        let encoded = packet.encode().unwrap();

        assert_eq!(encoded[3], 0x03);
        assert_eq!(encoded[4], 8);
        assert_eq!(&encoded[5..13], b"test.com");
        assert_eq!(&encoded[13..15], &443u16.to_be_bytes());
        assert_eq!(&encoded[15..], b"hi");
    }

    #[test]
    fn test_parse_round_trip_ipv4() {
        let original = UdpPacket::new(
            Address::ipv4(Ipv4Addr::new(192, 168, 1, 100), 9999),
            Bytes::from_static(b"payload"),
        );
        let parsed = UdpPacket::parse(&original.encode().unwrap()).unwrap();
        assert_eq!(parsed.frag, 0);
        assert_eq!(parsed.addr, original.addr);
        assert_eq!(parsed.data, Bytes::from_static(b"payload"));
    }

    #[test]
    fn test_parse_strips_domain_header_by_atyp() {
        // Header length for a domain is 4 + 1 + len + 2, not the fixed
        // 10 bytes an IPv4 header would occupy.
        let original = UdpPacket::new(
            Address::domain("upstream.example.org", 8080),
            Bytes::from_static(b"content"),
        );
        let encoded = original.encode().unwrap();
        assert_ne!(encoded.len() - b"content".len(), 10);

        let parsed = UdpPacket::parse(&encoded).unwrap();
        assert_eq!(parsed.addr, Address::domain("upstream.example.org", 8080));
        assert_eq!(parsed.data, Bytes::from_static(b"content"));
    }

    #[test]
    fn test_parse_strips_ipv6_header_by_atyp() {
        let original = UdpPacket::new(
            Address::ipv6(Ipv6Addr::LOCALHOST, 53),
            Bytes::from_static(b"dns-reply"),
        );
        let parsed = UdpPacket::parse(&original.encode().unwrap()).unwrap();
        assert_eq!(parsed.addr, Address::ipv6(Ipv6Addr::LOCALHOST, 53));
        assert_eq!(parsed.data, Bytes::from_static(b"dns-reply"));
    }

    #[test]
    fn test_parse_too_short() {
        assert!(UdpPacket::parse(&[0, 0, 0]).is_err());
    }

    #[test]
    fn test_parse_nonzero_rsv() {
        let mut encoded = UdpPacket::new(
            Address::ipv4(Ipv4Addr::UNSPECIFIED, 0),
            Bytes::new(),
        )
        .encode()
        .unwrap();
        encoded[1] = 1;
        assert!(matches!(
            UdpPacket::parse(&encoded),
            Err(FerryError::Protocol(_))
        ));
    }

    #[test]
    fn test_parse_truncated_address_is_malformed() {
        // Valid prefix, domain length field promising more than present.
        let raw = [0u8, 0, 0, 0x03, 50, b'a', b'b'];
        assert!(matches!(
            UdpPacket::parse(&raw),
            Err(FerryError::MalformedAddress(_))
        ));
    }

    #[test]
    fn test_is_fragmented() {
        let mut packet = UdpPacket::new(Address::ipv4(Ipv4Addr::LOCALHOST, 1), Bytes::new());
        assert!(!packet.is_fragmented());
        packet.frag = 2;
        assert!(packet.is_fragmented());
    }
}
