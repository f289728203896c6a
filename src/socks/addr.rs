//! SOCKS5 address codec
//!
//! Encodes and decodes the address representation shared by CONNECT requests,
//! UDP ASSOCIATE replies, and UDP datagram headers:
//!
//! ```text
//! +------+----------+----------+
//! | ATYP | DST.ADDR | DST.PORT |
//! +------+----------+----------+
//! |  1   | Variable |    2     |
//! +------+----------+----------+
//! ```
//!
//! ATYP 0x01 is a 4-byte IPv4 address, 0x03 a length-prefixed domain name
//! (no terminator, length <= 255), 0x04 a 16-byte IPv6 address. The port is
//! big-endian. Decoding validates the buffer against the declared length
//! before indexing and fails with [`FerryError::MalformedAddress`] on
//! truncation, never over-reading.

use crate::error::{FerryError, Result};
use crate::socks::consts::*;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Address field of a SOCKS5 request, reply, or UDP datagram header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    /// IP address with port
    Ip(SocketAddr),
    /// Domain name with port
    Domain(String, u16),
}

impl Address {
    /// Create an address from an IPv4 address and port
    pub fn ipv4(ip: Ipv4Addr, port: u16) -> Self {
        Address::Ip(SocketAddr::new(IpAddr::V4(ip), port))
    }

    /// Create an address from an IPv6 address and port
    pub fn ipv6(ip: Ipv6Addr, port: u16) -> Self {
        Address::Ip(SocketAddr::new(IpAddr::V6(ip), port))
    }

    /// Create an address from a domain name and port
    pub fn domain(domain: impl Into<String>, port: u16) -> Self {
        Address::Domain(domain.into(), port)
    }

    /// The wildcard address 0.0.0.0:0, used for UDP ASSOCIATE requests.
    pub fn unspecified() -> Self {
        Address::Ip(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0))
    }

    /// Get the port number
    pub fn port(&self) -> u16 {
        match self {
            Address::Ip(addr) => addr.port(),
            Address::Domain(_, port) => *port,
        }
    }

    /// Get the ATYP byte for this address
    pub fn addr_type(&self) -> u8 {
        match self {
            Address::Ip(SocketAddr::V4(_)) => SOCKS5_ADDR_TYPE_IPV4,
            Address::Ip(SocketAddr::V6(_)) => SOCKS5_ADDR_TYPE_IPV6,
            Address::Domain(_, _) => SOCKS5_ADDR_TYPE_DOMAIN,
        }
    }

    /// Length in bytes of the encoded form (ATYP + address + port).
    pub fn encoded_len(&self) -> usize {
        match self {
            Address::Ip(SocketAddr::V4(_)) => 1 + 4 + 2,
            Address::Ip(SocketAddr::V6(_)) => 1 + 16 + 2,
            Address::Domain(domain, _) => 1 + 1 + domain.len() + 2,
        }
    }

    /// Append the encoded address to `buf`.
    ///
    /// Fails with [`FerryError::MalformedAddress`] when a domain name does
    /// not fit the 1-byte length field.
    pub fn encode_to(&self, buf: &mut Vec<u8>) -> Result<()> {
        match self {
            Address::Ip(SocketAddr::V4(addr)) => {
                buf.push(SOCKS5_ADDR_TYPE_IPV4);
                buf.extend_from_slice(&addr.ip().octets());
                buf.extend_from_slice(&addr.port().to_be_bytes());
            }
            Address::Ip(SocketAddr::V6(addr)) => {
                buf.push(SOCKS5_ADDR_TYPE_IPV6);
                buf.extend_from_slice(&addr.ip().octets());
                buf.extend_from_slice(&addr.port().to_be_bytes());
            }
            Address::Domain(domain, port) => {
                if domain.len() > MAX_DOMAIN_LEN {
                    return Err(FerryError::MalformedAddress(format!(
                        "domain name too long: {} bytes",
                        domain.len()
                    )));
                }
                if domain.is_empty() {
                    return Err(FerryError::MalformedAddress(
                        "empty domain name".to_string(),
                    ));
                }
                buf.push(SOCKS5_ADDR_TYPE_DOMAIN);
                buf.push(domain.len() as u8);
                buf.extend_from_slice(domain.as_bytes());
                buf.extend_from_slice(&port.to_be_bytes());
            }
        }
        Ok(())
    }

    /// Encode the address into a new byte vector.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        self.encode_to(&mut buf)?;
        Ok(buf)
    }

    /// Decode an address from the front of `buf`.
    ///
    /// Returns the address and the number of bytes consumed, which callers
    /// use to strip variable-length headers (the UDP datagram header in
    /// particular).
    pub fn decode(buf: &[u8]) -> Result<(Address, usize)> {
        if buf.is_empty() {
            return Err(FerryError::MalformedAddress(
                "empty address buffer".to_string(),
            ));
        }

        match buf[0] {
            SOCKS5_ADDR_TYPE_IPV4 => {
                if buf.len() < 1 + 4 + 2 {
                    return Err(FerryError::MalformedAddress(format!(
                        "IPv4 address needs 7 bytes, got {}",
                        buf.len()
                    )));
                }
                let ip = Ipv4Addr::new(buf[1], buf[2], buf[3], buf[4]);
                let port = u16::from_be_bytes([buf[5], buf[6]]);
                Ok((Address::ipv4(ip, port), 7))
            }
            SOCKS5_ADDR_TYPE_DOMAIN => {
                if buf.len() < 2 {
                    return Err(FerryError::MalformedAddress(
                        "missing domain length".to_string(),
                    ));
                }
                let len = buf[1] as usize;
                if len == 0 {
                    return Err(FerryError::MalformedAddress(
                        "empty domain name".to_string(),
                    ));
                }
                let need = 2 + len + 2;
                if buf.len() < need {
                    return Err(FerryError::MalformedAddress(format!(
                        "domain address needs {} bytes, got {}",
                        need,
                        buf.len()
                    )));
                }
                let domain = std::str::from_utf8(&buf[2..2 + len])
                    .map_err(|_| {
                        FerryError::MalformedAddress("domain is not valid UTF-8".to_string())
                    })?
                    .to_string();
                let port = u16::from_be_bytes([buf[2 + len], buf[2 + len + 1]]);
                Ok((Address::Domain(domain, port), need))
            }
            SOCKS5_ADDR_TYPE_IPV6 => {
                if buf.len() < 1 + 16 + 2 {
                    return Err(FerryError::MalformedAddress(format!(
                        "IPv6 address needs 19 bytes, got {}",
                        buf.len()
                    )));
                }
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&buf[1..17]);
                let port = u16::from_be_bytes([buf[17], buf[18]]);
                Ok((Address::ipv6(Ipv6Addr::from(octets), port), 19))
            }
            other => Err(FerryError::MalformedAddress(format!(
                "unknown address type: 0x{:02x}",
                other
            ))),
        }
    }

    /// Read an address (ATYP + body + port) from an async stream.
    pub async fn read_from<S>(stream: &mut S) -> Result<Address>
    where
        S: AsyncRead + Unpin,
    {
        let atyp = stream.read_u8().await?;
        match atyp {
            SOCKS5_ADDR_TYPE_IPV4 => {
                let mut octets = [0u8; 4];
                stream.read_exact(&mut octets).await?;
                let port = stream.read_u16().await?;
                Ok(Address::ipv4(Ipv4Addr::from(octets), port))
            }
            SOCKS5_ADDR_TYPE_DOMAIN => {
                let len = stream.read_u8().await? as usize;
                if len == 0 {
                    return Err(FerryError::MalformedAddress(
                        "empty domain name".to_string(),
                    ));
                }
                let mut raw = vec![0u8; len];
                stream.read_exact(&mut raw).await?;
                let domain = String::from_utf8(raw).map_err(|_| {
                    FerryError::MalformedAddress("domain is not valid UTF-8".to_string())
                })?;
                let port = stream.read_u16().await?;
                Ok(Address::Domain(domain, port))
            }
            SOCKS5_ADDR_TYPE_IPV6 => {
                let mut octets = [0u8; 16];
                stream.read_exact(&mut octets).await?;
                let port = stream.read_u16().await?;
                Ok(Address::ipv6(Ipv6Addr::from(octets), port))
            }
            other => Err(FerryError::MalformedAddress(format!(
                "unknown address type: 0x{:02x}",
                other
            ))),
        }
    }

    /// Resolve the address to a socket address.
    ///
    /// IP addresses return immediately; domains go through DNS.
    pub async fn resolve(&self) -> Result<SocketAddr> {
        match self {
            Address::Ip(addr) => Ok(*addr),
            Address::Domain(domain, port) => {
                let query = format!("{}:{}", domain, port);
                tokio::net::lookup_host(query)
                    .await?
                    .next()
                    .ok_or_else(|| {
                        FerryError::UpstreamUnreachable(format!(
                            "no addresses found for {}",
                            domain
                        ))
                    })
            }
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Ip(addr) => write!(f, "{}", addr),
            Address::Domain(domain, port) => write!(f, "{}:{}", domain, port),
        }
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        Address::Ip(addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_ipv4() {
        let addr = Address::ipv4(Ipv4Addr::new(192, 168, 1, 1), 8080);
        let bytes = addr.to_bytes().unwrap();
        let (decoded, consumed) = Address::decode(&bytes).unwrap();
        assert_eq!(decoded, addr);
        assert_eq!(consumed, bytes.len());
        assert_eq!(consumed, 7);
    }

    #[test]
    fn test_round_trip_domain() {
        let addr = Address::domain("example.com", 443);
        let bytes = addr.to_bytes().unwrap();
        let (decoded, consumed) = Address::decode(&bytes).unwrap();
        assert_eq!(decoded, addr);
        assert_eq!(consumed, bytes.len());
    }

    #[test]
    fn test_round_trip_domain_max_length() {
        let addr = Address::domain("a".repeat(255), 53);
        let bytes = addr.to_bytes().unwrap();
        let (decoded, consumed) = Address::decode(&bytes).unwrap();
        assert_eq!(decoded, addr);
        assert_eq!(consumed, 2 + 255 + 2);
    }

    #[test]
    fn test_round_trip_ipv6() {
        let addr = Address::ipv6(Ipv6Addr::new(0x20, 1, 0xdb8, 0, 0, 0, 0, 1), 9999);
        let bytes = addr.to_bytes().unwrap();
        let (decoded, consumed) = Address::decode(&bytes).unwrap();
        assert_eq!(decoded, addr);
        assert_eq!(consumed, 19);
    }

    #[test]
    fn test_encode_domain_too_long_fails() {
        let addr = Address::domain("x".repeat(256), 80);
        let result = addr.to_bytes();
        assert!(matches!(result, Err(FerryError::MalformedAddress(_))));
    }

    #[test]
    fn test_encode_empty_domain_fails() {
        let addr = Address::domain("", 80);
        assert!(matches!(
            addr.to_bytes(),
            Err(FerryError::MalformedAddress(_))
        ));
    }

    #[test]
    fn test_decode_truncated_never_over_reads() {
        // Every prefix of a valid encoding must fail cleanly.
        let addrs = [
            Address::ipv4(Ipv4Addr::new(10, 0, 0, 1), 80),
            Address::domain("test.example.org", 443),
            Address::ipv6(Ipv6Addr::LOCALHOST, 53),
        ];

        for addr in addrs {
            let bytes = addr.to_bytes().unwrap();
            for cut in 0..bytes.len() {
                let result = Address::decode(&bytes[..cut]);
                assert!(
                    matches!(result, Err(FerryError::MalformedAddress(_))),
                    "prefix of {} bytes must fail for {}",
                    cut,
                    addr
                );
            }
        }
    }

    #[test]
    fn test_decode_domain_truncated_by_declared_length() {
        // Declared length 10 but only 3 domain bytes present.
        let buf = [SOCKS5_ADDR_TYPE_DOMAIN, 10, b'a', b'b', b'c'];
        assert!(matches!(
            Address::decode(&buf),
            Err(FerryError::MalformedAddress(_))
        ));
    }

    #[test]
    fn test_decode_unknown_atyp() {
        let buf = [0x09, 0, 0, 0, 0, 0, 0];
        assert!(matches!(
            Address::decode(&buf),
            Err(FerryError::MalformedAddress(_))
        ));
    }

    #[test]
    fn test_decode_trailing_bytes_ignored() {
        let mut bytes = Address::ipv4(Ipv4Addr::new(1, 2, 3, 4), 5).to_bytes().unwrap();
        bytes.extend_from_slice(b"payload");
        let (decoded, consumed) = Address::decode(&bytes).unwrap();
        assert_eq!(decoded, Address::ipv4(Ipv4Addr::new(1, 2, 3, 4), 5));
        assert_eq!(&bytes[consumed..], b"payload");
    }

    #[tokio::test]
    async fn test_read_from_stream() {
        let addr = Address::domain("proxy.local", 1080);
        let bytes = addr.to_bytes().unwrap();
        let mut cursor = std::io::Cursor::new(bytes);
        let decoded = Address::read_from(&mut cursor).await.unwrap();
        assert_eq!(decoded, addr);
    }

    #[tokio::test]
    async fn test_read_from_stream_unknown_atyp() {
        let mut cursor = std::io::Cursor::new(vec![0x07u8, 0, 0]);
        let result = Address::read_from(&mut cursor).await;
        assert!(matches!(result, Err(FerryError::MalformedAddress(_))));
    }

    #[tokio::test]
    async fn test_resolve_ip_is_identity() {
        let addr = Address::ipv4(Ipv4Addr::new(127, 0, 0, 1), 8080);
        let resolved = addr.resolve().await.unwrap();
        assert_eq!(resolved, "127.0.0.1:8080".parse().unwrap());
    }

    #[tokio::test]
    async fn test_resolve_domain_keeps_port() {
        let addr = Address::domain("localhost", 8080);
        let resolved = addr.resolve().await.unwrap();
        assert_eq!(resolved.port(), 8080);
        assert!(resolved.ip().is_loopback());
    }

    #[test]
    fn test_display() {
        assert_eq!(
            format!("{}", Address::ipv4(Ipv4Addr::new(127, 0, 0, 1), 8080)),
            "127.0.0.1:8080"
        );
        assert_eq!(
            format!("{}", Address::domain("test.com", 443)),
            "test.com:443"
        );
    }

    #[test]
    fn test_unspecified() {
        let addr = Address::unspecified();
        assert_eq!(addr.port(), 0);
        assert_eq!(addr.addr_type(), SOCKS5_ADDR_TYPE_IPV4);
    }

    #[test]
    fn test_encoded_len_matches() {
        for addr in [
            Address::ipv4(Ipv4Addr::new(8, 8, 8, 8), 53),
            Address::domain("dns.google", 853),
            Address::ipv6(Ipv6Addr::UNSPECIFIED, 0),
        ] {
            assert_eq!(addr.to_bytes().unwrap().len(), addr.encoded_len());
        }
    }
}
