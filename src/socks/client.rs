//! SOCKS5 client handler
//!
//! Establishes tunnels through an upstream SOCKS5 proxy: method negotiation,
//! optional RFC 1929 username/password sub-negotiation, then CONNECT or
//! UDP ASSOCIATE. Any handshake failure or non-success reply fails fast and
//! drops the partial socket; retry policy belongs to the caller.

use crate::error::{FerryError, ReplyCode, Result};
use crate::socks::addr::Address;
use crate::socks::consts::*;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

/// Username/password pair for the RFC 1929 sub-negotiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    /// Username literal, 1-255 bytes on the wire
    pub username: String,
    /// Password literal, 1-255 bytes on the wire
    pub password: String,
}

/// Client for one upstream SOCKS5 proxy.
#[derive(Debug, Clone)]
pub struct Socks5Client {
    proxy_addr: String,
    credentials: Option<Credentials>,
}

impl Socks5Client {
    /// Create a client for an unauthenticated proxy.
    pub fn new(proxy_addr: impl Into<String>) -> Self {
        Socks5Client {
            proxy_addr: proxy_addr.into(),
            credentials: None,
        }
    }

    /// Attach username/password credentials.
    ///
    /// Empty strings mean "no credentials", matching the common convention
    /// of subscription feeds that leave both fields blank.
    pub fn with_credentials(mut self, username: &str, password: &str) -> Self {
        if !username.is_empty() || !password.is_empty() {
            self.credentials = Some(Credentials {
                username: username.to_string(),
                password: password.to_string(),
            });
        }
        self
    }

    /// The proxy address this client dials.
    pub fn proxy_addr(&self) -> &str {
        &self.proxy_addr
    }

    /// Open a tunnel to `target` through the proxy (CMD = CONNECT).
    ///
    /// On success the returned stream carries end-to-end traffic. Each of
    /// the eight non-success reply codes maps to a distinct
    /// [`FerryError::Rejected`] value.
    pub async fn connect(&self, target: &Address) -> Result<TcpStream> {
        let mut stream = self.open().await?;
        // Errors drop `stream` on the way out, closing the partial socket.
        self.handshake(&mut stream).await?;
        self.request(&mut stream, SOCKS5_CMD_TCP_CONNECT, target)
            .await?;
        debug!("SOCKS5 tunnel established to {} via {}", target, self.proxy_addr);
        Ok(stream)
    }

    /// Establish a UDP association (CMD = UDP ASSOCIATE) with a wildcard
    /// target.
    ///
    /// Returns the control connection and the relay address datagrams must
    /// be exchanged with. The control connection must stay open for the
    /// association's lifetime; closing it terminates the association.
    pub async fn udp_associate(&self) -> Result<(TcpStream, Address)> {
        let mut stream = self.open().await?;
        self.handshake(&mut stream).await?;
        let relay_addr = self
            .request(&mut stream, SOCKS5_CMD_UDP_ASSOCIATE, &Address::unspecified())
            .await?;
        debug!(
            "UDP association established via {}, relay at {}",
            self.proxy_addr, relay_addr
        );
        Ok((stream, relay_addr))
    }

    async fn open(&self) -> Result<TcpStream> {
        TcpStream::connect(&self.proxy_addr).await.map_err(|e| {
            FerryError::UpstreamUnreachable(format!("{}: {}", self.proxy_addr, e))
        })
    }

    /// Method negotiation plus the password sub-negotiation when selected.
    async fn handshake<S>(&self, stream: &mut S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let offer: &[u8] = if self.credentials.is_some() {
            &[
                SOCKS5_VERSION,
                2,
                SOCKS5_AUTH_METHOD_NONE,
                SOCKS5_AUTH_METHOD_PASSWORD,
            ]
        } else {
            &[SOCKS5_VERSION, 1, SOCKS5_AUTH_METHOD_NONE]
        };
        stream.write_all(offer).await?;
        stream.flush().await?;

        let mut choice = [0u8; 2];
        stream.read_exact(&mut choice).await?;
        if choice[0] != SOCKS5_VERSION {
            return Err(FerryError::Protocol(format!(
                "unexpected version in method selection: {}",
                choice[0]
            )));
        }

        match choice[1] {
            SOCKS5_AUTH_METHOD_NONE => Ok(()),
            SOCKS5_AUTH_METHOD_PASSWORD => match &self.credentials {
                Some(creds) => self.authenticate(stream, creds).await,
                None => Err(FerryError::Protocol(
                    "proxy requires password auth but no credentials configured".to_string(),
                )),
            },
            SOCKS5_AUTH_METHOD_NOT_ACCEPTABLE => Err(FerryError::Protocol(
                "proxy accepted none of the offered auth methods".to_string(),
            )),
            other => Err(FerryError::Protocol(format!(
                "proxy selected unsupported auth method: 0x{:02x}",
                other
            ))),
        }
    }

    /// RFC 1929 sub-negotiation: version 1, length-prefixed literals.
    async fn authenticate<S>(&self, stream: &mut S, creds: &Credentials) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        if creds.username.len() > 255 || creds.password.len() > 255 {
            return Err(FerryError::Protocol(
                "username or password exceeds 255 bytes".to_string(),
            ));
        }

        let mut frame =
            Vec::with_capacity(3 + creds.username.len() + creds.password.len());
        frame.push(SOCKS5_AUTH_VERSION);
        frame.push(creds.username.len() as u8);
        frame.extend_from_slice(creds.username.as_bytes());
        frame.push(creds.password.len() as u8);
        frame.extend_from_slice(creds.password.as_bytes());
        stream.write_all(&frame).await?;
        stream.flush().await?;

        let mut status = [0u8; 2];
        stream.read_exact(&mut status).await?;
        if status[0] != SOCKS5_AUTH_VERSION {
            return Err(FerryError::Protocol(format!(
                "unexpected auth sub-negotiation version: {}",
                status[0]
            )));
        }
        if status[1] != SOCKS5_AUTH_SUCCESS {
            return Err(FerryError::Protocol(format!(
                "proxy rejected credentials (status 0x{:02x})",
                status[1]
            )));
        }
        Ok(())
    }

    /// Send a request and read the reply, returning the bound address.
    async fn request<S>(&self, stream: &mut S, cmd: u8, target: &Address) -> Result<Address>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut frame = Vec::with_capacity(3 + target.encoded_len());
        frame.push(SOCKS5_VERSION);
        frame.push(cmd);
        frame.push(SOCKS5_RESERVED);
        target.encode_to(&mut frame)?;
        stream.write_all(&frame).await?;
        stream.flush().await?;

        let mut header = [0u8; 3];
        stream.read_exact(&mut header).await?;
        if header[0] != SOCKS5_VERSION {
            return Err(FerryError::Protocol(format!(
                "unexpected version in reply: {}",
                header[0]
            )));
        }

        // Bound address is read even on failure so the stream stays framed.
        let code = ReplyCode::try_from(header[1])?;
        let bound = Address::read_from(stream).await?;

        if !code.is_success() {
            return Err(FerryError::Rejected(code));
        }
        Ok(bound)
    }
}
