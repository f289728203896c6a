//! Minimal inbound SOCKS5 server for auto-proxy mode
//!
//! Accepts a SOCKS5 CONNECT from a local client, resolves the currently
//! selected upstream server from the registry, tunnels through it via the
//! client handler, and relays. Only the no-auth method and the CONNECT
//! command are served; everything else is answered with the appropriate
//! failure reply.

use crate::error::{FerryError, ReplyCode, Result};
use crate::relay::relay_streams;
use crate::registry::{ServerProtocol, ServerRegistry};
use crate::socks::addr::Address;
use crate::socks::client::Socks5Client;
use crate::socks::consts::*;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

/// Write a SOCKS5 reply with the given code and bound address.
///
/// The bound address defaults to 0.0.0.0:0; the true bound address of the
/// upstream tunnel is not tracked.
pub async fn write_reply<S>(stream: &mut S, code: ReplyCode, bound: Option<Address>) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let bound = bound.unwrap_or_else(Address::unspecified);
    let mut reply = Vec::with_capacity(3 + bound.encoded_len());
    reply.push(SOCKS5_VERSION);
    reply.push(code.into());
    reply.push(SOCKS5_RESERVED);
    bound.encode_to(&mut reply)?;
    stream.write_all(&reply).await?;
    stream.flush().await?;
    Ok(())
}

/// Read the client's method offer and answer "no authentication required".
async fn negotiate_no_auth<S>(stream: &mut S) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).await?;
    if header[0] != SOCKS5_VERSION {
        return Err(FerryError::Protocol(format!(
            "unsupported SOCKS version: {}",
            header[0]
        )));
    }
    let mut methods = vec![0u8; header[1] as usize];
    stream.read_exact(&mut methods).await?;

    stream
        .write_all(&[SOCKS5_VERSION, SOCKS5_AUTH_METHOD_NONE])
        .await?;
    stream.flush().await?;
    Ok(())
}

/// Read and validate the client's request, returning the CONNECT target.
async fn read_connect_request<S>(stream: &mut S) -> Result<Address>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut header = [0u8; 3];
    stream.read_exact(&mut header).await?;
    if header[0] != SOCKS5_VERSION {
        return Err(FerryError::Protocol(format!(
            "unsupported SOCKS version in request: {}",
            header[0]
        )));
    }
    if header[1] != SOCKS5_CMD_TCP_CONNECT {
        write_reply(stream, ReplyCode::CommandNotSupported, None).await?;
        return Err(FerryError::Protocol(format!(
            "unsupported command: 0x{:02x}",
            header[1]
        )));
    }

    Address::read_from(stream).await
}

/// Serve one inbound auto-proxy connection end to end.
///
/// The selected server is resolved from the registry per request: changing
/// the selection affects subsequent connections only, never this one.
pub async fn serve_auto_proxy<S>(
    mut stream: S,
    registry: &dyn ServerRegistry,
    relay_cap: Duration,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    negotiate_no_auth(&mut stream).await?;
    let target = read_connect_request(&mut stream).await?;

    debug!("auto-proxy CONNECT request for {}", target);

    let server = match registry.get_selected() {
        Some(server) => server,
        None => {
            warn!("auto-proxy request for {} with no server selected", target);
            write_reply(&mut stream, ReplyCode::HostUnreachable, None).await?;
            return Err(FerryError::NoServerSelected);
        }
    };

    if server.protocol != ServerProtocol::Socks5 {
        warn!(
            "selected server {} speaks {}, which is not dialable",
            server.name, server.protocol
        );
        write_reply(&mut stream, ReplyCode::ConnectionRefused, None).await?;
        return Err(FerryError::UpstreamUnreachable(format!(
            "selected server {} is not a SOCKS5 server",
            server.name
        )));
    }

    let client = Socks5Client::new(server.endpoint())
        .with_credentials(&server.username, &server.password);

    let upstream = match client.connect(&target).await {
        Ok(upstream) => upstream,
        Err(e) => {
            warn!(
                "dial to {} via selected server {} failed: {}",
                target, server.name, e
            );
            write_reply(&mut stream, ReplyCode::ConnectionRefused, None).await?;
            return Err(e);
        }
    };

    write_reply(&mut stream, ReplyCode::Succeeded, None).await?;
    info!(
        "auto-proxy tunnel to {} via server {}",
        target, server.name
    );

    relay_streams(stream, upstream, relay_cap).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{MemoryRegistry, UpstreamServer};
    use std::net::Ipv4Addr;
    use tokio::io::duplex;
    use tokio::net::TcpListener;

    fn connect_request(target: &Address) -> Vec<u8> {
        let mut bytes = vec![SOCKS5_VERSION, 1, SOCKS5_AUTH_METHOD_NONE];
        bytes.extend_from_slice(&[SOCKS5_VERSION, SOCKS5_CMD_TCP_CONNECT, SOCKS5_RESERVED]);
        target.encode_to(&mut bytes).unwrap();
        bytes
    }

    async fn read_negotiation_and_reply<S>(client: &mut S) -> (u8, u8)
    where
        S: AsyncRead + Unpin,
    {
        let mut method = [0u8; 2];
        client.read_exact(&mut method).await.unwrap();
        assert_eq!(method, [SOCKS5_VERSION, SOCKS5_AUTH_METHOD_NONE]);

        let mut reply = [0u8; 10]; // ver + rep + rsv + ATYP=IPv4 + 4 + 2
        client.read_exact(&mut reply).await.unwrap();
        (reply[1], reply[3])
    }

    #[tokio::test]
    async fn test_no_server_selected_replies_failure() {
        let registry = MemoryRegistry::new();
        let (mut client, server_side) = duplex(1024);

        let handle = tokio::spawn(async move {
            serve_auto_proxy(server_side, &registry, Duration::from_secs(5)).await
        });

        client
            .write_all(&connect_request(&Address::domain("example.com", 80)))
            .await
            .unwrap();

        let (code, atyp) = read_negotiation_and_reply(&mut client).await;
        assert_eq!(code, u8::from(ReplyCode::HostUnreachable));
        assert_eq!(atyp, SOCKS5_ADDR_TYPE_IPV4);

        let result = handle.await.unwrap();
        assert!(matches!(result, Err(FerryError::NoServerSelected)));
    }

    #[tokio::test]
    async fn test_dial_failure_replies_failure() {
        let registry = MemoryRegistry::new();
        // Points at a port that is not listening.
        let server = UpstreamServer::socks5("dead", "127.0.0.1", 1, "", "");
        let id = server.id.clone();
        registry.upsert(server);
        registry.select(&id).unwrap();

        let (mut client, server_side) = duplex(1024);
        let handle = tokio::spawn(async move {
            serve_auto_proxy(server_side, &registry, Duration::from_secs(5)).await
        });

        client
            .write_all(&connect_request(&Address::domain("example.com", 80)))
            .await
            .unwrap();

        let (code, _) = read_negotiation_and_reply(&mut client).await;
        assert_eq!(code, u8::from(ReplyCode::ConnectionRefused));

        let result = handle.await.unwrap();
        assert!(matches!(result, Err(FerryError::UpstreamUnreachable(_))));
    }

    #[tokio::test]
    async fn test_bad_version_rejected() {
        let registry = MemoryRegistry::new();
        let (mut client, server_side) = duplex(1024);

        let handle = tokio::spawn(async move {
            serve_auto_proxy(server_side, &registry, Duration::from_secs(5)).await
        });

        client.write_all(&[0x04, 1, 0x00]).await.unwrap();
        let result = handle.await.unwrap();
        assert!(matches!(result, Err(FerryError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_unsupported_command_replied() {
        let registry = MemoryRegistry::new();
        let (mut client, server_side) = duplex(1024);

        let handle = tokio::spawn(async move {
            serve_auto_proxy(server_side, &registry, Duration::from_secs(5)).await
        });

        let mut bytes = vec![SOCKS5_VERSION, 1, SOCKS5_AUTH_METHOD_NONE];
        bytes.extend_from_slice(&[SOCKS5_VERSION, SOCKS5_CMD_TCP_BIND, SOCKS5_RESERVED]);
        Address::ipv4(Ipv4Addr::LOCALHOST, 80)
            .encode_to(&mut bytes)
            .unwrap();
        client.write_all(&bytes).await.unwrap();

        let (code, _) = read_negotiation_and_reply(&mut client).await;
        assert_eq!(code, u8::from(ReplyCode::CommandNotSupported));

        let result = handle.await.unwrap();
        assert!(matches!(result, Err(FerryError::Protocol(_))));
    }

    /// Full path: local client -> auto-proxy -> mock upstream SOCKS5 proxy
    /// -> echo.
    #[tokio::test]
    async fn test_end_to_end_relay_through_selected_server() {
        // Mock upstream proxy that accepts the handshake and echoes.
        let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = upstream.accept().await.unwrap();
            let mut offer = [0u8; 3];
            stream.read_exact(&mut offer).await.unwrap();
            stream
                .write_all(&[SOCKS5_VERSION, SOCKS5_AUTH_METHOD_NONE])
                .await
                .unwrap();
            let mut header = [0u8; 3];
            stream.read_exact(&mut header).await.unwrap();
            let _ = Address::read_from(&mut stream).await.unwrap();
            let mut reply = vec![SOCKS5_VERSION, 0x00, SOCKS5_RESERVED];
            Address::unspecified().encode_to(&mut reply).unwrap();
            stream.write_all(&reply).await.unwrap();

            let mut buf = [0u8; 1024];
            loop {
                match stream.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if stream.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        let registry = MemoryRegistry::new();
        let server = UpstreamServer::socks5(
            "mock",
            upstream_addr.ip().to_string(),
            upstream_addr.port(),
            "",
            "",
        );
        let id = server.id.clone();
        registry.upsert(server);
        registry.select(&id).unwrap();

        let (mut client, server_side) = duplex(4096);
        tokio::spawn(async move {
            let _ = serve_auto_proxy(server_side, &registry, Duration::from_secs(5)).await;
        });

        client
            .write_all(&connect_request(&Address::domain("echo.example", 7)))
            .await
            .unwrap();

        let (code, _) = read_negotiation_and_reply(&mut client).await;
        assert_eq!(code, u8::from(ReplyCode::Succeeded));

        client.write_all(b"round trip").await.unwrap();
        let mut buf = [0u8; 10];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"round trip");
    }

    #[tokio::test]
    async fn test_write_reply_layout() {
        let mut buf = Vec::new();
        write_reply(&mut buf, ReplyCode::HostUnreachable, None)
            .await
            .unwrap();
        assert_eq!(
            buf,
            vec![SOCKS5_VERSION, 0x04, SOCKS5_RESERVED, SOCKS5_ADDR_TYPE_IPV4, 0, 0, 0, 0, 0, 0]
        );
    }
}
