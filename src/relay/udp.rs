//! UDP forwarder
//!
//! One UDP ASSOCIATE per rule, established at start and shared by every
//! local client. A single reader owns the local socket and demultiplexes by
//! source address: datagrams from the proxy relay are responses, everything
//! else is a client. Responses are matched to clients in arrival order
//! through a deadline-bounded queue.
//!
//! ```text
//!  client A ──┐                         ┌── proxy relay ── remote
//!  client B ──┼── local socket ── demux ┘
//!  client C ──┘        (one reader, one pending queue)
//! ```

use crate::config::ForwardRule;
use crate::error::{FerryError, Result};
use crate::socks::consts::MAX_UDP_PACKET;
use crate::socks::{Address, Socks5Client, UdpPacket};
use bytes::Bytes;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// UDP association lifecycle for one forwarding rule.
#[derive(Debug)]
pub struct UdpForwarder {
    rule: ForwardRule,
    client: Socks5Client,
    response_timeout: Duration,
    // Shared with the control watcher, which tears the session down when
    // the proxy drops the association.
    running: Arc<AtomicBool>,
    local: Arc<Mutex<Option<SocketAddr>>>,
    shutdown: Mutex<Option<broadcast::Sender<()>>>,
}

impl UdpForwarder {
    /// Build a stopped forwarder.
    pub fn new(rule: ForwardRule, client: Socks5Client, response_timeout: Duration) -> Self {
        UdpForwarder {
            rule,
            client,
            response_timeout,
            running: Arc::new(AtomicBool::new(false)),
            local: Arc::new(Mutex::new(None)),
            shutdown: Mutex::new(None),
        }
    }

    /// The id of the rule this forwarder serves.
    pub fn rule_id(&self) -> &str {
        &self.rule.id
    }

    /// Whether the forwarder is serving.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// The bound local address, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local.lock().unwrap()
    }

    /// Bind the local socket, establish the association, and start serving.
    pub async fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(FerryError::AlreadyRunning);
        }

        match self.start_inner().await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    async fn start_inner(&self) -> Result<()> {
        let remote = self.rule.remote_address()?;
        let socket = UdpSocket::bind(&self.rule.local_addr).await?;
        let local = socket.local_addr()?;

        let (control, relay_addr) = self.client.udp_associate().await?;
        let relay = self.resolve_relay(relay_addr).await?;

        let (tx, rx) = broadcast::channel(1);
        let control_rx = tx.subscribe();
        let control_tx = tx.clone();
        *self.shutdown.lock().unwrap() = Some(tx);
        *self.local.lock().unwrap() = Some(local);

        info!(
            "rule {}: udp forwarder on {}, relay at {}",
            self.rule.id, local, relay
        );

        tokio::spawn(watch_control(
            control,
            control_rx,
            control_tx,
            Arc::clone(&self.running),
            Arc::clone(&self.local),
            self.rule.id.clone(),
        ));
        tokio::spawn(demux_loop(
            socket,
            relay,
            remote,
            self.response_timeout,
            rx,
            self.rule.id.clone(),
        ));
        Ok(())
    }

    /// Resolve the relay endpoint the proxy returned.
    ///
    /// Proxies commonly reply with an unspecified bound IP; the relay then
    /// lives on the proxy host itself, only the port is meaningful.
    async fn resolve_relay(&self, relay_addr: Address) -> Result<SocketAddr> {
        let mut relay = relay_addr.resolve().await?;
        if relay.ip().is_unspecified() {
            let proxy = tokio::net::lookup_host(self.client.proxy_addr())
                .await?
                .next()
                .ok_or_else(|| {
                    FerryError::UpstreamUnreachable(format!(
                        "{}: no addresses resolved",
                        self.client.proxy_addr()
                    ))
                })?;
            relay.set_ip(proxy.ip());
        }
        Ok(relay)
    }

    /// Stop serving and tear down the association.
    ///
    /// Dropping the control connection ends the association on the proxy
    /// side as well.
    pub async fn stop(&self) -> Result<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Err(FerryError::NotRunning);
        }

        *self.local.lock().unwrap() = None;
        if let Some(tx) = self.shutdown.lock().unwrap().take() {
            let _ = tx.send(());
        }
        info!("rule {}: udp forwarder stopped", self.rule.id);
        Ok(())
    }
}

/// Hold the association's control connection open.
///
/// The association dies with the control connection: when the proxy drops
/// it, the whole session is torn down so the demux loop stops forwarding
/// datagrams to a dead relay.
async fn watch_control(
    mut control: TcpStream,
    mut shutdown: broadcast::Receiver<()>,
    shutdown_tx: broadcast::Sender<()>,
    running: Arc<AtomicBool>,
    local: Arc<Mutex<Option<SocketAddr>>>,
    rule_id: String,
) {
    let mut buf = [0u8; 64];
    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            read = control.read(&mut buf) => {
                match read {
                    Ok(0) => warn!("rule {}: udp association closed by proxy", rule_id),
                    Ok(_) => continue,
                    Err(e) => {
                        warn!("rule {}: udp association control error: {}", rule_id, e)
                    }
                }
                running.store(false, Ordering::SeqCst);
                *local.lock().unwrap() = None;
                let _ = shutdown_tx.send(());
                break;
            }
        }
    }
}

/// The single reader that owns the local socket.
async fn demux_loop(
    socket: UdpSocket,
    relay: SocketAddr,
    remote: Address,
    response_timeout: Duration,
    mut shutdown: broadcast::Receiver<()>,
    rule_id: String,
) {
    // Clients awaiting a response, oldest first. Expired entries are dropped
    // silently; UDP applications already tolerate loss.
    let mut pending: VecDeque<(SocketAddr, Instant)> = VecDeque::new();
    let mut buf = vec![0u8; MAX_UDP_PACKET];

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                debug!("rule {}: demux loop shutting down", rule_id);
                break;
            }
            received = socket.recv_from(&mut buf) => {
                let (len, src) = match received {
                    Ok(pair) => pair,
                    Err(e) => {
                        error!("rule {}: udp recv failed: {}", rule_id, e);
                        continue;
                    }
                };

                let now = Instant::now();
                while pending.front().is_some_and(|(_, deadline)| *deadline <= now) {
                    pending.pop_front();
                }

                if src == relay {
                    handle_response(&socket, &mut pending, &buf[..len], &rule_id).await;
                } else {
                    handle_client(
                        &socket,
                        &mut pending,
                        &buf[..len],
                        src,
                        relay,
                        &remote,
                        now + response_timeout,
                        &rule_id,
                    )
                    .await;
                }
            }
        }
    }
}

/// A datagram from the relay: strip the header, deliver to the oldest
/// pending client.
async fn handle_response(
    socket: &UdpSocket,
    pending: &mut VecDeque<(SocketAddr, Instant)>,
    datagram: &[u8],
    rule_id: &str,
) {
    let packet = match UdpPacket::parse(datagram) {
        Ok(packet) => packet,
        Err(e) => {
            warn!("rule {}: malformed relay datagram: {}", rule_id, e);
            return;
        }
    };
    if packet.is_fragmented() {
        debug!("rule {}: fragmented relay datagram dropped", rule_id);
        return;
    }

    match pending.pop_front() {
        Some((client, _)) => {
            if let Err(e) = socket.send_to(&packet.data, client).await {
                warn!("rule {}: response delivery to {} failed: {}", rule_id, client, e);
            }
        }
        None => debug!("rule {}: relay response with no pending client", rule_id),
    }
}

/// A datagram from a local client: wrap it for the rule's remote and queue
/// the client for the next response.
#[allow(clippy::too_many_arguments)]
async fn handle_client(
    socket: &UdpSocket,
    pending: &mut VecDeque<(SocketAddr, Instant)>,
    payload: &[u8],
    src: SocketAddr,
    relay: SocketAddr,
    remote: &Address,
    deadline: Instant,
    rule_id: &str,
) {
    let packet = UdpPacket::new(remote.clone(), Bytes::copy_from_slice(payload));
    let encoded = match packet.encode() {
        Ok(encoded) => encoded,
        Err(e) => {
            warn!("rule {}: datagram from {} not encodable: {}", rule_id, src, e);
            return;
        }
    };

    if let Err(e) = socket.send_to(&encoded, relay).await {
        warn!("rule {}: forward to relay failed: {}", rule_id, e);
        return;
    }
    pending.push_back((src, deadline));
}
