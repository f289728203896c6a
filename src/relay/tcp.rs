//! TCP forwarder
//!
//! Binds a local listener for one rule and serves each accepted connection
//! on its own task. In normal mode every connection is tunneled to the
//! rule's fixed remote through the configured proxy; in auto-proxy mode the
//! listener speaks SOCKS5 itself and tunnels through the selected server.

use crate::config::ForwardRule;
use crate::error::{FerryError, Result};
use crate::relay::{relay_streams, ForwarderMode};
use crate::socks::{serve_auto_proxy, Address, Socks5Client};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// TCP listener lifecycle for one forwarding rule.
#[derive(Debug)]
pub struct TcpForwarder {
    rule: ForwardRule,
    mode: ForwarderMode,
    relay_cap: Duration,
    running: AtomicBool,
    shutdown: Mutex<Option<broadcast::Sender<()>>>,
}

impl TcpForwarder {
    /// Build a stopped forwarder.
    pub fn new(rule: ForwardRule, mode: ForwarderMode, relay_cap: Duration) -> Self {
        TcpForwarder {
            rule,
            mode,
            relay_cap,
            running: AtomicBool::new(false),
            shutdown: Mutex::new(None),
        }
    }

    /// The id of the rule this forwarder serves.
    pub fn rule_id(&self) -> &str {
        &self.rule.id
    }

    /// Whether the accept loop is live.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Bind the local address and start accepting.
    ///
    /// Fails with [`FerryError::AlreadyRunning`] when already started, and
    /// leaves the forwarder stopped when the bind itself fails.
    pub async fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(FerryError::AlreadyRunning);
        }

        // The remote target is validated here so a bad rule fails at start
        // instead of on the first connection.
        let remote = self.rule.remote_address().map_err(|e| {
            self.running.store(false, Ordering::SeqCst);
            e
        })?;

        let listener = match TcpListener::bind(&self.rule.local_addr).await {
            Ok(listener) => listener,
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(e.into());
            }
        };

        let (tx, rx) = broadcast::channel(1);
        *self.shutdown.lock().unwrap() = Some(tx);

        info!(
            "rule {}: tcp forwarder listening on {}",
            self.rule.id, self.rule.local_addr
        );

        let rule_id = self.rule.id.clone();
        let mode = self.mode.clone();
        let relay_cap = self.relay_cap;
        tokio::spawn(accept_loop(listener, rx, rule_id, mode, remote, relay_cap));
        Ok(())
    }

    /// Stop accepting and signal in-flight sessions to wind down.
    pub async fn stop(&self) -> Result<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Err(FerryError::NotRunning);
        }

        if let Some(tx) = self.shutdown.lock().unwrap().take() {
            // All receivers gone means the loop already exited on its own.
            let _ = tx.send(());
        }
        info!("rule {}: tcp forwarder stopped", self.rule.id);
        Ok(())
    }
}

async fn accept_loop(
    listener: TcpListener,
    mut shutdown: broadcast::Receiver<()>,
    rule_id: String,
    mode: ForwarderMode,
    remote: Address,
    relay_cap: Duration,
) {
    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                debug!("rule {}: accept loop shutting down", rule_id);
                break;
            }
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        // Transient accept errors (EMFILE and friends) must
                        // not kill the listener.
                        error!("rule {}: accept failed: {}", rule_id, e);
                        continue;
                    }
                };

                debug!("rule {}: accepted connection from {}", rule_id, peer);
                let rule_id = rule_id.clone();
                let mode = mode.clone();
                let remote = remote.clone();
                tokio::spawn(async move {
                    let result = match mode {
                        ForwarderMode::Normal { client } => {
                            serve_normal(stream, &client, &remote, relay_cap).await
                        }
                        ForwarderMode::Auto { registry } => {
                            serve_auto_proxy(stream, registry.as_ref(), relay_cap).await
                        }
                    };
                    if let Err(e) = result {
                        warn!("rule {}: session from {} ended: {}", rule_id, peer, e);
                    }
                });
            }
        }
    }
}

/// Normal mode: tunnel the accepted stream to the rule's fixed remote.
async fn serve_normal(
    stream: TcpStream,
    client: &Socks5Client,
    remote: &Address,
    relay_cap: Duration,
) -> Result<()> {
    let upstream = client.connect(remote).await?;
    relay_streams(stream, upstream, relay_cap).await
}
