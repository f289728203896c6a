//! Socksferry - SOCKS5 Port Forwarding Engine
//!
//! This is the main entry point for the Socksferry application.

use anyhow::{Context, Result};
use clap::Parser;
use socksferry::config::{load_config, ForwardRule};
use socksferry::relay::{Forwarder, ForwarderMode};
use socksferry::socks::Socks5Client;
use std::path::PathBuf;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

/// Socksferry - forward local TCP/UDP ports through SOCKS5 proxies
#[derive(Parser, Debug)]
#[command(name = "socksferry")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Enable JSON logging format
    #[arg(long)]
    json_log: bool,

    /// Override the proxy address from the configuration
    #[arg(long)]
    proxy: Option<String>,

    /// Override the proxy username
    #[arg(long)]
    username: Option<String>,

    /// Override the proxy password
    #[arg(long)]
    password: Option<String>,

    /// Forward a single ad-hoc rule: local listen address (requires --remote)
    #[arg(long, requires = "remote")]
    local: Option<String>,

    /// Remote target for the ad-hoc rule
    #[arg(long, requires = "local")]
    remote: Option<String>,

    /// Protocol of the ad-hoc rule (tcp or udp)
    #[arg(long, default_value = "tcp")]
    proto: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Setup logging
    setup_logging(&args.log_level, args.json_log)?;

    // Load configuration
    let mut config = load_config(&args.config)?;
    if let Some(proxy) = args.proxy {
        config.proxy.addr = proxy;
    }
    if args.username.is_some() {
        config.proxy.username = args.username;
    }
    if args.password.is_some() {
        config.proxy.password = args.password;
    }
    if let (Some(local), Some(remote)) = (args.local, args.remote) {
        // An ad-hoc rule from the command line replaces the configured set.
        config.rules = vec![ForwardRule {
            id: "cli".to_string(),
            protocol: args.proto.parse()?,
            local_addr: local,
            remote_addr: remote,
            enabled: true,
        }];
    }

    info!("Socksferry v{}", socksferry::VERSION);
    info!("Configuration loaded from: {:?}", args.config);
    info!("Upstream proxy: {}", config.proxy.addr);

    let client = Socks5Client::new(config.proxy.addr.clone()).with_credentials(
        config.proxy.username.as_deref().unwrap_or_default(),
        config.proxy.password.as_deref().unwrap_or_default(),
    );

    let mut forwarders = Vec::new();
    for rule in config.rules.iter().filter(|r| r.enabled) {
        let mode = ForwarderMode::Normal {
            client: client.clone(),
        };
        let forwarder = Forwarder::from_rule(rule, mode, &config.relay)
            .with_context(|| format!("rule {} is not startable", rule.id))?;
        forwarder
            .start()
            .await
            .with_context(|| format!("rule {} failed to start", rule.id))?;
        info!("rule {}: {} forwarder started on {}", rule.id, rule.protocol, rule.local_addr);
        forwarders.push(forwarder);
    }

    if forwarders.is_empty() {
        warn!("no enabled rules; nothing to forward");
        return Ok(());
    }

    wait_for_shutdown().await;

    for forwarder in &forwarders {
        if let Err(e) = forwarder.stop().await {
            warn!("rule {}: stop failed: {}", forwarder.rule_id(), e);
        }
    }
    info!("all forwarders stopped");
    Ok(())
}

/// Block until Ctrl+C or SIGTERM (cross-platform).
async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                warn!("Failed to setup SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
                info!("Received Ctrl+C, shutting down...");
                return;
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        // On Windows, only handle Ctrl+C
        let _ = tokio::signal::ctrl_c().await;
        info!("Received Ctrl+C, shutting down...");
    }
}

/// Setup logging based on configuration
fn setup_logging(level: &str, json: bool) -> Result<()> {
    let level = match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" | "warning" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    if json {
        let subscriber = FmtSubscriber::builder()
            .with_max_level(level)
            .json()
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let subscriber = FmtSubscriber::builder()
            .with_max_level(level)
            .with_target(true)
            .with_thread_ids(false)
            .with_thread_names(false)
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    }

    Ok(())
}
