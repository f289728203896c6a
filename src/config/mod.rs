//! Configuration module for Socksferry
//!
//! This module provides configuration types and parsing for the forwarder.

mod rules;

pub use rules::{parse_host_port, ForwardRule, Protocol, ProxyConfig, RelayConfig};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Fixed upstream proxy for normal-mode rules
    #[serde(default)]
    pub proxy: ProxyConfig,
    /// Forwarding rules
    #[serde(default)]
    pub rules: Vec<ForwardRule>,
    /// Relay deadlines
    #[serde(default)]
    pub relay: RelayConfig,
}

impl Config {
    /// Check cross-field invariants the serde layer cannot express.
    pub fn validate(&self) -> std::result::Result<(), crate::error::FerryError> {
        let mut seen = HashSet::new();
        for rule in &self.rules {
            if !seen.insert(rule.id.as_str()) {
                return Err(crate::error::FerryError::Config(format!(
                    "duplicate rule id: {}",
                    rule.id
                )));
            }
            rule.remote_address()?;
        }
        Ok(())
    }
}

/// Load configuration from a TOML file
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let content = std::fs::read_to_string(path.as_ref())
        .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;

    parse_config(&content)
}

/// Parse configuration from a TOML string
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse configuration")?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_config() {
        let config = parse_config("").unwrap();
        assert!(config.rules.is_empty());
        assert_eq!(config.relay.tcp_timeout_secs, 30);
    }

    #[test]
    fn test_parse_full_config() {
        let config_str = r#"
[proxy]
addr = "proxy.example.com:1080"
username = "user"
password = "pass"

[relay]
tcp_timeout_secs = 60
udp_response_timeout_secs = 3

[[rules]]
id = "web"
protocol = "tcp"
local_addr = "127.0.0.1:8080"
remote_addr = "example.com:80"

[[rules]]
id = "dns"
protocol = "udp"
local_addr = "127.0.0.1:5353"
remote_addr = "8.8.8.8:53"
enabled = false
"#;

        let config = parse_config(config_str).unwrap();
        assert_eq!(config.proxy.addr, "proxy.example.com:1080");
        assert_eq!(config.proxy.username.as_deref(), Some("user"));
        assert_eq!(config.relay.tcp_timeout_secs, 60);
        assert_eq!(config.rules.len(), 2);
        assert_eq!(config.rules[0].protocol, Protocol::Tcp);
        assert_eq!(config.rules[1].protocol, Protocol::Udp);
        assert!(config.rules[0].enabled);
        assert!(!config.rules[1].enabled);
    }

    #[test]
    fn test_parse_rejects_duplicate_rule_ids() {
        let config_str = r#"
[[rules]]
id = "r1"
protocol = "tcp"
local_addr = "127.0.0.1:8080"
remote_addr = "example.com:80"

[[rules]]
id = "r1"
protocol = "tcp"
local_addr = "127.0.0.1:8081"
remote_addr = "example.com:81"
"#;
        assert!(parse_config(config_str).is_err());
    }

    #[test]
    fn test_parse_rejects_unknown_protocol() {
        let config_str = r#"
[[rules]]
id = "r1"
protocol = "icmp"
local_addr = "127.0.0.1:8080"
remote_addr = "example.com:80"
"#;
        assert!(parse_config(config_str).is_err());
    }

    #[test]
    fn test_load_config_from_file() {
        use std::io::Write;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[proxy]
addr = "127.0.0.1:1080"

[[rules]]
id = "r1"
protocol = "tcp"
local_addr = "127.0.0.1:9000"
remote_addr = "example.org:443"
"#
        )
        .unwrap();

        let config = load_config(file.path()).unwrap();
        assert_eq!(config.rules.len(), 1);
        assert_eq!(config.proxy.addr, "127.0.0.1:1080");
    }

    #[test]
    fn test_load_config_missing_file() {
        assert!(load_config("/nonexistent/socksferry.toml").is_err());
    }
}
