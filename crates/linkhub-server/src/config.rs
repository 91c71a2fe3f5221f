//! Server configuration.
//!
//! Configuration can be loaded from:
//! - Environment variables (LINKHUB_*)
//! - TOML configuration file

use anyhow::{bail, Context, Result};
use linkhub_core::{BrokerConfig, HeartbeatConfig, TunnelConfig};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host the HTTP API binds to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port of the HTTP API.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Bus broker settings.
    #[serde(default)]
    pub broker: BrokerSettings,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Device tunnels to listen on.
    #[serde(default)]
    pub tunnels: Vec<TunnelEntry>,
}

/// Bus broker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerSettings {
    /// Broadcast capacity per topic.
    #[serde(default = "default_topic_capacity")]
    pub topic_capacity: usize,

    /// Maximum subscriptions per subscriber.
    #[serde(default = "default_max_subscriptions")]
    pub max_subscriptions_per_subscriber: usize,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

/// Socket type a tunnel listens on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

/// How a reconnecting device is matched to its closed link.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResumeMatch {
    /// Full source address. TCP devices reconnect from a new port, so
    /// this only resumes datagram devices in practice.
    #[default]
    Address,
    /// Source IP only. For deployments with one device per IP; never use
    /// it for devices behind NAT.
    Ip,
}

impl ResumeMatch {
    /// The remote key a device connecting from `addr` is looked up by.
    #[must_use]
    pub fn remote_key(self, addr: SocketAddr) -> String {
        match self {
            Self::Address => addr.to_string(),
            Self::Ip => addr.ip().to_string(),
        }
    }
}

/// One device tunnel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelEntry {
    pub id: u64,

    #[serde(default)]
    pub name: String,

    #[serde(default = "default_protocol")]
    pub protocol: Protocol,

    /// Address to accept device connections on.
    pub listen: String,

    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// Maximum queued writes per disconnected link.
    #[serde(default)]
    pub pending_limit: Option<usize>,

    /// Read buffer size per device connection.
    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,

    /// UDP only: close a link after this long without datagrams.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// How reconnecting devices find their closed link.
    #[serde(default)]
    pub resume_match: ResumeMatch,

    /// Drop closed links, and their queued writes, after this long.
    #[serde(default = "default_closed_retention")]
    pub closed_retention_secs: u64,
}

// Default value functions
fn default_host() -> String {
    std::env::var("LINKHUB_HOST").unwrap_or_else(|_| "127.0.0.1".to_string())
}

fn default_port() -> u16 {
    std::env::var("LINKHUB_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080)
}

fn default_true() -> bool {
    true
}

fn default_topic_capacity() -> usize {
    1024
}

fn default_max_subscriptions() -> usize {
    100
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_protocol() -> Protocol {
    Protocol::Tcp
}

fn default_read_buffer_size() -> usize {
    4096
}

fn default_idle_timeout() -> u64 {
    300 // 5 minutes
}

fn default_closed_retention() -> u64 {
    3600 // 1 hour
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            broker: BrokerSettings::default(),
            metrics: MetricsConfig::default(),
            tunnels: Vec::new(),
        }
    }
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            topic_capacity: default_topic_capacity(),
            max_subscriptions_per_subscriber: default_max_subscriptions(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl BrokerSettings {
    #[must_use]
    pub fn to_broker_config(&self) -> BrokerConfig {
        BrokerConfig {
            topic_capacity: self.topic_capacity,
            max_subscriptions_per_subscriber: self.max_subscriptions_per_subscriber,
        }
    }
}

impl TunnelEntry {
    /// The link-level configuration shared by this tunnel's links.
    #[must_use]
    pub fn to_tunnel_config(&self) -> TunnelConfig {
        TunnelConfig {
            heartbeat: self.heartbeat.clone(),
            pending_limit: self.pending_limit,
        }
    }

    /// How long an idle datagram device keeps its link open.
    #[must_use]
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    /// How long a closed link stays resumable.
    #[must_use]
    pub fn closed_retention(&self) -> Duration {
        Duration::from_secs(self.closed_retention_secs)
    }

    /// Parse the listen address.
    ///
    /// # Errors
    ///
    /// Returns an error if the address is not a valid `host:port`.
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        self.listen
            .parse()
            .with_context(|| format!("Invalid listen address for tunnel {}: {}", self.id, self.listen))
    }
}

impl Config {
    /// Load configuration from file or defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed.
    pub fn load() -> Result<Self> {
        let config_paths = [
            "linkhub.toml",
            "/etc/linkhub/linkhub.toml",
            "~/.config/linkhub/linkhub.toml",
        ];

        for path in &config_paths {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                return Self::from_file(expanded.as_ref());
            }
        }

        // Fall back to defaults with environment overrides
        Ok(Self::default())
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns an error on duplicate tunnel ids, bad listen addresses, zero
    /// sizes or timeouts, or heartbeat content that does not decode.
    pub fn validate(&self) -> Result<()> {
        let mut ids = HashSet::new();
        for tunnel in &self.tunnels {
            if !ids.insert(tunnel.id) {
                bail!("Duplicate tunnel id: {}", tunnel.id);
            }
            tunnel.listen_addr()?;
            if tunnel.read_buffer_size == 0 {
                bail!("Tunnel {} has a zero read buffer", tunnel.id);
            }
            if tunnel.idle_timeout_secs == 0 || tunnel.closed_retention_secs == 0 {
                bail!("Tunnel {} has a zero idle timeout or closed retention", tunnel.id);
            }
            if tunnel.heartbeat.enabled {
                tunnel
                    .heartbeat
                    .decode_content()
                    .with_context(|| format!("Invalid heartbeat content for tunnel {}", tunnel.id))?;
            }
        }
        Ok(())
    }

    /// Get the socket address of the HTTP API.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid host:port {}:{}", self.host, self.port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.tunnels.is_empty());
        assert!(config.metrics.enabled);
        assert_eq!(config.broker.topic_capacity, 1024);
    }

    #[test]
    fn test_config_bind_addr() {
        let config = Config {
            host: "127.0.0.1".to_string(),
            port: 8080,
            ..Config::default()
        };
        assert_eq!(config.bind_addr().unwrap().port(), 8080);
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            host = "0.0.0.0"
            port = 9000

            [[tunnels]]
            id = 1
            name = "dtu"
            listen = "0.0.0.0:7001"
            pending_limit = 128

            [tunnels.heartbeat]
            enabled = true
            interval_secs = 30
            content = "AA"
            is_hex = true

            [[tunnels]]
            id = 2
            protocol = "udp"
            listen = "0.0.0.0:7002"
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        config.validate().unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.tunnels.len(), 2);

        let dtu = &config.tunnels[0];
        assert_eq!(dtu.protocol, Protocol::Tcp);
        assert_eq!(dtu.read_buffer_size, 4096);
        assert_eq!(dtu.resume_match, ResumeMatch::Address);
        assert_eq!(dtu.closed_retention(), Duration::from_secs(3600));
        let tunnel_config = dtu.to_tunnel_config();
        assert_eq!(tunnel_config.pending_limit, Some(128));
        assert!(tunnel_config.heartbeat.is_hex);

        assert_eq!(config.tunnels[1].protocol, Protocol::Udp);
        assert!(!config.tunnels[1].heartbeat.enabled);
    }

    #[test]
    fn test_duplicate_tunnel_ids_rejected() {
        let toml_str = r#"
            [[tunnels]]
            id = 1
            listen = "127.0.0.1:7001"

            [[tunnels]]
            id = 1
            listen = "127.0.0.1:7002"
        "#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bad_listen_address_rejected() {
        let toml_str = r#"
            [[tunnels]]
            id = 1
            listen = "not-an-address"
        "#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bad_heartbeat_content_rejected() {
        let toml_str = r#"
            [[tunnels]]
            id = 1
            listen = "127.0.0.1:7001"

            [tunnels.heartbeat]
            enabled = true
            content = "XYZ"
            is_hex = true
        "#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_retention_rejected() {
        let toml_str = r#"
            [[tunnels]]
            id = 1
            listen = "127.0.0.1:7001"
            closed_retention_secs = 0
        "#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_resume_match_keys() {
        let addr: SocketAddr = "10.1.2.3:40001".parse().unwrap();
        assert_eq!(ResumeMatch::Address.remote_key(addr), "10.1.2.3:40001");
        assert_eq!(ResumeMatch::Ip.remote_key(addr), "10.1.2.3");

        let entry: TunnelEntry = toml::from_str(
            r#"
            id = 3
            listen = "0.0.0.0:7003"
            resume_match = "ip"
        "#,
        )
        .unwrap();
        assert_eq!(entry.resume_match, ResumeMatch::Ip);
    }
}
