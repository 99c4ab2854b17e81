//! Server configuration.
//!
//! Configuration can be loaded from:
//! - Environment variables (RELAY_HOST, RELAY_PORT)
//! - TOML configuration file
//! - Command line (`--config <path>`)

use anyhow::{Context, Result};
use relay_protocol::{WireFormat, MAX_RECORD_SIZE};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use tenvis_relay_core::RelayConfig;
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Host and port do not form a socket address.
    #[error("Invalid bind address {0}: {1}")]
    InvalidAddr(String, std::net::AddrParseError),
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Transport configuration.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Heartbeat configuration.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// Delivery policy.
    #[serde(default)]
    pub relay: RelayPolicyConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Path for WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,

    /// Outbound encoding when the client does not ask for one.
    #[serde(default)]
    pub format: WireFormat,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum number of connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Maximum number of live records.
    #[serde(default = "default_max_records")]
    pub max_records: usize,

    /// Maximum inbound message size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Maximum size of a stored record once encoded. Updates may grow a
    /// record past `max_message_size`, up to this limit.
    #[serde(default = "default_max_record_size")]
    pub max_record_size: usize,

    /// Records buffered per connection before it is considered stalled.
    #[serde(default = "default_outbound_buffer")]
    pub outbound_buffer: usize,
}

/// Heartbeat configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Heartbeat interval in milliseconds.
    #[serde(default = "default_heartbeat_interval")]
    pub interval_ms: u64,

    /// Connection timeout in milliseconds.
    #[serde(default = "default_heartbeat_timeout")]
    pub timeout_ms: u64,
}

/// What to do with an inbound message that is not a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MalformedPolicy {
    /// Log and discard the message, keep the connection.
    #[default]
    Drop,
    /// Close the connection.
    Disconnect,
}

/// Delivery policy configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelayPolicyConfig {
    /// Send in-place edits of public records to every connection that knows
    /// them, not only to the editor.
    #[serde(default)]
    pub broadcast_public_updates: bool,

    /// Handling of undecodable inbound messages.
    #[serde(default)]
    pub on_malformed: MalformedPolicy,
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

// Default value functions
fn default_host() -> String {
    std::env::var("RELAY_HOST").unwrap_or_else(|_| "127.0.0.1".to_string())
}

fn default_port() -> u16 {
    std::env::var("RELAY_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080)
}

fn default_true() -> bool {
    true
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_max_connections() -> usize {
    10_000
}

fn default_max_records() -> usize {
    100_000
}

fn default_max_message_size() -> usize {
    64 * 1024 // 64 KB
}

fn default_max_record_size() -> usize {
    MAX_RECORD_SIZE
}

fn default_outbound_buffer() -> usize {
    1024
}

fn default_heartbeat_interval() -> u64 {
    30_000 // 30 seconds
}

fn default_heartbeat_timeout() -> u64 {
    60_000 // 60 seconds
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            transport: TransportConfig::default(),
            limits: LimitsConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            relay: RelayPolicyConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            websocket_path: default_ws_path(),
            format: WireFormat::default(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            max_records: default_max_records(),
            max_message_size: default_max_message_size(),
            max_record_size: default_max_record_size(),
            outbound_buffer: default_outbound_buffer(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_heartbeat_interval(),
            timeout_ms: default_heartbeat_timeout(),
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

impl Config {
    /// Load configuration from `--config <path>`, the default paths, or defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed, or if
    /// `--config` names a file that cannot be read.
    pub fn load() -> Result<Self> {
        let mut args = std::env::args().skip(1);
        while let Some(arg) = args.next() {
            if arg == "--config" {
                let path = args.next().context("--config requires a path")?;
                return Self::from_file(shellexpand::tilde(&path).as_ref());
            }
        }

        // Try to load from default paths
        let config_paths = [
            "relay.toml",
            "/etc/relay/relay.toml",
            "~/.config/relay/relay.toml",
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
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not parse as a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        let addr = format!("{}:{}", self.host, self.port);
        addr.parse()
            .map_err(|e| ConfigError::InvalidAddr(addr.clone(), e))
    }

    /// Delivery engine configuration derived from this server config.
    #[must_use]
    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            max_records: self.limits.max_records,
            max_connections: self.limits.max_connections,
            max_record_size: self.limits.max_record_size,
            broadcast_public_updates: self.relay.broadcast_public_updates,
        }
    }
}
