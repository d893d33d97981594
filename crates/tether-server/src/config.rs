//! Server configuration.
//!
//! Configuration can be loaded from:
//! - Environment variables (TETHER_HOST, TETHER_PORT)
//! - TOML configuration file

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use tether_transport::{PerMessageDeflate, TransportKind};

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

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Transports clients may use, by name.
    #[serde(default = "default_transports")]
    pub enabled: Vec<String>,

    /// Path of the endpoint.
    #[serde(default = "default_path")]
    pub path: String,

    /// Compress WebSocket messages.
    #[serde(default)]
    pub per_message_deflate: bool,

    /// Messages shorter than this many bytes are sent uncompressed.
    #[serde(default = "default_deflate_threshold")]
    pub deflate_threshold: usize,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum size of a single inbound message in bytes. Also bounds the
    /// bytes of outbound packets queued while the transport is busy.
    #[serde(default = "default_max_payload")]
    pub max_payload: usize,
}

/// Heartbeat configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Interval between server pings in milliseconds.
    #[serde(default = "default_ping_interval")]
    pub ping_interval_ms: u64,

    /// How long to wait for a pong in milliseconds.
    #[serde(default = "default_ping_timeout")]
    pub ping_timeout_ms: u64,
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
    std::env::var("TETHER_HOST").unwrap_or_else(|_| "127.0.0.1".to_string())
}

fn default_port() -> u16 {
    std::env::var("TETHER_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(3000)
}

fn default_true() -> bool {
    true
}

fn default_transports() -> Vec<String> {
    vec!["polling".to_string(), "websocket".to_string()]
}

fn default_path() -> String {
    "/engine.io/".to_string()
}

fn default_deflate_threshold() -> usize {
    1024
}

fn default_max_payload() -> usize {
    1_000_000
}

fn default_ping_interval() -> u64 {
    25_000
}

fn default_ping_timeout() -> u64 {
    20_000
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
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            enabled: default_transports(),
            path: default_path(),
            per_message_deflate: false,
            deflate_threshold: default_deflate_threshold(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_payload: default_max_payload(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            ping_interval_ms: default_ping_interval(),
            ping_timeout_ms: default_ping_timeout(),
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
    /// Load configuration from file or defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed.
    pub fn load() -> Result<Self> {
        let config_paths = [
            "tether.toml",
            "/etc/tether/tether.toml",
            "~/.config/tether/tether.toml",
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

        config.enabled_transports()?;
        Ok(config)
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port don't form a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid host:port {}:{}", self.host, self.port))
    }

    /// The enabled transports.
    ///
    /// # Errors
    ///
    /// Returns an error if a configured name is not a known transport.
    pub fn enabled_transports(&self) -> Result<Vec<TransportKind>> {
        self.transport
            .enabled
            .iter()
            .map(|name| {
                name.parse::<TransportKind>()
                    .with_context(|| format!("Invalid transport in config: {name}"))
            })
            .collect()
    }

    /// WebSocket compression settings, if enabled.
    #[must_use]
    pub fn per_message_deflate(&self) -> Option<PerMessageDeflate> {
        self.transport
            .per_message_deflate
            .then_some(PerMessageDeflate {
                threshold: self.transport.deflate_threshold,
            })
    }
}
