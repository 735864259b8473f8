//! Configuration management for the relay gateway.
//!
//! The TOML file mirrors [`ServerConfig`] with human-friendly units (seconds
//! and milliseconds) plus the plugin and logging sections only the binary
//! cares about.

use plugin_system::PluginSettings;
use relay_core::security::IpCidr;
use relay_core::{RetryPolicy, SecurityConfig};
use relay_server::ServerConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

/// Log levels accepted by `[logging] level`.
pub const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to access config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize default config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Application configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerSettings,
    pub retry: RetryPolicy,
    pub security: SecurityConfig,
    pub plugins: PluginsSettings,
    pub logging: LoggingSettings,
}

/// Listener and maintenance settings.
///
/// An empty bind address turns that listener off.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub tcp_bind: String,
    pub udp_bind: String,
    pub max_connections: usize,
    pub idle_timeout_secs: u64,
    pub udp_session_ttl_secs: u64,
    pub udp_sweep_interval_secs: u64,
    pub resource_sweep_interval_secs: u64,
    pub security_sweep_interval_secs: u64,
    /// Whether to use SO_REUSEPORT for one accept loop per core (Unix only)
    pub use_reuse_port: bool,
    pub max_datagram_size: usize,
    pub read_buffer_size: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        let defaults = ServerConfig::default();
        Self {
            tcp_bind: bind_to_string(defaults.tcp_bind),
            udp_bind: bind_to_string(defaults.udp_bind),
            max_connections: defaults.max_connections,
            idle_timeout_secs: defaults.idle_timeout.as_secs(),
            udp_session_ttl_secs: defaults.udp_session_ttl.as_secs(),
            udp_sweep_interval_secs: defaults.udp_sweep_interval.as_secs(),
            resource_sweep_interval_secs: defaults.resource_sweep_interval.as_secs(),
            security_sweep_interval_secs: defaults.security_sweep_interval.as_secs(),
            use_reuse_port: defaults.use_reuse_port,
            max_datagram_size: defaults.max_datagram_size,
            read_buffer_size: defaults.read_buffer_size,
        }
    }
}

fn bind_to_string(addr: Option<SocketAddr>) -> String {
    addr.map(|a| a.to_string()).unwrap_or_default()
}

/// Plugin selection and per-plugin settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginsSettings {
    /// Plugins to load, by name. Empty means every registered plugin.
    pub enabled: Vec<String>,
    /// `[plugins.settings.<name>]` tables, validated against each plugin's schema.
    pub settings: HashMap<String, PluginSettings>,
}

impl PluginsSettings {
    pub fn enabled_filter(&self) -> Option<&[String]> {
        (!self.enabled.is_empty()).then_some(self.enabled.as_slice())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Log level filter (trace, debug, info, warn, error)
    pub level: String,
    /// Whether to output logs in JSON format
    pub json_format: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
        }
    }
}

impl AppConfig {
    /// Loads configuration from a TOML file.
    ///
    /// If the file doesn't exist, a default configuration file is written at
    /// `path` and the defaults are returned.
    pub async fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let io_error = |source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        };

        if path.exists() {
            let content = tokio::fs::read_to_string(path).await.map_err(io_error)?;
            Ok(toml::from_str(&content)?)
        } else {
            let default_config = AppConfig::default();
            let toml_content = toml::to_string_pretty(&default_config)?;
            tokio::fs::write(path, toml_content)
                .await
                .map_err(io_error)?;
            info!("Created default configuration file: {}", path.display());
            Ok(default_config)
        }
    }

    /// Converts the file settings into the server's own configuration.
    pub fn to_server_config(&self) -> Result<ServerConfig, ConfigError> {
        let server = &self.server;
        Ok(ServerConfig {
            tcp_bind: parse_bind("tcp_bind", &server.tcp_bind)?,
            udp_bind: parse_bind("udp_bind", &server.udp_bind)?,
            max_connections: server.max_connections,
            idle_timeout: Duration::from_secs(server.idle_timeout_secs),
            udp_session_ttl: Duration::from_secs(server.udp_session_ttl_secs),
            udp_sweep_interval: Duration::from_secs(server.udp_sweep_interval_secs),
            resource_sweep_interval: Duration::from_secs(server.resource_sweep_interval_secs),
            security_sweep_interval: Duration::from_secs(server.security_sweep_interval_secs),
            use_reuse_port: server.use_reuse_port,
            max_datagram_size: server.max_datagram_size,
            read_buffer_size: server.read_buffer_size,
            retry: self.retry.clone(),
            security: self.security.clone(),
        })
    }

    /// Validates the configuration for consistency and correctness.
    pub fn validate(&self) -> Result<(), String> {
        let server = &self.server;
        let tcp = parse_bind("tcp_bind", &server.tcp_bind).map_err(|e| e.to_string())?;
        let udp = parse_bind("udp_bind", &server.udp_bind).map_err(|e| e.to_string())?;
        if tcp.is_none() && udp.is_none() {
            return Err("At least one of tcp_bind or udp_bind must be set".to_string());
        }

        let non_zero = [
            ("max_connections", server.max_connections as u64),
            ("idle_timeout_secs", server.idle_timeout_secs),
            ("udp_session_ttl_secs", server.udp_session_ttl_secs),
            ("udp_sweep_interval_secs", server.udp_sweep_interval_secs),
            ("resource_sweep_interval_secs", server.resource_sweep_interval_secs),
            ("security_sweep_interval_secs", server.security_sweep_interval_secs),
            ("max_datagram_size", server.max_datagram_size as u64),
            ("read_buffer_size", server.read_buffer_size as u64),
        ];
        if let Some((name, _)) = non_zero.iter().find(|(_, value)| *value == 0) {
            return Err(format!("{name} must be greater than zero"));
        }

        if self.retry.backoff_multiplier < 1.0 {
            return Err(format!(
                "retry.backoff_multiplier must be at least 1.0, got {}",
                self.retry.backoff_multiplier
            ));
        }

        let rate_limit = &self.security.rate_limit;
        if rate_limit.enabled && (rate_limit.max_requests == 0 || rate_limit.window_ms == 0) {
            return Err("security.rate_limit needs non-zero max_requests and window_ms".to_string());
        }
        let connection_limit = &self.security.connection_limit;
        if connection_limit.enabled && connection_limit.max_connections_per_ip == 0 {
            return Err("security.connection_limit.max_connections_per_ip must be greater than zero".to_string());
        }
        for rule in &self.security.ip_filter.rules {
            IpCidr::parse(&rule.cidr)
                .map_err(|e| format!("Invalid IP rule '{}': {}", rule.cidr, e.message))?;
        }

        if !VALID_LOG_LEVELS.contains(&self.logging.level.as_str()) {
            return Err(format!(
                "Invalid log level: {}. Must be one of: {VALID_LOG_LEVELS:?}",
                &self.logging.level
            ));
        }

        Ok(())
    }
}

fn parse_bind(field: &str, value: &str) -> Result<Option<SocketAddr>, ConfigError> {
    let value = value.trim();
    if value.is_empty() {
        return Ok(None);
    }
    value
        .parse()
        .map(Some)
        .map_err(|_| ConfigError::Invalid(format!("Invalid {field} address: {value}")))
}
