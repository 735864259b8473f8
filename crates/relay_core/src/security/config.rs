//! Serde-backed configuration for the security gate.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::ip_filter::RuleKind;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Master switch. When off every check allows.
    pub enabled: bool,
    pub ip_filter: IpFilterConfig,
    pub rate_limit: RateLimitConfig,
    pub connection_limit: ConnectionLimitConfig,
    pub health_auth: HealthAuthConfig,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ip_filter: IpFilterConfig::default(),
            rate_limit: RateLimitConfig::default(),
            connection_limit: ConnectionLimitConfig::default(),
            health_auth: HealthAuthConfig::default(),
        }
    }
}

impl SecurityConfig {
    /// Everything off. Handy for tests and trusted deployments.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IpFilterConfig {
    pub enabled: bool,
    pub rules: Vec<IpRuleConfig>,
}

impl Default for IpFilterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            rules: Vec::new(),
        }
    }
}

/// A rule as written in a config file: `{ cidr = "10.0.0.0/8", kind = "whitelist" }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpRuleConfig {
    pub cidr: String,
    pub kind: RuleKind,
    #[serde(default)]
    pub description: Option<String>,
    /// Lifetime from startup, in milliseconds. Absent means permanent.
    #[serde(default)]
    pub expires_in_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub max_requests: u32,
    pub window_ms: u64,
    /// How long a peer stays blocked after exceeding the limit. Zero means
    /// until the current window resets.
    pub block_duration_ms: u64,
    /// Count each protocol separately for the same identifier.
    pub per_protocol: bool,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_requests: 100,
            window_ms: 60_000,
            block_duration_ms: 0,
            per_protocol: false,
        }
    }
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    pub fn block_duration(&self) -> Option<Duration> {
        (self.block_duration_ms > 0).then(|| Duration::from_millis(self.block_duration_ms))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionLimitConfig {
    pub enabled: bool,
    pub max_connections_per_ip: u32,
}

impl Default for ConnectionLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_connections_per_ip: 10,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthAuthConfig {
    pub enabled: bool,
    pub token: Option<String>,
}
