//! Server configuration types and defaults.

use relay_core::{RetryPolicy, SecurityConfig};
use std::net::SocketAddr;
use std::time::Duration;

/// Configuration for a [`RelayServer`](crate::RelayServer).
///
/// Either listener may be turned off by leaving its bind address unset, but
/// at least one must be present for the server to start.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// TCP listener address
    pub tcp_bind: Option<SocketAddr>,

    /// UDP socket address
    pub udp_bind: Option<SocketAddr>,

    /// Maximum number of concurrent TCP connections across all peers
    pub max_connections: usize,

    /// A TCP connection with no inbound bytes for this long is torn down
    pub idle_timeout: Duration,

    /// UDP sessions idle for longer than this are evicted
    pub udp_session_ttl: Duration,

    /// How often idle UDP sessions are looked for
    pub udp_sweep_interval: Duration,

    /// How often disposed resources are purged from the registry
    pub resource_sweep_interval: Duration,

    /// How often expired IP rules and idle rate-limit entries are purged
    pub security_sweep_interval: Duration,

    /// Whether to use SO_REUSEPORT for one accept loop per core
    pub use_reuse_port: bool,

    /// Largest datagram read from the UDP socket
    pub max_datagram_size: usize,

    /// Size of each TCP read
    pub read_buffer_size: usize,

    /// Retry policy wrapped around every pipeline run
    pub retry: RetryPolicy,

    /// Security gate settings
    pub security: SecurityConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            tcp_bind: Some(SocketAddr::from(([127, 0, 0, 1], 8080))),
            udp_bind: Some(SocketAddr::from(([127, 0, 0, 1], 8081))),
            max_connections: 1000,
            idle_timeout: Duration::from_secs(300),
            udp_session_ttl: Duration::from_secs(120),
            udp_sweep_interval: Duration::from_secs(30),
            resource_sweep_interval: Duration::from_secs(60),
            security_sweep_interval: Duration::from_secs(60),
            use_reuse_port: false,
            max_datagram_size: 65_507,
            read_buffer_size: 8192,
            retry: RetryPolicy::default(),
            security: SecurityConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Both listeners on ephemeral loopback ports. Used by tests.
    pub fn ephemeral() -> Self {
        Self {
            tcp_bind: Some(SocketAddr::from(([127, 0, 0, 1], 0))),
            udp_bind: Some(SocketAddr::from(([127, 0, 0, 1], 0))),
            ..Self::default()
        }
    }
}
