//! Ordered security stages with short-circuit on first denial.

use serde::Serialize;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::warn;

use super::{canonical_ip, SecurityManager};
use crate::session::Protocol;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SecurityStage {
    IpFilter,
    RateLimit,
    ConnectionLimit,
}

impl SecurityStage {
    pub fn as_str(self) -> &'static str {
        match self {
            SecurityStage::IpFilter => "ip-filter",
            SecurityStage::RateLimit => "rate-limit",
            SecurityStage::ConnectionLimit => "connection-limit",
        }
    }
}

impl fmt::Display for SecurityStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityVerdict {
    Allowed,
    Denied(SecurityStage),
}

impl SecurityVerdict {
    pub fn is_allowed(&self) -> bool {
        matches!(self, SecurityVerdict::Allowed)
    }
}

#[derive(Clone)]
pub struct SecurityPipeline {
    manager: Arc<SecurityManager>,
    stages: Vec<SecurityStage>,
}

impl SecurityPipeline {
    pub fn new(manager: Arc<SecurityManager>) -> Self {
        Self {
            manager,
            stages: Vec::new(),
        }
    }

    /// ip-filter, rate-limit, connection-limit. Used for TCP accepts.
    pub fn for_connections(manager: Arc<SecurityManager>) -> Self {
        Self::new(manager)
            .stage(SecurityStage::IpFilter)
            .stage(SecurityStage::RateLimit)
            .stage(SecurityStage::ConnectionLimit)
    }

    /// ip-filter, rate-limit. Datagrams hold no connection slot to release.
    pub fn for_datagrams(manager: Arc<SecurityManager>) -> Self {
        Self::new(manager)
            .stage(SecurityStage::IpFilter)
            .stage(SecurityStage::RateLimit)
    }

    pub fn stage(mut self, stage: SecurityStage) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn stages(&self) -> &[SecurityStage] {
        &self.stages
    }

    /// Run every stage in order. A denial is logged and counted, never raised.
    ///
    /// When the connection-limit stage allows, the caller owns a slot and must
    /// call [`SecurityManager::release_connection`] on teardown.
    pub fn check(&self, peer: IpAddr, protocol: Protocol) -> SecurityVerdict {
        for &stage in &self.stages {
            let allowed = match stage {
                SecurityStage::IpFilter => self.manager.check_ip_access(peer),
                SecurityStage::RateLimit => self
                    .manager
                    .check_rate_limit(&canonical_ip(peer).to_string(), protocol),
                SecurityStage::ConnectionLimit => self.manager.check_connection_limit(peer),
            };
            self.manager.record_stage(stage, allowed);

            if !allowed {
                warn!(peer = %peer, %protocol, stage = %stage, "🚫 Security check denied");
                return SecurityVerdict::Denied(stage);
            }
        }
        SecurityVerdict::Allowed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::config::{IpRuleConfig, SecurityConfig};
    use crate::security::ip_filter::RuleKind;

    fn manager(config: SecurityConfig) -> Arc<SecurityManager> {
        Arc::new(SecurityManager::new(config).unwrap())
    }

    #[test]
    fn test_short_circuits_on_first_denial() {
        let mut config = SecurityConfig::default();
        config.ip_filter.rules.push(IpRuleConfig {
            cidr: "10.0.0.0/8".into(),
            kind: RuleKind::Blacklist,
            description: None,
            expires_in_ms: None,
        });
        config.connection_limit.max_connections_per_ip = 1;
        let security = manager(config);
        let pipeline = SecurityPipeline::for_connections(security.clone());

        let banned: IpAddr = "10.1.1.1".parse().unwrap();
        assert_eq!(
            pipeline.check(banned, Protocol::Tcp),
            SecurityVerdict::Denied(SecurityStage::IpFilter)
        );
        // Later stages never saw the banned peer.
        assert!(security.rate_limit_entry(&banned.to_string(), Protocol::Tcp).is_none());
        assert_eq!(security.connection_count(banned), 0);

        let peer: IpAddr = "192.0.2.10".parse().unwrap();
        assert!(pipeline.check(peer, Protocol::Tcp).is_allowed());
        assert_eq!(
            pipeline.check(peer, Protocol::Tcp),
            SecurityVerdict::Denied(SecurityStage::ConnectionLimit)
        );
        security.release_connection(peer);
        assert!(pipeline.check(peer, Protocol::Tcp).is_allowed());

        let stats = security.stats();
        assert_eq!(stats.stages["ip-filter"].denied, 1);
        assert_eq!(stats.stages["ip-filter"].allowed, 3);
        assert_eq!(stats.stages["connection-limit"].denied, 1);
        assert_eq!(stats.stages["connection-limit"].allowed, 2);
    }

    #[test]
    fn test_datagram_pipeline_skips_connection_limit() {
        let mut config = SecurityConfig::default();
        config.connection_limit.max_connections_per_ip = 0;
        let pipeline = SecurityPipeline::for_datagrams(manager(config));

        let peer: IpAddr = "192.0.2.20".parse().unwrap();
        assert!(pipeline.check(peer, Protocol::Udp).is_allowed());
        assert_eq!(
            pipeline.stages(),
            &[SecurityStage::IpFilter, SecurityStage::RateLimit]
        );
    }

    #[test]
    fn test_mapped_ipv6_peer_shares_the_ipv4_rate_bucket() {
        let mut config = SecurityConfig::default();
        config.rate_limit.max_requests = 1;
        let security = manager(config);
        let pipeline = SecurityPipeline::for_datagrams(security.clone());

        let mapped: IpAddr = "::ffff:192.0.2.30".parse().unwrap();
        let plain: IpAddr = "192.0.2.30".parse().unwrap();
        assert!(pipeline.check(mapped, Protocol::Udp).is_allowed());
        assert_eq!(
            pipeline.check(plain, Protocol::Udp),
            SecurityVerdict::Denied(SecurityStage::RateLimit)
        );
        assert_eq!(
            security
                .rate_limit_entry("192.0.2.30", Protocol::Udp)
                .unwrap()
                .request_count,
            2
        );
        assert!(security
            .rate_limit_entry("::ffff:192.0.2.30", Protocol::Udp)
            .is_none());
    }
}
