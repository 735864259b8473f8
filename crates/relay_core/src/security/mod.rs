//! # Security Gate
//!
//! Admission control for inbound traffic: IP allow/deny rules, fixed-window
//! rate limiting and per-IP connection caps, composed into an ordered
//! [`SecurityPipeline`]. Every check returns a boolean; denials are logged and
//! counted but never surface as errors.
//!
//! All tables are concurrent maps so the hot path and the periodic
//! [`SecurityManager::sweep`] can run from different tasks.

pub mod config;
pub mod connection_limit;
pub mod ip_filter;
pub mod pipeline;
pub mod rate_limit;

use serde::Serialize;
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info};

use crate::error::RouterError;
use crate::session::Protocol;

pub use config::{
    ConnectionLimitConfig, HealthAuthConfig, IpFilterConfig, IpRuleConfig, RateLimitConfig,
    SecurityConfig,
};
pub use connection_limit::ConnectionLimiter;
pub use ip_filter::{canonical_ip, IpCidr, IpDecision, IpFilter, IpRule, RuleKind};
pub use pipeline::{SecurityPipeline, SecurityStage, SecurityVerdict};
pub use rate_limit::{RateLimitEntry, RateLimiter};

#[derive(Debug, Default)]
struct StageCounters {
    allowed: AtomicU64,
    denied: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StageStats {
    pub allowed: u64,
    pub denied: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SecurityStats {
    pub enabled: bool,
    pub stages: BTreeMap<String, StageStats>,
    pub ip_rules: usize,
    pub blocked_ips: usize,
    pub rate_limit_entries: usize,
    pub active_connections: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub expired_rules: usize,
    pub expired_blocks: usize,
    pub idle_rate_limits: usize,
}

/// Owns every security table and the configuration switches around them.
#[derive(Debug)]
pub struct SecurityManager {
    config: SecurityConfig,
    ip_filter: IpFilter,
    rate_limiter: RateLimiter,
    connection_limiter: ConnectionLimiter,
    counters: [StageCounters; 3],
}

impl SecurityManager {
    /// Build the gate, parsing every configured IP rule up front.
    pub fn new(config: SecurityConfig) -> Result<Self, RouterError> {
        let mut rules = Vec::with_capacity(config.ip_filter.rules.len());
        for rule in &config.ip_filter.rules {
            rules.push(rule_from_config(rule)?);
        }

        info!(
            enabled = config.enabled,
            ip_rules = rules.len(),
            max_requests = config.rate_limit.max_requests,
            max_connections_per_ip = config.connection_limit.max_connections_per_ip,
            "🛡️ Security gate configured"
        );

        Ok(Self {
            rate_limiter: RateLimiter::new(&config.rate_limit),
            connection_limiter: ConnectionLimiter::new(
                config.connection_limit.max_connections_per_ip,
            ),
            ip_filter: IpFilter::with_rules(rules),
            counters: Default::default(),
            config,
        })
    }

    pub fn config(&self) -> &SecurityConfig {
        &self.config
    }

    pub fn check_ip_access(&self, ip: IpAddr) -> bool {
        if !self.config.enabled || !self.config.ip_filter.enabled {
            return true;
        }
        let decision = self.ip_filter.evaluate(ip);
        if !decision.is_allowed() {
            debug!(peer = %ip, ?decision, "IP access denied");
        }
        decision.is_allowed()
    }

    pub fn check_rate_limit(&self, identifier: &str, protocol: Protocol) -> bool {
        if !self.config.enabled || !self.config.rate_limit.enabled {
            return true;
        }
        self.rate_limiter.check(identifier, protocol)
    }

    /// Take a connection slot for `ip`. Pair with [`release_connection`](Self::release_connection).
    pub fn check_connection_limit(&self, ip: IpAddr) -> bool {
        if !self.config.enabled || !self.config.connection_limit.enabled {
            return true;
        }
        self.connection_limiter.try_acquire(canonical_ip(ip))
    }

    pub fn release_connection(&self, ip: IpAddr) {
        self.connection_limiter.release(canonical_ip(ip));
    }

    pub fn connection_count(&self, ip: IpAddr) -> u32 {
        self.connection_limiter.count(canonical_ip(ip))
    }

    pub fn block_ip(&self, ip: IpAddr, duration: Option<Duration>) {
        info!(peer = %ip, ?duration, "Blocking IP");
        self.ip_filter.block(ip, duration);
    }

    pub fn unblock_ip(&self, ip: IpAddr) -> bool {
        let removed = self.ip_filter.unblock(ip);
        if removed {
            info!(peer = %ip, "Unblocked IP");
        }
        removed
    }

    /// Shared-secret check for administrative endpoints. Fails closed when
    /// enabled without a configured token.
    pub fn validate_health_check_auth(&self, token: Option<&str>) -> bool {
        let auth = &self.config.health_auth;
        if !auth.enabled {
            return true;
        }
        match (&auth.token, token) {
            (Some(expected), Some(given)) => expected == given,
            _ => false,
        }
    }

    pub fn add_ip_rule(
        &self,
        cidr: &str,
        kind: RuleKind,
        description: Option<String>,
        ttl: Option<Duration>,
    ) -> Result<IpRule, RouterError> {
        let mut rule = IpRule::new(IpCidr::parse(cidr)?, kind);
        rule.description = description;
        if let Some(ttl) = ttl {
            rule = rule.expires_in(ttl);
        }
        info!(cidr = %rule.cidr, ?kind, "Added IP rule");
        self.ip_filter.add_rule(rule.clone());
        Ok(rule)
    }

    pub fn remove_ip_rule(&self, cidr: &str) -> Result<usize, RouterError> {
        let cidr = IpCidr::parse(cidr)?;
        let removed = self.ip_filter.remove_rule(&cidr);
        info!(%cidr, removed, "Removed IP rules");
        Ok(removed)
    }

    pub fn list_ip_rules(&self) -> Vec<IpRule> {
        self.ip_filter.rules()
    }

    pub fn rate_limit_entry(&self, identifier: &str, protocol: Protocol) -> Option<RateLimitEntry> {
        self.rate_limiter.entry(identifier, protocol)
    }

    /// Purge expired rules, expired manual blocks and idle rate-limit entries.
    pub fn sweep(&self) -> SweepStats {
        let (expired_rules, expired_blocks) = self.ip_filter.purge_expired();
        let idle_rate_limits = self.rate_limiter.purge_idle();
        let stats = SweepStats {
            expired_rules,
            expired_blocks,
            idle_rate_limits,
        };
        debug!(?stats, "Security sweep finished");
        stats
    }

    pub(crate) fn record_stage(&self, stage: SecurityStage, allowed: bool) {
        let counters = &self.counters[stage_index(stage)];
        if allowed {
            counters.allowed.fetch_add(1, Ordering::Relaxed);
        } else {
            counters.denied.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn stats(&self) -> SecurityStats {
        let stages = [
            SecurityStage::IpFilter,
            SecurityStage::RateLimit,
            SecurityStage::ConnectionLimit,
        ]
        .into_iter()
        .map(|stage| {
            let counters = &self.counters[stage_index(stage)];
            (
                stage.as_str().to_string(),
                StageStats {
                    allowed: counters.allowed.load(Ordering::Relaxed),
                    denied: counters.denied.load(Ordering::Relaxed),
                },
            )
        })
        .collect();

        SecurityStats {
            enabled: self.config.enabled,
            stages,
            ip_rules: self.ip_filter.rules().len(),
            blocked_ips: self.ip_filter.blocked_count(),
            rate_limit_entries: self.rate_limiter.len(),
            active_connections: self.connection_limiter.total(),
        }
    }
}

fn stage_index(stage: SecurityStage) -> usize {
    match stage {
        SecurityStage::IpFilter => 0,
        SecurityStage::RateLimit => 1,
        SecurityStage::ConnectionLimit => 2,
    }
}

fn rule_from_config(config: &IpRuleConfig) -> Result<IpRule, RouterError> {
    let mut rule = IpRule::new(IpCidr::parse(&config.cidr)?, config.kind);
    rule.description = config.description.clone();
    if let Some(ms) = config.expires_in_ms {
        rule = rule.expires_in(Duration::from_millis(ms));
    }
    Ok(rule)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_disabled_gate_allows_everything() {
        let security = SecurityManager::new(SecurityConfig::disabled()).unwrap();
        security.block_ip(ip("10.0.0.1"), None);
        assert!(security.check_ip_access(ip("10.0.0.1")));
        for _ in 0..1_000 {
            assert!(security.check_rate_limit("10.0.0.1", Protocol::Tcp));
        }
        assert!(security.check_connection_limit(ip("10.0.0.1")));
    }

    #[test]
    fn test_whitelist_rule_denies_other_hosts() {
        let mut config = SecurityConfig::default();
        config.ip_filter.rules.push(IpRuleConfig {
            cidr: "10.0.0.1".into(),
            kind: RuleKind::Whitelist,
            description: Some("office".into()),
            expires_in_ms: None,
        });
        let security = SecurityManager::new(config).unwrap();

        assert!(security.check_ip_access(ip("10.0.0.1")));
        assert!(!security.check_ip_access(ip("10.0.0.2")));
    }

    #[test]
    fn test_invalid_rule_rejected_at_construction() {
        let mut config = SecurityConfig::default();
        config.ip_filter.rules.push(IpRuleConfig {
            cidr: "10.0.0.0/40".into(),
            kind: RuleKind::Blacklist,
            description: None,
            expires_in_ms: None,
        });
        let err = SecurityManager::new(config).unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Validation);
    }

    #[test]
    fn test_health_auth() {
        let mut config = SecurityConfig::default();
        let open = SecurityManager::new(config.clone()).unwrap();
        assert!(open.validate_health_check_auth(None));

        config.health_auth.enabled = true;
        let no_secret = SecurityManager::new(config.clone()).unwrap();
        assert!(!no_secret.validate_health_check_auth(Some("anything")));

        config.health_auth.token = Some("s3cret".into());
        let guarded = SecurityManager::new(config).unwrap();
        assert!(guarded.validate_health_check_auth(Some("s3cret")));
        assert!(!guarded.validate_health_check_auth(Some("s3cret ")));
        assert!(!guarded.validate_health_check_auth(None));
    }

    #[test]
    fn test_runtime_rule_management() {
        let security = SecurityManager::new(SecurityConfig::default()).unwrap();
        security
            .add_ip_rule("203.0.113.0/24", RuleKind::Blacklist, None, None)
            .unwrap();
        assert!(!security.check_ip_access(ip("203.0.113.77")));
        assert_eq!(security.list_ip_rules().len(), 1);

        assert!(security.add_ip_rule("bogus", RuleKind::Blacklist, None, None).is_err());
        assert_eq!(security.remove_ip_rule("203.0.113.0/24").unwrap(), 1);
        assert!(security.check_ip_access(ip("203.0.113.77")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_purges_expired_state() {
        let security = SecurityManager::new(SecurityConfig::default()).unwrap();
        security
            .add_ip_rule("10.0.0.0/8", RuleKind::Blacklist, None, Some(Duration::from_secs(1)))
            .unwrap();
        security.block_ip(ip("10.9.9.9"), Some(Duration::from_secs(1)));
        security.check_rate_limit("10.9.9.9", Protocol::Udp);

        tokio::time::advance(Duration::from_secs(61)).await;
        let stats = security.sweep();
        assert_eq!(
            stats,
            SweepStats {
                expired_rules: 1,
                expired_blocks: 1,
                idle_rate_limits: 1,
            }
        );
        assert_eq!(security.stats().rate_limit_entries, 0);
    }
}
