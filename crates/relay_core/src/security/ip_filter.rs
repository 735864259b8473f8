//! IP allow/deny rules with bit-level CIDR matching.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;
use tokio::time::Instant;

use crate::error::RouterError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleKind {
    Whitelist,
    Blacklist,
}

/// An IPv4 or IPv6 network in prefix form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IpCidr {
    V4 { network: u32, prefix: u8 },
    V6 { network: u128, prefix: u8 },
}

impl IpCidr {
    /// Parse `addr` or `addr/prefix`. A bare address is a host route.
    ///
    /// Host bits below the prefix are cleared, so `10.1.2.3/8` is stored as
    /// `10.0.0.0/8`. IPv4-mapped IPv6 input is stored as plain IPv4.
    pub fn parse(input: &str) -> Result<Self, RouterError> {
        let input = input.trim();
        let (addr, prefix) = match input.split_once('/') {
            Some((addr, prefix)) => {
                let prefix: u8 = prefix.parse().map_err(|_| {
                    RouterError::validation(format!("invalid prefix length in '{input}'"))
                })?;
                (addr, Some(prefix))
            }
            None => (input, None),
        };

        let ip = IpAddr::from_str(addr)
            .map_err(|_| RouterError::validation(format!("invalid IP address '{addr}'")))?;

        match canonical_ip(ip) {
            IpAddr::V4(v4) => {
                // A mapped address keeps its prefix relative to the 128-bit form.
                let prefix = match (ip, prefix) {
                    (IpAddr::V6(_), Some(p)) if p >= 96 => p - 96,
                    (IpAddr::V6(_), Some(p)) => {
                        return Err(RouterError::validation(format!(
                            "prefix /{p} is too short for an IPv4-mapped address in '{input}'"
                        )))
                    }
                    (_, p) => p.unwrap_or(32),
                };
                if prefix > 32 {
                    return Err(RouterError::validation(format!(
                        "IPv4 prefix length must be 0-32, got {prefix}"
                    )));
                }
                let mask = v4_mask(prefix);
                Ok(IpCidr::V4 {
                    network: u32::from(v4) & mask,
                    prefix,
                })
            }
            IpAddr::V6(v6) => {
                let prefix = prefix.unwrap_or(128);
                if prefix > 128 {
                    return Err(RouterError::validation(format!(
                        "IPv6 prefix length must be 0-128, got {prefix}"
                    )));
                }
                let mask = v6_mask(prefix);
                Ok(IpCidr::V6 {
                    network: u128::from(v6) & mask,
                    prefix,
                })
            }
        }
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self, canonical_ip(ip)) {
            (IpCidr::V4 { network, prefix }, IpAddr::V4(v4)) => {
                u32::from(v4) & v4_mask(*prefix) == *network
            }
            (IpCidr::V6 { network, prefix }, IpAddr::V6(v6)) => {
                u128::from(v6) & v6_mask(*prefix) == *network
            }
            _ => false,
        }
    }
}

impl fmt::Display for IpCidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpCidr::V4 { network, prefix } => write!(f, "{}/{}", Ipv4Addr::from(*network), prefix),
            IpCidr::V6 { network, prefix } => write!(f, "{}/{}", Ipv6Addr::from(*network), prefix),
        }
    }
}

impl FromStr for IpCidr {
    type Err = RouterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        IpCidr::parse(s)
    }
}

fn v4_mask(prefix: u8) -> u32 {
    if prefix == 0 {
        0
    } else {
        !0u32 << (32 - u32::from(prefix))
    }
}

fn v6_mask(prefix: u8) -> u128 {
    if prefix == 0 {
        0
    } else {
        !0u128 << (128 - u32::from(prefix))
    }
}

/// Collapse IPv4-mapped IPv6 addresses (`::ffff:a.b.c.d`) to IPv4.
pub fn canonical_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        },
        v4 => v4,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct IpRule {
    pub cidr: IpCidr,
    pub kind: RuleKind,
    pub description: Option<String>,
    pub created_at: Instant,
    pub expires_at: Option<Instant>,
}

impl IpRule {
    pub fn new(cidr: IpCidr, kind: RuleKind) -> Self {
        Self {
            cidr,
            kind,
            description: None,
            created_at: Instant::now(),
            expires_at: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn expires_in(mut self, ttl: Duration) -> Self {
        self.expires_at = Some(self.created_at + ttl);
        self
    }

    pub fn is_active(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| now < at)
    }
}

/// Why an address was allowed or denied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IpDecision {
    Allowed,
    ManuallyBlocked,
    Blacklisted(IpCidr),
    NotWhitelisted,
}

impl IpDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, IpDecision::Allowed)
    }
}

/// Ordered rule list plus a manual block set.
#[derive(Debug, Default)]
pub struct IpFilter {
    rules: RwLock<Vec<IpRule>>,
    blocked: DashMap<IpAddr, Option<Instant>>,
}

impl IpFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rules(rules: Vec<IpRule>) -> Self {
        Self {
            rules: RwLock::new(rules),
            blocked: DashMap::new(),
        }
    }

    /// Evaluate `ip` against the block set and then the rules, in order.
    pub fn evaluate(&self, ip: IpAddr) -> IpDecision {
        let ip = canonical_ip(ip);
        let now = Instant::now();

        if self.is_blocked(ip, now) {
            return IpDecision::ManuallyBlocked;
        }

        let rules = self.rules.read().unwrap_or_else(PoisonError::into_inner);
        let mut has_whitelist = false;
        for rule in rules.iter().filter(|rule| rule.is_active(now)) {
            if rule.kind == RuleKind::Whitelist {
                has_whitelist = true;
            }
            if rule.cidr.contains(ip) {
                return match rule.kind {
                    RuleKind::Blacklist => IpDecision::Blacklisted(rule.cidr),
                    RuleKind::Whitelist => IpDecision::Allowed,
                };
            }
        }

        if has_whitelist {
            IpDecision::NotWhitelisted
        } else {
            IpDecision::Allowed
        }
    }

    pub fn add_rule(&self, rule: IpRule) {
        self.rules
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(rule);
    }

    /// Remove every rule for `cidr`, returning how many were removed.
    pub fn remove_rule(&self, cidr: &IpCidr) -> usize {
        let mut rules = self.rules.write().unwrap_or_else(PoisonError::into_inner);
        let before = rules.len();
        rules.retain(|rule| rule.cidr != *cidr);
        before - rules.len()
    }

    pub fn rules(&self) -> Vec<IpRule> {
        self.rules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn block(&self, ip: IpAddr, duration: Option<Duration>) {
        let until = duration.map(|d| Instant::now() + d);
        self.blocked.insert(canonical_ip(ip), until);
    }

    pub fn unblock(&self, ip: IpAddr) -> bool {
        self.blocked.remove(&canonical_ip(ip)).is_some()
    }

    pub fn blocked_count(&self) -> usize {
        self.blocked.len()
    }

    /// Drop expired rules and expired manual blocks.
    pub fn purge_expired(&self) -> (usize, usize) {
        let now = Instant::now();

        let rules_removed = {
            let mut rules = self.rules.write().unwrap_or_else(PoisonError::into_inner);
            let before = rules.len();
            rules.retain(|rule| rule.is_active(now));
            before - rules.len()
        };

        let before = self.blocked.len();
        self.blocked
            .retain(|_, until| until.map_or(true, |until| now < until));
        let blocks_removed = before.saturating_sub(self.blocked.len());

        (rules_removed, blocks_removed)
    }

    fn is_blocked(&self, ip: IpAddr, now: Instant) -> bool {
        let Some(until) = self.blocked.get(&ip).map(|entry| *entry) else {
            return false;
        };
        match until {
            None => true,
            Some(until) if now < until => true,
            Some(_) => {
                self.blocked
                    .remove_if(&ip, |_, current| current.is_some_and(|at| now >= at));
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn rule(cidr: &str, kind: RuleKind) -> IpRule {
        IpRule::new(IpCidr::parse(cidr).unwrap(), kind)
    }

    #[test]
    fn test_cidr_parsing_clears_host_bits() {
        let cidr = IpCidr::parse("10.1.2.3/8").unwrap();
        assert_eq!(cidr.to_string(), "10.0.0.0/8");

        assert_eq!(IpCidr::parse("192.168.1.7").unwrap().to_string(), "192.168.1.7/32");
        assert_eq!(IpCidr::parse("2001:db8::1/32").unwrap().to_string(), "2001:db8::/32");
        assert_eq!(IpCidr::parse("::ffff:10.0.0.0/104").unwrap().to_string(), "10.0.0.0/8");

        assert!(IpCidr::parse("10.0.0.0/33").is_err());
        assert!(IpCidr::parse("2001:db8::/129").is_err());
        assert!(IpCidr::parse("not-an-ip").is_err());
        assert!(IpCidr::parse("10.0.0.0/x").is_err());
    }

    #[test]
    fn test_non_octet_aligned_prefixes() {
        let cidr = IpCidr::parse("192.168.0.0/22").unwrap();
        assert!(cidr.contains(ip("192.168.3.255")));
        assert!(!cidr.contains(ip("192.168.4.0")));

        // A string-prefix match would wrongly accept this one.
        let cidr = IpCidr::parse("10.1.0.0/16").unwrap();
        assert!(!cidr.contains(ip("10.10.0.1")));

        let everything = IpCidr::parse("0.0.0.0/0").unwrap();
        assert!(everything.contains(ip("203.0.113.9")));
        assert!(!everything.contains(ip("2001:db8::1")));
    }

    #[test]
    fn test_mapped_addresses_match_ipv4_rules() {
        let cidr = IpCidr::parse("127.0.0.0/8").unwrap();
        assert!(cidr.contains(ip("::ffff:127.0.0.1")));

        let v6 = IpCidr::parse("fe80::/10").unwrap();
        assert!(v6.contains(ip("fe80::1234")));
        assert!(!v6.contains(ip("fec0::1")));
    }

    #[test]
    fn test_whitelist_present_means_default_deny() {
        let filter = IpFilter::with_rules(vec![rule("10.0.0.1", RuleKind::Whitelist)]);
        assert_eq!(filter.evaluate(ip("10.0.0.1")), IpDecision::Allowed);
        assert_eq!(filter.evaluate(ip("10.0.0.2")), IpDecision::NotWhitelisted);
    }

    #[test]
    fn test_first_matching_rule_wins() {
        let filter = IpFilter::with_rules(vec![
            rule("10.0.0.5", RuleKind::Blacklist),
            rule("10.0.0.0/24", RuleKind::Whitelist),
        ]);
        assert!(matches!(filter.evaluate(ip("10.0.0.5")), IpDecision::Blacklisted(_)));
        assert_eq!(filter.evaluate(ip("10.0.0.6")), IpDecision::Allowed);
        assert_eq!(filter.evaluate(ip("10.0.1.1")), IpDecision::NotWhitelisted);

        let filter = IpFilter::with_rules(vec![rule("10.0.0.0/8", RuleKind::Blacklist)]);
        assert_eq!(filter.evaluate(ip("192.0.2.1")), IpDecision::Allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_rules_are_ignored_and_purged() {
        let filter = IpFilter::with_rules(vec![
            rule("10.0.0.1", RuleKind::Blacklist).expires_in(Duration::from_secs(5))
        ]);
        assert!(!filter.evaluate(ip("10.0.0.1")).is_allowed());

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(filter.evaluate(ip("10.0.0.1")).is_allowed());
        assert_eq!(filter.purge_expired(), (1, 0));
        assert!(filter.rules().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_blocks() {
        let filter = IpFilter::new();
        filter.block(ip("198.51.100.1"), None);
        filter.block(ip("198.51.100.2"), Some(Duration::from_secs(10)));

        assert_eq!(filter.evaluate(ip("198.51.100.1")), IpDecision::ManuallyBlocked);
        assert_eq!(filter.evaluate(ip("::ffff:198.51.100.2")), IpDecision::ManuallyBlocked);

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(filter.evaluate(ip("198.51.100.2")).is_allowed());
        assert_eq!(filter.blocked_count(), 1);

        assert!(filter.unblock(ip("198.51.100.1")));
        assert!(!filter.unblock(ip("198.51.100.1")));
        assert!(filter.evaluate(ip("198.51.100.1")).is_allowed());
    }

    #[test]
    fn test_remove_rule() {
        let filter = IpFilter::new();
        filter.add_rule(rule("10.0.0.0/8", RuleKind::Blacklist));
        filter.add_rule(rule("10.0.0.0/8", RuleKind::Whitelist));
        filter.add_rule(rule("172.16.0.0/12", RuleKind::Blacklist));

        assert_eq!(filter.remove_rule(&IpCidr::parse("10.9.9.9/8").unwrap()), 2);
        assert_eq!(filter.rules().len(), 1);
    }
}
