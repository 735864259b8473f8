//! Fixed-window request counting per identifier.

use dashmap::DashMap;
use std::time::Duration;
use tokio::time::Instant;

use super::config::RateLimitConfig;
use crate::session::Protocol;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitEntry {
    pub identifier: String,
    pub window_reset_at: Instant,
    pub request_count: u32,
    pub blocked: bool,
    pub block_until: Option<Instant>,
}

impl RateLimitEntry {
    fn new(identifier: String, now: Instant, window: Duration) -> Self {
        Self {
            identifier,
            window_reset_at: now + window,
            request_count: 0,
            blocked: false,
            block_until: None,
        }
    }

    fn reset_window(&mut self, now: Instant, window: Duration) {
        self.window_reset_at = now + window;
        self.request_count = 0;
        self.blocked = false;
        self.block_until = None;
    }
}

#[derive(Debug)]
pub struct RateLimiter {
    max_requests: u32,
    window: Duration,
    block_duration: Option<Duration>,
    per_protocol: bool,
    entries: DashMap<String, RateLimitEntry>,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            max_requests: config.max_requests,
            window: config.window(),
            block_duration: config.block_duration(),
            per_protocol: config.per_protocol,
            entries: DashMap::new(),
        }
    }

    /// Count one request and report whether it is within the limit.
    ///
    /// While blocked, calls are denied without being counted. A block without
    /// a fixed duration lifts when the window resets.
    pub fn check(&self, identifier: &str, protocol: Protocol) -> bool {
        let key = self.key(identifier, protocol);
        let now = Instant::now();
        let window = self.window;

        let mut entry = self
            .entries
            .entry(key)
            .or_insert_with(|| RateLimitEntry::new(identifier.to_string(), now, window));

        if entry.blocked {
            let still_blocked = match entry.block_until {
                Some(until) => now < until,
                None => now <= entry.window_reset_at,
            };
            if still_blocked {
                return false;
            }
            entry.reset_window(now, window);
        }

        if now > entry.window_reset_at {
            entry.reset_window(now, window);
        }

        entry.request_count += 1;
        if entry.request_count > self.max_requests {
            entry.blocked = true;
            entry.block_until = self.block_duration.map(|d| now + d);
            return false;
        }
        true
    }

    pub fn entry(&self, identifier: &str, protocol: Protocol) -> Option<RateLimitEntry> {
        self.entries
            .get(&self.key(identifier, protocol))
            .map(|entry| entry.clone())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove entries whose window has passed and that are not serving a block.
    ///
    /// Runs under each shard's write lock, so a concurrent `check` either lands
    /// before the sweep sees the entry or creates a fresh one after it.
    pub fn purge_idle(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| {
            let block_active = entry.blocked && entry.block_until.is_some_and(|until| now < until);
            block_active || now <= entry.window_reset_at
        });
        before.saturating_sub(self.entries.len())
    }

    fn key(&self, identifier: &str, protocol: Protocol) -> String {
        if self.per_protocol {
            format!("{identifier}:{protocol}")
        } else {
            identifier.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(max_requests: u32, window_ms: u64, block_duration_ms: u64) -> RateLimiter {
        RateLimiter::new(&RateLimitConfig {
            enabled: true,
            max_requests,
            window_ms,
            block_duration_ms,
            per_protocol: false,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_eleventh_request_denied_then_window_resets() {
        let limiter = limiter(10, 60_000, 0);
        for _ in 0..10 {
            assert!(limiter.check("10.0.0.1", Protocol::Tcp));
        }
        assert!(!limiter.check("10.0.0.1", Protocol::Tcp));
        // Denied calls while blocked are not counted.
        assert!(!limiter.check("10.0.0.1", Protocol::Tcp));
        assert_eq!(limiter.entry("10.0.0.1", Protocol::Tcp).unwrap().request_count, 11);

        tokio::time::advance(Duration::from_millis(60_001)).await;
        assert!(limiter.check("10.0.0.1", Protocol::Tcp));
        let entry = limiter.entry("10.0.0.1", Protocol::Tcp).unwrap();
        assert_eq!(entry.request_count, 1);
        assert!(!entry.blocked);
    }

    #[tokio::test(start_paused = true)]
    async fn test_block_duration_outlasts_window() {
        let limiter = limiter(1, 1_000, 5_000);
        assert!(limiter.check("peer", Protocol::Udp));
        assert!(!limiter.check("peer", Protocol::Udp));

        tokio::time::advance(Duration::from_millis(2_000)).await;
        assert!(!limiter.check("peer", Protocol::Udp));

        tokio::time::advance(Duration::from_millis(3_500)).await;
        assert!(limiter.check("peer", Protocol::Udp));
    }

    #[test]
    fn test_identifiers_are_independent() {
        let limiter = limiter(1, 60_000, 0);
        assert!(limiter.check("a", Protocol::Tcp));
        assert!(limiter.check("b", Protocol::Tcp));
        assert!(!limiter.check("a", Protocol::Udp));
    }

    #[test]
    fn test_per_protocol_keys() {
        let limiter = RateLimiter::new(&RateLimitConfig {
            max_requests: 1,
            per_protocol: true,
            ..RateLimitConfig::default()
        });
        assert!(limiter.check("a", Protocol::Tcp));
        assert!(limiter.check("a", Protocol::Udp));
        assert!(!limiter.check("a", Protocol::Tcp));
        assert_eq!(limiter.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_idle_keeps_active_blocks() {
        let limiter = limiter(1, 1_000, 10_000);
        limiter.check("idle", Protocol::Tcp);
        limiter.check("blocked", Protocol::Tcp);
        limiter.check("blocked", Protocol::Tcp);

        tokio::time::advance(Duration::from_millis(1_500)).await;
        assert_eq!(limiter.purge_idle(), 1);
        assert!(limiter.entry("idle", Protocol::Tcp).is_none());
        assert!(limiter.entry("blocked", Protocol::Tcp).is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_purge_never_loses_concurrent_counts() {
        use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
        use std::sync::Arc;

        let limiter = Arc::new(limiter(100_000, 60_000, 0));
        let allowed = Arc::new(AtomicU32::new(0));
        let done = Arc::new(AtomicBool::new(false));
        assert!(limiter.check("10.0.0.9", Protocol::Udp));
        let window = limiter.entry("10.0.0.9", Protocol::Udp).unwrap().window_reset_at;

        let purger = {
            let limiter = limiter.clone();
            let done = done.clone();
            tokio::spawn(async move {
                while !done.load(Ordering::Acquire) {
                    limiter.purge_idle();
                    tokio::task::yield_now().await;
                }
            })
        };

        let mut workers = Vec::new();
        for _ in 0..8 {
            let limiter = limiter.clone();
            let allowed = allowed.clone();
            workers.push(tokio::spawn(async move {
                for i in 0..500 {
                    if limiter.check("10.0.0.9", Protocol::Udp) {
                        allowed.fetch_add(1, Ordering::Relaxed);
                    }
                    if i % 50 == 0 {
                        tokio::task::yield_now().await;
                    }
                }
            }));
        }
        for worker in workers {
            worker.await.unwrap();
        }
        done.store(true, Ordering::Release);
        purger.await.unwrap();

        let entry = limiter.entry("10.0.0.9", Protocol::Udp).unwrap();
        assert_eq!(allowed.load(Ordering::Relaxed), 4_000);
        assert_eq!(entry.request_count, 4_001);
        assert_eq!(entry.window_reset_at, window);
        assert!(!entry.blocked);
    }
}
