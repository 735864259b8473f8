//! Concurrent connection caps per IP.

use dashmap::DashMap;
use std::net::IpAddr;

#[derive(Debug)]
pub struct ConnectionLimiter {
    max_per_ip: u32,
    active: DashMap<IpAddr, u32>,
}

impl ConnectionLimiter {
    pub fn new(max_per_ip: u32) -> Self {
        Self {
            max_per_ip,
            active: DashMap::new(),
        }
    }

    /// Take a slot for `ip`. Denies once the ip is at the cap.
    pub fn try_acquire(&self, ip: IpAddr) -> bool {
        let mut count = self.active.entry(ip).or_insert(0);
        if *count >= self.max_per_ip {
            return false;
        }
        *count += 1;
        true
    }

    /// Give back a slot. Floors at zero and forgets idle addresses.
    pub fn release(&self, ip: IpAddr) {
        if let Some(mut count) = self.active.get_mut(&ip) {
            *count = count.saturating_sub(1);
        }
        self.active.remove_if(&ip, |_, count| *count == 0);
    }

    pub fn count(&self, ip: IpAddr) -> u32 {
        self.active.get(&ip).map(|count| *count).unwrap_or(0)
    }

    pub fn total(&self) -> u64 {
        self.active.iter().map(|entry| u64::from(*entry.value())).sum()
    }
}
