//! Session tracking for both transports.
//!
//! TCP sessions are one-per-connection and keyed by a generated id. UDP has no
//! connections, so a UDP session is a best-effort grouping keyed by the peer's
//! `address:port`, refreshed on each datagram and evicted once idle.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::Instant;
use tracing::debug;

/// Transport a session arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub protocol: Protocol,
    pub remote: SocketAddr,
    pub created_at: Instant,
    pub last_activity: Instant,
    pub metadata: HashMap<String, String>,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub messages_processed: u64,
}

impl Session {
    fn new(protocol: Protocol, remote: SocketAddr) -> Self {
        let now = Instant::now();
        Self {
            id: generate_session_id(),
            protocol,
            remote,
            created_at: now,
            last_activity: now,
            metadata: HashMap::new(),
            bytes_sent: 0,
            bytes_received: 0,
            messages_processed: 0,
        }
    }

    pub fn remote_address(&self) -> String {
        self.remote.ip().to_string()
    }

    pub fn remote_port(&self) -> u16 {
        self.remote.port()
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity)
    }

    fn touch(&mut self) {
        let now = Instant::now();
        // Monotonic clock, but guard anyway so lastActivity never moves back.
        if now > self.last_activity {
            self.last_activity = now;
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionCount {
    pub tcp: usize,
    pub udp: usize,
}

impl SessionCount {
    pub fn total(&self) -> usize {
        self.tcp + self.udp
    }
}

/// 128 random bits plus a millisecond timestamp suffix.
pub fn generate_session_id() -> String {
    let random: u128 = rand::random();
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();
    format!("{random:032x}-{millis:x}")
}

/// Concurrent session map with a secondary index for UDP peers.
#[derive(Debug, Default)]
pub struct SessionStore {
    sessions: DashMap<String, Session>,
    udp_index: DashMap<SocketAddr, String>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a session for a freshly accepted TCP connection.
    pub fn create_session(&self, remote: SocketAddr) -> String {
        let session = Session::new(Protocol::Tcp, remote);
        let id = session.id.clone();
        debug!(session_id = %id, peer = %remote, "Created TCP session");
        self.sessions.insert(id.clone(), session);
        id
    }

    /// Resolve the logical session for a UDP peer, creating it on first sight.
    ///
    /// Returns the session id and whether it was newly created. The peer index
    /// entry is held for the whole lookup so two datagrams racing from the same
    /// peer always agree on one id.
    pub fn get_or_create_for_datagram(&self, remote: SocketAddr) -> (String, bool) {
        match self.udp_index.entry(remote) {
            Entry::Occupied(existing) => {
                let id = existing.get().clone();
                if let Some(mut session) = self.sessions.get_mut(&id) {
                    session.touch();
                    return (id, false);
                }
                // Index points at a session removed elsewhere; replace it.
                let session = Session::new(Protocol::Udp, remote);
                let id = session.id.clone();
                self.sessions.insert(id.clone(), session);
                *existing.into_ref() = id.clone();
                (id, true)
            }
            Entry::Vacant(slot) => {
                let session = Session::new(Protocol::Udp, remote);
                let id = session.id.clone();
                debug!(session_id = %id, peer = %remote, "Created UDP session");
                self.sessions.insert(id.clone(), session);
                slot.insert(id.clone());
                (id, true)
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<Session> {
        self.sessions.get(id).map(|entry| entry.clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sessions.contains_key(id)
    }

    pub fn remove(&self, id: &str) -> bool {
        match self.sessions.remove(id) {
            Some((_, session)) => {
                if session.protocol == Protocol::Udp {
                    self.udp_index
                        .remove_if(&session.remote, |_, indexed| indexed == id);
                }
                debug!(session_id = %id, "Removed session");
                true
            }
            None => false,
        }
    }

    /// Remove the UDP session for `remote`, if one exists.
    pub fn remove_by_address(&self, remote: SocketAddr) -> bool {
        match self.udp_index.remove(&remote) {
            Some((_, id)) => self.sessions.remove(&id).is_some(),
            None => false,
        }
    }

    pub fn count(&self) -> SessionCount {
        let mut count = SessionCount::default();
        for entry in self.sessions.iter() {
            match entry.protocol {
                Protocol::Tcp => count.tcp += 1,
                Protocol::Udp => count.udp += 1,
            }
        }
        count
    }

    pub fn list(&self) -> Vec<Session> {
        self.sessions.iter().map(|entry| entry.clone()).collect()
    }

    pub fn set_metadata(&self, id: &str, key: impl Into<String>, value: impl Into<String>) -> bool {
        match self.sessions.get_mut(id) {
            Some(mut session) => {
                session.metadata.insert(key.into(), value.into());
                true
            }
            None => false,
        }
    }

    /// Account for an inbound chunk. Returns `false` if the session is gone.
    pub fn record_inbound(&self, id: &str, bytes: usize) -> bool {
        match self.sessions.get_mut(id) {
            Some(mut session) => {
                session.bytes_received += bytes as u64;
                session.touch();
                true
            }
            None => false,
        }
    }

    pub fn record_outbound(&self, id: &str, bytes: usize) -> bool {
        match self.sessions.get_mut(id) {
            Some(mut session) => {
                session.bytes_sent += bytes as u64;
                true
            }
            None => false,
        }
    }

    pub fn record_message(&self, id: &str) -> bool {
        match self.sessions.get_mut(id) {
            Some(mut session) => {
                session.messages_processed += 1;
                true
            }
            None => false,
        }
    }

    /// Evict UDP sessions idle for longer than `ttl`, returning their ids.
    pub fn evict_idle_udp(&self, ttl: Duration) -> Vec<String> {
        let now = Instant::now();
        let mut evicted = Vec::new();
        self.sessions.retain(|id, session| {
            let stale = session.protocol == Protocol::Udp && session.idle_for(now) > ttl;
            if stale {
                evicted.push((id.clone(), session.remote));
            }
            !stale
        });

        for (id, remote) in &evicted {
            self.udp_index.remove_if(remote, |_, indexed| indexed == id);
        }

        if !evicted.is_empty() {
            debug!(evicted = evicted.len(), "Evicted idle UDP sessions");
        }
        evicted.into_iter().map(|(id, _)| id).collect()
    }

    /// Drop every session. Used during shutdown.
    pub fn clear(&self) -> usize {
        let count = self.sessions.len();
        self.sessions.clear();
        self.udp_index.clear();
        count
    }
}
