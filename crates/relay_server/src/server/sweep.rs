//! Periodic maintenance: UDP idle eviction, resource purge, security purge.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info};

use super::state::{udp_resource_id, RelayState};

/// Evict UDP sessions idle past the TTL and dispose their resources.
pub(crate) fn sweep_idle_udp(state: &RelayState) -> usize {
    let evicted = state.sessions.evict_idle_udp(state.config.udp_session_ttl);
    for session_id in &evicted {
        state.resources.dispose(&udp_resource_id(session_id));
    }
    if !evicted.is_empty() {
        info!(evicted = evicted.len(), "🧹 Evicted idle UDP sessions");
    }
    state.record_session_gauges();
    evicted.len()
}

pub(crate) fn sweep_resources(state: &RelayState) -> usize {
    state.resources.cleanup_disposed()
}

pub(crate) fn sweep_security(state: &RelayState) {
    let stats = state.security.sweep();
    if stats.expired_rules + stats.expired_blocks + stats.idle_rate_limits > 0 {
        debug!(
            expired_rules = stats.expired_rules,
            expired_blocks = stats.expired_blocks,
            idle_rate_limits = stats.idle_rate_limits,
            "🛡️ Security sweep purged entries"
        );
    }
}

pub(crate) fn spawn_sweeps(
    state: &Arc<RelayState>,
    shutdown: &broadcast::Sender<()>,
) -> Vec<JoinHandle<()>> {
    let config = &state.config;
    let mut handles = Vec::new();

    if config.udp_bind.is_some() {
        let s = state.clone();
        handles.push(spawn_periodic(
            "udp-idle",
            config.udp_sweep_interval,
            shutdown.subscribe(),
            move || {
                sweep_idle_udp(&s);
            },
        ));
    }

    let s = state.clone();
    handles.push(spawn_periodic(
        "resources",
        config.resource_sweep_interval,
        shutdown.subscribe(),
        move || {
            sweep_resources(&s);
        },
    ));

    let s = state.clone();
    handles.push(spawn_periodic(
        "security",
        config.security_sweep_interval,
        shutdown.subscribe(),
        move || {
            sweep_security(&s);
        },
    ));

    handles
}

/// Run `tick` every `period` until shutdown. The first run happens one
/// period after spawning.
fn spawn_periodic<F>(
    name: &'static str,
    period: Duration,
    mut shutdown: broadcast::Receiver<()>,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() + Send + 'static,
{
    let period = period.max(Duration::from_millis(1));
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = ticker.tick() => tick(),
            }
        }
        debug!(sweep = name, "Sweep stopped");
    })
}
