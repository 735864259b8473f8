use plugin_system::PluginSystemStats;
use relay_core::{ErrorStats, MetricsSnapshot, RegistryStats, RouteStats, SecurityStats, SessionCount};

/// Snapshot returned by [`RelayServer::stats`](crate::RelayServer::stats).
#[derive(Debug, Clone)]
pub struct ServerStats {
    pub sessions: SessionCount,
    pub active_connections: usize,
    pub resources: RegistryStats,
    pub security: SecurityStats,
    pub plugins: PluginSystemStats,
    pub errors: ErrorStats,
    pub routes: Vec<RouteStats>,
    pub metrics: MetricsSnapshot,
}

impl ServerStats {
    /// Messages that went through the pipeline, summed over protocol and outcome.
    pub fn messages_processed(&self) -> u64 {
        self.metrics
            .counters
            .iter()
            .filter(|(series, _)| series.starts_with("relay_messages_total{"))
            .map(|(_, value)| *value)
            .sum()
    }

    pub fn security_denials(&self) -> u64 {
        self.security.stages.values().map(|stage| stage.denied).sum()
    }
}
