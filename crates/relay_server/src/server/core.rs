//! Core relay server implementation.
//!
//! `RelayServer` owns the shared stores, wires the message pipeline
//! (plugins first, then the router) and runs the listeners, sweeps and
//! shutdown sequence.

use plugin_system::{LoadReport, PluginManager, PluginRegistry, PluginSettings, PluginStage};
use relay_core::{
    ErrorHandler, InMemoryMetrics, MessagePipeline, ResourceRegistry, Router, RouterStage,
    SecurityManager, SecurityPipeline, ServiceLocator, SessionStore,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{error, info, warn};

use super::listener::{bind_tcp_listeners, bind_udp};
use super::state::{RelayState, TCP_RESOURCE_TYPE, UDP_RESOURCE_TYPE};
use super::{sweep, tcp, udp};
use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::stats::ServerStats;

const CONNECTION_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Addresses the listeners actually bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BoundAddrs {
    pub tcp: Option<SocketAddr>,
    pub udp: Option<SocketAddr>,
}

/// The relay server.
///
/// # Lifecycle
///
/// 1. [`new`](Self::new) builds every store and the pipeline.
/// 2. [`load_plugins`](Self::load_plugins) discovers and initialises plugins.
/// 3. [`start`](Self::start) binds listeners, starts plugins and spawns the
///    accept loops and sweeps. A bind failure aborts startup.
/// 4. [`shutdown`](Self::shutdown) stops accepting, force-closes
///    connections, waits for in-flight datagrams, clears sessions, shuts
///    plugins down and finally disposes whatever the resource registry
///    still holds.
pub struct RelayServer {
    state: Arc<RelayState>,
    services: Arc<ServiceLocator>,
    plugin_manager: Arc<PluginManager>,
    router: Arc<Router>,
    shutdown_sender: broadcast::Sender<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl RelayServer {
    pub fn new(config: ServerConfig) -> Result<Self, ServerError> {
        if config.tcp_bind.is_none() && config.udp_bind.is_none() {
            return Err(ServerError::Config(
                "at least one of tcp_bind or udp_bind must be set".to_string(),
            ));
        }
        if config.max_connections == 0 {
            return Err(ServerError::Config("max_connections must be > 0".to_string()));
        }

        let metrics = Arc::new(InMemoryMetrics::new());
        let sessions = Arc::new(SessionStore::new());
        let resources = Arc::new(ResourceRegistry::new());
        let security = Arc::new(
            SecurityManager::new(config.security.clone())
                .map_err(|e| ServerError::Config(e.to_string()))?,
        );
        let errors = Arc::new(ErrorHandler::new().with_metrics(metrics.clone()));

        let services = Arc::new(ServiceLocator::new());
        services.register_singleton("sessions", sessions.clone());
        services.register_singleton("resources", resources.clone());
        services.register_singleton("security", security.clone());
        services.register_singleton("metrics", metrics.clone());
        services.register_singleton("errors", errors.clone());

        let plugin_manager = Arc::new(
            PluginManager::new(services.clone())
                .with_resources(resources.clone())
                .with_metrics(metrics.clone()),
        );
        let router = Arc::new(
            Router::with_builtin_routes(sessions.clone()).with_metrics(metrics.clone()),
        );
        let pipeline = MessagePipeline::new()
            .stage(PluginStage::new(plugin_manager.clone()))
            .stage(RouterStage::new(router.clone()));

        let state = Arc::new(RelayState {
            connection_gate: SecurityPipeline::for_connections(security.clone()),
            datagram_gate: SecurityPipeline::for_datagrams(security.clone()),
            config,
            sessions,
            resources,
            security,
            errors,
            metrics,
            pipeline,
            active_connections: AtomicUsize::new(0),
            connections: Mutex::new(JoinSet::new()),
            datagrams: Mutex::new(JoinSet::new()),
        });
        let (shutdown_sender, _) = broadcast::channel(1);

        Ok(Self {
            state,
            services,
            plugin_manager,
            router,
            shutdown_sender,
            tasks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        })
    }

    /// Discover and initialise plugins from `registry`.
    ///
    /// `settings` overrides schema defaults per plugin name; `enabled`
    /// restricts loading to the listed names.
    pub async fn load_plugins(
        &self,
        registry: &PluginRegistry,
        settings: &HashMap<String, PluginSettings>,
        enabled: Option<&[String]>,
    ) -> LoadReport {
        info!("🔌 Loading plugins from {} registered source(s)", registry.len());
        let report = self.plugin_manager.load_all(registry, settings, enabled).await;
        if report.loaded.is_empty() {
            info!("📭 No plugins loaded");
        } else {
            info!(
                "🎉 Successfully loaded {} plugin(s): {:?}",
                report.loaded.len(),
                report.loaded
            );
        }
        for (name, e) in &report.failed {
            warn!(plugin = %name, "Plugin failed to load: {}", e);
        }
        report
    }

    /// Bind listeners and spawn every background task.
    pub async fn start(&self) -> Result<BoundAddrs, ServerError> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(ServerError::Internal("server has been shut down".to_string()));
        }
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(ServerError::Internal("server already started".to_string()));
        }

        let config = &self.state.config;
        let mut bound = BoundAddrs::default();

        let listeners = match config.tcp_bind {
            Some(addr) => {
                let core_count = num_cpus::get();
                info!(
                    "🧠 Detected {} CPU cores, using {} acceptor(s)",
                    core_count,
                    if config.use_reuse_port { core_count } else { 1 }
                );
                let listeners = bind_tcp_listeners(addr, config.use_reuse_port, core_count)?;
                bound.tcp = listeners
                    .first()
                    .and_then(|listener| listener.local_addr().ok());
                listeners
            }
            None => Vec::new(),
        };
        let udp_socket = match config.udp_bind {
            Some(addr) => {
                let socket = Arc::new(bind_udp(addr).await?);
                bound.udp = socket.local_addr().ok();
                Some(socket)
            }
            None => None,
        };

        let started_plugins = self.plugin_manager.start_all().await;
        info!(started_plugins, "🔌 Plugins started");

        let mut tasks = self.tasks.lock().await;
        for listener in listeners {
            tasks.push(tokio::spawn(tcp::accept_loop(
                listener,
                self.state.clone(),
                self.shutdown_sender.subscribe(),
            )));
        }
        if let Some(socket) = udp_socket {
            tasks.push(tokio::spawn(udp::receive_loop(
                socket,
                self.state.clone(),
                self.shutdown_sender.subscribe(),
            )));
        }
        tasks.extend(sweep::spawn_sweeps(&self.state, &self.shutdown_sender));

        info!(
            tcp = ?bound.tcp,
            udp = ?bound.udp,
            "🚀 Relay server started"
        );
        Ok(bound)
    }

    /// Stop the server. Safe to call more than once.
    pub async fn shutdown(&self) -> Result<(), ServerError> {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        info!("🛑 Shutting down relay server...");

        // 1. Stop accepting new work.
        let _ = self.shutdown_sender.send(());
        let tasks: Vec<_> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                error!("Background task ended abnormally: {}", e);
            }
        }

        // 2. Force-close every live connection and wait for their teardown.
        let closed = self.state.resources.dispose_by_type(TCP_RESOURCE_TYPE);
        info!(closed, "🔌 Closing TCP connections");
        {
            let mut connections = self.state.connections.lock().await;
            let drained = tokio::time::timeout(CONNECTION_DRAIN_TIMEOUT, async {
                while connections.join_next().await.is_some() {}
            })
            .await;
            if drained.is_err() {
                warn!("Connections did not close in time, aborting them");
                connections.abort_all();
            }
        }
        // The receive loop has stopped; let in-flight datagrams finish.
        {
            let mut datagrams = self.state.datagrams.lock().await;
            let drained = tokio::time::timeout(CONNECTION_DRAIN_TIMEOUT, async {
                while datagrams.join_next().await.is_some() {}
            })
            .await;
            if drained.is_err() {
                warn!("Datagram handlers did not finish in time, aborting them");
                datagrams.abort_all();
            }
        }
        self.state.resources.dispose_by_type(UDP_RESOURCE_TYPE);

        // 3. Flush the session store.
        let cleared = self.state.sessions.clear();
        info!(cleared, "🧹 Session store cleared");

        // 4. Plugins are business-level resources; stop them before the final sweep.
        self.plugin_manager.shutdown().await;

        // 5. Whatever is still registered goes now.
        let disposal = self.state.resources.dispose_all();
        self.services.dispose();

        info!(
            disposed = disposal.disposed,
            active = disposal.active,
            "✅ Relay server stopped"
        );
        Ok(())
    }

    /// Point-in-time view of every subsystem.
    pub async fn stats(&self) -> ServerStats {
        self.state.record_session_gauges();
        ServerStats {
            sessions: self.state.sessions.count(),
            active_connections: self.state.active_connections(),
            resources: self.state.resources.stats(),
            security: self.state.security.stats(),
            plugins: self.plugin_manager.stats().await,
            errors: self.state.errors.get_stats(),
            routes: self.router.stats(),
            metrics: self.state.metrics.snapshot(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::Acquire) && !self.stopped.load(Ordering::Acquire)
    }

    pub fn config(&self) -> &ServerConfig {
        &self.state.config
    }

    pub fn sessions(&self) -> Arc<SessionStore> {
        self.state.sessions.clone()
    }

    pub fn resources(&self) -> Arc<ResourceRegistry> {
        self.state.resources.clone()
    }

    pub fn security(&self) -> Arc<SecurityManager> {
        self.state.security.clone()
    }

    pub fn metrics(&self) -> Arc<InMemoryMetrics> {
        self.state.metrics.clone()
    }

    pub fn services(&self) -> Arc<ServiceLocator> {
        self.services.clone()
    }

    pub fn plugin_manager(&self) -> Arc<PluginManager> {
        self.plugin_manager.clone()
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> &Arc<RelayState> {
        &self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_config_without_listeners() {
        let config = ServerConfig {
            tcp_bind: None,
            udp_bind: None,
            ..ServerConfig::default()
        };
        assert!(matches!(RelayServer::new(config), Err(ServerError::Config(_))));
    }

    #[test]
    fn test_rejects_malformed_ip_rules() {
        let mut config = ServerConfig::ephemeral();
        config.security.ip_filter.rules.push(relay_core::security::IpRuleConfig {
            cidr: "10.0.0.0/99".into(),
            kind: relay_core::security::RuleKind::Blacklist,
            description: None,
            expires_in_ms: None,
        });
        assert!(matches!(RelayServer::new(config), Err(ServerError::Config(_))));
    }

    #[tokio::test]
    async fn test_services_are_registered() {
        let server = RelayServer::new(ServerConfig::ephemeral()).unwrap();
        let services = server.services();
        for key in ["sessions", "resources", "security", "metrics", "errors"] {
            assert!(services.has(key), "missing service {key}");
        }
        assert!(services.resolve::<SessionStore>("sessions").is_some());
    }

    #[tokio::test]
    async fn test_start_twice_and_shutdown_twice() {
        let server = RelayServer::new(ServerConfig::ephemeral()).unwrap();
        let bound = server.start().await.unwrap();
        assert!(bound.tcp.is_some() && bound.udp.is_some());
        assert!(server.is_running());
        assert!(matches!(server.start().await, Err(ServerError::Internal(_))));

        server.shutdown().await.unwrap();
        server.shutdown().await.unwrap();
        assert!(!server.is_running());
        assert!(server.resources().is_shutting_down());
        assert_eq!(server.resources().active_count(), 0);
        assert!(matches!(server.start().await, Err(ServerError::Internal(_))));
    }
}
