//! Plugin lifecycle and message dispatch.

use futures::FutureExt;
use relay_core::{MessageContext, MetricsSink, Resource, ResourceRegistry, ServiceLocator};
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::plugin::{LegacyAdapter, Plugin, PluginConfig, PluginMetadata, PluginSettings};
use crate::registry::{PluginCandidate, PluginKind, PluginRegistry};
use crate::{panic_to_error, PluginError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginState {
    Initialized,
    Started,
    Stopped,
    Disposed,
    Failed,
}

impl PluginState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => PluginState::Initialized,
            1 => PluginState::Started,
            2 => PluginState::Stopped,
            3 => PluginState::Disposed,
            _ => PluginState::Failed,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            PluginState::Initialized => 0,
            PluginState::Started => 1,
            PluginState::Stopped => 2,
            PluginState::Disposed => 3,
            PluginState::Failed => 4,
        }
    }
}

/// A plugin that passed initialisation.
struct LoadedPlugin {
    metadata: PluginMetadata,
    kind: PluginKind,
    instance: RwLock<Box<dyn Plugin>>,
    config: RwLock<PluginConfig>,
    /// Read on every message, so toggling takes effect immediately.
    enabled: Arc<AtomicBool>,
    state: AtomicU8,
    processed: AtomicU64,
    dropped: AtomicU64,
    failed: AtomicU64,
    loaded_at: SystemTime,
}

impl LoadedPlugin {
    fn name(&self) -> &str {
        &self.metadata.name
    }

    fn state(&self) -> PluginState {
        PluginState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: PluginState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    fn resource_id(&self) -> String {
        format!("plugin:{}", self.metadata.name)
    }
}

/// A plugin built from a candidate but not yet initialised.
struct PendingPlugin {
    metadata: PluginMetadata,
    kind: PluginKind,
    instance: Box<dyn Plugin>,
    config: PluginConfig,
}

/// Outcome of [`PluginManager::load_all`].
#[derive(Debug, Default)]
pub struct LoadReport {
    pub loaded: Vec<String>,
    pub failed: Vec<(String, PluginError)>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PluginStats {
    pub name: String,
    pub version: String,
    pub kind: PluginKind,
    pub state: PluginState,
    pub enabled: bool,
    pub processed: u64,
    pub dropped: u64,
    pub failed: u64,
    pub loaded_at: SystemTime,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PluginSystemStats {
    pub total_plugins: usize,
    pub enabled_plugins: usize,
    pub plugins: Vec<PluginStats>,
}

/// Owns every loaded plugin, in load order.
pub struct PluginManager {
    services: Arc<ServiceLocator>,
    resources: Option<Arc<ResourceRegistry>>,
    metrics: Option<Arc<dyn MetricsSink>>,
    plugins: RwLock<Vec<Arc<LoadedPlugin>>>,
}

impl PluginManager {
    pub fn new(services: Arc<ServiceLocator>) -> Self {
        Self {
            services,
            resources: None,
            metrics: None,
            plugins: RwLock::new(Vec::new()),
        }
    }

    /// Track each loaded plugin as a `plugin` resource. Disposing it through
    /// the registry disables the plugin.
    pub fn with_resources(mut self, resources: Arc<ResourceRegistry>) -> Self {
        self.resources = Some(resources);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Discover, build and initialise plugins from `registry`.
    ///
    /// Phase 1 builds every instance with its resolved config (schema
    /// defaults overlaid with `settings`). Phase 2 initialises them in order.
    /// A failure at either phase drops that plugin only.
    pub async fn load_all(
        &self,
        registry: &PluginRegistry,
        settings: &HashMap<String, PluginSettings>,
        enabled: Option<&[String]>,
    ) -> LoadReport {
        let mut report = LoadReport::default();
        let (discovered, rejected) = registry.discover(enabled);
        for err in rejected {
            report.failed.push((err_subject(&err), err));
        }

        info!(
            "Starting two-phase plugin loading for {} discovered plugins",
            discovered.len()
        );

        // Phase 1: build instances
        let mut pending = Vec::new();
        for discovery in discovered {
            let name = discovery.metadata.name.clone();
            if self.get(&name).await.is_some() {
                warn!(plugin = %name, "Plugin is already loaded");
                report.failed.push((name.clone(), PluginError::AlreadyLoaded(name)));
                continue;
            }

            let built = self.build(
                discovery.metadata,
                discovery.kind,
                discovery.candidate,
                settings.get(&name),
            );
            match built {
                Ok(plugin) => {
                    debug!(
                        plugin = %name,
                        version = %plugin.metadata.version,
                        "Created plugin instance"
                    );
                    pending.push(plugin);
                }
                Err(e) => {
                    error!(plugin = %name, "Failed to create plugin instance: {}", e);
                    report.failed.push((name, e));
                }
            }
        }

        info!("Phase 1 complete: {} plugin instances created", pending.len());

        // Phase 2: initialise
        for mut plugin in pending {
            let name = plugin.metadata.name.clone();
            let result = guarded(plugin.instance.initialize(self.services.clone())).await;
            match result {
                Ok(()) => {
                    info!(plugin = %name, version = %plugin.metadata.version, "Plugin initialized");
                    self.install(plugin).await;
                    report.loaded.push(name);
                }
                Err(e) => {
                    error!(plugin = %name, "Plugin initialization failed: {}", e);
                    report.failed.push((name, e));
                }
            }
        }

        if !report.failed.is_empty() {
            warn!("Failed to load {} plugins", report.failed.len());
            for (name, error) in &report.failed {
                warn!("  {}: {}", name, error);
            }
        }

        info!(
            "🔌 Plugin loading complete: {} plugins loaded",
            report.loaded.len()
        );
        report
    }

    /// Start every initialised plugin. Returns how many started.
    pub async fn start_all(&self) -> usize {
        let mut started = 0;
        for plugin in self.snapshot().await {
            if plugin.state() != PluginState::Initialized {
                continue;
            }
            let result = {
                let mut instance = plugin.instance.write().await;
                guarded(instance.start()).await
            };
            match result {
                Ok(()) => {
                    plugin.set_state(PluginState::Started);
                    started += 1;
                    debug!(plugin = plugin.name(), "Plugin started");
                }
                Err(e) => {
                    plugin.set_state(PluginState::Failed);
                    plugin.enabled.store(false, Ordering::Release);
                    error!(plugin = plugin.name(), "Plugin failed to start: {}", e);
                }
            }
        }
        info!("▶️ Started {} plugins", started);
        started
    }

    /// Stop running plugins, last loaded first.
    pub async fn stop_all(&self) -> usize {
        let mut stopped = 0;
        for plugin in self.snapshot().await.iter().rev() {
            if plugin.state() != PluginState::Started {
                continue;
            }
            let result = {
                let mut instance = plugin.instance.write().await;
                guarded(instance.stop()).await
            };
            if let Err(e) = result {
                error!(plugin = plugin.name(), "Error stopping plugin: {}", e);
            }
            plugin.set_state(PluginState::Stopped);
            stopped += 1;
        }
        stopped
    }

    /// Dispose every plugin not yet disposed, last loaded first.
    pub async fn dispose_all(&self) -> usize {
        let mut disposed = 0;
        for plugin in self.snapshot().await.iter().rev() {
            if plugin.state() == PluginState::Disposed {
                continue;
            }
            let result = {
                let mut instance = plugin.instance.write().await;
                guarded(instance.dispose()).await
            };
            if let Err(e) = result {
                error!(plugin = plugin.name(), "Error disposing plugin: {}", e);
            }
            plugin.set_state(PluginState::Disposed);
            plugin.enabled.store(false, Ordering::Release);
            if let Some(resources) = &self.resources {
                resources.dispose(&plugin.resource_id());
            }
            disposed += 1;
        }
        disposed
    }

    /// `stop_all` followed by `dispose_all`.
    pub async fn shutdown(&self) {
        let stopped = self.stop_all().await;
        let disposed = self.dispose_all().await;
        info!(stopped, disposed, "🛑 Plugins shut down");
    }

    /// Feed `ctx` through every enabled, running plugin in load order.
    ///
    /// Returns `None` as soon as a plugin drops the message. A plugin error or
    /// panic is logged and the next plugin receives the context as it was
    /// before the failing plugin ran.
    pub async fn process_message(&self, ctx: MessageContext) -> Option<MessageContext> {
        let mut current = ctx;
        for plugin in self.snapshot().await {
            if !plugin.enabled.load(Ordering::Acquire) || plugin.state() != PluginState::Started {
                continue;
            }

            let outcome = {
                let instance = plugin.instance.read().await;
                guarded(instance.process(current.clone())).await
            };

            match outcome {
                Ok(Some(next)) => {
                    plugin.processed.fetch_add(1, Ordering::Relaxed);
                    self.count(plugin.name(), "processed");
                    current = next;
                }
                Ok(None) => {
                    plugin.dropped.fetch_add(1, Ordering::Relaxed);
                    self.count(plugin.name(), "dropped");
                    debug!(
                        plugin = plugin.name(),
                        session_id = %current.session_id,
                        "Message dropped by plugin"
                    );
                    return None;
                }
                Err(e) => {
                    plugin.failed.fetch_add(1, Ordering::Relaxed);
                    self.count(plugin.name(), "failed");
                    error!(
                        plugin = plugin.name(),
                        session_id = %current.session_id,
                        "Plugin failed to process message: {}",
                        e
                    );
                }
            }
        }
        Some(current)
    }

    pub async fn enable(&self, name: &str) -> Result<(), PluginError> {
        self.set_enabled(name, true).await
    }

    pub async fn disable(&self, name: &str) -> Result<(), PluginError> {
        self.set_enabled(name, false).await
    }

    pub async fn is_enabled(&self, name: &str) -> Option<bool> {
        self.get(name)
            .await
            .map(|plugin| plugin.enabled.load(Ordering::Acquire))
    }

    /// Validate `partial` against the plugin's schema, merge it, and notify the
    /// plugin. If the plugin rejects the update the previous settings stay.
    pub async fn update_config(
        &self,
        name: &str,
        partial: PluginSettings,
    ) -> Result<PluginConfig, PluginError> {
        let plugin = self
            .get(name)
            .await
            .ok_or_else(|| PluginError::NotFound(name.to_string()))?;

        plugin
            .metadata
            .validate_settings(&partial)
            .map_err(|reason| PluginError::InvalidConfig {
                plugin: name.to_string(),
                reason,
            })?;

        let mut config = plugin.config.write().await;
        let mut merged = config.settings.clone();
        for (key, value) in partial {
            merged.insert(key, value);
        }

        {
            let mut instance = plugin.instance.write().await;
            guarded(instance.on_config_update(&merged)).await?;
        }

        config.settings = merged;
        info!(plugin = %name, "Plugin configuration updated");
        Ok(config.clone())
    }

    pub async fn config(&self, name: &str) -> Option<PluginConfig> {
        let plugin = self.get(name).await?;
        let config = plugin.config.read().await;
        Some(config.clone())
    }

    pub async fn plugin_names(&self) -> Vec<String> {
        self.plugins
            .read()
            .await
            .iter()
            .map(|plugin| plugin.metadata.name.clone())
            .collect()
    }

    pub async fn stats(&self) -> PluginSystemStats {
        let plugins: Vec<PluginStats> = self
            .snapshot()
            .await
            .iter()
            .map(|plugin| PluginStats {
                name: plugin.metadata.name.clone(),
                version: plugin.metadata.version.clone(),
                kind: plugin.kind,
                state: plugin.state(),
                enabled: plugin.enabled.load(Ordering::Acquire),
                processed: plugin.processed.load(Ordering::Relaxed),
                dropped: plugin.dropped.load(Ordering::Relaxed),
                failed: plugin.failed.load(Ordering::Relaxed),
                loaded_at: plugin.loaded_at,
            })
            .collect();

        PluginSystemStats {
            total_plugins: plugins.len(),
            enabled_plugins: plugins.iter().filter(|p| p.enabled).count(),
            plugins,
        }
    }

    fn build(
        &self,
        metadata: PluginMetadata,
        kind: PluginKind,
        candidate: PluginCandidate,
        overrides: Option<&PluginSettings>,
    ) -> Result<PendingPlugin, PluginError> {
        if let Some(overrides) = overrides {
            metadata
                .validate_settings(overrides)
                .map_err(|reason| PluginError::InvalidConfig {
                    plugin: metadata.name.clone(),
                    reason,
                })?;
        }
        let config = PluginConfig::resolve(&metadata, overrides);

        let instance = match candidate {
            PluginCandidate::Factory(factory) => {
                let services = self.services.clone();
                catch_unwind(AssertUnwindSafe(|| factory.create(services, &config)))
                    .map_err(panic_to_error)??
            }
            PluginCandidate::Legacy(legacy) => Box::new(LegacyAdapter::new(legacy)),
        };

        if instance.name() != metadata.name {
            warn!(
                plugin = %metadata.name,
                instance_name = instance.name(),
                "Plugin instance reports a different name than its metadata"
            );
        }

        Ok(PendingPlugin {
            metadata,
            kind,
            instance,
            config,
        })
    }

    async fn install(&self, pending: PendingPlugin) {
        let plugin = Arc::new(LoadedPlugin {
            metadata: pending.metadata,
            kind: pending.kind,
            instance: RwLock::new(pending.instance),
            config: RwLock::new(pending.config),
            enabled: Arc::new(AtomicBool::new(true)),
            state: AtomicU8::new(PluginState::Initialized.as_u8()),
            processed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            loaded_at: SystemTime::now(),
        });

        if let Some(resources) = &self.resources {
            let enabled = plugin.enabled.clone();
            resources.register(
                Resource::new(plugin.resource_id(), "plugin", move || {
                    enabled.store(false, Ordering::Release);
                    Ok(())
                })
                .with_metadata("version", plugin.metadata.version.clone()),
            );
        }

        self.plugins.write().await.push(plugin);
    }

    async fn set_enabled(&self, name: &str, enabled: bool) -> Result<(), PluginError> {
        let plugin = self
            .get(name)
            .await
            .ok_or_else(|| PluginError::NotFound(name.to_string()))?;
        plugin.enabled.store(enabled, Ordering::Release);
        plugin.config.write().await.enabled = enabled;
        info!(plugin = %name, enabled, "Plugin toggled");
        Ok(())
    }

    async fn get(&self, name: &str) -> Option<Arc<LoadedPlugin>> {
        self.plugins
            .read()
            .await
            .iter()
            .find(|plugin| plugin.metadata.name == name)
            .cloned()
    }

    async fn snapshot(&self) -> Vec<Arc<LoadedPlugin>> {
        self.plugins.read().await.clone()
    }

    fn count(&self, plugin: &str, outcome: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.increment_counter(
                "relay_plugin_messages_total",
                &[("plugin", plugin), ("outcome", outcome)],
                1,
            );
        }
    }
}

/// Await a plugin future, turning a panic into [`PluginError::Runtime`].
async fn guarded<T, F>(future: F) -> Result<T, PluginError>
where
    F: Future<Output = Result<T, PluginError>>,
{
    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => Err(panic_to_error(panic)),
    }
}

fn err_subject(err: &PluginError) -> String {
    match err {
        PluginError::AlreadyLoaded(name) | PluginError::NotFound(name) => name.clone(),
        PluginError::InvalidConfig { plugin, .. } => plugin.clone(),
        _ => String::from("unknown"),
    }
}
