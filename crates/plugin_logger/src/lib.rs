use async_trait::async_trait;
use plugin_system::{
    ConfigField, Plugin, PluginConfig, PluginError, PluginFactory, PluginMetadata,
    PluginSettings, SettingType,
};
use relay_core::{InMemoryMetrics, MessageContext, MetricsSink, ServiceLocator};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, trace};

// ============================================================================
// Logger Plugin
// ============================================================================

pub const NAME: &str = "logger";

/// Logs every message passing through the relay and tags it with a sequence
/// number.
pub struct LoggerPlugin {
    settings: LoggerSettings,
    messages_logged: AtomicU64,
    metrics: Option<Arc<InMemoryMetrics>>,
}

#[derive(Debug, Clone, PartialEq)]
struct LoggerSettings {
    level: String,
    preview_bytes: usize,
    tag_messages: bool,
}

impl LoggerSettings {
    fn from_settings(settings: &PluginSettings) -> Self {
        Self {
            level: settings
                .get("level")
                .and_then(Value::as_str)
                .unwrap_or("info")
                .to_string(),
            preview_bytes: settings
                .get("preview_bytes")
                .and_then(Value::as_u64)
                .map_or(64, |n| n as usize),
            tag_messages: settings
                .get("tag_messages")
                .and_then(Value::as_bool)
                .unwrap_or(true),
        }
    }
}

impl LoggerPlugin {
    fn new(config: &PluginConfig) -> Self {
        Self {
            settings: LoggerSettings::from_settings(&config.settings),
            messages_logged: AtomicU64::new(0),
            metrics: None,
        }
    }

    pub fn messages_logged(&self) -> u64 {
        self.messages_logged.load(Ordering::Relaxed)
    }

    fn preview(&self, ctx: &MessageContext) -> String {
        let end = ctx.payload.len().min(self.settings.preview_bytes);
        String::from_utf8_lossy(&ctx.payload[..end]).escape_debug().to_string()
    }
}

#[async_trait]
impl Plugin for LoggerPlugin {
    fn name(&self) -> &str {
        NAME
    }

    fn version(&self) -> &str {
        env!("CARGO_PKG_VERSION")
    }

    async fn initialize(&mut self, services: Arc<ServiceLocator>) -> Result<(), PluginError> {
        self.metrics = services.resolve::<InMemoryMetrics>("metrics");
        info!(
            level = %self.settings.level,
            metrics = self.metrics.is_some(),
            "📝 LoggerPlugin: initialized"
        );
        Ok(())
    }

    async fn process(&self, mut ctx: MessageContext) -> Result<Option<MessageContext>, PluginError> {
        let sequence = self.messages_logged.fetch_add(1, Ordering::Relaxed) + 1;
        let preview = self.preview(&ctx);

        match self.settings.level.as_str() {
            "trace" => trace!(
                session_id = %ctx.session_id,
                protocol = %ctx.protocol,
                peer = %ctx.remote(),
                bytes = ctx.payload.len(),
                sequence,
                "📝 {}",
                preview
            ),
            "debug" => debug!(
                session_id = %ctx.session_id,
                protocol = %ctx.protocol,
                peer = %ctx.remote(),
                bytes = ctx.payload.len(),
                sequence,
                "📝 {}",
                preview
            ),
            _ => info!(
                session_id = %ctx.session_id,
                protocol = %ctx.protocol,
                peer = %ctx.remote(),
                bytes = ctx.payload.len(),
                sequence,
                "📝 {}",
                preview
            ),
        }

        if let Some(metrics) = &self.metrics {
            metrics.increment_counter(
                "relay_logger_messages_total",
                &[("protocol", ctx.protocol.as_str())],
                1,
            );
        }

        if self.settings.tag_messages {
            ctx.metadata.insert("logged_by".into(), NAME.into());
            ctx.metadata.insert("log_sequence".into(), sequence.to_string());
        }
        Ok(Some(ctx))
    }

    async fn stop(&mut self) -> Result<(), PluginError> {
        info!(
            messages_logged = self.messages_logged(),
            "📝 LoggerPlugin: stopped"
        );
        Ok(())
    }

    async fn on_config_update(&mut self, settings: &PluginSettings) -> Result<(), PluginError> {
        self.settings = LoggerSettings::from_settings(settings);
        debug!(settings = ?self.settings, "📝 LoggerPlugin: settings applied");
        Ok(())
    }
}

// ============================================================================
// Factory
// ============================================================================

pub struct LoggerFactory;

impl PluginFactory for LoggerFactory {
    fn metadata(&self) -> PluginMetadata {
        PluginMetadata::new(NAME, env!("CARGO_PKG_VERSION"))
            .description("Logs relay traffic and tags each message with a sequence number")
            .setting(
                "level",
                ConfigField::new(SettingType::String, json!("info"), "Log level for traffic lines")
                    .one_of(vec![json!("trace"), json!("debug"), json!("info")]),
            )
            .setting(
                "preview_bytes",
                ConfigField::new(
                    SettingType::Number,
                    json!(64),
                    "Bytes of payload included in each log line",
                ),
            )
            .setting(
                "tag_messages",
                ConfigField::new(
                    SettingType::Boolean,
                    json!(true),
                    "Add logged_by and log_sequence metadata",
                ),
            )
    }

    fn create(
        &self,
        _services: Arc<ServiceLocator>,
        config: &PluginConfig,
    ) -> Result<Box<dyn Plugin>, PluginError> {
        Ok(Box::new(LoggerPlugin::new(config)))
    }
}

pub fn factory() -> LoggerFactory {
    LoggerFactory
}
