//! Plugin capability traits and their configuration schema.
//!
//! Two shapes are accepted. A *factory* ([`PluginFactory`]) describes itself
//! through [`PluginMetadata`] and builds a [`Plugin`] from the service locator
//! and its resolved [`PluginConfig`]. A *legacy* plugin ([`LegacyPlugin`]) is a
//! named object with an `initialize` method and optional lifecycle hooks; it is
//! run through [`LegacyAdapter`] so the manager only ever sees [`Plugin`].

use async_trait::async_trait;
use relay_core::{MessageContext, ServiceLocator};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::PluginError;

/// Resolved settings handed to a plugin.
pub type PluginSettings = Map<String, Value>;

/// Declared setting name to its description.
pub type ConfigSchema = BTreeMap<String, ConfigField>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SettingType {
    String,
    Number,
    Boolean,
    Array,
    Object,
}

impl SettingType {
    pub fn matches(self, value: &Value) -> bool {
        match self {
            SettingType::String => value.is_string(),
            SettingType::Number => value.is_number(),
            SettingType::Boolean => value.is_boolean(),
            SettingType::Array => value.is_array(),
            SettingType::Object => value.is_object(),
        }
    }
}

/// One entry of a plugin's config schema: `{type, default, description, enum?}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigField {
    #[serde(rename = "type")]
    pub field_type: SettingType,
    pub default: Value,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "enum", default, skip_serializing_if = "Option::is_none")]
    pub allowed: Option<Vec<Value>>,
}

impl ConfigField {
    pub fn new(field_type: SettingType, default: Value, description: impl Into<String>) -> Self {
        Self {
            field_type,
            default,
            description: description.into(),
            allowed: None,
        }
    }

    pub fn one_of(mut self, allowed: Vec<Value>) -> Self {
        self.allowed = Some(allowed);
        self
    }

    /// Check `value` against the declared type and, if present, the enum.
    pub fn validate(&self, key: &str, value: &Value) -> Result<(), String> {
        if !self.field_type.matches(value) {
            return Err(format!(
                "'{key}' expects {:?}, got {value}",
                self.field_type
            ));
        }
        if let Some(allowed) = &self.allowed {
            if !allowed.contains(value) {
                return Err(format!("'{key}' must be one of {allowed:?}, got {value}"));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginMetadata {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub config_schema: ConfigSchema,
}

impl PluginMetadata {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            description: String::new(),
            config_schema: ConfigSchema::new(),
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn setting(mut self, key: impl Into<String>, field: ConfigField) -> Self {
        self.config_schema.insert(key.into(), field);
        self
    }

    /// Settings made of every schema default.
    pub fn default_settings(&self) -> PluginSettings {
        self.config_schema
            .iter()
            .map(|(key, field)| (key.clone(), field.default.clone()))
            .collect()
    }

    /// Validate a partial settings update. An empty schema accepts anything.
    pub fn validate_settings(&self, settings: &PluginSettings) -> Result<(), String> {
        if self.config_schema.is_empty() {
            return Ok(());
        }
        for (key, value) in settings {
            let field = self
                .config_schema
                .get(key)
                .ok_or_else(|| format!("unknown setting '{key}'"))?;
            field.validate(key, value)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginConfig {
    pub name: String,
    pub version: String,
    pub enabled: bool,
    pub settings: PluginSettings,
}

impl PluginConfig {
    /// Schema defaults overlaid with `overrides`.
    pub fn resolve(metadata: &PluginMetadata, overrides: Option<&PluginSettings>) -> Self {
        let mut settings = metadata.default_settings();
        if let Some(overrides) = overrides {
            for (key, value) in overrides {
                settings.insert(key.clone(), value.clone());
            }
        }
        Self {
            name: metadata.name.clone(),
            version: metadata.version.clone(),
            enabled: true,
            settings,
        }
    }
}

/// A running message processor.
///
/// Lifecycle: `initialize → start → [process …] → stop → dispose`. Each step
/// is run in isolation by the manager; a failure is logged against this
/// plugin alone.
#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    fn version(&self) -> &str;

    async fn initialize(&mut self, _services: Arc<ServiceLocator>) -> Result<(), PluginError> {
        Ok(())
    }

    async fn start(&mut self) -> Result<(), PluginError> {
        Ok(())
    }

    /// Transform the message, or return `Ok(None)` to drop it.
    async fn process(&self, ctx: MessageContext) -> Result<Option<MessageContext>, PluginError>;

    async fn stop(&mut self) -> Result<(), PluginError> {
        Ok(())
    }

    async fn dispose(&mut self) -> Result<(), PluginError> {
        Ok(())
    }

    /// Called after settings were validated and merged.
    async fn on_config_update(&mut self, _settings: &PluginSettings) -> Result<(), PluginError> {
        Ok(())
    }
}

/// Describes and builds a [`Plugin`].
pub trait PluginFactory: Send + Sync {
    fn metadata(&self) -> PluginMetadata;

    fn create(
        &self,
        services: Arc<ServiceLocator>,
        config: &PluginConfig,
    ) -> Result<Box<dyn Plugin>, PluginError>;
}

/// The older plugin shape: a name, `initialize`, and optional hooks.
#[async_trait]
pub trait LegacyPlugin: Send + Sync {
    fn name(&self) -> &str;

    fn version(&self) -> &str {
        "0.0.0"
    }

    async fn initialize(&mut self, services: Arc<ServiceLocator>) -> Result<(), PluginError>;

    async fn start(&mut self) -> Result<(), PluginError> {
        Ok(())
    }

    async fn process(&self, ctx: MessageContext) -> Result<Option<MessageContext>, PluginError> {
        Ok(Some(ctx))
    }

    async fn stop(&mut self) -> Result<(), PluginError> {
        Ok(())
    }
}

/// Presents a [`LegacyPlugin`] as a [`Plugin`].
pub struct LegacyAdapter {
    inner: Box<dyn LegacyPlugin>,
}

impl LegacyAdapter {
    pub fn new(inner: Box<dyn LegacyPlugin>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl Plugin for LegacyAdapter {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn version(&self) -> &str {
        self.inner.version()
    }

    async fn initialize(&mut self, services: Arc<ServiceLocator>) -> Result<(), PluginError> {
        self.inner.initialize(services).await
    }

    async fn start(&mut self) -> Result<(), PluginError> {
        self.inner.start().await
    }

    async fn process(&self, ctx: MessageContext) -> Result<Option<MessageContext>, PluginError> {
        self.inner.process(ctx).await
    }

    async fn stop(&mut self) -> Result<(), PluginError> {
        self.inner.stop().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn metadata() -> PluginMetadata {
        PluginMetadata::new("tagger", "1.0.0")
            .setting(
                "level",
                ConfigField::new(SettingType::String, json!("info"), "log level")
                    .one_of(vec![json!("debug"), json!("info")]),
            )
            .setting("limit", ConfigField::new(SettingType::Number, json!(10), "max"))
    }

    #[test]
    fn test_defaults_come_from_schema() {
        let config = PluginConfig::resolve(&metadata(), None);
        assert_eq!(config.settings["level"], json!("info"));
        assert_eq!(config.settings["limit"], json!(10));
        assert!(config.enabled);

        let overrides: PluginSettings = json!({"limit": 3}).as_object().unwrap().clone();
        let config = PluginConfig::resolve(&metadata(), Some(&overrides));
        assert_eq!(config.settings["limit"], json!(3));
        assert_eq!(config.settings["level"], json!("info"));
    }

    #[test]
    fn test_settings_validation() {
        let meta = metadata();
        let ok: PluginSettings = json!({"level": "debug"}).as_object().unwrap().clone();
        assert!(meta.validate_settings(&ok).is_ok());

        let bad_enum: PluginSettings = json!({"level": "loud"}).as_object().unwrap().clone();
        assert!(meta.validate_settings(&bad_enum).is_err());

        let bad_type: PluginSettings = json!({"limit": "ten"}).as_object().unwrap().clone();
        assert!(meta.validate_settings(&bad_type).is_err());

        let unknown: PluginSettings = json!({"color": "red"}).as_object().unwrap().clone();
        assert!(meta.validate_settings(&unknown).is_err());

        let free = PluginMetadata::new("free", "0.1.0");
        assert!(free.validate_settings(&unknown).is_ok());
    }

    #[test]
    fn test_schema_round_trips_through_json() {
        let schema = json!({
            "type": "string",
            "default": "info",
            "description": "log level",
            "enum": ["debug", "info"]
        });
        let field: ConfigField = serde_json::from_value(schema).unwrap();
        assert_eq!(field.field_type, SettingType::String);
        assert_eq!(field.allowed.as_ref().map(Vec::len), Some(2));
    }
}
