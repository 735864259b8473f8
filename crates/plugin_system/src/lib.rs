//! Plugin system for the relay gateway
//!
//! Provides explicit plugin discovery, lifecycle management, and best-effort
//! dispatch of messages through every enabled plugin.
//!
//! ## Plugin shapes
//!
//! - **Factory**: [`PluginFactory`] exposes [`PluginMetadata`] (including a
//!   config schema) and builds a [`Plugin`] from the service locator and its
//!   resolved config.
//! - **Legacy**: [`LegacyPlugin`] is a named object with `initialize` and
//!   optional hooks, adapted to [`Plugin`] by the manager.
//!
//! ## Isolation
//!
//! Every lifecycle step and every `process` call is isolated per plugin:
//! errors and panics are logged against that plugin and never stop the rest.

pub mod manager;
pub mod plugin;
pub mod registry;
pub mod stage;

use relay_core::{ErrorKind, RouterError};

pub use manager::{LoadReport, PluginManager, PluginState, PluginStats, PluginSystemStats};
pub use plugin::{
    ConfigField, ConfigSchema, LegacyAdapter, LegacyPlugin, Plugin, PluginConfig, PluginFactory,
    PluginMetadata, PluginSettings, SettingType,
};
pub use registry::{DiscoveredPlugin, PluginCandidate, PluginKind, PluginRegistry};
pub use stage::PluginStage;

// ============================================================================
// Errors
// ============================================================================

/// Errors that can occur during plugin operations.
#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    /// Plugin initialization failed during startup
    #[error("Plugin initialization failed: {0}")]
    InitializationFailed(String),
    /// Error occurred during plugin execution
    #[error("Plugin execution error: {0}")]
    ExecutionError(String),
    /// Requested plugin was not found
    #[error("Plugin not found: {0}")]
    NotFound(String),
    /// A plugin with the same name is already loaded
    #[error("Plugin already loaded: {0}")]
    AlreadyLoaded(String),
    /// Settings did not match the plugin's declared schema
    #[error("Invalid config for plugin {plugin}: {reason}")]
    InvalidConfig { plugin: String, reason: String },
    /// Panic or other unexpected runtime condition
    #[error("Plugin runtime error: {0}")]
    Runtime(String),
}

impl From<PluginError> for RouterError {
    fn from(err: PluginError) -> Self {
        let kind = match err {
            PluginError::InvalidConfig { .. } => ErrorKind::Validation,
            _ => ErrorKind::Plugin,
        };
        RouterError::new(kind, err.to_string()).with_cause(err)
    }
}

/// Extract a readable message from a panic payload.
pub(crate) fn panic_to_error(panic_info: Box<dyn std::any::Any + Send>) -> PluginError {
    let message = if let Some(s) = panic_info.downcast_ref::<&str>() {
        format!("Plugin panicked: {}", s)
    } else if let Some(s) = panic_info.downcast_ref::<String>() {
        format!("Plugin panicked: {}", s)
    } else {
        "Plugin panicked with unknown error".to_string()
    };

    PluginError::Runtime(message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plugin_errors_are_not_retryable() {
        let err: RouterError = PluginError::ExecutionError("bad".into()).into();
        assert_eq!(err.kind, ErrorKind::Plugin);
        assert!(!err.retryable);

        let err: RouterError = PluginError::InvalidConfig {
            plugin: "p".into(),
            reason: "r".into(),
        }
        .into();
        assert_eq!(err.kind, ErrorKind::Validation);
    }

    #[test]
    fn test_panic_payloads() {
        let err = panic_to_error(Box::new("static"));
        assert_eq!(err.to_string(), "Plugin runtime error: Plugin panicked: static");

        let err = panic_to_error(Box::new(String::from("owned")));
        assert!(err.to_string().ends_with("owned"));

        let err = panic_to_error(Box::new(42_u8));
        assert!(err.to_string().ends_with("unknown error"));
    }
}
