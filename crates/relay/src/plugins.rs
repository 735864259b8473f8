//! Plugins compiled into the binary.
//!
//! Discovery is explicit: everything the gateway can load is registered
//! here, and `[plugins] enabled` picks from this set by name.

use plugin_system::PluginRegistry;

pub fn builtin_registry() -> PluginRegistry {
    let mut registry = PluginRegistry::new();
    registry
        .register_factory(plugin_logger::factory())
        .register_legacy(plugin_greeter::create);
    registry
}
