//! Explicit plugin discovery.
//!
//! Plugins are registered in code at startup instead of being scanned from a
//! directory and loaded as shared libraries. [`PluginRegistry::discover`]
//! turns the registrations into [`DiscoveredPlugin`] candidates, rejecting
//! duplicate names.

use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::plugin::{LegacyPlugin, PluginFactory, PluginMetadata};
use crate::PluginError;

type LegacyConstructor = Box<dyn Fn() -> Box<dyn LegacyPlugin> + Send + Sync>;

enum Registration {
    Factory(Arc<dyn PluginFactory>),
    Legacy(LegacyConstructor),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginKind {
    Factory,
    Legacy,
}

/// How to build a discovered plugin.
pub enum PluginCandidate {
    Factory(Arc<dyn PluginFactory>),
    Legacy(Box<dyn LegacyPlugin>),
}

pub struct DiscoveredPlugin {
    pub metadata: PluginMetadata,
    pub kind: PluginKind,
    pub candidate: PluginCandidate,
}

impl std::fmt::Debug for DiscoveredPlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscoveredPlugin")
            .field("metadata", &self.metadata)
            .field("kind", &self.kind)
            .finish()
    }
}

#[derive(Default)]
pub struct PluginRegistry {
    registrations: Vec<Registration>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_factory<F: PluginFactory + 'static>(&mut self, factory: F) -> &mut Self {
        self.registrations
            .push(Registration::Factory(Arc::new(factory)));
        self
    }

    pub fn register_legacy<C>(&mut self, constructor: C) -> &mut Self
    where
        C: Fn() -> Box<dyn LegacyPlugin> + Send + Sync + 'static,
    {
        self.registrations
            .push(Registration::Legacy(Box::new(constructor)));
        self
    }

    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    /// Produce candidates in registration order.
    ///
    /// Duplicate names are reported and skipped; the first registration wins.
    /// When `enabled` is given, only the listed names are returned.
    pub fn discover(
        &self,
        enabled: Option<&[String]>,
    ) -> (Vec<DiscoveredPlugin>, Vec<PluginError>) {
        let mut seen = HashSet::new();
        let mut found = Vec::new();
        let mut rejected = Vec::new();

        for registration in &self.registrations {
            let discovered = match registration {
                Registration::Factory(factory) => DiscoveredPlugin {
                    metadata: factory.metadata(),
                    kind: PluginKind::Factory,
                    candidate: PluginCandidate::Factory(factory.clone()),
                },
                Registration::Legacy(construct) => {
                    let instance = construct();
                    DiscoveredPlugin {
                        metadata: PluginMetadata::new(instance.name(), instance.version()),
                        kind: PluginKind::Legacy,
                        candidate: PluginCandidate::Legacy(instance),
                    }
                }
            };

            let name = discovered.metadata.name.clone();
            if let Some(enabled) = enabled {
                if !enabled.iter().any(|n| n == &name) {
                    debug!(plugin = %name, "Plugin not enabled; skipping");
                    continue;
                }
            }
            if !seen.insert(name.clone()) {
                warn!(plugin = %name, "Duplicate plugin name rejected");
                rejected.push(PluginError::AlreadyLoaded(name));
                continue;
            }

            debug!(plugin = %name, kind = ?discovered.kind, "Discovered plugin");
            found.push(discovered);
        }

        (found, rejected)
    }
}
