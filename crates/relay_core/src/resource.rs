//! Central registry of disposable runtime objects.
//!
//! Every live socket or plugin instance is registered here when it is created
//! so that teardown and shutdown can release it exactly once, no matter which
//! path gets there first.

use dashmap::DashMap;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::SystemTime;
use tracing::{debug, error, info, warn};

use crate::error::RouterError;

pub type DisposeAction = Box<dyn FnOnce() -> Result<(), RouterError> + Send + Sync>;

/// A tracked handle and the action that releases it.
pub struct Resource {
    pub id: String,
    pub resource_type: String,
    pub created_at: SystemTime,
    pub metadata: HashMap<String, String>,
    is_disposed: bool,
    dispose_action: Option<DisposeAction>,
}

impl Resource {
    pub fn new<F>(id: impl Into<String>, resource_type: impl Into<String>, dispose: F) -> Self
    where
        F: FnOnce() -> Result<(), RouterError> + Send + Sync + 'static,
    {
        Self {
            id: id.into(),
            resource_type: resource_type.into(),
            created_at: SystemTime::now(),
            metadata: HashMap::new(),
            is_disposed: false,
            dispose_action: Some(Box::new(dispose)),
        }
    }

    /// A resource with nothing to release beyond its bookkeeping entry.
    pub fn logical(id: impl Into<String>, resource_type: impl Into<String>) -> Self {
        Self::new(id, resource_type, || Ok(()))
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn is_disposed(&self) -> bool {
        self.is_disposed
    }
}

impl std::fmt::Debug for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resource")
            .field("id", &self.id)
            .field("resource_type", &self.resource_type)
            .field("created_at", &self.created_at)
            .field("metadata", &self.metadata)
            .field("is_disposed", &self.is_disposed)
            .finish()
    }
}

/// Result of [`ResourceRegistry::dispose_all`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DisposalStats {
    /// Entries present when disposal started.
    pub total: usize,
    pub by_type: HashMap<String, usize>,
    /// Entries disposed by this call.
    pub disposed: usize,
    /// Entries still not disposed afterwards.
    pub active: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub total: usize,
    pub active: usize,
    pub disposed: usize,
    pub by_type: HashMap<String, usize>,
    pub shutting_down: bool,
}

/// Registry guaranteeing each dispose action runs at most once.
#[derive(Default)]
pub struct ResourceRegistry {
    resources: DashMap<String, Resource>,
    shutting_down: AtomicBool,
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a resource. Duplicate ids and registrations during shutdown are
    /// refused and logged.
    pub fn register(&self, resource: Resource) -> bool {
        if self.shutting_down.load(Ordering::Acquire) {
            warn!(
                resource_id = %resource.id,
                "Refusing resource registration during shutdown"
            );
            return false;
        }

        match self.resources.entry(resource.id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                warn!(resource_id = %resource.id, "Resource already registered");
                false
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                debug!(
                    resource_id = %resource.id,
                    resource_type = %resource.resource_type,
                    "Registered resource"
                );
                slot.insert(resource);
                true
            }
        }
    }

    /// Run the dispose action for `id`.
    ///
    /// Returns `false` only for unknown ids. A failing or panicking action is
    /// logged and the resource is still marked disposed; disposing again is a
    /// no-op that reports success.
    pub fn dispose(&self, id: &str) -> bool {
        let action = {
            let Some(mut entry) = self.resources.get_mut(id) else {
                return false;
            };
            if entry.is_disposed {
                return true;
            }
            entry.is_disposed = true;
            entry.dispose_action.take()
        };

        // The shard lock is released before running the action so it may
        // touch the registry itself.
        if let Some(action) = action {
            run_dispose_action(id, action);
        }
        true
    }

    /// Dispose every live resource of one type, returning how many were disposed.
    pub fn dispose_by_type(&self, resource_type: &str) -> usize {
        let ids: Vec<String> = self
            .resources
            .iter()
            .filter(|entry| entry.resource_type == resource_type && !entry.is_disposed)
            .map(|entry| entry.key().clone())
            .collect();

        let disposed = ids.iter().filter(|id| self.dispose_fresh(id)).count();
        debug!(resource_type, disposed, "Disposed resources by type");
        disposed
    }

    /// Enter shutdown mode and dispose everything still live.
    pub fn dispose_all(&self) -> DisposalStats {
        self.shutting_down.store(true, Ordering::Release);

        let mut stats = DisposalStats::default();
        let mut pending = Vec::new();
        for entry in self.resources.iter() {
            stats.total += 1;
            *stats.by_type.entry(entry.resource_type.clone()).or_insert(0) += 1;
            if !entry.is_disposed {
                pending.push(entry.key().clone());
            }
        }

        for id in pending {
            if self.dispose_fresh(&id) {
                stats.disposed += 1;
            }
        }

        stats.active = self
            .resources
            .iter()
            .filter(|entry| !entry.is_disposed)
            .count();

        info!(
            total = stats.total,
            disposed = stats.disposed,
            active = stats.active,
            "🧹 Resource registry disposed"
        );
        stats
    }

    /// Drop entries that have already been disposed.
    pub fn cleanup_disposed(&self) -> usize {
        let before = self.resources.len();
        self.resources.retain(|_, resource| !resource.is_disposed);
        let removed = before.saturating_sub(self.resources.len());
        if removed > 0 {
            debug!(removed, "Purged disposed resources");
        }
        removed
    }

    pub fn contains(&self, id: &str) -> bool {
        self.resources.contains_key(id)
    }

    pub fn is_disposed(&self, id: &str) -> Option<bool> {
        self.resources.get(id).map(|entry| entry.is_disposed)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    pub fn active_count(&self) -> usize {
        self.resources.iter().filter(|entry| !entry.is_disposed).count()
    }

    pub fn stats(&self) -> RegistryStats {
        let mut stats = RegistryStats {
            shutting_down: self.is_shutting_down(),
            ..RegistryStats::default()
        };
        for entry in self.resources.iter() {
            stats.total += 1;
            if entry.is_disposed {
                stats.disposed += 1;
            } else {
                stats.active += 1;
            }
            *stats.by_type.entry(entry.resource_type.clone()).or_insert(0) += 1;
        }
        stats
    }

    /// Like [`dispose`](Self::dispose) but only reports `true` when this call
    /// performed the disposal.
    fn dispose_fresh(&self, id: &str) -> bool {
        let action = {
            let Some(mut entry) = self.resources.get_mut(id) else {
                return false;
            };
            if entry.is_disposed {
                return false;
            }
            entry.is_disposed = true;
            entry.dispose_action.take()
        };

        if let Some(action) = action {
            run_dispose_action(id, action);
        }
        true
    }
}

fn run_dispose_action(id: &str, action: DisposeAction) {
    match catch_unwind(AssertUnwindSafe(action)) {
        Ok(Ok(())) => debug!(resource_id = id, "Disposed resource"),
        Ok(Err(e)) => error!(resource_id = id, "Resource dispose failed: {}", e),
        Err(_) => error!(resource_id = id, "Resource dispose action panicked"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn counting(id: &str, kind: &str, counter: &Arc<AtomicUsize>) -> Resource {
        let counter = counter.clone();
        Resource::new(id, kind, move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    #[test]
    fn test_dispose_runs_once() {
        let registry = ResourceRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));
        assert!(registry.register(counting("conn-1", "tcp_connection", &calls)));

        assert!(registry.dispose("conn-1"));
        assert!(registry.dispose("conn-1"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(registry.is_disposed("conn-1"), Some(true));
        assert!(!registry.dispose("missing"));
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let registry = ResourceRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));
        assert!(registry.register(counting("a", "x", &calls)));
        assert!(!registry.register(counting("a", "x", &calls)));
        assert_eq!(registry.stats().total, 1);
    }

    #[test]
    fn test_failures_are_isolated() {
        let registry = ResourceRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));

        registry.register(Resource::new("bad", "tcp_connection", || {
            Err(RouterError::resource("socket already gone"))
        }));
        registry.register(Resource::new("panics", "tcp_connection", || {
            panic!("dispose exploded")
        }));
        registry.register(counting("good", "tcp_connection", &calls));

        let stats = registry.dispose_all();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.disposed, 3);
        assert_eq!(stats.active, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(registry.is_disposed("bad"), Some(true));
        assert_eq!(registry.is_disposed("panics"), Some(true));
    }

    #[test]
    fn test_dispose_all_is_idempotent_and_blocks_registration() {
        let registry = ResourceRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));
        registry.register(counting("a", "tcp_connection", &calls));
        registry.register(counting("b", "plugin", &calls));

        let first = registry.dispose_all();
        assert_eq!(first.active, 0);
        assert_eq!(first.by_type["plugin"], 1);

        let second = registry.dispose_all();
        assert_eq!(second.disposed, 0);
        assert_eq!(second.active, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        assert!(!registry.register(counting("c", "tcp_connection", &calls)));
        assert!(registry.is_shutting_down());
    }

    #[test]
    fn test_dispose_by_type_and_cleanup() {
        let registry = ResourceRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));
        registry.register(counting("t1", "tcp_connection", &calls));
        registry.register(counting("t2", "tcp_connection", &calls));
        registry.register(counting("u1", "udp_session", &calls));

        assert_eq!(registry.dispose_by_type("tcp_connection"), 2);
        assert_eq!(registry.dispose_by_type("tcp_connection"), 0);
        assert_eq!(registry.active_count(), 1);

        assert_eq!(registry.cleanup_disposed(), 2);
        assert!(!registry.contains("t1"));
        assert!(registry.contains("u1"));
    }

    #[test]
    fn test_dispose_action_may_reenter_registry() {
        let registry = Arc::new(ResourceRegistry::new());
        let inner = registry.clone();
        registry.register(Resource::new("outer", "x", move || {
            inner.dispose("outer");
            Ok(())
        }));

        assert!(registry.dispose("outer"));
    }
}
