//! Keyed singleton lookup handed to plugins at creation and initialisation.

use dashmap::DashMap;
use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

type Service = Arc<dyn Any + Send + Sync>;

#[derive(Default)]
pub struct ServiceLocator {
    services: DashMap<String, Service>,
    disposed: AtomicBool,
}

impl ServiceLocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `value` under `key`, replacing any previous registration.
    pub fn register_singleton<T>(&self, key: impl Into<String>, value: Arc<T>) -> bool
    where
        T: Any + Send + Sync,
    {
        let key = key.into();
        if self.disposed.load(Ordering::Acquire) {
            warn!(service = %key, "Service locator disposed; registration ignored");
            return false;
        }
        if self.services.insert(key.clone(), value).is_some() {
            warn!(service = %key, "Replaced existing service");
        } else {
            debug!(service = %key, "Registered service");
        }
        true
    }

    /// Look up `key` as a `T`. Returns `None` if missing or of another type.
    pub fn resolve<T>(&self, key: &str) -> Option<Arc<T>>
    where
        T: Any + Send + Sync,
    {
        let service = self.services.get(key)?.value().clone();
        service.downcast::<T>().ok()
    }

    pub fn has(&self, key: &str) -> bool {
        self.services.contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.services.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Drop every registration and refuse new ones.
    pub fn dispose(&self) {
        self.disposed.store(true, Ordering::Release);
        let count = self.services.len();
        self.services.clear();
        debug!(count, "Service locator disposed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionStore;

    #[test]
    fn test_register_and_resolve() {
        let locator = ServiceLocator::new();
        let sessions = Arc::new(SessionStore::new());
        assert!(locator.register_singleton("sessions", sessions.clone()));

        let resolved: Arc<SessionStore> = locator.resolve("sessions").unwrap();
        assert!(Arc::ptr_eq(&resolved, &sessions));
        assert!(locator.has("sessions"));

        assert!(locator.resolve::<String>("sessions").is_none());
        assert!(locator.resolve::<SessionStore>("missing").is_none());
    }

    #[test]
    fn test_dispose_blocks_registration() {
        let locator = ServiceLocator::new();
        locator.register_singleton("greeting", Arc::new(String::from("hi")));
        locator.dispose();

        assert!(!locator.has("greeting"));
        assert!(!locator.register_singleton("greeting", Arc::new(String::from("again"))));
        assert!(locator.keys().is_empty());
    }
}
