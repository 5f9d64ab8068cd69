//! Process-wide lookup of counter providers by key.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use parking_lot::RwLock;
use tracing::{debug, info};

use super::{CounterProvider, LocalCounterProvider};
use crate::counter::CounterStore;
use crate::error::{Result, TallyError};

/// Maps provider keys to providers.
///
/// Registration and lookup may happen from any thread; lookups never block
/// each other.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: RwLock<HashMap<String, Arc<dyn CounterProvider>>>,
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("keys", &self.keys())
            .finish()
    }
}

impl ProviderRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the in-process provider registered under its key.
    pub fn with_local() -> Self {
        let registry = Self::new();
        let local = LocalCounterProvider::new();
        let key = local.key().to_string();
        registry.register(key, move || local);
        registry
    }

    /// Register the provider built by `factory` under `key`.
    ///
    /// Replaces and returns whatever was registered under `key` before.
    pub fn register<F, P>(&self, key: impl Into<String>, factory: F) -> Option<Arc<dyn CounterProvider>>
    where
        F: FnOnce() -> P,
        P: CounterProvider + 'static,
    {
        let key = key.into();
        let provider: Arc<dyn CounterProvider> = Arc::new(factory());
        let previous = self.providers.write().insert(key.clone(), provider);
        if previous.is_some() {
            info!(provider = %key, "Replaced counter provider");
        } else {
            info!(provider = %key, "Registered counter provider");
        }
        previous
    }

    /// Remove the provider registered under `key`, if any.
    pub fn unregister(&self, key: &str) -> Option<Arc<dyn CounterProvider>> {
        let removed = self.providers.write().remove(key);
        if removed.is_some() {
            info!(provider = %key, "Unregistered counter provider");
        }
        removed
    }

    /// The provider registered under `key`, if any.
    pub fn lookup(&self, key: &str) -> Option<Arc<dyn CounterProvider>> {
        self.providers.read().get(key).cloned()
    }

    /// Resolve a store through the provider registered under `provider_key`.
    pub fn counter_store(&self, provider_key: &str, store_name: &str) -> Result<Arc<dyn CounterStore>> {
        let provider = self
            .lookup(provider_key)
            .ok_or_else(|| TallyError::UnknownProvider(provider_key.to_string()))?;
        debug!(provider = %provider_key, store = %store_name, "Resolving counter store");
        Ok(provider.counter_store(store_name))
    }

    /// Registered keys in sorted order.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.providers.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Shut down every registered provider concurrently.
    pub async fn shutdown(&self) {
        let providers: Vec<_> = self.providers.read().values().cloned().collect();
        join_all(providers.iter().map(|provider| provider.shutdown())).await;
        info!(count = providers.len(), "Counter providers shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counter::{CounterField, LocalCounterStore};
    use chrono::{TimeZone, Utc};
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Provider that serves one fixed store and records shutdown.
    struct FixedProvider {
        store: Arc<LocalCounterStore>,
        stopped: Arc<AtomicBool>,
    }

    #[async_trait::async_trait]
    impl CounterProvider for FixedProvider {
        fn key(&self) -> &str {
            "fixed"
        }

        fn counter_store(&self, _store_name: &str) -> Arc<dyn CounterStore> {
            self.store.clone()
        }

        async fn shutdown(&self) {
            self.stopped.store(true, Ordering::SeqCst);
        }
    }

    fn fixed() -> (FixedProvider, Arc<AtomicBool>) {
        let stopped = Arc::new(AtomicBool::new(false));
        let provider = FixedProvider {
            store: Arc::new(LocalCounterStore::new("fixed")),
            stopped: stopped.clone(),
        };
        (provider, stopped)
    }

    #[test]
    fn test_with_local() {
        let registry = ProviderRegistry::with_local();
        assert_eq!(registry.keys(), vec!["local".to_string()]);
        assert!(registry.lookup("local").is_some());
        assert!(registry.lookup("cluster").is_none());
    }

    #[test]
    fn test_register_replaces_and_returns_previous() {
        let registry = ProviderRegistry::new();
        assert!(registry.register("local", LocalCounterProvider::new).is_none());

        let (provider, _) = fixed();
        let previous = registry.register("local", move || provider).unwrap();
        assert_eq!(previous.key(), "local");
        assert_eq!(registry.lookup("local").unwrap().key(), "fixed");
    }

    #[test]
    fn test_unregister() {
        let registry = ProviderRegistry::with_local();
        assert!(registry.unregister("local").is_some());
        assert!(registry.unregister("local").is_none());
        assert!(registry.lookup("local").is_none());
        assert!(registry.keys().is_empty());
    }

    #[test]
    fn test_counter_store_resolution() {
        let registry = ProviderRegistry::with_local();
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();

        let store = registry.counter_store("local", "sla").unwrap();
        store.update("c", CounterField::Hour, at, 4).unwrap();

        let again = registry.counter_store("local", "sla").unwrap();
        assert_eq!(again.get_field("c", CounterField::Hour).unwrap(), 4);

        let Err(err) = registry.counter_store("missing", "sla") else {
            panic!("expected an unknown provider error");
        };
        assert!(matches!(err, TallyError::UnknownProvider(key) if key == "missing"));
    }

    #[test]
    fn test_swapping_provider_changes_backing_store() {
        let registry = ProviderRegistry::with_local();
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        registry
            .counter_store("local", "sla")
            .unwrap()
            .update("c", CounterField::Second, at, 1)
            .unwrap();

        let (provider, _) = fixed();
        registry.register("local", move || provider);

        let store = registry.counter_store("local", "sla").unwrap();
        assert!(store.query("c").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_shutdown_reaches_every_provider() {
        let registry = ProviderRegistry::with_local();
        let (provider, stopped) = fixed();
        registry.register("fixed", move || provider);

        registry.shutdown().await;
        assert!(stopped.load(Ordering::SeqCst));
    }
}
