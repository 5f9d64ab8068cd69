//! In-process counter provider.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use super::{CounterProvider, LOCAL_PROVIDER_KEY};
use crate::counter::{CounterStore, LocalCounterStore};

/// Hands out [`LocalCounterStore`]s, one per store name.
#[derive(Debug, Default)]
pub struct LocalCounterProvider {
    stores: DashMap<String, Arc<LocalCounterStore>>,
}

impl LocalCounterProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// The concrete store for `store_name`, created on first use.
    pub fn local_store(&self, store_name: &str) -> Arc<LocalCounterStore> {
        if let Some(store) = self.stores.get(store_name) {
            return Arc::clone(&store);
        }

        self.stores
            .entry(store_name.to_string())
            .or_insert_with(|| {
                debug!(store = %store_name, "Creating local counter store");
                Arc::new(LocalCounterStore::new(store_name))
            })
            .clone()
    }

    /// Number of stores created so far.
    pub fn store_count(&self) -> usize {
        self.stores.len()
    }
}

impl CounterProvider for LocalCounterProvider {
    fn key(&self) -> &str {
        LOCAL_PROVIDER_KEY
    }

    fn counter_store(&self, store_name: &str) -> Arc<dyn CounterStore> {
        self.local_store(store_name)
    }
}
