//! Counter providers and the registry that selects between them.
//!
//! A provider is a named strategy for obtaining counter stores: `local`
//! keeps counters in this process, `cluster` shares them with peer nodes.
//! Call sites only ever see [`CounterStore`] trait objects, so switching
//! strategies is a matter of picking a different provider key.

mod cluster;
mod local;
mod registry;

use std::sync::Arc;

use async_trait::async_trait;

use crate::counter::CounterStore;

pub use cluster::{ClusterCounterProvider, SyncSettings};
pub use local::LocalCounterProvider;
pub use registry::ProviderRegistry;

/// Key of the in-process provider.
pub const LOCAL_PROVIDER_KEY: &str = "local";
/// Key of the cluster-replicated provider.
pub const CLUSTER_PROVIDER_KEY: &str = "cluster";

/// A swappable source of counter stores.
#[async_trait]
pub trait CounterProvider: Send + Sync {
    /// The key this provider is normally registered under.
    fn key(&self) -> &str;

    /// The store named `store_name`, created on first use.
    ///
    /// Repeated calls with the same name return the same store.
    fn counter_store(&self, store_name: &str) -> Arc<dyn CounterStore>;

    /// Release background resources. Stores handed out earlier may start
    /// failing afterwards.
    async fn shutdown(&self) {}
}
