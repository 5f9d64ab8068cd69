//! Cluster-replicated counter provider using Chitchat cluster state.
//!
//! Stores handed out by this provider keep serving requests from memory;
//! a background task gossips their changes to peers and installs the peers'
//! contributions every gossip interval.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::IntervalStream;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

use super::{CounterProvider, CLUSTER_PROVIDER_KEY};
use crate::counter::{ClusterCounterStore, Contribution, CounterStore, PeerView};
use crate::mesh::{Cluster, CounterKey, PeerEntry, KEY_PREFIX};

/// Timing knobs for replica synchronization.
#[derive(Debug, Clone, Copy)]
pub struct SyncSettings {
    /// How often stores are synchronized with the cluster
    pub interval: Duration,
    /// Upper bound on one synchronization round
    pub timeout: Duration,
    /// Peer views older than this make store operations fail
    pub staleness_threshold: Duration,
}

type StoreMap = DashMap<String, Arc<ClusterCounterStore>>;

/// A counter provider backed by Chitchat cluster state.
pub struct ClusterCounterProvider {
    /// The cluster for distributed state.
    cluster: Arc<Cluster>,
    /// Memoized stores by name.
    stores: Arc<StoreMap>,
    settings: SyncSettings,
    sync_task: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for ClusterCounterProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterCounterProvider")
            .field("node_id", &self.cluster.node_id())
            .field("stores", &self.stores.len())
            .field("settings", &self.settings)
            .field("closed", &self.closed)
            .finish()
    }
}

impl ClusterCounterProvider {
    /// Create the provider and start its synchronization task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(cluster: Cluster, settings: SyncSettings) -> Self {
        let cluster = Arc::new(cluster);
        let stores: Arc<StoreMap> = Arc::new(DashMap::new());

        info!(
            node_id = %cluster.node_id(),
            interval_ms = settings.interval.as_millis() as u64,
            "Starting cluster counter provider"
        );

        let task = tokio::spawn(run_sync(Arc::clone(&cluster), Arc::clone(&stores), settings));

        Self {
            cluster,
            stores,
            settings,
            sync_task: Mutex::new(Some(task)),
            closed: AtomicBool::new(false),
        }
    }

    /// The concrete store for `store_name`, created on first use.
    pub fn cluster_store(&self, store_name: &str) -> Arc<ClusterCounterStore> {
        if let Some(store) = self.stores.get(store_name) {
            return Arc::clone(&store);
        }

        self.stores
            .entry(store_name.to_string())
            .or_insert_with(|| {
                debug!(store = %store_name, "Creating cluster counter store");
                let store = ClusterCounterStore::new(store_name, self.settings.staleness_threshold);
                if self.closed.load(Ordering::SeqCst) {
                    store.close();
                }
                Arc::new(store)
            })
            .clone()
    }

    /// Run one synchronization round now instead of waiting for the next tick.
    pub async fn sync_now(&self) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        sync_once(&self.cluster, &self.stores, self.settings.timeout).await;
    }

    /// Number of live nodes in the cluster, or 0 once shut down.
    pub async fn live_node_count(&self) -> usize {
        if self.closed.load(Ordering::SeqCst) {
            return 0;
        }
        self.cluster.live_node_count().await
    }
}

#[async_trait]
impl CounterProvider for ClusterCounterProvider {
    fn key(&self) -> &str {
        CLUSTER_PROVIDER_KEY
    }

    fn counter_store(&self, store_name: &str) -> Arc<dyn CounterStore> {
        self.cluster_store(store_name)
    }

    async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let task = self.sync_task.lock().take();
        if let Some(task) = task {
            task.abort();
            let _ = task.await;
        }

        for store in self.stores.iter() {
            store.close();
        }

        if let Err(e) = self.cluster.shutdown().await {
            warn!(error = %e, "Cluster shutdown failed");
        }

        info!("Cluster counter provider stopped");
    }
}

async fn run_sync(cluster: Arc<Cluster>, stores: Arc<StoreMap>, settings: SyncSettings) {
    let mut ticks = IntervalStream::new(tokio::time::interval(settings.interval));
    while ticks.next().await.is_some() {
        sync_once(&cluster, &stores, settings.timeout).await;
    }
}

/// Publish every store's pending changes and install fresh peer views.
async fn sync_once(cluster: &Cluster, stores: &StoreMap, timeout: Duration) {
    let mut outgoing = Vec::new();
    for store in stores.iter() {
        for contribution in store.drain_publications() {
            match encode(store.name(), &contribution) {
                Ok(entry) => outgoing.push(entry),
                Err(e) => warn!(store = %store.name(), error = %e, "Failed to encode contribution"),
            }
        }
    }

    let entries = match tokio::time::timeout(timeout, cluster.exchange(outgoing, KEY_PREFIX)).await
    {
        Ok(entries) => entries,
        Err(_) => {
            warn!(
                timeout_ms = timeout.as_millis() as u64,
                "Cluster sync timed out, will republish next round"
            );
            for store in stores.iter() {
                store.mark_all_dirty();
            }
            return;
        }
    };

    let mut views = decode(entries);
    for store in stores.iter() {
        let view = views.remove(store.name()).unwrap_or_default();
        store.install_peer_view(view);
    }
}

fn encode(store: &str, contribution: &Contribution) -> serde_json::Result<(String, String)> {
    Ok((
        CounterKey::new(store, contribution.state.name()).to_chitchat_key(),
        serde_json::to_string(contribution)?,
    ))
}

/// Group peer entries into one view per store.
fn decode(entries: Vec<PeerEntry>) -> HashMap<String, PeerView> {
    let mut views: HashMap<String, PeerView> = HashMap::new();

    for entry in entries {
        let Some(key) = CounterKey::from_chitchat_key(&entry.key) else {
            debug!(key = %entry.key, "Ignoring unrecognized cluster key");
            continue;
        };
        let peer = views
            .entry(key.store)
            .or_default()
            .entry(key.name.clone())
            .or_default();

        match serde_json::from_str::<Contribution>(&entry.value) {
            Ok(contribution) => peer.contributions.push(contribution),
            Err(e) => {
                warn!(node_id = %entry.node_id, counter = %key.name, error = %e, "Ignoring malformed contribution")
            }
        }
    }

    views
}
