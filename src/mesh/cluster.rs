//! Cluster management using Chitchat.
//!
//! This module wraps the chitchat library to provide cluster membership,
//! failure detection, and key/value gossip for replicated counter stores.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chitchat::transport::UdpTransport;
use chitchat::{
    spawn_chitchat, Chitchat, ChitchatConfig, ChitchatHandle, ChitchatId, FailureDetectorConfig,
};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Prefix shared by every key this crate gossips.
pub const KEY_PREFIX: &str = "tally|";

/// Errors that can occur in cluster operations.
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("Failed to start cluster: {0}")]
    StartError(String),
    #[error("Failed to shut down cluster: {0}")]
    ShutdownError(String),
}

/// Configuration for the cluster.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Unique node identifier.
    pub node_id: String,
    /// The address to listen on for gossip.
    pub listen_addr: SocketAddr,
    /// The address to advertise to other nodes.
    pub advertise_addr: SocketAddr,
    /// Seed nodes to bootstrap cluster membership.
    pub seed_nodes: Vec<String>,
    /// Cluster identifier (nodes must have matching cluster IDs).
    pub cluster_id: String,
    /// How often to gossip with peers.
    pub gossip_interval: Duration,
    /// Grace period before considering a dead node's state deletable.
    pub dead_node_grace_period: Duration,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        let default_addr = SocketAddr::from(([0, 0, 0, 0], 7946));
        Self {
            node_id: uuid::Uuid::new_v4().to_string(),
            listen_addr: default_addr,
            advertise_addr: default_addr,
            seed_nodes: Vec::new(),
            cluster_id: "tally".to_string(),
            gossip_interval: Duration::from_millis(100),
            dead_node_grace_period: Duration::from_secs(3600),
        }
    }
}

/// Key identifying a replicated counter entry in the cluster state.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CounterKey {
    /// The counter store name.
    pub store: String,
    /// The counter name.
    pub name: String,
}

impl CounterKey {
    /// Create a new counter key.
    pub fn new(store: &str, name: &str) -> Self {
        Self {
            store: store.to_string(),
            name: name.to_string(),
        }
    }

    /// Convert to a chitchat key string.
    /// Format: "tally|{store}|{name}"
    /// The store segment is escaped so the first `|` after it always ends it;
    /// the name is taken verbatim up to the end of the key.
    pub fn to_chitchat_key(&self) -> String {
        format!(
            "{KEY_PREFIX}{}|{}",
            escape_segment(&self.store),
            self.name
        )
    }

    /// Parse from a chitchat key string.
    pub fn from_chitchat_key(key: &str) -> Option<Self> {
        let rest = key.strip_prefix(KEY_PREFIX)?;
        let (store, name) = rest.split_once('|')?;

        Some(Self {
            store: unescape_segment(store)?,
            name: name.to_string(),
        })
    }
}

fn escape_segment(segment: &str) -> String {
    segment.replace('%', "%25").replace('|', "%7C")
}

fn unescape_segment(segment: &str) -> Option<String> {
    let mut out = String::with_capacity(segment.len());
    let mut rest = segment;
    while let Some(pos) = rest.find('%') {
        out.push_str(&rest[..pos]);
        let code = rest.get(pos + 1..pos + 3)?;
        match code {
            "25" => out.push('%'),
            "7C" => out.push('|'),
            _ => return None,
        }
        rest = &rest[pos + 3..];
    }
    out.push_str(rest);
    Some(out)
}

/// A key/value pair gossiped by a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerEntry {
    /// The node that owns the value.
    pub node_id: String,
    /// The raw chitchat key.
    pub key: String,
    /// The raw value.
    pub value: String,
}

/// The cluster handle for distributed state management.
pub struct Cluster {
    /// Our node ID.
    node_id: String,
    /// Shared chitchat state.
    chitchat: Arc<Mutex<Chitchat>>,
    /// Chitchat handle, taken on shutdown.
    handle: parking_lot::Mutex<Option<ChitchatHandle>>,
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("node_id", &self.node_id)
            .field("running", &self.handle.lock().is_some())
            .finish()
    }
}

impl Cluster {
    /// Create and start a new cluster node.
    pub async fn start(config: ClusterConfig) -> Result<Self, ClusterError> {
        info!(
            node_id = %config.node_id,
            listen_addr = %config.listen_addr,
            advertise_addr = %config.advertise_addr,
            seed_nodes = ?config.seed_nodes,
            cluster_id = %config.cluster_id,
            "Starting cluster node"
        );

        let chitchat_id = ChitchatId {
            node_id: config.node_id.clone(),
            generation_id: 0,
            gossip_advertise_addr: config.advertise_addr,
        };

        let chitchat_config = ChitchatConfig {
            chitchat_id,
            cluster_id: config.cluster_id.clone(),
            gossip_interval: config.gossip_interval,
            listen_addr: config.listen_addr,
            seed_nodes: config.seed_nodes.clone(),
            failure_detector_config: FailureDetectorConfig {
                initial_interval: config.gossip_interval,
                ..Default::default()
            },
            marked_for_deletion_grace_period: config.dead_node_grace_period,
            catchup_callback: None,
            extra_liveness_predicate: None,
        };

        let transport = UdpTransport;
        let handle = spawn_chitchat(chitchat_config, Vec::new(), &transport)
            .await
            .map_err(|e| ClusterError::StartError(e.to_string()))?;

        info!("Cluster node started successfully");

        Ok(Self {
            node_id: config.node_id,
            chitchat: handle.chitchat(),
            handle: parking_lot::Mutex::new(Some(handle)),
        })
    }

    /// Get our node ID.
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Publish our own key/values and collect every live peer's entries
    /// under `prefix`.
    ///
    /// Both happen under a single lock of the chitchat state.
    pub async fn exchange(&self, outgoing: Vec<(String, String)>, prefix: &str) -> Vec<PeerEntry> {
        let mut chitchat = self.chitchat.lock().await;

        let published = outgoing.len();
        {
            let own = chitchat.self_node_state();
            for (key, value) in outgoing {
                own.set(&key, value);
            }
        }

        let mut entries = Vec::new();
        for chitchat_id in chitchat.live_nodes() {
            if chitchat_id.node_id == self.node_id {
                continue;
            }
            if let Some(node_state) = chitchat.node_state(chitchat_id) {
                for (key, versioned_value) in node_state.iter_prefix(prefix) {
                    entries.push(PeerEntry {
                        node_id: chitchat_id.node_id.clone(),
                        key: key.to_string(),
                        value: versioned_value.value.clone(),
                    });
                }
            }
        }

        debug!(
            published = published,
            received = entries.len(),
            "Exchanged cluster state"
        );

        entries
    }

    /// Get the number of live nodes in the cluster.
    pub async fn live_node_count(&self) -> usize {
        let chitchat = self.chitchat.lock().await;
        chitchat.live_nodes().count()
    }

    /// Shutdown the cluster node gracefully. Later calls are no-ops.
    pub async fn shutdown(&self) -> Result<(), ClusterError> {
        let handle = self.handle.lock().take();
        let Some(handle) = handle else {
            return Ok(());
        };

        info!(node_id = %self.node_id, "Shutting down cluster node");
        handle
            .shutdown()
            .await
            .map_err(|e| ClusterError::ShutdownError(format!("{:?}", e)))?;
        Ok(())
    }
}
