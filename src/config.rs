//! Configuration management for Tally.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Result, TallyError};
use crate::mesh::ClusterConfig;
use crate::provider::{SyncSettings, LOCAL_PROVIDER_KEY};

/// Prefix for environment overrides, e.g. `TALLY__CLUSTER__ENABLED=true`.
const ENV_PREFIX: &str = "TALLY";

/// Main configuration for the Tally service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TallyConfig {
    /// Provider selection
    #[serde(default)]
    pub provider: ProviderSettings,

    /// Cluster membership and replication
    #[serde(default)]
    pub cluster: ClusterSettings,

    /// Logging
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Which provider and store callers get by default.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSettings {
    /// Provider key used when none is given
    #[serde(default = "default_provider")]
    pub default_provider: String,

    /// Store name used when none is given
    #[serde(default = "default_store")]
    pub default_store: String,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            default_provider: default_provider(),
            default_store: default_store(),
        }
    }
}

fn default_provider() -> String {
    LOCAL_PROVIDER_KEY.to_string()
}

fn default_store() -> String {
    "default".to_string()
}

/// Cluster configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterSettings {
    /// Whether to join a cluster and register the cluster provider
    #[serde(default)]
    pub enabled: bool,

    /// Node identifier; a random UUID when unset
    #[serde(default)]
    pub node_id: Option<String>,

    /// Gossip listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// Address advertised to peers; defaults to the listen address
    #[serde(default)]
    pub advertise_addr: Option<SocketAddr>,

    /// Seed nodes to bootstrap membership
    #[serde(default)]
    pub seed_nodes: Vec<String>,

    /// Cluster identifier
    #[serde(default = "default_cluster_id")]
    pub cluster_id: String,

    /// Gossip and replica sync interval in milliseconds
    #[serde(default = "default_gossip_interval")]
    pub gossip_interval_ms: u64,

    /// Grace period before a dead node's state is dropped, in seconds
    #[serde(default = "default_dead_node_grace_period")]
    pub dead_node_grace_period_secs: u64,

    /// Upper bound on one replica sync round in milliseconds
    #[serde(default = "default_sync_timeout")]
    pub sync_timeout_ms: u64,

    /// Replica views older than this fail operations, in milliseconds
    #[serde(default = "default_staleness_threshold")]
    pub staleness_threshold_ms: u64,
}

impl Default for ClusterSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            node_id: None,
            listen_addr: default_listen_addr(),
            advertise_addr: None,
            seed_nodes: Vec::new(),
            cluster_id: default_cluster_id(),
            gossip_interval_ms: default_gossip_interval(),
            dead_node_grace_period_secs: default_dead_node_grace_period(),
            sync_timeout_ms: default_sync_timeout(),
            staleness_threshold_ms: default_staleness_threshold(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 7946))
}

fn default_cluster_id() -> String {
    "tally".to_string()
}

fn default_gossip_interval() -> u64 {
    100
}

fn default_dead_node_grace_period() -> u64 {
    3600
}

fn default_sync_timeout() -> u64 {
    500
}

fn default_staleness_threshold() -> u64 {
    5000
}

impl ClusterSettings {
    /// Membership configuration for [`Cluster::start`](crate::mesh::Cluster::start).
    pub fn to_cluster_config(&self) -> ClusterConfig {
        let defaults = ClusterConfig::default();
        ClusterConfig {
            node_id: self.node_id.clone().unwrap_or(defaults.node_id),
            listen_addr: self.listen_addr,
            advertise_addr: self.advertise_addr.unwrap_or(self.listen_addr),
            seed_nodes: self.seed_nodes.clone(),
            cluster_id: self.cluster_id.clone(),
            gossip_interval: self.gossip_interval(),
            dead_node_grace_period: Duration::from_secs(self.dead_node_grace_period_secs),
        }
    }

    /// Timing for the cluster provider's replica synchronization.
    pub fn sync_settings(&self) -> SyncSettings {
        SyncSettings {
            interval: self.gossip_interval(),
            timeout: self.sync_timeout(),
            staleness_threshold: self.staleness_threshold(),
        }
    }

    pub fn gossip_interval(&self) -> Duration {
        Duration::from_millis(self.gossip_interval_ms)
    }

    pub fn sync_timeout(&self) -> Duration {
        Duration::from_millis(self.sync_timeout_ms)
    }

    pub fn staleness_threshold(&self) -> Duration {
        Duration::from_millis(self.staleness_threshold_ms)
    }

    fn validate(&self) -> Result<()> {
        if self.gossip_interval_ms == 0 {
            return Err(TallyError::Config(
                "cluster.gossip_interval_ms must be greater than 0".to_string(),
            ));
        }
        if self.staleness_threshold_ms <= self.gossip_interval_ms {
            return Err(TallyError::Config(format!(
                "cluster.staleness_threshold_ms ({}) must exceed cluster.gossip_interval_ms ({})",
                self.staleness_threshold_ms, self.gossip_interval_ms
            )));
        }
        Ok(())
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter directive, e.g. `info` or `tally=debug`
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl TallyConfig {
    /// Load configuration from an optional file, overridden by `TALLY__*`
    /// environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();

        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration");
            let format = match path.extension().and_then(|ext| ext.to_str()) {
                Some("json") => FileFormat::Json,
                Some("toml") => FileFormat::Toml,
                _ => FileFormat::Yaml,
            };
            let name = path.to_str().ok_or_else(|| {
                TallyError::Config(format!("Invalid UTF-8 path: {}", path.display()))
            })?;
            builder = builder.add_source(File::new(name, format));
        }

        let config: TallyConfig = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("cluster.seed_nodes"),
            )
            .build()
            .and_then(|settings| settings.try_deserialize())
            .map_err(|e| TallyError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: TallyConfig = serde_yaml::from_str(yaml)
            .map_err(|e| TallyError::Config(format!("Failed to parse configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.provider.default_provider.is_empty() {
            return Err(TallyError::Config(
                "provider.default_provider must not be empty".to_string(),
            ));
        }
        self.cluster.validate()
    }
}
