//! Replication configuration
//!
//! Consumed, not owned, by the replication core: the deployment enable
//! flag, per-stream replication modes and filters, and the batching/lease
//! constants. Workers re-read stream settings on every iteration, so mode
//! changes take effect without a restart.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::{Context, Result};

/// How a stream's content is replicated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReplicationMode {
    /// Do not replicate; pending work is drained.
    Disabled,
    /// Replicate full file content.
    Full,
    /// Store `"<depotPath>#<revision>"` pointers instead of content.
    RevisionsOnly,
}

/// One version-control server cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterSettings {
    /// Connection address, e.g. `sim://` for the in-process simulator.
    pub address: String,
}

/// Per-stream replication settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct StreamSettings {
    /// Cluster the stream lives on.
    pub cluster: String,
    /// Depot root of the stream's workspace, e.g. `//depot/main`. Changing
    /// this invalidates the cached replication client.
    pub root: String,
    #[serde(default = "default_mode")]
    pub mode: ReplicationMode,
    /// Optional depot path filter restricting what is replicated.
    #[serde(default)]
    pub filter: Option<String>,
}

fn default_mode() -> ReplicationMode {
    ReplicationMode::Full
}

/// Deployment configuration stored as JSON on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ReplicationConfig {
    /// Master switch for the whole deployment.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Namespace prefix for coordination keys.
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Redis URL for the coordination store; in-process store when absent.
    #[serde(default)]
    pub coordination: Option<String>,
    /// Concurrent replication workers per process.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default = "default_lease_secs")]
    pub lease_secs: u64,
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    /// Upper bound on the previewed bytes synced per batch.
    #[serde(default = "default_batch_bytes")]
    pub batch_bytes: u64,
    /// Commit ingestion poll interval.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Directory for the per-stream replication status log.
    #[serde(default)]
    pub status_dir: Option<String>,
    #[serde(default)]
    pub clusters: BTreeMap<String, ClusterSettings>,
    #[serde(default)]
    pub streams: BTreeMap<String, StreamSettings>,
}

fn default_enabled() -> bool {
    true
}

fn default_namespace() -> String {
    "streamsnap".to_string()
}

fn default_max_workers() -> usize {
    2
}

fn default_lease_secs() -> u64 {
    60
}

fn default_heartbeat_secs() -> u64 {
    40
}

fn default_batch_bytes() -> u64 {
    1024 * 1024 * 1024
}

fn default_poll_interval_secs() -> u64 {
    30
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            namespace: default_namespace(),
            coordination: None,
            max_workers: default_max_workers(),
            lease_secs: default_lease_secs(),
            heartbeat_secs: default_heartbeat_secs(),
            batch_bytes: default_batch_bytes(),
            poll_interval_secs: default_poll_interval_secs(),
            status_dir: None,
            clusters: BTreeMap::new(),
            streams: BTreeMap::new(),
        }
    }
}

impl ReplicationConfig {
    /// Load configuration from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {:?}", path))?;
        let config: ReplicationConfig =
            serde_json::from_str(&data).with_context(|| "Failed to parse config JSON")?;
        Ok(config)
    }

    /// Save configuration to a JSON file.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp_path = path.with_extension("tmp");
        let data = serde_json::to_string_pretty(self)?;
        fs::write(&tmp_path, &data)?;
        fs::rename(&tmp_path, path)?;
        Ok(())
    }

    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_secs)
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// Stream ids grouped by cluster name, for ingestion polling.
    pub fn streams_by_cluster(&self) -> BTreeMap<String, Vec<String>> {
        let mut grouped: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (id, stream) in &self.streams {
            grouped.entry(stream.cluster.clone()).or_default().push(id.clone());
        }
        grouped
    }
}

/// Live view of the current settings, shared between the control loop and
/// its workers. Pulling configuration may disable a stream or switch it to
/// revisions-only at any time.
pub trait SettingsSource: Send + Sync {
    fn enabled(&self) -> bool;

    fn stream(&self, id: &str) -> Option<StreamSettings>;
}

/// Settings backed by a shared, updatable config.
#[derive(Clone)]
pub struct SharedSettings {
    inner: Arc<RwLock<ReplicationConfig>>,
}

impl SharedSettings {
    pub fn new(config: ReplicationConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(config)),
        }
    }

    /// Replace or adjust the live configuration.
    pub fn update(&self, apply: impl FnOnce(&mut ReplicationConfig)) {
        let mut config = self.inner.write().unwrap();
        apply(&mut config);
    }

    pub fn snapshot(&self) -> ReplicationConfig {
        self.inner.read().unwrap().clone()
    }
}

impl SettingsSource for SharedSettings {
    fn enabled(&self) -> bool {
        self.inner.read().unwrap().enabled
    }

    fn stream(&self, id: &str) -> Option<StreamSettings> {
        self.inner.read().unwrap().streams.get(id).cloned()
    }
}
