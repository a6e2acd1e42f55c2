//! Hub configuration management.
//!
//! Configuration is stored as TOML:
//! - Linux: `~/.config/corral/hub.toml`
//! - Windows: `%APPDATA%/corral/hub.toml`

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use corral_protocol::types::LoadBalanceStrategy;
use corral_registry::{BreakerConfig, RegistryConfig};

/// Hub configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubConfig {
    /// Stable identity of this hub instance (hostname by default).
    #[serde(default = "default_node_id")]
    pub node_id: String,

    /// Address the WebSocket listener binds to.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// Address of the health/metrics HTTP surface.
    #[serde(default = "default_ops_addr")]
    pub ops_addr: SocketAddr,

    /// Load-balancing strategy for agent selection.
    #[serde(default)]
    pub strategy: LoadBalanceStrategy,

    /// Interval at which agents are expected to heartbeat.
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,

    /// Missed heartbeats tolerated before an agent is declared offline.
    #[serde(default = "default_missed_beat_tolerance")]
    pub missed_beat_tolerance: u32,

    /// Interval of the agent liveness sweep.
    #[serde(default = "default_registry_sweep_secs")]
    pub registry_sweep_secs: u64,

    /// How long offline agent records are kept before removal.
    #[serde(default = "default_offline_grace_secs")]
    pub offline_grace_secs: u64,

    /// Closed set of task types agents may declare. Empty = accept any.
    #[serde(default)]
    pub known_task_types: Vec<String>,

    /// Maximum queued (not yet dispatched) tasks.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Requeue attempts before a task is declared timed out.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Deadline applied when a submission carries no timeout.
    #[serde(default = "default_task_timeout_secs")]
    pub default_task_timeout_secs: u64,

    /// How long terminal task ids are remembered.
    #[serde(default = "default_task_retention_secs")]
    pub task_retention_secs: u64,

    /// Interval of the task timeout sweep.
    #[serde(default = "default_task_sweep_secs")]
    pub task_sweep_secs: u64,

    #[serde(default)]
    pub breaker: BreakerSection,

    #[serde(default)]
    pub cluster: ClusterSection,
}

/// `[breaker]` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerSection {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_breaker_cooldown_secs")]
    pub cooldown_secs: u64,
    #[serde(default = "default_breaker_max_cooldown_secs")]
    pub max_cooldown_secs: u64,
}

impl Default for BreakerSection {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cooldown_secs: default_breaker_cooldown_secs(),
            max_cooldown_secs: default_breaker_max_cooldown_secs(),
        }
    }
}

/// `[cluster]` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_announce_interval_secs")]
    pub announce_interval_secs: u64,
    #[serde(default = "default_peer_ttl_secs")]
    pub peer_ttl_secs: u64,
}

impl Default for ClusterSection {
    fn default() -> Self {
        Self {
            enabled: false,
            announce_interval_secs: default_announce_interval_secs(),
            peer_ttl_secs: default_peer_ttl_secs(),
        }
    }
}

fn default_node_id() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "corral-hub".into())
}

fn default_listen_addr() -> SocketAddr {
    ([0, 0, 0, 0], 7400).into()
}

fn default_ops_addr() -> SocketAddr {
    ([127, 0, 0, 1], 7401).into()
}

fn default_heartbeat_interval_secs() -> u64 {
    10
}

fn default_missed_beat_tolerance() -> u32 {
    3
}

fn default_registry_sweep_secs() -> u64 {
    5
}

fn default_offline_grace_secs() -> u64 {
    300
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_max_retries() -> u32 {
    2
}

fn default_task_timeout_secs() -> u64 {
    60
}

fn default_task_retention_secs() -> u64 {
    300
}

fn default_task_sweep_secs() -> u64 {
    2
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_breaker_cooldown_secs() -> u64 {
    30
}

fn default_breaker_max_cooldown_secs() -> u64 {
    300
}

fn default_announce_interval_secs() -> u64 {
    5
}

fn default_peer_ttl_secs() -> u64 {
    30
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            listen_addr: default_listen_addr(),
            ops_addr: default_ops_addr(),
            strategy: LoadBalanceStrategy::default(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            missed_beat_tolerance: default_missed_beat_tolerance(),
            registry_sweep_secs: default_registry_sweep_secs(),
            offline_grace_secs: default_offline_grace_secs(),
            known_task_types: Vec::new(),
            queue_capacity: default_queue_capacity(),
            max_retries: default_max_retries(),
            default_task_timeout_secs: default_task_timeout_secs(),
            task_retention_secs: default_task_retention_secs(),
            task_sweep_secs: default_task_sweep_secs(),
            breaker: BreakerSection::default(),
            cluster: ClusterSection::default(),
        }
    }
}

impl HubConfig {
    /// Loads configuration from disk, or creates a default file if none
    /// exists at the path.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => config_path()?,
        };

        if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            let config: HubConfig = toml::from_str(&content)?;
            Ok(config)
        } else {
            let config = HubConfig::default();
            config.save(&path)?;
            Ok(config)
        }
    }

    /// Saves the current configuration to disk.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        tracing::debug!(path = %path.display(), "configuration saved");
        Ok(())
    }

    /// Registry view of this configuration.
    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            heartbeat_interval: Duration::from_secs(self.heartbeat_interval_secs),
            missed_beat_tolerance: self.missed_beat_tolerance,
            sweep_interval: Duration::from_secs(self.registry_sweep_secs),
            offline_grace: Duration::from_secs(self.offline_grace_secs),
            known_task_types: self.known_task_types.clone(),
            breaker: BreakerConfig {
                failure_threshold: self.breaker.failure_threshold,
                cooldown: Duration::from_secs(self.breaker.cooldown_secs),
                max_cooldown: Duration::from_secs(self.breaker.max_cooldown_secs),
            },
        }
    }

    /// Dispatcher view of this configuration.
    pub fn dispatcher_config(&self) -> corral_dispatch::DispatcherConfig {
        corral_dispatch::DispatcherConfig {
            queue_capacity: self.queue_capacity,
            max_retries: self.max_retries,
            default_timeout: Duration::from_secs(self.default_task_timeout_secs),
            retention: Duration::from_secs(self.task_retention_secs),
            sweep_interval: Duration::from_secs(self.task_sweep_secs),
            strategy: self.strategy,
        }
    }

    /// Cluster view of this configuration, given the bound listener port.
    pub fn cluster_config(&self, advertise_port: u16) -> corral_cluster::ClusterConfig {
        corral_cluster::ClusterConfig {
            node_id: self.node_id.clone(),
            advertise_port,
            announce_interval: Duration::from_secs(self.cluster.announce_interval_secs),
            peer_ttl: Duration::from_secs(self.cluster.peer_ttl_secs),
            sweep_interval: Duration::from_secs(self.cluster.peer_ttl_secs.min(5)),
        }
    }
}

/// Returns the platform-specific configuration file path.
fn config_path() -> anyhow::Result<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
        Ok(PathBuf::from(home)
            .join(".config")
            .join("corral")
            .join("hub.toml"))
    }

    #[cfg(target_os = "windows")]
    {
        let appdata =
            std::env::var("APPDATA").unwrap_or_else(|_| "C:\\Users\\Default\\AppData".into());
        Ok(PathBuf::from(appdata).join("corral").join("hub.toml"))
    }

    #[cfg(not(any(target_os = "linux", target_os = "windows")))]
    {
        Ok(PathBuf::from("/tmp/corral/hub.toml"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_sane() {
        let config = HubConfig::default();
        assert!(!config.node_id.is_empty());
        assert_eq!(config.strategy, LoadBalanceStrategy::RoundRobin);
        assert_eq!(config.missed_beat_tolerance, 3);
        assert!(!config.cluster.enabled);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config: HubConfig = toml::from_str(
            r#"
            strategy = "least_connections"
            queue_capacity = 16

            [cluster]
            enabled = true
            "#,
        )
        .unwrap();
        assert_eq!(config.strategy, LoadBalanceStrategy::LeastConnections);
        assert_eq!(config.queue_capacity, 16);
        assert!(config.cluster.enabled);
        assert_eq!(config.max_retries, 2);
        assert_eq!(config.breaker.failure_threshold, 5);
    }

    #[test]
    fn save_and_reload_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hub.toml");

        let mut config = HubConfig::default();
        config.node_id = "node-test".into();
        config.known_task_types = vec!["echo".into()];
        config.save(&path).unwrap();

        let loaded = HubConfig::load(Some(&path)).unwrap();
        assert_eq!(loaded.node_id, "node-test");
        assert_eq!(loaded.known_task_types, vec!["echo"]);
    }

    #[test]
    fn load_creates_default_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fresh.toml");
        assert!(!path.exists());

        let config = HubConfig::load(Some(&path)).unwrap();
        assert!(path.exists());
        assert_eq!(config.queue_capacity, 1024);
    }

    #[test]
    fn registry_config_derives_ttl_inputs() {
        let config: HubConfig = toml::from_str(
            r#"
            heartbeat_interval_secs = 2
            missed_beat_tolerance = 4
            "#,
        )
        .unwrap();
        let registry = config.registry_config();
        assert_eq!(registry.ttl(), Duration::from_secs(8));
    }
}
