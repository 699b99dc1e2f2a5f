use crate::{PoolError, PoolResult, WorkerId, DEFAULT_COORDINATOR};
use log::warn;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use tokio::fs;

pub const CONFIG_FILE_NAME: &str = "mempool.json";

/// One peer of the cluster, as known to the coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerEntry {
    pub worker_id: WorkerId,
    /// Bare IP, `ip:port` or a resolvable hostname.
    pub address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemPoolConfig {
    pub worker_id: WorkerId,
    /// Address this worker advertises to its peers.
    #[serde(default = "default_address")]
    pub address: String,
    /// Overrides address resolution when the worker is bound to loopback
    /// but reachable at a real host IP.
    #[serde(default)]
    pub external_ip: Option<Ipv4Addr>,
    #[serde(default = "default_coordinator")]
    pub coordinator: WorkerId,
    /// Peer table. Only the coordinator needs a complete one.
    #[serde(default)]
    pub peers: Vec<PeerEntry>,
    /// Root for the spill directory. Defaults to the working directory.
    #[serde(default)]
    pub base_dir: Option<PathBuf>,
    #[serde(default = "default_true")]
    pub enable_who_has_read: bool,
    /// When off, file fetches always target the lowest worker id per host.
    #[serde(default = "default_true")]
    pub enable_random_fref_serve: bool,
    /// Advisory memory cap driving the eviction policy. None disables it.
    #[serde(default)]
    pub max_memsize: Option<u64>,
    /// Spill refs without the destroy-on-evict bit instead of keeping them
    /// resident when the cap is hit.
    #[serde(default)]
    pub spill_to_disk: bool,
}

fn default_address() -> String {
    "127.0.0.1".to_string()
}

fn default_coordinator() -> WorkerId {
    DEFAULT_COORDINATOR
}

fn default_true() -> bool {
    true
}

impl Default for MemPoolConfig {
    fn default() -> Self {
        Self::new(DEFAULT_COORDINATOR)
    }
}

impl MemPoolConfig {
    pub fn new(worker_id: WorkerId) -> Self {
        Self {
            worker_id,
            address: default_address(),
            external_ip: None,
            coordinator: DEFAULT_COORDINATOR,
            peers: Vec::new(),
            base_dir: None,
            enable_who_has_read: true,
            enable_random_fref_serve: true,
            max_memsize: None,
            spill_to_disk: false,
        }
    }

    pub fn is_coordinator(&self) -> bool {
        self.worker_id == self.coordinator
    }

    /// Load the config from `<root>/mempool.json`, writing the defaults for
    /// `worker_id` there on first use.
    pub async fn load(root: &Path, worker_id: WorkerId) -> PoolResult<Self> {
        let config_path = root.join(CONFIG_FILE_NAME);
        if !config_path.exists() {
            let config = Self::new(worker_id);
            fs::create_dir_all(root).await.map_err(|e| {
                warn!("MemPoolConfig: create config dir failed! {}", e);
                PoolError::IoError(e.to_string())
            })?;
            let config_str = serde_json::to_string_pretty(&config)
                .map_err(|e| PoolError::Internal(e.to_string()))?;
            fs::write(&config_path, config_str).await.map_err(|e| {
                warn!("MemPoolConfig: write config failed! {}", e);
                PoolError::IoError(e.to_string())
            })?;
            return Ok(config);
        }

        let config_str = fs::read_to_string(&config_path).await.map_err(|e| {
            warn!("MemPoolConfig: read config failed! {}", e);
            PoolError::IoError(e.to_string())
        })?;
        serde_json::from_str::<MemPoolConfig>(&config_str).map_err(|e| {
            warn!("MemPoolConfig: parse config failed! {}", e);
            PoolError::DecodeError(e.to_string())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_load_writes_defaults_then_reads_them_back() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config = MemPoolConfig::load(temp_dir.path(), 7).await.unwrap();
        assert_eq!(config.worker_id, 7);
        assert!(config.enable_who_has_read);
        assert!(config.enable_random_fref_serve);
        assert!(!config.spill_to_disk);

        // A second load reads the written file, worker_id argument ignored.
        let again = MemPoolConfig::load(temp_dir.path(), 99).await.unwrap();
        assert_eq!(again.worker_id, 7);
    }

    #[tokio::test]
    async fn test_load_rejects_garbage() {
        let temp_dir = tempfile::tempdir().unwrap();
        tokio::fs::write(temp_dir.path().join(CONFIG_FILE_NAME), b"not json")
            .await
            .unwrap();
        let err = MemPoolConfig::load(temp_dir.path(), 1).await.unwrap_err();
        assert!(matches!(err, PoolError::DecodeError(_)));
    }
}
