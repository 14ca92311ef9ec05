use crate::error::{BlockchainError, Result};
use crate::wallet::validate_address;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_NODE_ADDR: &str = "127.0.0.1:2001";

const NODE_ADDRESS_KEY: &str = "NODE_ADDRESS";
const MINING_ADDRESS_KEY: &str = "MINING_ADDRESS";
const NODE_ID_KEY: &str = "NODE_ID";
const SEED_NODES_KEY: &str = "SEED_NODES";

/// Node settings. Built once at startup and passed by value to whoever
/// needs it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub node_address: String,
    /// Names the node's database directory; the port of `node_address` when unset.
    pub node_id: Option<String>,
    pub data_dir: PathBuf,
    pub wallet_file: PathBuf,
    pub mining_address: Option<String>,
    pub seed_nodes: Vec<String>,
    /// Leading zero bits required of every block hash.
    pub difficulty: u32,
    pub worker_threads: usize,
    pub accept_queue: usize,
    pub dial_timeout_ms: u64,
    pub io_timeout_ms: u64,
    pub sync_interval_secs: u64,
    /// Pool size at which a mining node starts a round.
    pub mempool_threshold: usize,
    pub max_frame_bytes: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            node_address: DEFAULT_NODE_ADDR.to_string(),
            node_id: None,
            data_dir: PathBuf::from("data"),
            wallet_file: PathBuf::from(crate::wallet::WALLET_FILE),
            mining_address: None,
            seed_nodes: vec![DEFAULT_NODE_ADDR.to_string()],
            difficulty: crate::core::TARGET_BITS,
            worker_threads: 4,
            accept_queue: 64,
            dial_timeout_ms: 5000,
            io_timeout_ms: 5000,
            sync_interval_secs: 30,
            mempool_threshold: 2,
            max_frame_bytes: 8 * 1024 * 1024,
        }
    }
}

impl Config {
    /// Defaults, overlaid by the TOML file at `path` (if given), overlaid by
    /// the environment.
    pub fn load(path: Option<&Path>) -> Result<Config> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Config::default(),
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Config> {
        let contents = fs::read_to_string(path).map_err(|e| {
            BlockchainError::Config(format!("Failed to read {}: {e}", path.display()))
        })?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Config> {
        toml::from_str(contents).map_err(|e| BlockchainError::Config(e.to_string()))
    }

    pub fn apply_env(&mut self) {
        self.apply_vars(|key| env::var(key).ok());
    }

    fn apply_vars<F: Fn(&str) -> Option<String>>(&mut self, var: F) {
        if let Some(addr) = var(NODE_ADDRESS_KEY) {
            self.node_address = addr;
        }
        if let Some(node_id) = var(NODE_ID_KEY) {
            self.node_id = Some(node_id);
        }
        if let Some(addr) = var(MINING_ADDRESS_KEY) {
            self.mining_address = Some(addr);
        }
        if let Some(seeds) = var(SEED_NODES_KEY) {
            self.seed_nodes = seeds
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !(1..=255).contains(&self.difficulty) {
            return Err(BlockchainError::Config(format!(
                "difficulty must be within 1..=255, got {}",
                self.difficulty
            )));
        }
        if self.worker_threads == 0 || self.accept_queue == 0 {
            return Err(BlockchainError::Config(
                "worker_threads and accept_queue must be non-zero".to_string(),
            ));
        }
        if self.mempool_threshold == 0 || self.max_frame_bytes == 0 {
            return Err(BlockchainError::Config(
                "mempool_threshold and max_frame_bytes must be non-zero".to_string(),
            ));
        }
        if self.node_address.is_empty() {
            return Err(BlockchainError::Config("node_address must be set".to_string()));
        }
        if let Some(addr) = &self.mining_address {
            if !validate_address(addr) {
                return Err(BlockchainError::Config(format!("Invalid mining address: {addr}")));
            }
        }
        Ok(())
    }

    /// Explicit `node_id`, else the port of `node_address` ("127.0.0.1:2001" -> "2001").
    pub fn node_id(&self) -> String {
        if let Some(node_id) = &self.node_id {
            return node_id.clone();
        }
        match self.node_address.rsplit_once(':') {
            Some((_, port)) if !port.is_empty() => port.to_string(),
            _ => "default".to_string(),
        }
    }

    /// `data_dir/node_<id>`, so several nodes can share one machine.
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join(format!("node_{}", self.node_id()))
    }

    pub fn is_miner(&self) -> bool {
        self.mining_address.is_some()
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }
}
