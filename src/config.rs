//! Configuration management for the Nous node

use crate::crypto::Address;
use crate::error::ChainError;
use crate::genesis::{GenesisConfig, GENESIS_RULES};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub gossip: GossipConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub mempool: MempoolConfig,
    #[serde(default)]
    pub producer: ProducerConfig,
    #[serde(default)]
    pub identity: IdentityConfig,
    #[serde(default)]
    pub genesis: GenesisConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(default = "default_listen_host")]
    pub listen_host: String,
    #[serde(default = "default_p2p_port")]
    pub p2p_port: u16,
    #[serde(default = "default_rpc_port")]
    pub rpc_port: u16,
    #[serde(default = "default_network_id")]
    pub network_id: u32,
    #[serde(default)]
    pub bootstrap_peers: Vec<String>,
    #[serde(default = "default_max_peers")]
    pub max_peers: usize,
    #[serde(default = "default_target_peers")]
    pub target_peers: usize,
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,
    #[serde(default = "default_maintenance_interval")]
    pub maintenance_interval_secs: u64,
    #[serde(default = "default_stale_peer")]
    pub stale_peer_secs: u64,
}

impl NetworkConfig {
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.listen_host, self.p2p_port)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval_secs)
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_host: default_listen_host(),
            p2p_port: default_p2p_port(),
            rpc_port: default_rpc_port(),
            network_id: default_network_id(),
            bootstrap_peers: Vec::new(),
            max_peers: default_max_peers(),
            target_peers: default_target_peers(),
            read_timeout_secs: default_read_timeout(),
            handshake_timeout_secs: default_handshake_timeout(),
            maintenance_interval_secs: default_maintenance_interval(),
            stale_peer_secs: default_stale_peer(),
        }
    }
}

/// Gossip knobs. `fanout`, `max_hops` and the rate limits are carried for
/// operators but propagation is flood-with-dedup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GossipConfig {
    #[serde(default = "default_seen_cache_size")]
    pub seen_cache_size: usize,
    #[serde(default = "default_seen_ttl")]
    pub seen_ttl_secs: u64,
    #[serde(default = "default_fanout")]
    pub fanout: usize,
    #[serde(default = "default_max_hops")]
    pub max_hops: u32,
    #[serde(default = "default_max_tx_per_second")]
    pub max_tx_per_second: u32,
    #[serde(default = "default_max_blocks_per_second")]
    pub max_blocks_per_second: u32,
}

impl GossipConfig {
    pub fn seen_ttl(&self) -> Duration {
        Duration::from_secs(self.seen_ttl_secs)
    }
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            seen_cache_size: default_seen_cache_size(),
            seen_ttl_secs: default_seen_ttl(),
            fanout: default_fanout(),
            max_hops: default_max_hops(),
            max_tx_per_second: default_max_tx_per_second(),
            max_blocks_per_second: default_max_blocks_per_second(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: u64,
    #[serde(default = "default_response_timeout")]
    pub response_timeout_secs: u64,
}

impl SyncConfig {
    pub fn response_timeout(&self) -> Duration {
        Duration::from_secs(self.response_timeout_secs)
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            response_timeout_secs: default_response_timeout(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MempoolConfig {
    #[serde(default = "default_mempool_size")]
    pub max_size: usize,
}

impl Default for MempoolConfig {
    fn default() -> Self {
        Self {
            max_size: default_mempool_size(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProducerConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_block_interval")]
    pub block_interval_secs: u64,
    #[serde(default = "default_max_block_transactions")]
    pub max_block_transactions: usize,
    /// Human owner recorded for this node when it is an agent validator
    #[serde(default)]
    pub owner_address: Option<Address>,
}

impl ProducerConfig {
    pub fn block_interval(&self) -> Duration {
        Duration::from_secs(self.block_interval_secs)
    }
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            block_interval_secs: default_block_interval(),
            max_block_transactions: default_max_block_transactions(),
            owner_address: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// Hex-encoded secp256k1 secret key; a fresh key is generated when absent
    #[serde(default)]
    pub secret_key: Option<String>,
}

impl Config {
    pub fn from_toml_str(s: &str) -> Result<Self, ChainError> {
        let config: Config = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ChainError> {
        if self.sync.batch_size == 0 {
            return Err(ChainError::Config("sync.batch_size must be positive".to_string()));
        }
        if self.mempool.max_size == 0 {
            return Err(ChainError::Config("mempool.max_size must be positive".to_string()));
        }
        let periods = [
            ("producer.block_interval_secs", self.producer.block_interval_secs),
            ("network.read_timeout_secs", self.network.read_timeout_secs),
            ("network.handshake_timeout_secs", self.network.handshake_timeout_secs),
            ("network.maintenance_interval_secs", self.network.maintenance_interval_secs),
            ("sync.response_timeout_secs", self.sync.response_timeout_secs),
        ];
        if let Some((name, _)) = periods.iter().find(|(_, secs)| *secs == 0) {
            return Err(ChainError::Config(format!("{} must be positive", name)));
        }
        if self.network.target_peers > self.network.max_peers {
            return Err(ChainError::Config(
                "network.target_peers cannot exceed network.max_peers".to_string(),
            ));
        }
        if self.network.network_id != GENESIS_RULES.network_id {
            return Err(ChainError::Config(format!(
                "network.network_id {:#x} does not match genesis network id {:#x}",
                self.network.network_id, GENESIS_RULES.network_id
            )));
        }

        let addresses = self
            .genesis
            .validators
            .iter()
            .flat_map(|v| std::iter::once(&v.address).chain(v.owner.as_ref()))
            .chain(self.genesis.balances.keys())
            .chain(self.producer.owner_address.as_ref());
        for address in addresses {
            if !address.is_well_formed() {
                return Err(ChainError::Config(format!("Malformed address: {}", address)));
            }
        }
        for validator in &self.genesis.validators {
            if validator.stake < GENESIS_RULES.min_stake {
                return Err(ChainError::Config(format!(
                    "Genesis validator {} stakes less than the minimum",
                    validator.address
                )));
            }
        }
        Ok(())
    }
}

/// Reads `path` (default `config.toml`). A missing or empty file yields
/// the defaults.
pub fn load_config(path: Option<&Path>) -> Result<Config, ChainError> {
    let path = path.unwrap_or_else(|| Path::new("config.toml"));
    let config_str = fs::read_to_string(path).unwrap_or_default();
    if config_str.trim().is_empty() {
        return Ok(Config::default());
    }
    Config::from_toml_str(&config_str)
}

fn default_listen_host() -> String {
    "0.0.0.0".to_string()
}

fn default_p2p_port() -> u16 {
    9000
}

fn default_rpc_port() -> u16 {
    9001
}

fn default_network_id() -> u32 {
    GENESIS_RULES.network_id
}

fn default_max_peers() -> usize {
    50
}

fn default_target_peers() -> usize {
    12
}

fn default_read_timeout() -> u64 {
    60
}

fn default_handshake_timeout() -> u64 {
    5
}

fn default_maintenance_interval() -> u64 {
    30
}

fn default_stale_peer() -> u64 {
    120
}

fn default_seen_cache_size() -> usize {
    10_000
}

fn default_seen_ttl() -> u64 {
    300
}

fn default_fanout() -> usize {
    8
}

fn default_max_hops() -> u32 {
    10
}

fn default_max_tx_per_second() -> u32 {
    100
}

fn default_max_blocks_per_second() -> u32 {
    10
}

fn default_batch_size() -> u64 {
    100
}

fn default_response_timeout() -> u64 {
    5
}

fn default_mempool_size() -> usize {
    crate::mempool::DEFAULT_MEMPOOL_SIZE
}

fn default_block_interval() -> u64 {
    600
}

fn default_max_block_transactions() -> usize {
    100
}
