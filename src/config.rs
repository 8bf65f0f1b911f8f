//! Node configuration
//!
//! Consensus parameters must match across every node on a network; mempool
//! policy and persistence cadence are local choices. All structures
//! deserialize with defaults so a config file only needs the fields it
//! overrides.

use crate::constants::*;
use crate::error::StorageError;
use crate::types::{parse_hash, Hash, Height};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// A height whose canonical block is pinned; no reorganization may cross it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub height: Height,
    #[serde(with = "crate::types::hex_hash")]
    pub hash: Hash,
}

impl Checkpoint {
    pub fn new(height: Height, hash: Hash) -> Self {
        Checkpoint { height, hash }
    }

    /// Parse from a hex hash string
    pub fn parse(height: Height, hash_hex: &str) -> Option<Self> {
        parse_hash(hash_hex).map(|hash| Checkpoint { height, hash })
    }
}

/// Network-wide consensus rules
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusParams {
    pub network: String,
    pub initial_reward: u64,
    pub halving_interval: u64,
    pub max_supply: u64,
    /// Easiest target, also the genesis difficulty
    pub pow_limit_bits: u32,
    pub target_block_time: u64,
    pub difficulty_adjustment_interval: u64,
    pub difficulty_clamp_factor: u64,
    pub max_future_block_time: u64,
    pub max_reorg_depth: u64,
    pub max_block_size: usize,
    pub dust_threshold: u64,
    pub genesis_timestamp: u64,
    pub checkpoints: Vec<Checkpoint>,
}

impl ConsensusParams {
    pub fn mainnet() -> Self {
        ConsensusParams {
            network: "mainnet".to_string(),
            initial_reward: INITIAL_REWARD,
            halving_interval: HALVING_INTERVAL,
            max_supply: MAX_SUPPLY,
            pow_limit_bits: MAINNET_POW_LIMIT_BITS,
            target_block_time: TARGET_BLOCK_TIME,
            difficulty_adjustment_interval: DIFFICULTY_ADJUSTMENT_INTERVAL,
            difficulty_clamp_factor: DIFFICULTY_CLAMP_FACTOR,
            max_future_block_time: MAX_FUTURE_BLOCK_TIME,
            max_reorg_depth: MAX_REORG_DEPTH,
            max_block_size: MAX_BLOCK_SIZE,
            dust_threshold: DUST_THRESHOLD,
            genesis_timestamp: GENESIS_TIMESTAMP,
            checkpoints: Vec::new(),
        }
    }

    /// Trivial proof of work and a unit dust threshold, for tests and local runs
    pub fn regtest() -> Self {
        ConsensusParams {
            network: "regtest".to_string(),
            pow_limit_bits: REGTEST_POW_LIMIT_BITS,
            dust_threshold: 1,
            ..Self::mainnet()
        }
    }

    /// Expected duration of one adjustment window
    pub fn expected_timespan(&self) -> u64 {
        self.difficulty_adjustment_interval * self.target_block_time
    }

    /// Highest configured checkpoint height, if any
    pub fn last_checkpoint_height(&self) -> Option<Height> {
        self.checkpoints.iter().map(|c| c.height).max()
    }
}

impl Default for ConsensusParams {
    fn default() -> Self {
        Self::mainnet()
    }
}

/// Local mempool policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MempoolPolicy {
    pub max_bytes: usize,
    pub max_age_secs: u64,
    pub rbf_min_bump_percent: u64,
    pub rbf_min_bump_abs: u64,
}

impl MempoolPolicy {
    pub fn regtest() -> Self {
        MempoolPolicy {
            rbf_min_bump_abs: 1,
            ..Self::default()
        }
    }
}

impl Default for MempoolPolicy {
    fn default() -> Self {
        MempoolPolicy {
            max_bytes: MEMPOOL_MAX_BYTES,
            max_age_secs: MEMPOOL_MAX_AGE_SECS,
            rbf_min_bump_percent: RBF_MIN_BUMP_PERCENT,
            rbf_min_bump_abs: RBF_MIN_BUMP_ABS,
        }
    }
}

/// Everything a node needs at startup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub data_dir: PathBuf,
    pub consensus: ConsensusParams,
    pub mempool: MempoolPolicy,
    /// Persist after this many accepted blocks; 0 disables scheduled saves
    pub persist_every_blocks: u64,
    /// Take a backup after this many accepted blocks; 0 disables backups
    pub backup_every_blocks: u64,
    pub backup_retention: usize,
    pub storage_retry_attempts: u32,
    pub orphan_limit: usize,
    pub orphan_ttl_secs: u64,
}

impl NodeConfig {
    pub fn regtest(data_dir: impl Into<PathBuf>) -> Self {
        NodeConfig {
            data_dir: data_dir.into(),
            consensus: ConsensusParams::regtest(),
            mempool: MempoolPolicy::regtest(),
            ..Self::default()
        }
    }

    /// Read a JSON config file; missing fields take their defaults
    pub fn from_file(path: &Path) -> Result<Self, StorageError> {
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            data_dir: PathBuf::from("./ledger-data"),
            consensus: ConsensusParams::default(),
            mempool: MempoolPolicy::default(),
            persist_every_blocks: 10,
            backup_every_blocks: 100,
            backup_retention: 5,
            storage_retry_attempts: 3,
            orphan_limit: ORPHAN_LIMIT,
            orphan_ttl_secs: ORPHAN_TTL_SECS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_takes_defaults() {
        let cfg: NodeConfig =
            serde_json::from_str(r#"{ "consensus": { "network": "regtest", "max_reorg_depth": 5 } }"#)
                .unwrap();
        assert_eq!(cfg.consensus.max_reorg_depth, 5);
        assert_eq!(cfg.consensus.halving_interval, HALVING_INTERVAL);
        assert_eq!(cfg.mempool, MempoolPolicy::default());
        assert_eq!(cfg.persist_every_blocks, 10);
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.json");
        std::fs::write(&path, r#"{ "backup_retention": 2 }"#).unwrap();
        let cfg = NodeConfig::from_file(&path).unwrap();
        assert_eq!(cfg.backup_retention, 2);

        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            NodeConfig::from_file(&path),
            Err(StorageError::Serialization(_))
        ));
    }

    #[test]
    fn test_regtest_presets() {
        let params = ConsensusParams::regtest();
        assert_eq!(params.pow_limit_bits, REGTEST_POW_LIMIT_BITS);
        assert_eq!(params.dust_threshold, 1);
        assert_eq!(params.initial_reward, INITIAL_REWARD);
        assert_eq!(params.expected_timespan(), 2016 * 120);
    }

    #[test]
    fn test_checkpoint_parse() {
        let cp = Checkpoint::parse(10, &"ab".repeat(32)).unwrap();
        assert_eq!(cp.hash, [0xab; 32]);
        assert!(Checkpoint::parse(10, "xyz").is_none());
    }
}
