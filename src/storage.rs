//! Chain persistence, backups and startup recovery
//!
//! The canonical chain is written as one JSON document. Writes go to a
//! temporary file which is fsynced and then renamed over the current file,
//! so a crash leaves either the old or the new state on disk. Loaded state is
//! never trusted: recovery replays every block through the validator and
//! compares the result against the persisted tip, work and UTXO digest.

use crate::chain::ChainState;
use crate::config::{Checkpoint, ConsensusParams};
use crate::constants::STORAGE_FORMAT_VERSION;
use crate::error::StorageError;
use crate::types::*;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const CHAIN_FILE: &str = "chain.json";
const BACKUP_DIR: &str = "backups";
const BACKUP_PREFIX: &str = "chain-";

/// On-disk form of the canonical chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedChain {
    pub format_version: u32,
    pub network: String,
    /// Canonical blocks from genesis to tip
    pub blocks: Vec<Block>,
    #[serde(with = "crate::types::hex_hash")]
    pub tip_hash: Hash,
    pub cumulative_work: ChainWork,
    pub checkpoints: Vec<Checkpoint>,
    #[serde(with = "crate::types::hex_hash")]
    pub utxo_digest: Hash,
    pub minted: Amount,
}

impl PersistedChain {
    pub fn from_chain(chain: &ChainState) -> Self {
        PersistedChain {
            format_version: STORAGE_FORMAT_VERSION,
            network: chain.params().network.clone(),
            blocks: chain.canonical_blocks(),
            tip_hash: chain.tip_hash(),
            cumulative_work: chain.cumulative_work(),
            checkpoints: chain.checkpoints().to_vec(),
            utxo_digest: chain.utxo().digest(),
            minted: chain.minted(),
        }
    }

    pub fn height(&self) -> Height {
        self.blocks.last().map(|b| b.header.height).unwrap_or(0)
    }

    /// Cheap self-consistency check, no replay
    fn check_shape(&self) -> Result<(), StorageError> {
        if self.format_version != STORAGE_FORMAT_VERSION {
            return Err(StorageError::VersionMismatch {
                found: self.format_version,
                expected: STORAGE_FORMAT_VERSION,
            });
        }
        let last = self
            .blocks
            .last()
            .ok_or_else(|| StorageError::Corrupt("no blocks".to_string()))?;
        if last.hash() != self.tip_hash {
            return Err(StorageError::Corrupt("tip hash does not match last block".to_string()));
        }
        for (i, pair) in self.blocks.windows(2).enumerate() {
            if pair[1].header.previous_hash != pair[0].hash() {
                return Err(StorageError::Corrupt(format!("block {} does not link to its parent", i + 1)));
            }
        }
        Ok(())
    }
}

/// Where a recovered chain came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoverySource {
    Primary,
    Backup(PathBuf),
    Genesis,
}

/// Chain file, backups and quarantined files under one data directory
#[derive(Debug, Clone)]
pub struct Storage {
    data_dir: PathBuf,
    backup_retention: usize,
}

impl Storage {
    /// Open (creating if needed) the data directory
    pub fn open(data_dir: impl Into<PathBuf>, backup_retention: usize) -> Result<Self, StorageError> {
        let data_dir = data_dir.into();
        fs::create_dir_all(data_dir.join(BACKUP_DIR))?;
        Ok(Storage {
            data_dir,
            backup_retention,
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn chain_path(&self) -> PathBuf {
        self.data_dir.join(CHAIN_FILE)
    }

    fn backup_dir(&self) -> PathBuf {
        self.data_dir.join(BACKUP_DIR)
    }

    /// Atomically replace the chain file
    pub fn save(&self, chain: &PersistedChain) -> Result<(), StorageError> {
        let contents = serde_json::to_vec_pretty(chain)?;
        write_atomic(&self.chain_path(), &contents)?;
        tracing::debug!(height = chain.height(), path = %self.chain_path().display(), "chain saved");
        Ok(())
    }

    /// `save`, retried with exponential backoff; returns the last error
    pub fn save_with_retry(&self, chain: &PersistedChain, attempts: u32) -> Result<(), StorageError> {
        let attempts = attempts.max(1);
        let mut delay = Duration::from_millis(25);
        let mut attempt = 1;
        loop {
            match self.save(chain) {
                Ok(()) => return Ok(()),
                Err(e) if attempt < attempts => {
                    tracing::warn!(attempt, error = %e, "chain save failed, retrying");
                    std::thread::sleep(delay);
                    delay *= 2;
                    attempt += 1;
                }
                Err(e) => {
                    tracing::warn!(attempts, error = %e, "chain save failed, giving up");
                    return Err(e);
                }
            }
        }
    }

    pub fn load(&self) -> Result<PersistedChain, StorageError> {
        read_chain(&self.chain_path())
    }

    /// File exists but cannot be parsed or is internally inconsistent
    pub fn detect_corruption(&self) -> bool {
        match self.load() {
            Ok(_) | Err(StorageError::NotFound) => false,
            Err(e) => {
                tracing::warn!(error = %e, "chain file corrupt");
                true
            }
        }
    }

    /// Copy the current chain file into the backup directory
    ///
    /// Backups are numbered; only the newest `backup_retention` are kept.
    pub fn backup(&self) -> Result<PathBuf, StorageError> {
        let source = self.chain_path();
        if !source.exists() {
            return Err(StorageError::NotFound);
        }
        let next = self
            .backups()?
            .first()
            .and_then(|p| backup_sequence(p))
            .map(|n| n + 1)
            .unwrap_or(0);
        let target = self.backup_dir().join(format!("{}{:010}.json", BACKUP_PREFIX, next));
        let contents = fs::read(&source)?;
        write_atomic(&target, &contents)?;

        for stale in self.backups()?.into_iter().skip(self.backup_retention.max(1)) {
            fs::remove_file(&stale)?;
            tracing::debug!(path = %stale.display(), "backup pruned");
        }
        tracing::info!(path = %target.display(), "backup written");
        Ok(target)
    }

    /// Backup files, newest first
    pub fn backups(&self) -> Result<Vec<PathBuf>, StorageError> {
        let mut backups: Vec<(u64, PathBuf)> = fs::read_dir(self.backup_dir())?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter_map(|path| backup_sequence(&path).map(|n| (n, path)))
            .collect();
        backups.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(backups.into_iter().map(|(_, path)| path).collect())
    }

    /// Make the newest readable backup the current chain file
    pub fn restore_from_backup(&self) -> Result<PathBuf, StorageError> {
        for path in self.backups()? {
            match read_chain(&path) {
                Ok(chain) => {
                    self.save(&chain)?;
                    tracing::info!(path = %path.display(), height = chain.height(), "restored from backup");
                    return Ok(path);
                }
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "skipping unreadable backup"),
            }
        }
        Err(StorageError::NotFound)
    }

    /// Move the current chain file aside as `chain.json.corrupt-<ts>`
    pub fn quarantine(&self) -> Result<Option<PathBuf>, StorageError> {
        let source = self.chain_path();
        if !source.exists() {
            return Ok(None);
        }
        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        let target = self.data_dir.join(format!("{}.corrupt-{}", CHAIN_FILE, stamp));
        fs::rename(&source, &target)?;
        tracing::warn!(path = %target.display(), "chain file quarantined");
        Ok(Some(target))
    }
}

/// Recover: storage × params → chain × source
///
/// 1. Load the chain file and replay it through the validator
/// 2. If it is missing or fails, quarantine it and try each backup, newest first
/// 3. Fall back to a fresh genesis chain
///
/// A chain rebuilt from a backup is written back as the current file.
pub fn recover(
    storage: &Storage,
    params: &ConsensusParams,
    orphan_limit: usize,
    orphan_ttl_secs: u64,
) -> (ChainState, RecoverySource) {
    let fresh = || ChainState::with_orphan_limits(params.clone(), orphan_limit, orphan_ttl_secs);

    // 1. Primary
    match storage.load() {
        Ok(persisted) => match verify_chain(&persisted, params, orphan_limit, orphan_ttl_secs) {
            Ok(chain) => {
                tracing::info!(height = chain.height(), "chain recovered from disk");
                return (chain, RecoverySource::Primary);
            }
            Err(e) => tracing::warn!(error = %e, "persisted chain failed verification"),
        },
        Err(StorageError::NotFound) => tracing::info!("no persisted chain, checking backups"),
        Err(e) => tracing::warn!(error = %e, "persisted chain unreadable"),
    }

    // 2. Backups
    if let Err(e) = storage.quarantine() {
        tracing::warn!(error = %e, "could not quarantine chain file");
    }
    let backups = storage.backups().unwrap_or_default();
    for path in backups {
        let verified = read_chain(&path)
            .and_then(|persisted| verify_chain(&persisted, params, orphan_limit, orphan_ttl_secs));
        match verified {
            Ok(chain) => {
                if let Err(e) = storage.save(&PersistedChain::from_chain(&chain)) {
                    tracing::warn!(error = %e, "could not rewrite chain file from backup");
                }
                tracing::info!(path = %path.display(), height = chain.height(), "chain recovered from backup");
                return (chain, RecoverySource::Backup(path));
            }
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "backup failed verification"),
        }
    }

    // 3. Genesis
    tracing::warn!("no usable chain state, starting from genesis");
    (fresh(), RecoverySource::Genesis)
}

/// Replay a persisted chain and check it against its recorded summary
pub fn verify_chain(
    persisted: &PersistedChain,
    params: &ConsensusParams,
    orphan_limit: usize,
    orphan_ttl_secs: u64,
) -> Result<ChainState, StorageError> {
    persisted.check_shape()?;
    if persisted.network != params.network {
        return Err(StorageError::Corrupt(format!(
            "network {} does not match {}",
            persisted.network, params.network
        )));
    }

    let mut chain = ChainState::from_blocks(params.clone(), &persisted.blocks, orphan_limit, orphan_ttl_secs)
        .map_err(|rejection| StorageError::Corrupt(rejection.to_string()))?;

    for checkpoint in &persisted.checkpoints {
        if chain.block_at(checkpoint.height).map(|b| b.hash()) != Some(checkpoint.hash) {
            return Err(StorageError::Corrupt(format!(
                "checkpoint at height {} does not match",
                checkpoint.height
            )));
        }
        chain.add_checkpoint(checkpoint.height);
    }

    if chain.tip_hash() != persisted.tip_hash {
        return Err(StorageError::Corrupt("tip hash mismatch after replay".to_string()));
    }
    if chain.cumulative_work() != persisted.cumulative_work {
        return Err(StorageError::Corrupt("cumulative work mismatch after replay".to_string()));
    }
    if chain.minted() != persisted.minted {
        return Err(StorageError::Corrupt("minted supply mismatch after replay".to_string()));
    }
    if chain.utxo().digest() != persisted.utxo_digest {
        return Err(StorageError::Corrupt("UTXO digest mismatch after replay".to_string()));
    }
    Ok(chain)
}

// ============================================================================
// HELPER FUNCTIONS
// ============================================================================

fn read_chain(path: &Path) -> Result<PersistedChain, StorageError> {
    let contents = match fs::read(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(StorageError::NotFound),
        Err(e) => return Err(e.into()),
    };
    let chain: PersistedChain =
        serde_json::from_slice(&contents).map_err(|e| StorageError::Corrupt(e.to_string()))?;
    chain.check_shape()?;
    Ok(chain)
}

fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), StorageError> {
    let tmp = path.with_extension("json.tmp");
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(contents)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

fn backup_sequence(path: &Path) -> Option<u64> {
    path.file_name()?
        .to_str()?
        .strip_prefix(BACKUP_PREFIX)?
        .strip_suffix(".json")?
        .parse()
        .ok()
}
