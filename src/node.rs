//! Node facade: the external interface over chain, mempool and storage
//!
//! Locks are always taken chain first, then mempool. Readers that only need
//! balances take a UTXO snapshot and release the chain lock immediately.

use crate::block::{decode_block, HEADER_SIZE};
use crate::chain::{BlockOutcome, ChainState, ChainUpdate};
use crate::config::{Checkpoint, ConsensusParams, NodeConfig};
use crate::error::{RejectReason, StorageError};
use crate::mempool::{Mempool, MempoolSnapshot};
use crate::mining::{create_block_template, BlockTemplate, CancelToken};
use crate::storage::{recover, PersistedChain, RecoverySource, Storage};
use crate::transaction::decode_transaction;
use crate::types::*;
use crate::utxo::UtxoSnapshot;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::JoinHandle;
use std::time::{SystemTime, UNIX_EPOCH};

/// Block space held back for the coinbase when selecting transactions
const COINBASE_RESERVE: usize = 1_000;

/// Gossip callbacks for accepted blocks and transactions
pub trait Relay: Send + Sync {
    fn relay_block(&self, block: &Block);
    fn relay_transaction(&self, tx: &Transaction);
}

/// Relay that drops everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRelay;

impl Relay for NoopRelay {
    fn relay_block(&self, _block: &Block) {}
    fn relay_transaction(&self, _tx: &Transaction) {}
}

/// Supplies the address block rewards are paid to
pub trait PayoutAddressSource: Send + Sync {
    fn payout_address(&self) -> Address;
}

impl PayoutAddressSource for Address {
    fn payout_address(&self) -> Address {
        self.clone()
    }
}

/// Outcome of a submission
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubmitResult {
    pub accepted: bool,
    #[serde(serialize_with = "serialize_reason")]
    pub reason: Option<RejectReason>,
}

impl SubmitResult {
    pub fn accepted() -> Self {
        SubmitResult {
            accepted: true,
            reason: None,
        }
    }

    pub fn rejected(reason: RejectReason) -> Self {
        SubmitResult {
            accepted: false,
            reason: Some(reason),
        }
    }
}

fn serialize_reason<S: serde::Serializer>(reason: &Option<RejectReason>, s: S) -> Result<S::Ok, S::Error> {
    match reason {
        Some(reason) => s.serialize_some(&reason.to_string()),
        None => s.serialize_none(),
    }
}

/// Summary of the canonical chain
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChainInfo {
    pub height: Height,
    #[serde(with = "crate::types::hex_hash")]
    pub tip_hash: Hash,
    pub difficulty: f64,
    pub cumulative_work: ChainWork,
    /// Configured supply cap
    pub total_supply: Amount,
    /// Coins minted so far
    pub circulating_supply: Amount,
}

/// Liveness and persistence status
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Health {
    pub degraded: bool,
    pub last_storage_error: Option<String>,
    pub height: Height,
    pub mempool_size: usize,
    pub orphans: usize,
}

/// Persistence state shared with background writer threads
#[derive(Debug, Default)]
struct PersistStatus {
    degraded: AtomicBool,
    last_error: Mutex<Option<String>>,
}

impl PersistStatus {
    fn record(&self, result: &Result<(), StorageError>) {
        match result {
            Ok(()) => {
                self.degraded.store(false, Ordering::Release);
                *self.last_error.lock() = None;
            }
            Err(e) => {
                tracing::warn!(error = %e, "persistence failed, node degraded");
                self.degraded.store(true, Ordering::Release);
                *self.last_error.lock() = Some(e.to_string());
            }
        }
    }
}

/// Work for the persistence thread
enum PersistJob {
    Save {
        snapshot: PersistedChain,
        take_backup: bool,
    },
    /// Save, then report the result once every earlier job is done
    Flush {
        snapshot: PersistedChain,
        done: mpsc::Sender<Result<(), StorageError>>,
    },
}

/// Single background thread owning all disk writes, fed in order
struct PersistWriter {
    jobs: Mutex<Option<mpsc::Sender<PersistJob>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl PersistWriter {
    fn spawn(storage: Storage, attempts: u32, status: Arc<PersistStatus>) -> std::io::Result<Self> {
        let (sender, receiver) = mpsc::channel::<PersistJob>();
        let thread = std::thread::Builder::new()
            .name("persist".to_string())
            .spawn(move || {
                for job in receiver {
                    match job {
                        PersistJob::Save { snapshot, take_backup } => {
                            let result = storage.save_with_retry(&snapshot, attempts).and_then(|()| {
                                if take_backup {
                                    storage.backup().map(|_| ())
                                } else {
                                    Ok(())
                                }
                            });
                            if result.is_ok() {
                                tracing::info!(height = snapshot.height(), take_backup, "chain persisted");
                            }
                            status.record(&result);
                        }
                        PersistJob::Flush { snapshot, done } => {
                            let result = storage.save_with_retry(&snapshot, attempts);
                            status.record(&result);
                            if done.send(result).is_err() {
                                tracing::debug!("flush caller went away");
                            }
                        }
                    }
                }
                tracing::debug!("persistence thread stopped");
            })?;
        Ok(PersistWriter {
            jobs: Mutex::new(Some(sender)),
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Queue a job; false once the thread is gone
    fn submit(&self, job: PersistJob) -> bool {
        match self.jobs.lock().as_ref() {
            Some(sender) => sender.send(job).is_ok(),
            None => false,
        }
    }

    /// Close the queue and wait for queued writes to land
    fn stop(&self) {
        drop(self.jobs.lock().take());
        if let Some(thread) = self.thread.lock().take() {
            if thread.join().is_err() {
                tracing::warn!("persistence thread panicked");
            }
        }
    }
}

impl Drop for PersistWriter {
    fn drop(&mut self) {
        self.stop();
    }
}

fn writer_stopped() -> StorageError {
    StorageError::Io(std::io::Error::new(
        std::io::ErrorKind::BrokenPipe,
        "persistence thread stopped",
    ))
}

/// A running ledger node
pub struct Node {
    config: NodeConfig,
    chain: RwLock<ChainState>,
    mempool: Mutex<Mempool>,
    relay: Arc<dyn Relay>,
    /// Cancel tokens of outstanding mining templates
    jobs: Mutex<Vec<CancelToken>>,
    accepted_blocks: AtomicU64,
    status: Arc<PersistStatus>,
    persist: Option<PersistWriter>,
}

impl Node {
    /// Open a node on `config.data_dir`, recovering any persisted chain
    pub fn open(config: NodeConfig, relay: Arc<dyn Relay>) -> Result<(Self, RecoverySource), StorageError> {
        let storage = Storage::open(&config.data_dir, config.backup_retention)?;
        let (chain, source) = recover(
            &storage,
            &config.consensus,
            config.orphan_limit,
            config.orphan_ttl_secs,
        );
        tracing::info!(
            network = %config.consensus.network,
            height = chain.height(),
            source = ?source,
            "node opened"
        );
        let status = Arc::new(PersistStatus::default());
        let writer = PersistWriter::spawn(storage, config.storage_retry_attempts, Arc::clone(&status))?;
        Ok((Self::build(config, chain, Some(writer), status, relay), source))
    }

    /// A node without persistence
    pub fn in_memory(config: NodeConfig, relay: Arc<dyn Relay>) -> Self {
        let chain = ChainState::with_orphan_limits(
            config.consensus.clone(),
            config.orphan_limit,
            config.orphan_ttl_secs,
        );
        Self::build(config, chain, None, Arc::new(PersistStatus::default()), relay)
    }

    fn build(
        config: NodeConfig,
        chain: ChainState,
        persist: Option<PersistWriter>,
        status: Arc<PersistStatus>,
        relay: Arc<dyn Relay>,
    ) -> Self {
        let mempool = Mempool::new(config.mempool.clone(), config.consensus.dust_threshold);
        Node {
            chain: RwLock::new(chain),
            mempool: Mutex::new(mempool),
            relay,
            jobs: Mutex::new(Vec::new()),
            accepted_blocks: AtomicU64::new(0),
            status,
            persist,
            config,
        }
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn params(&self) -> &ConsensusParams {
        &self.config.consensus
    }

    pub fn now(&self) -> Timestamp {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }

    // ============================================================================
    // SUBMISSION
    // ============================================================================

    /// Decode and submit a wire-encoded transaction
    pub fn submit_transaction(&self, raw: &[u8]) -> SubmitResult {
        match decode_transaction(raw) {
            Ok(tx) => self.submit_tx(tx),
            Err(reason) => SubmitResult::rejected(reason),
        }
    }

    pub fn submit_tx(&self, tx: Transaction) -> SubmitResult {
        let now = self.now();
        let result = {
            let chain = self.chain.read();
            let mut mempool = self.mempool.lock();
            mempool.submit(tx.clone(), chain.utxo(), now)
        };
        match result {
            Ok(admission) => {
                tracing::debug!(
                    txid = %hex::encode(admission.txid),
                    replaced = admission.replaced.len(),
                    "transaction accepted"
                );
                self.relay.relay_transaction(&tx);
                SubmitResult::accepted()
            }
            Err(reason) => {
                tracing::debug!(%reason, "transaction rejected");
                SubmitResult::rejected(reason)
            }
        }
    }

    /// Decode and submit a wire-encoded block
    pub fn submit_block(&self, raw: &[u8]) -> SubmitResult {
        match decode_block(raw) {
            Ok(block) => self.submit_block_value(block),
            Err(reason) => SubmitResult::rejected(reason),
        }
    }

    pub fn submit_block_value(&self, block: Block) -> SubmitResult {
        let now = self.now();
        let relayed = block.clone();

        let update = {
            let mut chain = self.chain.write();
            let update = match chain.process_block(block, now) {
                Ok(update) => update,
                Err(rejection) => {
                    match rejection.reason {
                        RejectReason::UnknownParent | RejectReason::AlreadyKnown => {
                            tracing::debug!(%rejection, "block not connected")
                        }
                        _ => tracing::warn!(%rejection, "block rejected"),
                    }
                    return SubmitResult::rejected(rejection.reason);
                }
            };
            if update.tip_changed {
                self.on_tip_changed(&chain, &update, now);
            }
            // Queued under the lock so snapshots reach the writer in chain order
            if let Some(job) = self.persist_job(&chain, 1 + update.orphans_connected.len() as u64) {
                self.enqueue_persist(job);
            }
            update
        };

        if update.outcome != BlockOutcome::SideBranch {
            self.relay.relay_block(&relayed);
        }
        SubmitResult::accepted()
    }

    /// Mempool and miner follow-up; runs under the chain write lock
    fn on_tip_changed(&self, chain: &ChainState, update: &ChainUpdate, now: Timestamp) {
        for job in self.jobs.lock().drain(..) {
            job.cancel();
        }

        let mut mempool = self.mempool.lock();
        let confirmed = mempool.remove_confirmed(&update.confirmed_txids);
        // Reverted parents go back in before their pending children are checked
        let readmitted = mempool.readmit(update.reverted_transactions.clone(), chain.utxo(), now);
        let invalidated = mempool.revalidate(chain.utxo());
        let expired = mempool.evict_expired(now);
        tracing::debug!(
            height = chain.height(),
            confirmed,
            invalidated = invalidated.len(),
            readmitted = readmitted.len(),
            expired = expired.len(),
            "mempool updated for new tip"
        );
    }

    // ============================================================================
    // MINING SUPPORT
    // ============================================================================

    /// Template on the current tip; `job` is cancelled when the tip changes
    pub fn block_template(&self, payout: Address, job: &CancelToken) -> BlockTemplate {
        let chain = self.chain.read();
        let selection = {
            let mempool = self.mempool.lock();
            let budget = chain
                .params()
                .max_block_size
                .saturating_sub(HEADER_SIZE + COINBASE_RESERVE);
            mempool.select_for_block(budget)
        };
        let tip = chain.index().tip();
        let template = create_block_template(
            &tip.block.header,
            tip.hash,
            chain.next_bits(),
            selection,
            payout,
            self.now(),
            tip.minted,
            chain.params(),
        );
        self.jobs.lock().push(job.clone());
        template
    }

    // ============================================================================
    // QUERIES
    // ============================================================================

    pub fn get_chain_info(&self) -> ChainInfo {
        let chain = self.chain.read();
        ChainInfo {
            height: chain.height(),
            tip_hash: chain.tip_hash(),
            difficulty: chain.difficulty(),
            cumulative_work: chain.cumulative_work(),
            total_supply: chain.params().max_supply,
            circulating_supply: chain.minted(),
        }
    }

    pub fn utxo_snapshot(&self) -> UtxoSnapshot {
        self.chain.read().utxo_snapshot()
    }

    pub fn get_balance(&self, address: &Address) -> Amount {
        self.utxo_snapshot().balance(address)
    }

    pub fn get_utxos(&self, address: &Address) -> Vec<(OutPoint, UtxoEntry)> {
        self.utxo_snapshot().utxos(address)
    }

    pub fn get_mempool_snapshot(&self) -> MempoolSnapshot {
        self.mempool.lock().snapshot()
    }

    pub fn mempool_transactions(&self) -> Vec<Transaction> {
        self.mempool.lock().transactions()
    }

    pub fn block_at(&self, height: Height) -> Option<Block> {
        self.chain.read().block_at(height).cloned()
    }

    pub fn height(&self) -> Height {
        self.chain.read().height()
    }

    pub fn health(&self) -> Health {
        let chain = self.chain.read();
        let mempool_size = self.mempool.lock().len();
        Health {
            degraded: self.status.degraded.load(Ordering::Acquire),
            last_storage_error: self.status.last_error.lock().clone(),
            height: chain.height(),
            mempool_size,
            orphans: chain.orphan_count(),
        }
    }

    /// Pin the canonical block at `height`
    pub fn add_checkpoint(&self, height: Height) -> Option<Checkpoint> {
        self.chain.write().add_checkpoint(height)
    }

    // ============================================================================
    // PERSISTENCE
    // ============================================================================

    /// Snapshot for the writer every `persist_every_blocks`
    ///
    /// Runs under the chain lock; only clones in-memory state. The disk
    /// work happens on the writer thread.
    fn persist_job(&self, chain: &ChainState, newly_accepted: u64) -> Option<PersistJob> {
        self.persist.as_ref()?;
        let every = self.config.persist_every_blocks;
        if every == 0 {
            return None;
        }
        let before = self.accepted_blocks.fetch_add(newly_accepted, Ordering::AcqRel);
        let after = before + newly_accepted;
        if before / every == after / every {
            return None;
        }
        let backup_every = self.config.backup_every_blocks;
        Some(PersistJob::Save {
            snapshot: PersistedChain::from_chain(chain),
            take_backup: backup_every > 0 && before / backup_every != after / backup_every,
        })
    }

    fn enqueue_persist(&self, job: PersistJob) {
        let queued = self.persist.as_ref().map(|w| w.submit(job)).unwrap_or(false);
        if !queued {
            self.status.record(&Err(writer_stopped()));
        }
    }

    /// Persist the current chain after every queued write has landed
    pub fn flush(&self) -> Result<(), StorageError> {
        let writer = match &self.persist {
            Some(writer) => writer,
            None => return Ok(()),
        };
        let (done, result) = mpsc::channel();
        let queued = {
            let chain = self.chain.read();
            writer.submit(PersistJob::Flush {
                snapshot: PersistedChain::from_chain(&chain),
                done,
            })
        };
        if !queued {
            return Err(writer_stopped());
        }
        result.recv().unwrap_or_else(|_| Err(writer_stopped()))
    }

    /// Cancel mining jobs and flush state to disk
    pub fn shutdown(&self) -> Result<(), StorageError> {
        for job in self.jobs.lock().drain(..) {
            job.cancel();
        }
        let result = self.flush();
        tracing::info!(height = self.height(), ok = result.is_ok(), "node shut down");
        result
    }
}
