//! Chain state: block index, validation state machine and fork choice
//!
//! Every candidate block moves through
//! `Received → StructurallyValid → ParentKnown → ContextuallyValid → Applied`
//! and is rejected at the first stage it fails. Contextual validation always
//! runs against the UTXO state of the block's own branch. Blocks on a branch
//! with strictly more cumulative work than the canonical tip trigger a
//! reorganization, performed on a copy of the UTXO set and swapped in whole.

use crate::block::{check_block, connect_block, genesis_block};
use crate::config::{Checkpoint, ConsensusParams};
use crate::constants::{INVALID_CACHE_LIMIT, ORPHAN_LIMIT, ORPHAN_TTL_SECS};
use crate::error::RejectReason;
use crate::pow::{block_work, check_proof_of_work, get_next_work_required};
use crate::reorganization::{
    check_reorg_policy, find_common_ancestor, plan_reorganization, reorganize_chain, should_reorganize,
    ReorganizationResult,
};
use crate::types::*;
use crate::utxo::{BlockUndo, UtxoSet, UtxoSnapshot};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use thiserror::Error;

/// Validation stages a candidate block passes through
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ValidationStage {
    Received,
    StructurallyValid,
    ParentKnown,
    ContextuallyValid,
    Applied,
}

/// A block rejected at `stage`
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("block rejected at {stage:?}: {reason}")]
pub struct BlockRejection {
    pub stage: ValidationStage,
    pub reason: RejectReason,
}

impl BlockRejection {
    pub fn new(stage: ValidationStage, reason: RejectReason) -> Self {
        BlockRejection { stage, reason }
    }
}

/// What accepting a block did to the chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockOutcome {
    /// Block became the new tip
    Extended,
    /// Valid block stored on a branch with no more work than the tip
    SideBranch,
    /// Block's branch overtook the tip
    Reorganized(ReorganizationResult),
}

/// Aggregate effect of one `process_block` call, buffered orphans included
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainUpdate {
    pub hash: Hash,
    pub height: Height,
    pub outcome: BlockOutcome,
    pub tip_changed: bool,
    /// Buffered descendants connected after this block
    pub orphans_connected: Vec<Hash>,
    /// Txids that became canonical
    pub confirmed_txids: Vec<Txid>,
    /// Transactions dropped from the canonical chain by reorganizations
    pub reverted_transactions: Vec<Transaction>,
    pub reorganizations: Vec<ReorganizationResult>,
}

impl ChainUpdate {
    fn new(hash: Hash, height: Height, outcome: BlockOutcome) -> Self {
        ChainUpdate {
            hash,
            height,
            outcome,
            tip_changed: false,
            orphans_connected: Vec::new(),
            confirmed_txids: Vec::new(),
            reverted_transactions: Vec::new(),
            reorganizations: Vec::new(),
        }
    }
}

/// A validated block with its branch-local totals
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockRecord {
    pub block: Block,
    pub hash: Hash,
    /// Work of this block and all its ancestors
    pub cumulative_work: ChainWork,
    /// Coins minted through this block on its branch
    pub minted: Amount,
    /// Present while the block is canonical
    pub undo: Option<BlockUndo>,
}

impl BlockRecord {
    pub fn height(&self) -> Height {
        self.block.header.height
    }
}

/// Every validated block, keyed by hash, plus the canonical chain
///
/// The canonical list always holds at least the genesis hash, and every
/// hash in it has a record.
#[derive(Debug, Clone)]
pub struct BlockIndex {
    records: HashMap<Hash, BlockRecord>,
    canonical: Vec<Hash>,
}

impl BlockIndex {
    fn with_genesis(genesis: Block) -> Self {
        let hash = genesis.hash();
        let record = BlockRecord {
            cumulative_work: block_work(genesis.header.bits),
            block: genesis,
            hash,
            minted: 0,
            undo: Some(BlockUndo::default()),
        };
        let mut records = HashMap::new();
        records.insert(hash, record);
        BlockIndex {
            records,
            canonical: vec![hash],
        }
    }

    pub fn get(&self, hash: &Hash) -> Option<&BlockRecord> {
        self.records.get(hash)
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.records.contains_key(hash)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn height(&self) -> Height {
        (self.canonical.len() - 1) as Height
    }

    pub fn tip_hash(&self) -> Hash {
        self.canonical[self.canonical.len() - 1]
    }

    pub fn tip(&self) -> &BlockRecord {
        &self.records[&self.tip_hash()]
    }

    pub fn canonical_hash(&self, height: Height) -> Option<Hash> {
        self.canonical.get(height as usize).copied()
    }

    pub fn is_canonical(&self, hash: &Hash) -> bool {
        self.records
            .get(hash)
            .map(|r| self.canonical_hash(r.height()) == Some(*hash))
            .unwrap_or(false)
    }

    /// Ancestor of `hash` at `height` on the same branch
    pub fn ancestor(&self, hash: &Hash, height: Height) -> Option<&BlockRecord> {
        let mut current = self.records.get(hash)?;
        if current.height() < height {
            return None;
        }
        while current.height() > height {
            if self.is_canonical(&current.hash) {
                return self.canonical_hash(height).and_then(|h| self.records.get(&h));
            }
            current = self.records.get(&current.block.header.previous_hash)?;
        }
        Some(current)
    }

    /// Canonical records from genesis to tip
    pub fn canonical_records(&self) -> impl Iterator<Item = &BlockRecord> {
        self.canonical.iter().filter_map(move |h| self.records.get(h))
    }

    fn insert(&mut self, record: BlockRecord) {
        self.records.insert(record.hash, record);
    }
}

/// Blocks waiting for their parent, bounded by count and age
#[derive(Debug, Clone)]
struct OrphanPool {
    blocks: HashMap<Hash, (Block, Timestamp)>,
    by_parent: HashMap<Hash, Vec<Hash>>,
    order: VecDeque<Hash>,
    limit: usize,
    ttl: u64,
}

impl OrphanPool {
    fn new(limit: usize, ttl: u64) -> Self {
        OrphanPool {
            blocks: HashMap::new(),
            by_parent: HashMap::new(),
            order: VecDeque::new(),
            limit,
            ttl,
        }
    }

    fn len(&self) -> usize {
        self.blocks.len()
    }

    fn contains(&self, hash: &Hash) -> bool {
        self.blocks.contains_key(hash)
    }

    fn insert(&mut self, block: Block, now: Timestamp) {
        self.prune_expired(now);
        let hash = block.hash();
        if self.blocks.contains_key(&hash) || self.limit == 0 {
            return;
        }
        while self.blocks.len() >= self.limit {
            match self.order.pop_front() {
                Some(oldest) => {
                    if self.remove(&oldest).is_some() {
                        tracing::debug!(hash = %hex::encode(oldest), "orphan buffer full, dropping oldest");
                    }
                }
                None => break,
            }
        }
        self.by_parent
            .entry(block.header.previous_hash)
            .or_default()
            .push(hash);
        self.order.push_back(hash);
        self.blocks.insert(hash, (block, now));
    }

    fn prune_expired(&mut self, now: Timestamp) {
        let expired: Vec<Hash> = self
            .blocks
            .iter()
            .filter(|(_, (_, received))| now.saturating_sub(*received) > self.ttl)
            .map(|(hash, _)| *hash)
            .collect();
        for hash in expired {
            self.remove(&hash);
            tracing::debug!(hash = %hex::encode(hash), "orphan expired");
        }
        let blocks = &self.blocks;
        self.order.retain(|h| blocks.contains_key(h));
    }

    /// Remove and return every buffered child of `parent`
    fn take_children(&mut self, parent: &Hash) -> Vec<Block> {
        let children = self.by_parent.remove(parent).unwrap_or_default();
        children
            .into_iter()
            .filter_map(|hash| self.blocks.remove(&hash).map(|(block, _)| block))
            .collect()
    }

    fn remove(&mut self, hash: &Hash) -> Option<Block> {
        let (block, _) = self.blocks.remove(hash)?;
        if let Some(siblings) = self.by_parent.get_mut(&block.header.previous_hash) {
            siblings.retain(|h| h != hash);
            if siblings.is_empty() {
                self.by_parent.remove(&block.header.previous_hash);
            }
        }
        Some(block)
    }
}

/// Hashes of blocks known to be invalid, oldest evicted first
#[derive(Debug, Clone)]
struct InvalidCache {
    hashes: HashSet<Hash>,
    order: VecDeque<Hash>,
    limit: usize,
}

impl InvalidCache {
    fn new(limit: usize) -> Self {
        InvalidCache {
            hashes: HashSet::new(),
            order: VecDeque::new(),
            limit,
        }
    }

    fn len(&self) -> usize {
        self.hashes.len()
    }

    fn contains(&self, hash: &Hash) -> bool {
        self.hashes.contains(hash)
    }

    fn insert(&mut self, hash: Hash) {
        if self.limit == 0 || !self.hashes.insert(hash) {
            return;
        }
        self.order.push_back(hash);
        while self.order.len() > self.limit {
            if let Some(oldest) = self.order.pop_front() {
                self.hashes.remove(&oldest);
            }
        }
    }
}

/// The node's view of the ledger
///
/// Mutated only through [`ChainState::process_block`] and
/// [`ChainState::add_checkpoint`].
#[derive(Debug, Clone)]
pub struct ChainState {
    params: ConsensusParams,
    index: BlockIndex,
    utxo: UtxoSnapshot,
    checkpoints: Vec<Checkpoint>,
    orphans: OrphanPool,
    invalid: InvalidCache,
}

impl ChainState {
    /// Fresh chain holding only the genesis block
    pub fn new(params: ConsensusParams) -> Self {
        Self::with_orphan_limits(params, ORPHAN_LIMIT, ORPHAN_TTL_SECS)
    }

    pub fn with_orphan_limits(params: ConsensusParams, orphan_limit: usize, orphan_ttl_secs: u64) -> Self {
        let genesis = genesis_block(&params);
        ChainState {
            index: BlockIndex::with_genesis(genesis),
            utxo: Arc::new(UtxoSet::new()),
            checkpoints: params.checkpoints.clone(),
            orphans: OrphanPool::new(orphan_limit, orphan_ttl_secs),
            invalid: InvalidCache::new(INVALID_CACHE_LIMIT),
            params,
        }
    }

    /// Rebuild a chain by validating `blocks` in order from genesis
    ///
    /// Every block must extend the tip; a leading genesis block is accepted
    /// and skipped if it matches.
    pub fn from_blocks(
        params: ConsensusParams,
        blocks: &[Block],
        orphan_limit: usize,
        orphan_ttl_secs: u64,
    ) -> Result<Self, BlockRejection> {
        let mut chain = Self::with_orphan_limits(params, orphan_limit, orphan_ttl_secs);
        for block in blocks {
            if block.header.height == 0 {
                if block.hash() != chain.index.canonical[0] {
                    return Err(BlockRejection::new(ValidationStage::Received, RejectReason::BadGenesis));
                }
                continue;
            }
            let update = chain.process_block(block.clone(), Timestamp::MAX)?;
            if update.outcome != BlockOutcome::Extended {
                return Err(BlockRejection::new(
                    ValidationStage::Applied,
                    RejectReason::StructurallyInvalid(format!(
                        "block {} does not extend the tip",
                        block.header.height
                    )),
                ));
            }
        }
        Ok(chain)
    }

    pub fn params(&self) -> &ConsensusParams {
        &self.params
    }

    pub fn index(&self) -> &BlockIndex {
        &self.index
    }

    pub fn height(&self) -> Height {
        self.index.height()
    }

    pub fn tip_hash(&self) -> Hash {
        self.index.tip_hash()
    }

    pub fn tip(&self) -> &Block {
        &self.index.tip().block
    }

    pub fn cumulative_work(&self) -> ChainWork {
        self.index.tip().cumulative_work
    }

    /// Coins minted on the canonical chain
    pub fn minted(&self) -> Amount {
        self.index.tip().minted
    }

    /// Shared read-only view of the canonical UTXO set
    pub fn utxo_snapshot(&self) -> UtxoSnapshot {
        Arc::clone(&self.utxo)
    }

    pub fn utxo(&self) -> &UtxoSet {
        &self.utxo
    }

    pub fn block(&self, hash: &Hash) -> Option<&Block> {
        self.index.get(hash).map(|r| &r.block)
    }

    pub fn block_at(&self, height: Height) -> Option<&Block> {
        self.index.canonical_hash(height).and_then(|h| self.block(&h))
    }

    /// Canonical blocks from genesis to tip
    pub fn canonical_blocks(&self) -> Vec<Block> {
        self.index.canonical_records().map(|r| r.block.clone()).collect()
    }

    pub fn orphan_count(&self) -> usize {
        self.orphans.len()
    }

    pub fn is_known_invalid(&self, hash: &Hash) -> bool {
        self.invalid.contains(hash)
    }

    pub fn known_invalid_count(&self) -> usize {
        self.invalid.len()
    }

    pub fn checkpoints(&self) -> &[Checkpoint] {
        &self.checkpoints
    }

    pub fn last_checkpoint_height(&self) -> Option<Height> {
        self.checkpoints.iter().map(|c| c.height).max()
    }

    /// Pin the canonical block at `height`; `None` if above the tip
    pub fn add_checkpoint(&mut self, height: Height) -> Option<Checkpoint> {
        let hash = self.index.canonical_hash(height)?;
        let checkpoint = Checkpoint::new(height, hash);
        self.checkpoints.retain(|c| c.height != height);
        self.checkpoints.push(checkpoint.clone());
        self.checkpoints.sort_by_key(|c| c.height);
        tracing::info!(height, hash = %hex::encode(hash), "checkpoint added");
        Some(checkpoint)
    }

    /// Bits required for a child of the canonical tip
    pub fn next_bits(&self) -> u32 {
        self.expected_bits(self.index.tip())
    }

    /// Bits required for a child of `parent`, on the parent's own branch
    pub fn expected_bits(&self, parent: &BlockRecord) -> u32 {
        get_next_work_required(&parent.block.header, &self.params, |height| {
            self.index
                .ancestor(&parent.hash, height)
                .map(|r| r.block.header.timestamp)
        })
    }

    /// Tip difficulty relative to the easiest allowed target
    pub fn difficulty(&self) -> f64 {
        let base = block_work(self.params.pow_limit_bits).max(1);
        block_work(self.tip().header.bits) as f64 / base as f64
    }

    /// ProcessBlock: ℬ × 𝒞𝒮 → 𝒞𝒮 × outcome | rejection
    ///
    /// Runs the block through the validation stages, then connects any
    /// buffered orphans that descend from it. A block whose parent is unknown
    /// is buffered and rejected with `UnknownParent`.
    pub fn process_block(&mut self, block: Block, now: Timestamp) -> Result<ChainUpdate, BlockRejection> {
        let hash = block.hash();
        let height = block.header.height;
        let tip_before = self.tip_hash();

        let mut update = ChainUpdate::new(hash, height, BlockOutcome::SideBranch);
        let outcome = self.accept_block(block, now, &mut update)?;
        update.outcome = outcome;

        // Connect orphans waiting on anything accepted so far
        let mut queue = VecDeque::from([hash]);
        while let Some(parent) = queue.pop_front() {
            for child in self.orphans.take_children(&parent) {
                let child_hash = child.hash();
                match self.accept_block(child, now, &mut update) {
                    Ok(_) => {
                        update.orphans_connected.push(child_hash);
                        queue.push_back(child_hash);
                    }
                    Err(rejection) => {
                        tracing::warn!(
                            hash = %hex::encode(child_hash),
                            %rejection,
                            "buffered orphan rejected"
                        );
                    }
                }
            }
        }

        update.tip_changed = self.tip_hash() != tip_before;
        if update.tip_changed {
            self.prune_side_branches();
        }
        Ok(update)
    }

    // ============================================================================
    // VALIDATION STAGES
    // ============================================================================

    fn accept_block(
        &mut self,
        block: Block,
        now: Timestamp,
        update: &mut ChainUpdate,
    ) -> Result<BlockOutcome, BlockRejection> {
        let hash = block.hash();
        let height = block.header.height;

        // Received
        if self.index.contains(&hash) || self.orphans.contains(&hash) {
            return Err(BlockRejection::new(ValidationStage::Received, RejectReason::AlreadyKnown));
        }
        if self.invalid.contains(&hash) {
            return Err(BlockRejection::new(ValidationStage::Received, RejectReason::KnownInvalid));
        }
        if self.invalid.contains(&block.header.previous_hash) {
            // Only headers that cost work to produce get remembered
            if check_proof_of_work(&hash, block.header.bits, &self.params).is_ok() {
                self.invalid.insert(hash);
            }
            return Err(BlockRejection::new(ValidationStage::Received, RejectReason::KnownInvalid));
        }

        // StructurallyValid
        if let Err(reason) = check_block(&block, &self.params, now) {
            return Err(self.reject(hash, ValidationStage::StructurallyValid, reason));
        }
        tracing::debug!(height, hash = %hex::encode(hash), "block structurally valid");

        // ParentKnown
        let parent = match self.index.get(&block.header.previous_hash) {
            Some(parent) => parent.clone(),
            None => {
                tracing::debug!(height, hash = %hex::encode(hash), "parent unknown, buffering");
                self.orphans.insert(block, now);
                return Err(BlockRejection::new(ValidationStage::ParentKnown, RejectReason::UnknownParent));
            }
        };
        if let Err(reason) = self.check_against_parent(&block, hash, &parent) {
            return Err(self.reject(hash, ValidationStage::ParentKnown, reason));
        }

        // ContextuallyValid + Applied
        let cumulative_work = parent.cumulative_work.saturating_add(block_work(block.header.bits));
        let outcome = if parent.hash == self.tip_hash() {
            self.extend_tip(block, hash, cumulative_work, &parent, update)?
        } else {
            self.accept_on_branch(block, hash, cumulative_work, update)?
        };
        Ok(outcome)
    }

    /// Header rules that need the parent
    ///
    /// 1. Height is parent + 1
    /// 2. Bits match the retarget schedule of this branch
    /// 3. Timestamp not before the parent's
    /// 4. Hash matches any checkpoint at this height
    /// 5. Reorganization policy for the branch's fork point
    fn check_against_parent(&self, block: &Block, hash: Hash, parent: &BlockRecord) -> Result<(), RejectReason> {
        let header = &block.header;

        // 1. Height
        if header.height != parent.height() + 1 {
            return Err(RejectReason::StructurallyInvalid(format!(
                "height {} does not follow parent height {}",
                header.height,
                parent.height()
            )));
        }

        // 2. Difficulty
        let expected = self.expected_bits(parent);
        if header.bits != expected {
            return Err(RejectReason::BadDifficulty {
                expected,
                actual: header.bits,
            });
        }

        // 3. Timestamp
        if header.timestamp < parent.block.header.timestamp {
            return Err(RejectReason::BadTimestamp(format!(
                "timestamp {} before parent {}",
                header.timestamp, parent.block.header.timestamp
            )));
        }

        // 4. Checkpoints
        if let Some(checkpoint) = self.checkpoints.iter().find(|c| c.height == header.height) {
            if checkpoint.hash != hash {
                return Err(RejectReason::BelowCheckpoint(checkpoint.height));
            }
        }

        // 5. Fork policy
        if parent.hash != self.tip_hash() {
            let (_, fork_height) = find_common_ancestor(&self.index, &parent.hash)
                .ok_or(RejectReason::UnknownParent)?;
            check_reorg_policy(
                self.height(),
                fork_height,
                self.last_checkpoint_height(),
                &self.params,
            )?;
        }
        Ok(())
    }

    fn extend_tip(
        &mut self,
        block: Block,
        hash: Hash,
        cumulative_work: ChainWork,
        parent: &BlockRecord,
        update: &mut ChainUpdate,
    ) -> Result<BlockOutcome, BlockRejection> {
        let utxo = Arc::make_mut(&mut self.utxo);
        let connected = match connect_block(&block, utxo, parent.minted, &self.params) {
            Ok(connected) => connected,
            Err(reason) => return Err(self.reject(hash, ValidationStage::ContextuallyValid, reason)),
        };

        let height = block.header.height;
        update
            .confirmed_txids
            .extend(block.transactions.iter().map(|tx| tx.txid()));
        self.index.insert(BlockRecord {
            block,
            hash,
            cumulative_work,
            minted: parent.minted.saturating_add(connected.minted),
            undo: Some(connected.undo),
        });
        self.index.canonical.push(hash);

        tracing::info!(
            height,
            hash = %hex::encode(hash),
            fees = connected.fees,
            minted = connected.minted,
            "new tip"
        );
        Ok(BlockOutcome::Extended)
    }

    fn accept_on_branch(
        &mut self,
        block: Block,
        hash: Hash,
        cumulative_work: ChainWork,
        update: &mut ChainUpdate,
    ) -> Result<BlockOutcome, BlockRejection> {
        let plan = plan_reorganization(&self.index, &block.header.previous_hash).ok_or_else(|| {
            BlockRejection::new(ValidationStage::ParentKnown, RejectReason::UnknownParent)
        })?;

        // Validate against this branch's state on a scratch copy
        let mut scratch = (*self.utxo).clone();
        let branch = match reorganize_chain(&self.index, &plan, &block, &mut scratch, &self.params) {
            Ok(branch) => branch,
            Err((failed, reason)) => {
                if reason.is_bound_to_hash() {
                    self.invalid.insert(failed);
                }
                return Err(self.reject(hash, ValidationStage::ContextuallyValid, reason));
            }
        };

        let height = block.header.height;
        let parent_minted = self
            .index
            .get(&block.header.previous_hash)
            .map(|p| p.minted)
            .unwrap_or(0);
        let record = BlockRecord {
            minted: parent_minted.saturating_add(branch.candidate.minted),
            block,
            hash,
            cumulative_work,
            undo: None,
        };

        if !should_reorganize(cumulative_work, self.cumulative_work()) {
            tracing::debug!(
                height,
                hash = %hex::encode(hash),
                fork_height = plan.fork_height,
                "block stored on side branch"
            );
            self.index.insert(record);
            return Ok(BlockOutcome::SideBranch);
        }

        // Commit: swap in the branch state and rewrite the canonical list
        let old_tip = self.tip_hash();
        for disconnected in &plan.disconnect {
            if let Some(r) = self.index.records.get_mut(disconnected) {
                r.undo = None;
            }
        }
        for (connected, undo) in branch.undos {
            if let Some(r) = self.index.records.get_mut(&connected) {
                update
                    .confirmed_txids
                    .extend(r.block.transactions.iter().map(|tx| tx.txid()));
                r.undo = Some(undo);
            }
        }
        update
            .confirmed_txids
            .extend(record.block.transactions.iter().map(|tx| tx.txid()));
        let mut record = record;
        record.undo = Some(branch.candidate.undo);
        self.index.insert(record);

        self.index.canonical.truncate(plan.fork_height as usize + 1);
        self.index.canonical.extend(plan.connect.iter().copied());
        self.index.canonical.push(hash);
        self.utxo = Arc::new(scratch);

        let mut connected = plan.connect.clone();
        connected.push(hash);
        let result = ReorganizationResult {
            fork_hash: plan.fork_hash,
            fork_height: plan.fork_height,
            old_tip,
            new_tip: hash,
            disconnected: plan.disconnect.clone(),
            connected,
            reverted_transactions: branch.reverted_transactions,
        };
        tracing::info!(
            fork_height = result.fork_height,
            disconnected = result.disconnected.len(),
            connected = result.connected.len(),
            new_height = height,
            new_tip = %hex::encode(hash),
            "chain reorganized"
        );
        update
            .reverted_transactions
            .extend(result.reverted_transactions.iter().cloned());
        update.reorganizations.push(result.clone());
        Ok(BlockOutcome::Reorganized(result))
    }

    /// Forget side branches forked too deep to ever become canonical
    fn prune_side_branches(&mut self) {
        let tip_height = self.height();
        let limit = self.params.max_reorg_depth;
        let stale: Vec<Hash> = self
            .index
            .records
            .values()
            .filter(|r| !self.index.is_canonical(&r.hash))
            .filter(|r| match find_common_ancestor(&self.index, &r.hash) {
                Some((_, fork_height)) => tip_height.saturating_sub(fork_height) > limit,
                None => true,
            })
            .map(|r| r.hash)
            .collect();
        if stale.is_empty() {
            return;
        }
        for hash in &stale {
            self.index.records.remove(hash);
        }
        tracing::debug!(count = stale.len(), tip_height, "pruned stale side branches");
    }

    /// Only contextual failures are remembered: before that stage the body
    /// may be a forgery carrying an honest header
    fn reject(&mut self, hash: Hash, stage: ValidationStage, reason: RejectReason) -> BlockRejection {
        if stage >= ValidationStage::ContextuallyValid && reason.is_bound_to_hash() {
            self.invalid.insert(hash);
        }
        tracing::debug!(hash = %hex::encode(hash), ?stage, %reason, "block rejected");
        BlockRejection::new(stage, reason)
    }
}
