//! Block assembly and the cancellable proof-of-work search

use crate::block::calculate_merkle_root;
use crate::config::ConsensusParams;
use crate::constants::CANCEL_POLL_INTERVAL;
use crate::economic::clamped_reward;
use crate::node::{Node, PayoutAddressSource, SubmitResult};
use crate::pow::{expand_target, hash_meets_target};
use crate::transaction::create_coinbase;
use crate::types::*;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Shared cancellation flag, optionally chained to a parent flag
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    parent: Option<Arc<AtomicBool>>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// A token cancelled when either it or `self` is
    pub fn child(&self) -> CancelToken {
        CancelToken {
            flag: Arc::new(AtomicBool::new(false)),
            parent: Some(Arc::clone(&self.flag)),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
            || self
                .parent
                .as_ref()
                .map(|p| p.load(Ordering::Acquire))
                .unwrap_or(false)
    }
}

/// Everything needed to search for a block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockTemplate {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
    pub reward: Amount,
    pub fees: Amount,
}

impl BlockTemplate {
    pub fn height(&self) -> Height {
        self.header.height
    }

    pub fn into_block(self) -> Block {
        Block {
            header: self.header,
            transactions: self.transactions,
        }
    }
}

/// Result of a proof-of-work search
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MiningOutcome {
    Found(Block),
    Cancelled,
    Exhausted,
}

/// Bounds on a single search
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MiningLimits {
    /// Give up after this many hashes
    pub max_attempts: Option<u64>,
    /// Latest timestamp the search may roll forward to
    pub max_timestamp: Timestamp,
}

impl MiningLimits {
    pub fn unbounded(max_timestamp: Timestamp) -> Self {
        MiningLimits {
            max_attempts: None,
            max_timestamp,
        }
    }
}

/// CreateNewBlock: ℋ × 𝒯𝒳* × 𝒜 → template
///
/// 1. Height = parent height + 1
/// 2. Reward = scheduled reward clamped to the headroom under the supply cap
/// 3. Coinbase pays reward + Σ fees to `miner`, nonce = height
/// 4. Merkle root over coinbase followed by `selection` in order
/// 5. Timestamp never earlier than the parent's
#[allow(clippy::too_many_arguments)]
pub fn create_block_template(
    parent: &BlockHeader,
    parent_hash: Hash,
    bits: u32,
    selection: Vec<Transaction>,
    miner: Address,
    now: Timestamp,
    minted: Amount,
    params: &ConsensusParams,
) -> BlockTemplate {
    // 1. Height
    let height = parent.height + 1;
    let timestamp = now.max(parent.timestamp);

    // 2. Reward
    let reward = clamped_reward(height, minted, params);
    let fees = selection
        .iter()
        .fold(0u64, |acc, tx| acc.saturating_add(tx.fee));

    // 3. Coinbase
    let coinbase = create_coinbase(height, miner, reward.saturating_add(fees), timestamp);
    let mut transactions = Vec::with_capacity(selection.len() + 1);
    transactions.push(coinbase);
    transactions.extend(selection);

    // 4. Merkle root
    let merkle_root = calculate_merkle_root(&transactions);

    BlockTemplate {
        header: BlockHeader {
            height,
            previous_hash: parent_hash,
            timestamp,
            nonce: 0,
            bits,
            merkle_root,
        },
        transactions,
        reward,
        fees,
    }
}

/// MineBlock: template × cancel → outcome
///
/// Increments the nonce from the template's starting value; when the nonce
/// wraps the timestamp moves forward one second, up to `max_timestamp`. The
/// cancel token is polled every `CANCEL_POLL_INTERVAL` hashes.
pub fn mine_block(template: BlockTemplate, cancel: &CancelToken, limits: MiningLimits) -> MiningOutcome {
    let target = match expand_target(template.header.bits) {
        Some(t) if !t.is_zero() => t,
        _ => return MiningOutcome::Exhausted,
    };
    let mut block = template.into_block();
    let mut attempts: u64 = 0;

    loop {
        if attempts % CANCEL_POLL_INTERVAL == 0 && cancel.is_cancelled() {
            tracing::debug!(height = block.header.height, attempts, "mining cancelled");
            return MiningOutcome::Cancelled;
        }
        if hash_meets_target(&block.hash(), &target) {
            tracing::debug!(height = block.header.height, attempts, "proof of work found");
            return MiningOutcome::Found(block);
        }
        attempts += 1;
        if limits.max_attempts.map(|max| attempts >= max).unwrap_or(false) {
            return MiningOutcome::Exhausted;
        }
        if !advance_header(&mut block.header, limits.max_timestamp) {
            return MiningOutcome::Exhausted;
        }
    }
}

/// Next point in the search space; false once the timestamp window is spent
pub fn advance_header(header: &mut BlockHeader, max_timestamp: Timestamp) -> bool {
    if header.nonce == u64::MAX {
        if header.timestamp >= max_timestamp {
            return false;
        }
        header.nonce = 0;
        header.timestamp += 1;
    } else {
        header.nonce += 1;
    }
    true
}

// ============================================================================
// MINER TASK
// ============================================================================

/// Handle to a background miner thread
pub struct MinerHandle {
    stop: CancelToken,
    mined: Arc<AtomicU64>,
    thread: Option<JoinHandle<()>>,
}

impl MinerHandle {
    /// Blocks accepted so far
    pub fn mined(&self) -> u64 {
        self.mined.load(Ordering::Acquire)
    }

    /// Stop mining and wait for the thread to finish
    pub fn stop(mut self) -> u64 {
        self.stop.cancel();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::warn!("miner thread panicked");
            }
        }
        self.mined()
    }

    /// Wait until the miner stops on its own (block limit reached)
    pub fn join(mut self) -> u64 {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::warn!("miner thread panicked");
            }
        }
        self.mined()
    }
}

impl Drop for MinerHandle {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

/// Background miner: builds templates from the node, searches, and submits
/// results through the same entry point peers use
pub struct Miner;

impl Miner {
    /// Spawn a miner; it stops after `max_blocks` accepted blocks if given
    pub fn spawn(
        node: Arc<Node>,
        payout: Arc<dyn PayoutAddressSource>,
        max_blocks: Option<u64>,
    ) -> std::io::Result<MinerHandle> {
        let stop = CancelToken::new();
        let mined = Arc::new(AtomicU64::new(0));
        let thread = {
            let stop = stop.clone();
            let mined = Arc::clone(&mined);
            thread::Builder::new()
                .name("miner".to_string())
                .spawn(move || run_miner(&node, payout.as_ref(), &stop, &mined, max_blocks))?
        };
        Ok(MinerHandle {
            stop,
            mined,
            thread: Some(thread),
        })
    }
}

fn run_miner(
    node: &Node,
    payout: &dyn PayoutAddressSource,
    stop: &CancelToken,
    mined: &AtomicU64,
    max_blocks: Option<u64>,
) {
    tracing::info!("miner started");
    while !stop.is_cancelled() {
        if max_blocks.map(|max| mined.load(Ordering::Acquire) >= max).unwrap_or(false) {
            break;
        }
        let job = stop.child();
        let template = node.block_template(payout.payout_address(), &job);
        let height = template.height();
        let limits = MiningLimits::unbounded(node.now() + node.params().max_future_block_time);

        match mine_block(template, &job, limits) {
            MiningOutcome::Found(block) => match node.submit_block_value(block) {
                SubmitResult { accepted: true, .. } => {
                    mined.fetch_add(1, Ordering::AcqRel);
                }
                SubmitResult { reason, .. } => {
                    tracing::warn!(height, ?reason, "mined block rejected");
                }
            },
            MiningOutcome::Cancelled => {
                tracing::debug!(height, "template superseded");
            }
            MiningOutcome::Exhausted => {
                tracing::debug!(height, "search space exhausted, rebuilding template");
            }
        }
    }
    tracing::info!(mined = mined.load(Ordering::Acquire), "miner stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{check_block, connect_block, genesis_block};
    use crate::economic::block_reward;
    use crate::utxo::UtxoSet;

    fn miner_address() -> Address {
        Address::from_key_hash([7; 20])
    }

    fn template(params: &ConsensusParams) -> BlockTemplate {
        let genesis = genesis_block(params);
        create_block_template(
            &genesis.header,
            genesis.hash(),
            params.pow_limit_bits,
            vec![],
            miner_address(),
            genesis.header.timestamp + 60,
            0,
            params,
        )
    }

    #[test]
    fn test_create_block_template() {
        let params = ConsensusParams::regtest();
        let template = template(&params);
        assert_eq!(template.height(), 1);
        assert_eq!(template.reward, block_reward(1, &params));
        assert_eq!(template.fees, 0);
        assert_eq!(template.transactions.len(), 1);
        assert_eq!(
            template.header.merkle_root,
            calculate_merkle_root(&template.transactions)
        );
    }

    #[test]
    fn test_template_timestamp_not_before_parent() {
        let params = ConsensusParams::regtest();
        let genesis = genesis_block(&params);
        let template = create_block_template(
            &genesis.header,
            genesis.hash(),
            params.pow_limit_bits,
            vec![],
            miner_address(),
            0,
            0,
            &params,
        );
        assert_eq!(template.header.timestamp, genesis.header.timestamp);
    }

    #[test]
    fn test_template_reward_clamped_to_cap() {
        let params = ConsensusParams {
            max_supply: 5,
            ..ConsensusParams::regtest()
        };
        let genesis = genesis_block(&params);
        let template = create_block_template(
            &genesis.header,
            genesis.hash(),
            params.pow_limit_bits,
            vec![],
            miner_address(),
            0,
            3,
            &params,
        );
        assert_eq!(template.reward, 2);
    }

    #[test]
    fn test_mine_block_success_and_valid() {
        let params = ConsensusParams::regtest();
        let template = template(&params);
        let limits = MiningLimits::unbounded(u64::MAX);
        let block = match mine_block(template, &CancelToken::new(), limits) {
            MiningOutcome::Found(block) => block,
            other => panic!("unexpected outcome {:?}", other),
        };
        assert!(check_block(&block, &params, block.header.timestamp).is_ok());

        let mut set = UtxoSet::new();
        connect_block(&block, &mut set, 0, &params).unwrap();
        assert_eq!(set.balance(&miner_address()), params.initial_reward);
    }

    #[test]
    fn test_mine_block_cancelled() {
        let params = ConsensusParams::regtest();
        let cancel = CancelToken::new();
        cancel.cancel();
        assert_eq!(
            mine_block(template(&params), &cancel, MiningLimits::unbounded(u64::MAX)),
            MiningOutcome::Cancelled
        );
    }

    #[test]
    fn test_child_token_follows_parent() {
        let parent = CancelToken::new();
        let child = parent.child();
        assert!(!child.is_cancelled());
        parent.cancel();
        assert!(child.is_cancelled());

        let other = CancelToken::new();
        let other_child = other.child();
        other_child.cancel();
        assert!(!other.is_cancelled());
    }

    #[test]
    fn test_mine_block_exhausted() {
        let params = ConsensusParams::regtest();
        let mut template = template(&params);
        // Target of 1: effectively unreachable
        template.header.bits = 0x0300_0001;
        let limits = MiningLimits {
            max_attempts: Some(50),
            max_timestamp: u64::MAX,
        };
        assert_eq!(
            mine_block(template, &CancelToken::new(), limits),
            MiningOutcome::Exhausted
        );
    }

    #[test]
    fn test_advance_header_rolls_timestamp() {
        let params = ConsensusParams::regtest();
        let mut header = template(&params).header;
        header.nonce = u64::MAX;
        let ts = header.timestamp;

        assert!(advance_header(&mut header, ts + 1));
        assert_eq!(header.nonce, 0);
        assert_eq!(header.timestamp, ts + 1);

        header.nonce = u64::MAX;
        assert!(!advance_header(&mut header, ts + 1));
    }
}
