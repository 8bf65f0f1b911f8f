//! Chain reorganization: fork-point search, policy checks and branch switching

use crate::block::{connect_block, disconnect_block, ConnectedBlock};
use crate::chain::BlockIndex;
use crate::config::ConsensusParams;
use crate::error::RejectReason;
use crate::types::*;
use crate::utxo::{BlockUndo, UtxoSet};
use std::collections::HashSet;

/// Blocks to disconnect and connect to move the tip onto another branch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReorgPlan {
    pub fork_hash: Hash,
    pub fork_height: Height,
    /// Canonical blocks above the fork, tip first
    pub disconnect: Vec<Hash>,
    /// Branch blocks above the fork, lowest first
    pub connect: Vec<Hash>,
}

impl ReorgPlan {
    pub fn depth(&self) -> u64 {
        self.disconnect.len() as u64
    }
}

/// A branch applied on a scratch UTXO set
#[derive(Debug, Clone)]
pub struct BranchConnection {
    /// Undo data for each block in `ReorgPlan::connect`
    pub undos: Vec<(Hash, BlockUndo)>,
    pub candidate: ConnectedBlock,
    /// Non-coinbase transactions of disconnected blocks the new branch does not contain
    pub reverted_transactions: Vec<Transaction>,
}

/// Result of a committed reorganization
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReorganizationResult {
    pub fork_hash: Hash,
    pub fork_height: Height,
    pub old_tip: Hash,
    pub new_tip: Hash,
    pub disconnected: Vec<Hash>,
    pub connected: Vec<Hash>,
    pub reverted_transactions: Vec<Transaction>,
}

impl ReorganizationResult {
    pub fn depth(&self) -> usize {
        self.disconnected.len()
    }
}

/// Most recent canonical ancestor of `branch_tip`, possibly itself
pub fn find_common_ancestor(index: &BlockIndex, branch_tip: &Hash) -> Option<(Hash, Height)> {
    let mut current = index.get(branch_tip)?;
    loop {
        if index.is_canonical(&current.hash) {
            return Some((current.hash, current.height()));
        }
        current = index.get(&current.block.header.previous_hash)?;
    }
}

/// Plan the switch from the canonical tip to the branch ending at `branch_tip`
pub fn plan_reorganization(index: &BlockIndex, branch_tip: &Hash) -> Option<ReorgPlan> {
    let (fork_hash, fork_height) = find_common_ancestor(index, branch_tip)?;

    let disconnect: Vec<Hash> = ((fork_height + 1)..=index.height())
        .rev()
        .filter_map(|h| index.canonical_hash(h))
        .collect();

    let mut connect = Vec::new();
    let mut current = *branch_tip;
    while current != fork_hash {
        let record = index.get(&current)?;
        connect.push(current);
        current = record.block.header.previous_hash;
    }
    connect.reverse();

    Some(ReorgPlan {
        fork_hash,
        fork_height,
        disconnect,
        connect,
    })
}

/// Reorganization policy
///
/// 1. The fork point must lie above the last checkpoint
/// 2. No more than `max_reorg_depth` canonical blocks may be disconnected
pub fn check_reorg_policy(
    tip_height: Height,
    fork_height: Height,
    last_checkpoint: Option<Height>,
    params: &ConsensusParams,
) -> Result<(), RejectReason> {
    // 1. Checkpoint
    if let Some(checkpoint) = last_checkpoint {
        if fork_height <= checkpoint {
            return Err(RejectReason::BelowCheckpoint(checkpoint));
        }
    }

    // 2. Depth
    let depth = tip_height.saturating_sub(fork_height);
    if depth > params.max_reorg_depth {
        return Err(RejectReason::ReorgTooDeep {
            depth,
            limit: params.max_reorg_depth,
        });
    }
    Ok(())
}

/// Strictly more work wins; ties keep the chain seen first
pub fn should_reorganize(candidate_work: ChainWork, tip_work: ChainWork) -> bool {
    candidate_work > tip_work
}

/// ReorganizeChain: 𝒰𝒮 × plan × ℬ → 𝒰𝒮 | (block, reason)
///
/// Runs on a scratch copy of the canonical UTXO set:
/// 1. Disconnect canonical blocks above the fork with their stored undo data
/// 2. Connect each branch block in order, re-validating it
/// 3. Connect the candidate block on top
/// 4. Collect reverted transactions the new branch does not confirm
///
/// On error the offending block's hash is returned with the reason; the
/// scratch set is then in an unspecified state and must be discarded.
pub fn reorganize_chain(
    index: &BlockIndex,
    plan: &ReorgPlan,
    candidate: &Block,
    utxo_set: &mut UtxoSet,
    params: &ConsensusParams,
) -> Result<BranchConnection, (Hash, RejectReason)> {
    // 1. Disconnect
    for hash in &plan.disconnect {
        let undo = index
            .get(hash)
            .and_then(|record| record.undo.as_ref())
            .ok_or_else(|| {
                (
                    *hash,
                    RejectReason::StructurallyInvalid("missing undo data".to_string()),
                )
            })?;
        disconnect_block(utxo_set, undo);
    }

    // 2. Connect branch
    let mut undos = Vec::with_capacity(plan.connect.len());
    for hash in &plan.connect {
        let record = index
            .get(hash)
            .ok_or((*hash, RejectReason::UnknownParent))?;
        let minted = index
            .get(&record.block.header.previous_hash)
            .map(|parent| parent.minted)
            .ok_or((*hash, RejectReason::UnknownParent))?;
        let connected =
            connect_block(&record.block, utxo_set, minted, params).map_err(|reason| (*hash, reason))?;
        undos.push((*hash, connected.undo));
    }

    // 3. Connect candidate
    let candidate_hash = candidate.hash();
    let minted = index
        .get(&candidate.header.previous_hash)
        .map(|parent| parent.minted)
        .ok_or((candidate_hash, RejectReason::UnknownParent))?;
    let connected =
        connect_block(candidate, utxo_set, minted, params).map_err(|reason| (candidate_hash, reason))?;

    // 4. Reverted transactions
    let mut confirmed: HashSet<Txid> = candidate.transactions.iter().map(|tx| tx.txid()).collect();
    for hash in &plan.connect {
        if let Some(record) = index.get(hash) {
            confirmed.extend(record.block.transactions.iter().map(|tx| tx.txid()));
        }
    }
    let reverted_transactions = plan
        .disconnect
        .iter()
        .rev()
        .filter_map(|hash| index.get(hash))
        .flat_map(|record| record.block.transactions.iter().skip(1))
        .filter(|tx| !confirmed.contains(&tx.txid()))
        .cloned()
        .collect();

    Ok(BranchConnection {
        undos,
        candidate: connected,
        reverted_transactions,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::MAX_REORG_DEPTH;

    #[test]
    fn test_should_reorganize_strictly_more_work() {
        assert!(should_reorganize(11, 10));
        assert!(!should_reorganize(10, 10));
        assert!(!should_reorganize(9, 10));
    }

    #[test]
    fn test_reorg_policy_depth() {
        let params = ConsensusParams::regtest();
        assert!(check_reorg_policy(200, 100, None, &params).is_ok());
        assert_eq!(
            check_reorg_policy(200, 99, None, &params),
            Err(RejectReason::ReorgTooDeep {
                depth: 101,
                limit: MAX_REORG_DEPTH
            })
        );
    }

    #[test]
    fn test_reorg_policy_checkpoint() {
        let params = ConsensusParams::regtest();
        assert!(check_reorg_policy(10, 6, Some(5), &params).is_ok());
        assert_eq!(
            check_reorg_policy(10, 5, Some(5), &params),
            Err(RejectReason::BelowCheckpoint(5))
        );
        assert_eq!(
            check_reorg_policy(10, 4, Some(5), &params),
            Err(RejectReason::BelowCheckpoint(5))
        );
    }

    #[test]
    fn test_plan_depth() {
        let plan = ReorgPlan {
            fork_hash: ZERO_HASH,
            fork_height: 95,
            disconnect: vec![[1; 32]; 5],
            connect: vec![[2; 32]; 7],
        };
        assert_eq!(plan.depth(), 5);
    }
}
