//! Fork choice and reorganization scenarios

mod common;

use common::*;
use pow_ledger::block::{connect_block, disconnect_block};
use pow_ledger::*;

struct Fork {
    main: ChainState,
    /// Canonical blocks 1..=95 shared by both branches
    shared: Vec<Block>,
    /// Blocks 96..=100 of the first-seen branch
    old_branch: Vec<Block>,
    /// Blocks 96..=103 of the competing branch
    new_branch: Vec<Block>,
    /// Transaction confirmed only on the old branch
    old_only: Transaction,
    /// Transaction confirmed only on the new branch
    new_only: Transaction,
}

fn build_fork() -> Fork {
    let alice = key(1);
    let (bob, carol) = (key(2).address(), key(3).address());

    let mut main = ChainState::new(ConsensusParams::regtest());
    let shared = extend(&mut main, &alice.address(), 95);
    let mut competitor = main.clone();

    let (out1, amount1) = coinbase_output(&shared[0]);
    let (out2, amount2) = coinbase_output(&shared[1]);
    let old_only = transfer(&alice, out1, amount1, &bob, 100, 1);
    let new_only = transfer(&alice, out2, amount2, &carol, 200, 1);

    let old_branch = extend_with(&mut main, &key(4).address(), vec![vec![], vec![old_only.clone()]], 5, 0);
    let new_branch = extend_with(
        &mut competitor,
        &key(5).address(),
        vec![vec![], vec![], vec![new_only.clone()]],
        8,
        30,
    );

    Fork {
        main,
        shared,
        old_branch,
        new_branch,
        old_only,
        new_only,
    }
}

fn replay(blocks: &[Block]) -> ChainState {
    let mut chain = ChainState::new(ConsensusParams::regtest());
    for block in blocks {
        chain.process_block(block.clone(), NOW).unwrap();
    }
    chain
}

#[test]
fn test_reorg_100_to_103_from_ancestor_95() {
    let Fork {
        mut main,
        shared,
        old_branch,
        new_branch,
        old_only,
        new_only,
    } = build_fork();
    assert_eq!(main.height(), 100);
    let old_tip = main.tip_hash();

    // Deliver 97..=103 first; they wait for 96
    for block in &new_branch[1..] {
        let rejection = main.process_block(block.clone(), NOW).unwrap_err();
        assert_eq!(rejection.reason, RejectReason::UnknownParent);
    }
    assert_eq!(main.tip_hash(), old_tip);

    let update = main.process_block(new_branch[0].clone(), NOW).unwrap();
    assert!(update.tip_changed);
    assert_eq!(update.orphans_connected.len(), 7);
    assert_eq!(update.reorganizations.len(), 1);

    let reorg = &update.reorganizations[0];
    assert_eq!(reorg.fork_height, 95);
    assert_eq!(reorg.fork_hash, shared[94].hash());
    assert_eq!(reorg.old_tip, old_tip);
    assert_eq!(reorg.depth(), 5);
    let reverted: Vec<Hash> = old_branch.iter().rev().map(|b| b.hash()).collect();
    assert_eq!(reorg.disconnected, reverted);
    assert_eq!(update.reverted_transactions, vec![old_only.clone()]);
    assert!(update.confirmed_txids.contains(&new_only.txid()));

    // All 8 competing blocks are now canonical
    assert_eq!(main.height(), 103);
    assert_eq!(main.tip_hash(), new_branch[7].hash());
    for block in &new_branch {
        assert_eq!(main.block_at(block.header.height).map(|b| b.hash()), Some(block.hash()));
    }

    // Same state as applying the winning branch directly
    let direct = replay(&[shared, new_branch].concat());
    assert_eq!(main.utxo(), direct.utxo());
    assert_eq!(main.utxo().digest(), direct.utxo().digest());
    assert_eq!(main.minted(), direct.minted());
    assert_eq!(main.cumulative_work(), direct.cumulative_work());
    assert_eq!(main.utxo().balance(&key(2).address()), 0);
}

#[test]
fn test_reorg_back_and_forth() {
    let Fork {
        mut main,
        shared,
        old_branch,
        new_branch,
        ..
    } = build_fork();
    for block in &new_branch {
        let _ = main.process_block(block.clone(), NOW);
    }
    assert_eq!(main.tip_hash(), new_branch[7].hash());

    // Grow the original branch past the new one
    let mut builder = replay(&[shared.clone(), old_branch.clone()].concat());
    let extension = extend(&mut builder, &key(4).address(), 4);
    let mut last = None;
    for block in &extension {
        last = Some(main.process_block(block.clone(), NOW).unwrap());
    }
    let update = last.unwrap();
    assert_eq!(main.tip_hash(), extension[3].hash());
    assert_eq!(main.height(), 104);
    assert!(matches!(update.outcome, BlockOutcome::Reorganized(_)));

    let direct = replay(&[shared, old_branch, extension].concat());
    assert_eq!(main.utxo(), direct.utxo());
    assert_eq!(main.minted(), direct.minted());
}

#[test]
fn test_disconnect_then_connect_is_identity() {
    let Fork { main, .. } = build_fork();
    let tip = main.tip().clone();
    let parent_minted = main
        .index()
        .get(&tip.header.previous_hash)
        .map(|r| r.minted)
        .unwrap();
    let undo = main.index().get(&main.tip_hash()).and_then(|r| r.undo.clone()).unwrap();

    let mut set = main.utxo().clone();
    disconnect_block(&mut set, &undo);
    assert_ne!(&set, main.utxo());
    let reconnected = connect_block(&tip, &mut set, parent_minted, main.params()).unwrap();
    assert_eq!(&set, main.utxo());
    assert_eq!(reconnected.undo, undo);
}

#[test]
fn test_competing_branch_with_invalid_block_leaves_state() {
    let alice = key(1);
    let mut main = ChainState::new(ConsensusParams::regtest());
    extend(&mut main, &alice.address(), 3);
    let competitor = main.clone();
    extend(&mut main, &alice.address(), 1);
    let before = main.utxo().clone();
    let tip = main.tip_hash();

    // Side block spends an output that does not exist
    let bogus = transfer(&alice, OutPoint::new([0xaa; 32], 0), 1_000, &alice.address(), 1, 1);
    let fork_tip = competitor.tip_hash();
    let side = mine_child(&competitor, &fork_tip, &key(7).address(), vec![bogus], 11);
    let rejection = main.process_block(side.clone(), NOW).unwrap_err();
    assert_eq!(rejection.stage, ValidationStage::ContextuallyValid);
    assert!(main.is_known_invalid(&side.hash()));
    assert_eq!(main.tip_hash(), tip);
    assert_eq!(main.utxo(), &before);

    // Descendants of the invalid block are refused on sight
    let mut child = side.clone();
    child.header.previous_hash = side.hash();
    child.header.height += 1;
    let rejection = main.process_block(child, NOW).unwrap_err();
    assert_eq!(rejection.stage, ValidationStage::Received);
    assert_eq!(rejection.reason, RejectReason::KnownInvalid);
}
