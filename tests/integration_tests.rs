//! Consensus scenarios: rewards, supply, double spends and funding

mod common;

use common::*;
use pow_ledger::block::connect_block;
use pow_ledger::economic::{block_reward, supply_at};
use pow_ledger::*;

#[test]
fn test_halving_schedule() {
    let params = ConsensusParams::mainnet();
    assert_eq!(block_reward(0, &params), 0);
    assert_eq!(block_reward(1, &params), 12 * COIN);
    assert_eq!(block_reward(262_799, &params), 12 * COIN);
    assert_eq!(block_reward(262_800, &params), 6 * COIN);
    assert_eq!(block_reward(525_599, &params), 6 * COIN);
    assert_eq!(block_reward(525_600, &params), 3 * COIN);
    assert_eq!(block_reward(64 * 262_800, &params), 0);
}

#[test]
fn test_supply_never_exceeds_cap() {
    let params = ConsensusParams::mainnet();
    assert_eq!(supply_at(262_799, &params), 262_799 * 12 * COIN);
    assert!(supply_at(64 * 262_800, &params) <= MAX_SUPPLY);
    assert!(supply_at(u64::MAX, &params) <= MAX_SUPPLY);
}

#[test]
fn test_halving_on_a_short_interval_chain() {
    let params = ConsensusParams {
        halving_interval: 4,
        ..ConsensusParams::regtest()
    };
    let mut chain = ChainState::new(params.clone());
    let miner = key(1).address();
    let blocks = extend(&mut chain, &miner, 9);

    let rewards: Vec<Amount> = blocks.iter().map(|b| b.transactions[0].outputs[0].amount).collect();
    let twelve = 12 * COIN;
    assert_eq!(
        rewards,
        vec![twelve, twelve, twelve, twelve / 2, twelve / 2, twelve / 2, twelve / 2, twelve / 4, twelve / 4]
    );
    assert_eq!(chain.minted(), supply_at(9, &params));
}

#[test]
fn test_supply_conservation_with_fees() {
    let mut chain = ChainState::new(ConsensusParams::regtest());
    let (alice, bob) = (key(1), key(2));
    let early = extend(&mut chain, &alice.address(), 2);

    let (out1, amount1) = coinbase_output(&early[0]);
    let (out2, amount2) = coinbase_output(&early[1]);
    let pay1 = transfer(&alice, out1, amount1, &bob.address(), 3_000, 1);
    let pay2 = transfer(&alice, out2, amount2, &bob.address(), 7_000, 2);
    extend_with(&mut chain, &key(3).address(), vec![vec![pay1, pay2]], 3, 0);

    // Fees move value into the coinbase; only rewards create it
    assert_eq!(chain.utxo().total_value(), chain.minted());
    assert_eq!(chain.minted(), supply_at(chain.height(), chain.params()));
    assert_eq!(chain.utxo().balance(&bob.address()), amount1 + amount2 - 10_000);
    assert_eq!(
        chain.utxo().balance(&key(3).address()),
        3 * block_reward(3, chain.params()) + 10_000
    );
}

#[test]
fn test_double_spend_within_block_rejected() {
    let mut chain = ChainState::new(ConsensusParams::regtest());
    let alice = key(1);
    let early = extend(&mut chain, &alice.address(), 1);
    let (outpoint, amount) = coinbase_output(&early[0]);

    let first = transfer(&alice, outpoint, amount, &key(2).address(), 10, 1);
    let second = transfer(&alice, outpoint, amount, &key(3).address(), 20, 2);
    let tip = chain.tip_hash();
    let block = mine_child(&chain, &tip, &alice.address(), vec![first, second], 0);

    let before = chain.utxo().clone();
    let rejection = chain.process_block(block, NOW).unwrap_err();
    assert_eq!(rejection.stage, ValidationStage::ContextuallyValid);
    assert_eq!(rejection.reason, RejectReason::DoubleSpend(outpoint));
    assert_eq!(chain.utxo(), &before);
}

#[test]
fn test_double_spend_across_blocks_rejected() {
    let mut chain = ChainState::new(ConsensusParams::regtest());
    let alice = key(1);
    let early = extend(&mut chain, &alice.address(), 1);
    let (outpoint, amount) = coinbase_output(&early[0]);

    let first = transfer(&alice, outpoint, amount, &key(2).address(), 10, 1);
    extend_with(&mut chain, &alice.address(), vec![vec![first]], 1, 0);

    let second = transfer(&alice, outpoint, amount, &key(3).address(), 20, 2);
    let tip = chain.tip_hash();
    let block = mine_child(&chain, &tip, &alice.address(), vec![second], 0);
    let rejection = chain.process_block(block, NOW).unwrap_err();
    assert_eq!(rejection.reason, RejectReason::DoubleSpend(outpoint));
    assert_eq!(chain.height(), 2);
}

#[test]
fn test_underfunded_transaction_rejected_structurally() {
    let mut set = UtxoSet::new();
    let alice = key(1);
    let outpoint = fund(&mut set, &alice.address(), 1_000, 9);

    let mut tx = transfer(&alice, outpoint, 1_000, &key(2).address(), 10, 1);
    tx.outputs[0].amount = 5_000;
    pow_ledger::transaction::sign_inputs(&mut tx, &alice);

    let mut mempool = Mempool::new(MempoolPolicy::regtest(), 1);
    let before = set.clone();
    let reason = mempool.submit(tx, &set, NOW).unwrap_err();
    assert!(matches!(reason, RejectReason::StructurallyInvalid(_)));
    assert_eq!(reason.class(), ErrorClass::Structural);
    assert_eq!(set, before);
    assert!(mempool.is_empty());
}

#[test]
fn test_coinbase_overpaying_rejected() {
    let mut chain = ChainState::new(ConsensusParams::regtest());
    let tip = chain.tip_hash();
    let mut block = mine_child(&chain, &tip, &key(1).address(), vec![], 0);
    block.transactions[0].outputs[0].amount += 1;
    block.header.merkle_root = pow_ledger::block::calculate_merkle_root(&block.transactions);
    while pow_ledger::pow::check_proof_of_work(&block.hash(), block.header.bits, chain.params()).is_err() {
        block.header.nonce += 1;
    }

    let mut scratch = UtxoSet::new();
    let reason = connect_block(&block, &mut scratch, 0, chain.params()).unwrap_err();
    assert!(matches!(reason, RejectReason::BadCoinbase(_)));
    assert!(scratch.is_empty());

    let rejection = chain.process_block(block, NOW).unwrap_err();
    assert!(matches!(rejection.reason, RejectReason::BadCoinbase(_)));
}

#[test]
fn test_unsigned_spend_rejected() {
    let mut chain = ChainState::new(ConsensusParams::regtest());
    let (alice, mallory) = (key(1), key(6));
    let early = extend(&mut chain, &alice.address(), 1);
    let (outpoint, amount) = coinbase_output(&early[0]);

    let theft = transfer(&mallory, outpoint, amount, &mallory.address(), 10, 1);
    let tip = chain.tip_hash();
    let block = mine_child(&chain, &tip, &mallory.address(), vec![theft], 0);
    let rejection = chain.process_block(block, NOW).unwrap_err();
    assert_eq!(rejection.reason, RejectReason::BadSignature(0));
}
