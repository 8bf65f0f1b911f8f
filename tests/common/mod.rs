//! Shared fixtures for integration tests

#![allow(dead_code)]

use pow_ledger::crypto::KeyPair;
use pow_ledger::mining::{create_block_template, mine_block, CancelToken, MiningLimits, MiningOutcome};
use pow_ledger::transaction::sign_inputs;
use pow_ledger::*;

/// Far enough past genesis that no regtest block is in the future
pub const NOW: Timestamp = GENESIS_TIMESTAMP + 100_000_000;

pub fn key(seed: u8) -> KeyPair {
    KeyPair::from_secret_bytes(&[seed; 32]).unwrap()
}

/// Mine a child of `parent`; `salt` shifts the timestamp so siblings differ
pub fn mine_child(
    chain: &ChainState,
    parent: &Hash,
    miner: &Address,
    txs: Vec<Transaction>,
    salt: u64,
) -> Block {
    let record = chain.index().get(parent).expect("parent known");
    let template = create_block_template(
        &record.block.header,
        *parent,
        chain.expected_bits(record),
        txs,
        miner.clone(),
        record.block.header.timestamp + 120 + salt,
        record.minted,
        chain.params(),
    );
    match mine_block(template, &CancelToken::new(), MiningLimits::unbounded(u64::MAX)) {
        MiningOutcome::Found(block) => block,
        other => panic!("mining failed: {:?}", other),
    }
}

/// Mine `count` blocks on the tip, each carrying the matching entry of `txs`
pub fn extend_with(chain: &mut ChainState, miner: &Address, mut txs: Vec<Vec<Transaction>>, count: usize, salt: u64) -> Vec<Block> {
    txs.resize(count, Vec::new());
    let mut blocks = Vec::with_capacity(count);
    for block_txs in txs {
        let tip = chain.tip_hash();
        let block = mine_child(chain, &tip, miner, block_txs, salt);
        let update = chain.process_block(block.clone(), NOW).expect("block accepted");
        assert_eq!(update.outcome, BlockOutcome::Extended);
        blocks.push(block);
    }
    blocks
}

pub fn extend(chain: &mut ChainState, miner: &Address, count: usize) -> Vec<Block> {
    extend_with(chain, miner, Vec::new(), count, 0)
}

/// Spend `prevout` (worth `amount`) to `to`, paying `fee`
pub fn transfer(
    from: &KeyPair,
    prevout: OutPoint,
    amount: Amount,
    to: &Address,
    fee: Amount,
    nonce: u64,
) -> Transaction {
    let mut tx = Transaction {
        inputs: vec![TxInput {
            prevout,
            signature: vec![],
            public_key: vec![],
        }],
        outputs: vec![TxOutput {
            address: to.clone(),
            amount: amount - fee,
        }],
        fee,
        nonce,
        timestamp: NOW,
        replace_by_fee: false,
    };
    sign_inputs(&mut tx, from);
    tx
}

/// First output of the coinbase of `block`
pub fn coinbase_output(block: &Block) -> (OutPoint, Amount) {
    let coinbase = &block.transactions[0];
    (OutPoint::new(coinbase.txid(), 0), coinbase.outputs[0].amount)
}

/// Credit `address` with a standalone output in `set`
pub fn fund(set: &mut UtxoSet, address: &Address, amount: Amount, tag: u8) -> OutPoint {
    let outpoint = OutPoint::new([tag; 32], 0);
    set.insert(
        outpoint,
        UtxoEntry {
            address: address.clone(),
            amount,
            height: 1,
            coinbase: false,
        },
    );
    outpoint
}
