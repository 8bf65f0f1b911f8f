//! Block hashing, structural checks and connection against the UTXO set

use crate::config::ConsensusParams;
use crate::constants::WIRE_FORMAT_VERSION;
use crate::crypto::sha256d;
use crate::economic::{check_coinbase, total_fees};
use crate::error::{RejectReason, Result};
use crate::pow::check_proof_of_work;
use crate::transaction::{check_transaction, encode_varint, is_coinbase, validate, ValidationContext};
use crate::types::*;
use crate::utxo::{BlockUndo, UtxoSet};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Encoded header length: height, previous hash, timestamp, nonce, bits, merkle root
pub const HEADER_SIZE: usize = 8 + 32 + 8 + 8 + 4 + 32;

/// What connecting a block did to the ledger
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectedBlock {
    pub undo: BlockUndo,
    pub fees: Amount,
    /// Coins created by the coinbase beyond fees
    pub minted: Amount,
}

/// Calculate block hash: sha256d over the fixed-width header encoding
pub fn calculate_block_hash(header: &BlockHeader) -> Hash {
    let mut data = Vec::with_capacity(HEADER_SIZE);
    data.extend_from_slice(&header.height.to_le_bytes());
    data.extend_from_slice(&header.previous_hash);
    data.extend_from_slice(&header.timestamp.to_le_bytes());
    data.extend_from_slice(&header.nonce.to_le_bytes());
    data.extend_from_slice(&header.bits.to_le_bytes());
    data.extend_from_slice(&header.merkle_root);
    sha256d(&data)
}

/// Header bytes plus the canonical bytes of every transaction
pub fn block_size(block: &Block) -> usize {
    HEADER_SIZE
        + encode_varint(block.transactions.len() as u64).len()
        + block.transactions.iter().map(|tx| tx.size()).sum::<usize>()
}

/// Calculate merkle root over txids
///
/// Odd levels duplicate their last hash. An empty list yields the zero hash.
pub fn calculate_merkle_root(transactions: &[Transaction]) -> Hash {
    if transactions.is_empty() {
        return ZERO_HASH;
    }

    let mut hashes: Vec<Hash> = transactions.iter().map(|tx| tx.txid()).collect();

    // Build Merkle tree bottom-up
    while hashes.len() > 1 {
        let mut next_level = Vec::with_capacity((hashes.len() + 1) / 2);
        for chunk in hashes.chunks(2) {
            let right = chunk.get(1).unwrap_or(&chunk[0]);
            let mut combined = [0u8; 64];
            combined[..32].copy_from_slice(&chunk[0]);
            combined[32..].copy_from_slice(right);
            next_level.push(sha256d(&combined));
        }
        hashes = next_level;
    }

    hashes[0]
}

/// The fixed first block of a network
///
/// Height 0, zero previous hash, no transactions. It mints nothing and is
/// accepted by hash equality rather than proof of work.
pub fn genesis_block(params: &ConsensusParams) -> Block {
    Block {
        header: BlockHeader {
            height: 0,
            previous_hash: ZERO_HASH,
            timestamp: params.genesis_timestamp,
            nonce: 0,
            bits: params.pow_limit_bits,
            merkle_root: ZERO_HASH,
        },
        transactions: Vec::new(),
    }
}

/// CheckBlock: ℬ → {valid, invalid}
///
/// Context-free checks for a non-genesis block, cheapest header checks first:
/// 1. Hash meets the target encoded in bits
/// 2. Timestamp not beyond now + the allowed drift
/// 3. At least one transaction, the first a coinbase and no other
/// 4. Every transaction structurally valid, no repeated txids
/// 5. Merkle root commits to the transactions
/// 6. Size within the limit
pub fn check_block(block: &Block, params: &ConsensusParams, now: Timestamp) -> Result<()> {
    if block.header.height == 0 {
        return check_genesis(block, params);
    }

    // 1. Proof of work
    check_proof_of_work(&block.hash(), block.header.bits, params)?;

    // 2. Future drift
    let limit = now.saturating_add(params.max_future_block_time);
    if block.header.timestamp > limit {
        return Err(RejectReason::BadTimestamp(format!(
            "timestamp {} beyond {}",
            block.header.timestamp, limit
        )));
    }

    // 3. Coinbase placement
    let coinbase = block
        .transactions
        .first()
        .ok_or_else(|| RejectReason::StructurallyInvalid("block has no transactions".to_string()))?;
    if !is_coinbase(coinbase) {
        return Err(RejectReason::BadCoinbase("first transaction is not a coinbase".to_string()));
    }
    if block.transactions[1..].iter().any(is_coinbase) {
        return Err(RejectReason::BadCoinbase("more than one coinbase".to_string()));
    }

    // 4. Transaction structure
    let mut txids = HashSet::with_capacity(block.transactions.len());
    for (i, tx) in block.transactions.iter().enumerate() {
        check_transaction(tx).map_err(|reason| match reason {
            RejectReason::StructurallyInvalid(msg) => {
                RejectReason::StructurallyInvalid(format!("transaction {}: {}", i, msg))
            }
            other => other,
        })?;
        if !txids.insert(tx.txid()) {
            return Err(RejectReason::StructurallyInvalid(format!(
                "transaction {} repeats an earlier txid",
                i
            )));
        }
    }

    // 5. Merkle root
    if calculate_merkle_root(&block.transactions) != block.header.merkle_root {
        return Err(RejectReason::BadMerkleRoot);
    }

    // 6. Size
    let size = block.size();
    if size > params.max_block_size {
        return Err(RejectReason::StructurallyInvalid(format!(
            "block too large: {} bytes",
            size
        )));
    }
    Ok(())
}

/// Genesis is valid only if it hashes to the network's fixed genesis
pub fn check_genesis(block: &Block, params: &ConsensusParams) -> Result<()> {
    if block.hash() != genesis_block(params).hash() || !block.transactions.is_empty() {
        return Err(RejectReason::BadGenesis);
    }
    Ok(())
}

/// ConnectBlock: ℬ × 𝒰𝒮 × ℕ → 𝒰𝒮 × 𝒰𝒟
///
/// For block b at height h on top of UTXO set us with `minted` coins created so far:
/// 1. For each non-coinbase tx, in order: validate against us, then apply it
/// 2. Let fees = Σ fee(tx)
/// 3. Coinbase must pay exactly clamped reward(h) + fees
/// 4. Apply the coinbase
///
/// Later transactions see outputs and nonces of earlier ones. Coinbase outputs
/// become spendable from the next block. On error `utxo_set` is unchanged.
pub fn connect_block(
    block: &Block,
    utxo_set: &mut UtxoSet,
    minted: Amount,
    params: &ConsensusParams,
) -> Result<ConnectedBlock> {
    let mut undo = BlockUndo::default();
    match connect_inner(block, utxo_set, minted, params, &mut undo) {
        Ok((fees, new_coins)) => Ok(ConnectedBlock {
            undo,
            fees,
            minted: new_coins,
        }),
        Err(reason) => {
            utxo_set.revert(&undo);
            Err(reason)
        }
    }
}

fn connect_inner(
    block: &Block,
    utxo_set: &mut UtxoSet,
    minted: Amount,
    params: &ConsensusParams,
    undo: &mut BlockUndo,
) -> Result<(Amount, Amount)> {
    let height = block.header.height;
    if height == 0 {
        return Ok((0, 0));
    }
    let coinbase = block
        .coinbase()
        .ok_or_else(|| RejectReason::StructurallyInvalid("block has no transactions".to_string()))?;
    let ctx = ValidationContext::new(params.dust_threshold);

    // 1. Validate and apply in order
    let mut fees = Vec::with_capacity(block.transactions.len());
    for tx in &block.transactions[1..] {
        fees.push(validate(tx, &*utxo_set, &ctx)?);
        utxo_set.apply_transaction(tx, height, undo)?;
    }

    // 2. Fees
    let fees = total_fees(&fees)?;

    // 3. Coinbase amount
    let new_coins = check_coinbase(coinbase, height, fees, minted, params)?;

    // 4. Apply coinbase
    utxo_set.apply_transaction(coinbase, height, undo)?;

    Ok((fees, new_coins))
}

/// DisconnectBlock: restore the set to its state before the block
pub fn disconnect_block(utxo_set: &mut UtxoSet, undo: &BlockUndo) {
    utxo_set.revert(undo);
}

// ============================================================================
// WIRE FORMAT
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
struct BlockEnvelope {
    version: u32,
    #[serde(with = "crate::types::hex_hash")]
    hash: Hash,
    block: Block,
}

/// Serialize a block for relay
pub fn encode_block(block: &Block) -> serde_json::Result<Vec<u8>> {
    serde_json::to_vec(&BlockEnvelope {
        version: WIRE_FORMAT_VERSION,
        hash: block.hash(),
        block: block.clone(),
    })
}

/// Parse a relayed block, checking its version tag and claimed hash
pub fn decode_block(raw: &[u8]) -> Result<Block> {
    let envelope: BlockEnvelope = serde_json::from_slice(raw)
        .map_err(|e| RejectReason::StructurallyInvalid(format!("malformed block: {}", e)))?;
    if envelope.version != WIRE_FORMAT_VERSION {
        return Err(RejectReason::StructurallyInvalid(format!(
            "unsupported block version {}",
            envelope.version
        )));
    }
    if envelope.block.hash() != envelope.hash {
        return Err(RejectReason::StructurallyInvalid("block hash mismatch".to_string()));
    }
    Ok(envelope.block)
}
