//! Transaction codec and validation
//!
//! Validation is a pure function over a [`UtxoView`]: the caller decides
//! whether that view is the confirmed set (block validation) or the
//! confirmed set layered with pending mempool spends (admission).

use crate::constants::*;
use crate::crypto::{address_from_public_key, sha256d, verify_signature, KeyPair};
use crate::error::{RejectReason, Result};
use crate::types::*;
use crate::utxo::UtxoView;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Consensus knobs the validator needs beyond the view itself
#[derive(Debug, Clone, Copy)]
pub struct ValidationContext {
    pub dust_threshold: Amount,
}

impl ValidationContext {
    pub fn new(dust_threshold: Amount) -> Self {
        ValidationContext { dust_threshold }
    }
}

/// CheckTransaction: 𝒯𝒳 → {valid, invalid}
///
/// Context-free shape checks:
/// 1. |outs| > 0, and |ins| > 0 unless coinbase
/// 2. |ins| ≤ MAX_INPUTS, |outs| ≤ MAX_OUTPUTS
/// 3. |tx| ≤ MAX_TX_SIZE
/// 4. Σ outs and Σ outs + fee do not overflow
/// 5. key and signature lengths
pub fn check_transaction(tx: &Transaction) -> Result<()> {
    // 1. Check inputs and outputs are not empty
    if tx.outputs.is_empty() {
        return Err(RejectReason::StructurallyInvalid("no outputs".to_string()));
    }
    if tx.inputs.is_empty() && tx.fee != 0 {
        return Err(RejectReason::StructurallyInvalid(
            "coinbase must not carry a fee".to_string(),
        ));
    }

    // 2. Check count limits
    if tx.inputs.len() > MAX_INPUTS {
        return Err(RejectReason::StructurallyInvalid(format!(
            "too many inputs: {}",
            tx.inputs.len()
        )));
    }
    if tx.outputs.len() > MAX_OUTPUTS {
        return Err(RejectReason::StructurallyInvalid(format!(
            "too many outputs: {}",
            tx.outputs.len()
        )));
    }

    // 3. Check size limit
    let size = tx.size();
    if size > MAX_TX_SIZE {
        return Err(RejectReason::StructurallyInvalid(format!(
            "transaction too large: {} bytes",
            size
        )));
    }

    // 4. Check value sums
    let total_out = tx
        .output_total()
        .ok_or_else(|| RejectReason::StructurallyInvalid("output total overflows".to_string()))?;
    if total_out.checked_add(tx.fee).is_none() {
        return Err(RejectReason::StructurallyInvalid(
            "output total plus fee overflows".to_string(),
        ));
    }

    // 5. Check key material
    for (i, input) in tx.inputs.iter().enumerate() {
        if input.public_key.len() != PUBLIC_KEY_LEN {
            return Err(RejectReason::StructurallyInvalid(format!(
                "input {} public key must be {} bytes",
                i, PUBLIC_KEY_LEN
            )));
        }
        if input.signature.len() != SIGNATURE_LEN {
            return Err(RejectReason::StructurallyInvalid(format!(
                "input {} signature must be {} bytes",
                i, SIGNATURE_LEN
            )));
        }
    }

    Ok(())
}

/// Validate: 𝒯𝒳 × 𝒰𝒱 → fee | reason
///
/// For a non-coinbase transaction against a UTXO view, in order:
/// 1. Structural well-formedness
/// 2. No duplicate inputs
/// 3. Every input resolves to an unspent entry
/// 4. Every input's key owns the spent output and its signature covers the txid
/// 5. Σ ins == Σ outs + fee exactly
/// 6. Nonce above the sender's confirmed nonce
/// 7. No output below the dust threshold
///
/// Returns the fee.
pub fn validate(tx: &Transaction, view: &dyn UtxoView, ctx: &ValidationContext) -> Result<Amount> {
    // 1. Structure
    check_transaction(tx)?;
    if is_coinbase(tx) {
        return Err(RejectReason::StructurallyInvalid(
            "coinbase outside block position 0".to_string(),
        ));
    }

    // 2. Duplicate inputs
    let mut seen = HashSet::with_capacity(tx.inputs.len());
    for input in &tx.inputs {
        if !seen.insert(input.prevout) {
            return Err(RejectReason::DuplicateInput(input.prevout));
        }
    }

    // 3. Resolve inputs
    let mut spent = Vec::with_capacity(tx.inputs.len());
    for input in &tx.inputs {
        match view.get(&input.prevout) {
            Some(entry) => spent.push(entry),
            None => return Err(RejectReason::DoubleSpend(input.prevout)),
        }
    }

    // 4. Ownership and signatures
    let txid = tx.txid();
    for (i, (input, entry)) in tx.inputs.iter().zip(&spent).enumerate() {
        if address_from_public_key(&input.public_key) != entry.address {
            return Err(RejectReason::BadSignature(i));
        }
        if !verify_signature(&input.public_key, &input.signature, &txid) {
            return Err(RejectReason::BadSignature(i));
        }
    }

    // 5. Exact value balance
    let total_in = spent
        .iter()
        .try_fold(0u64, |acc, e| acc.checked_add(e.amount))
        .ok_or_else(|| RejectReason::StructurallyInvalid("input total overflows".to_string()))?;
    let total_out = tx
        .output_total()
        .and_then(|out| out.checked_add(tx.fee))
        .ok_or_else(|| RejectReason::StructurallyInvalid("output total overflows".to_string()))?;
    if total_in != total_out {
        return Err(RejectReason::StructurallyInvalid(format!(
            "inputs {} != outputs plus fee {}",
            total_in, total_out
        )));
    }

    // 6. Nonce monotonicity. Only confirmed nonces are binding here; a
    // pending transaction with the same nonce is resolved by mempool RBF.
    if let Some(sender) = sender_of(tx) {
        if let Some(confirmed) = view.confirmed_nonce(&sender) {
            if tx.nonce <= confirmed {
                return Err(RejectReason::NonceTooLow {
                    sender,
                    nonce: tx.nonce,
                    confirmed,
                });
            }
        }
    }

    // 7. Dust
    for (index, output) in tx.outputs.iter().enumerate() {
        if output.amount < ctx.dust_threshold {
            return Err(RejectReason::DustOutput {
                index,
                amount: output.amount,
            });
        }
    }

    Ok(tx.fee)
}

/// Coinbase: the only transaction without inputs
pub fn is_coinbase(tx: &Transaction) -> bool {
    tx.inputs.is_empty()
}

/// Sender of a non-coinbase transaction: owner of the first input's key
pub fn sender_of(tx: &Transaction) -> Option<Address> {
    tx.inputs
        .first()
        .map(|input| address_from_public_key(&input.public_key))
}

/// Build the coinbase for a block at `height`
pub fn create_coinbase(height: Height, address: Address, amount: Amount, timestamp: Timestamp) -> Transaction {
    Transaction {
        inputs: vec![],
        outputs: vec![TxOutput { address, amount }],
        fee: 0,
        nonce: height,
        timestamp,
        replace_by_fee: false,
    }
}

/// Set every input's public key to `key` and sign the resulting txid
pub fn sign_inputs(tx: &mut Transaction, key: &KeyPair) {
    let public_key = key.public_key_bytes();
    for input in tx.inputs.iter_mut() {
        input.public_key = public_key.clone();
    }
    let txid = calculate_txid(tx);
    let signature = key.sign(&txid);
    for input in tx.inputs.iter_mut() {
        input.signature = signature.clone();
    }
}

// ============================================================================
// ENCODING
// ============================================================================

/// Canonical binary encoding, signatures included
pub fn encode(tx: &Transaction) -> Vec<u8> {
    encode_with(tx, true)
}

/// Txid: sha256d of the canonical encoding without signatures
pub fn calculate_txid(tx: &Transaction) -> Txid {
    sha256d(&encode_with(tx, false))
}

fn encode_with(tx: &Transaction, include_signatures: bool) -> Vec<u8> {
    let mut data = Vec::with_capacity(64 + tx.inputs.len() * 140 + tx.outputs.len() * 49);

    // Inputs
    data.extend_from_slice(&encode_varint(tx.inputs.len() as u64));
    for input in &tx.inputs {
        data.extend_from_slice(&input.prevout.txid);
        data.extend_from_slice(&input.prevout.index.to_le_bytes());
        data.extend_from_slice(&encode_varint(input.public_key.len() as u64));
        data.extend_from_slice(&input.public_key);
        if include_signatures {
            data.extend_from_slice(&encode_varint(input.signature.len() as u64));
            data.extend_from_slice(&input.signature);
        }
    }

    // Outputs
    data.extend_from_slice(&encode_varint(tx.outputs.len() as u64));
    for output in &tx.outputs {
        data.extend_from_slice(output.address.as_str().as_bytes());
        data.extend_from_slice(&output.amount.to_le_bytes());
    }

    data.extend_from_slice(&tx.fee.to_le_bytes());
    data.extend_from_slice(&tx.nonce.to_le_bytes());
    data.extend_from_slice(&tx.timestamp.to_le_bytes());
    data.push(tx.replace_by_fee as u8);
    data
}

/// Encode a number as a varint
pub(crate) fn encode_varint(value: u64) -> Vec<u8> {
    if value < 0xfd {
        vec![value as u8]
    } else if value <= 0xffff {
        let mut result = vec![0xfd];
        result.extend_from_slice(&(value as u16).to_le_bytes());
        result
    } else if value <= 0xffff_ffff {
        let mut result = vec![0xfe];
        result.extend_from_slice(&(value as u32).to_le_bytes());
        result
    } else {
        let mut result = vec![0xff];
        result.extend_from_slice(&value.to_le_bytes());
        result
    }
}

/// Versioned JSON envelope carried over the wire
#[derive(Debug, Serialize, Deserialize)]
struct TxEnvelope {
    version: u32,
    #[serde(with = "crate::types::hex_hash")]
    txid: Txid,
    tx: Transaction,
}

/// Serialize a transaction for relay
pub fn encode_transaction(tx: &Transaction) -> serde_json::Result<Vec<u8>> {
    serde_json::to_vec(&TxEnvelope {
        version: WIRE_FORMAT_VERSION,
        txid: tx.txid(),
        tx: tx.clone(),
    })
}

/// Parse a relayed transaction, checking its version tag and claimed txid
pub fn decode_transaction(raw: &[u8]) -> Result<Transaction> {
    let envelope: TxEnvelope = serde_json::from_slice(raw)
        .map_err(|e| RejectReason::StructurallyInvalid(format!("malformed transaction: {}", e)))?;
    if envelope.version != WIRE_FORMAT_VERSION {
        return Err(RejectReason::StructurallyInvalid(format!(
            "unsupported transaction version {}",
            envelope.version
        )));
    }
    if envelope.tx.txid() != envelope.txid {
        return Err(RejectReason::StructurallyInvalid("txid mismatch".to_string()));
    }
    Ok(envelope.tx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utxo::UtxoSet;

    fn key(seed: u8) -> KeyPair {
        KeyPair::from_secret_bytes(&[seed; 32]).unwrap()
    }

    fn funded_set(owner: &KeyPair, amount: Amount) -> (UtxoSet, OutPoint) {
        let mut set = UtxoSet::new();
        let outpoint = OutPoint::new([1; 32], 0);
        set.insert(
            outpoint,
            UtxoEntry {
                address: owner.address(),
                amount,
                height: 0,
                coinbase: false,
            },
        );
        (set, outpoint)
    }

    fn spend(owner: &KeyPair, prevout: OutPoint, to: Address, amount: Amount, fee: Amount) -> Transaction {
        let mut tx = Transaction {
            inputs: vec![TxInput {
                prevout,
                signature: vec![],
                public_key: vec![],
            }],
            outputs: vec![TxOutput { address: to, amount }],
            fee,
            nonce: 1,
            timestamp: 1_700_000_100,
            replace_by_fee: false,
        };
        sign_inputs(&mut tx, owner);
        tx
    }

    #[test]
    fn test_validate_valid_spend() {
        let alice = key(1);
        let bob = key(2);
        let (set, op) = funded_set(&alice, 1000);
        let tx = spend(&alice, op, bob.address(), 990, 10);
        assert_eq!(validate(&tx, &set, &ValidationContext::new(1)), Ok(10));
    }

    #[test]
    fn test_txid_excludes_signatures() {
        let alice = key(1);
        let (_, op) = funded_set(&alice, 1000);
        let mut tx = spend(&alice, op, alice.address(), 990, 10);
        let before = tx.txid();
        tx.inputs[0].signature = vec![0; 64];
        assert_eq!(tx.txid(), before);
        tx.fee = 11;
        assert_ne!(tx.txid(), before);
    }

    #[test]
    fn test_validate_underfunded_is_structural() {
        let alice = key(1);
        let (set, op) = funded_set(&alice, 1000);
        let tx = spend(&alice, op, alice.address(), 1000, 10);
        assert!(matches!(
            validate(&tx, &set, &ValidationContext::new(1)),
            Err(RejectReason::StructurallyInvalid(_))
        ));
    }

    #[test]
    fn test_validate_rejects_fee_skimming() {
        // Inputs exceed outputs plus fee: implicit fees are not allowed
        let alice = key(1);
        let (set, op) = funded_set(&alice, 1000);
        let tx = spend(&alice, op, alice.address(), 900, 10);
        assert!(matches!(
            validate(&tx, &set, &ValidationContext::new(1)),
            Err(RejectReason::StructurallyInvalid(_))
        ));
    }

    #[test]
    fn test_validate_missing_input() {
        let alice = key(1);
        let set = UtxoSet::new();
        let tx = spend(&alice, OutPoint::new([9; 32], 0), alice.address(), 990, 10);
        assert_eq!(
            validate(&tx, &set, &ValidationContext::new(1)),
            Err(RejectReason::DoubleSpend(OutPoint::new([9; 32], 0)))
        );
    }

    #[test]
    fn test_validate_wrong_owner() {
        let alice = key(1);
        let mallory = key(3);
        let (set, op) = funded_set(&alice, 1000);
        let tx = spend(&mallory, op, mallory.address(), 990, 10);
        assert_eq!(
            validate(&tx, &set, &ValidationContext::new(1)),
            Err(RejectReason::BadSignature(0))
        );
    }

    #[test]
    fn test_validate_tampered_after_signing() {
        let alice = key(1);
        let (set, op) = funded_set(&alice, 1000);
        let mut tx = spend(&alice, op, alice.address(), 990, 10);
        tx.outputs[0].amount = 980;
        tx.fee = 20;
        assert_eq!(
            validate(&tx, &set, &ValidationContext::new(1)),
            Err(RejectReason::BadSignature(0))
        );
    }

    #[test]
    fn test_validate_duplicate_inputs() {
        let alice = key(1);
        let (set, op) = funded_set(&alice, 1000);
        let mut tx = spend(&alice, op, alice.address(), 990, 10);
        tx.inputs.push(tx.inputs[0].clone());
        sign_inputs(&mut tx, &alice);
        assert_eq!(
            validate(&tx, &set, &ValidationContext::new(1)),
            Err(RejectReason::DuplicateInput(op))
        );
    }

    #[test]
    fn test_validate_nonce_too_low() {
        let alice = key(1);
        let (mut set, op) = funded_set(&alice, 1000);
        set.set_nonce(alice.address(), 1);
        let tx = spend(&alice, op, alice.address(), 990, 10);
        assert!(matches!(
            validate(&tx, &set, &ValidationContext::new(1)),
            Err(RejectReason::NonceTooLow { nonce: 1, confirmed: 1, .. })
        ));
    }

    #[test]
    fn test_validate_dust() {
        let alice = key(1);
        let (set, op) = funded_set(&alice, 1000);
        let tx = spend(&alice, op, alice.address(), 990, 10);
        assert_eq!(
            validate(&tx, &set, &ValidationContext::new(DUST_THRESHOLD)),
            Ok(10)
        );
        let tx = spend(&alice, op, alice.address(), 500, 500);
        assert_eq!(
            validate(&tx, &set, &ValidationContext::new(DUST_THRESHOLD)),
            Err(RejectReason::DustOutput { index: 0, amount: 500 })
        );
    }

    // ============================================================================
    // STRUCTURE AND CODEC TESTS
    // ============================================================================

    #[test]
    fn test_check_transaction_no_outputs() {
        let alice = key(1);
        let mut tx = spend(&alice, OutPoint::new([1; 32], 0), alice.address(), 1, 0);
        tx.outputs.clear();
        assert!(check_transaction(&tx).is_err());
    }

    #[test]
    fn test_check_transaction_bad_key_length() {
        let alice = key(1);
        let mut tx = spend(&alice, OutPoint::new([1; 32], 0), alice.address(), 1, 0);
        tx.inputs[0].public_key.pop();
        assert!(matches!(
            check_transaction(&tx),
            Err(RejectReason::StructurallyInvalid(_))
        ));
    }

    #[test]
    fn test_coinbase_rejected_by_validate() {
        let cb = create_coinbase(5, key(1).address(), 100, 0);
        assert!(is_coinbase(&cb));
        assert!(check_transaction(&cb).is_ok());
        assert!(validate(&cb, &UtxoSet::new(), &ValidationContext::new(1)).is_err());
    }

    #[test]
    fn test_coinbase_txid_depends_on_height() {
        let addr = key(1).address();
        assert_ne!(
            create_coinbase(1, addr.clone(), 100, 0).txid(),
            create_coinbase(2, addr, 100, 0).txid()
        );
    }

    #[test]
    fn test_wire_codec() {
        let alice = key(1);
        let tx = spend(&alice, OutPoint::new([1; 32], 0), alice.address(), 990, 10);
        let raw = encode_transaction(&tx).unwrap();
        assert_eq!(decode_transaction(&raw).unwrap(), tx);
    }

    #[test]
    fn test_decode_rejects_txid_mismatch() {
        let alice = key(1);
        let tx = spend(&alice, OutPoint::new([1; 32], 0), alice.address(), 990, 10);
        let mut value: serde_json::Value = serde_json::from_slice(&encode_transaction(&tx).unwrap()).unwrap();
        value["tx"]["fee"] = serde_json::json!(11);
        let raw = serde_json::to_vec(&value).unwrap();
        assert_eq!(
            decode_transaction(&raw),
            Err(RejectReason::StructurallyInvalid("txid mismatch".to_string()))
        );
    }

    #[test]
    fn test_decode_rejects_garbage_and_negative_amounts() {
        assert!(decode_transaction(b"{}").is_err());
        assert!(decode_transaction(b"\x00\x01").is_err());
        let alice = key(1);
        let tx = spend(&alice, OutPoint::new([1; 32], 0), alice.address(), 990, 10);
        let mut value: serde_json::Value = serde_json::from_slice(&encode_transaction(&tx).unwrap()).unwrap();
        value["tx"]["outputs"][0]["amount"] = serde_json::json!(-5);
        assert!(decode_transaction(&serde_json::to_vec(&value).unwrap()).is_err());
        value["tx"]["outputs"][0]["amount"] = serde_json::json!(990);
        assert!(decode_transaction(&serde_json::to_vec(&value).unwrap()).is_ok());
        value["version"] = serde_json::json!(99);
        assert!(decode_transaction(&serde_json::to_vec(&value).unwrap()).is_err());
    }

    #[test]
    fn test_encode_varint() {
        assert_eq!(encode_varint(0xfc), vec![0xfc]);
        assert_eq!(encode_varint(0xfd), vec![0xfd, 0xfd, 0x00]);
        assert_eq!(encode_varint(0x1_0000), vec![0xfe, 0x00, 0x00, 0x01, 0x00]);
    }
}
