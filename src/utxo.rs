//! UTXO set with an address index and per-sender confirmed nonces
//!
//! The chain validator owns the only mutable instance. Everyone else reads
//! an [`UtxoSnapshot`], an `Arc` the chain swaps after each mutation.

use crate::crypto::sha256d;
use crate::error::{RejectReason, Result};
use crate::transaction::{is_coinbase, sender_of};
use crate::types::*;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// Immutable, shareable view of the set at some tip
pub type UtxoSnapshot = Arc<UtxoSet>;

/// Read access the transaction validator needs
pub trait UtxoView {
    /// Unspent entry at `outpoint`, if any
    fn get(&self, outpoint: &OutPoint) -> Option<UtxoEntry>;

    /// Highest nonce confirmed for `sender`
    fn confirmed_nonce(&self, sender: &Address) -> Option<u64>;
}

/// One reversible step recorded while applying a block
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UndoOp {
    Spent(OutPoint, UtxoEntry),
    Created(OutPoint),
    Nonce(Address, Option<u64>),
}

/// Everything needed to roll a block back without external lookups
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockUndo {
    journal: Vec<UndoOp>,
}

impl BlockUndo {
    /// Entries the block consumed, in spend order
    pub fn spent_entries(&self) -> impl Iterator<Item = (&OutPoint, &UtxoEntry)> {
        self.journal.iter().filter_map(|op| match op {
            UndoOp::Spent(outpoint, entry) => Some((outpoint, entry)),
            _ => None,
        })
    }

    pub fn len(&self) -> usize {
        self.journal.len()
    }

    pub fn is_empty(&self) -> bool {
        self.journal.is_empty()
    }
}

/// Authoritative mapping of spendable outputs
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UtxoSet {
    entries: HashMap<OutPoint, UtxoEntry>,
    by_address: HashMap<Address, BTreeSet<OutPoint>>,
    nonces: HashMap<Address, u64>,
    total_value: Amount,
}

impl UtxoSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_unspent(&self, txid: &Txid, index: u32) -> bool {
        self.entries.contains_key(&OutPoint::new(*txid, index))
    }

    pub fn entry(&self, outpoint: &OutPoint) -> Option<&UtxoEntry> {
        self.entries.get(outpoint)
    }

    /// Sum of unspent outputs owned by `address`; touches only that address's outputs
    pub fn balance(&self, address: &Address) -> Amount {
        self.by_address
            .get(address)
            .map(|outpoints| {
                outpoints
                    .iter()
                    .filter_map(|op| self.entries.get(op))
                    .map(|e| e.amount)
                    .sum()
            })
            .unwrap_or(0)
    }

    /// Unspent outputs owned by `address`, ordered by outpoint
    pub fn utxos(&self, address: &Address) -> Vec<(OutPoint, UtxoEntry)> {
        self.by_address
            .get(address)
            .map(|outpoints| {
                outpoints
                    .iter()
                    .filter_map(|op| self.entries.get(op).map(|e| (*op, e.clone())))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Sum of every unspent output
    pub fn total_value(&self) -> Amount {
        self.total_value
    }

    pub fn nonce_of(&self, sender: &Address) -> Option<u64> {
        self.nonces.get(sender).copied()
    }

    /// Insert an entry outside block application (genesis allocations, tests)
    pub fn insert(&mut self, outpoint: OutPoint, entry: UtxoEntry) {
        if let Some(previous) = self.remove_entry(&outpoint) {
            tracing::debug!(%outpoint, amount = previous.amount, "overwriting utxo entry");
        }
        self.insert_entry(outpoint, entry);
    }

    /// Record a confirmed nonce outside block application
    pub fn set_nonce(&mut self, sender: Address, nonce: u64) {
        self.nonces.insert(sender, nonce);
    }

    /// ApplyBlock: 𝒰𝒮 × ℬ → 𝒰𝒮 × 𝒰𝒟
    ///
    /// Spends every input and creates every output, in transaction order, so
    /// later transactions may spend outputs of earlier ones in the same block.
    /// Fails with the set unchanged if any input is missing or an output
    /// would overwrite an existing entry.
    pub fn apply(&mut self, block: &Block) -> Result<BlockUndo> {
        let mut undo = BlockUndo::default();
        for tx in &block.transactions {
            if let Err(reason) = self.apply_transaction(tx, block.header.height, &mut undo) {
                self.revert(&undo);
                return Err(reason);
            }
        }
        Ok(undo)
    }

    /// RevertBlock: replays the undo journal backwards
    pub fn revert(&mut self, undo: &BlockUndo) {
        for op in undo.journal.iter().rev() {
            match op {
                UndoOp::Created(outpoint) => {
                    self.remove_entry(outpoint);
                }
                UndoOp::Spent(outpoint, entry) => {
                    self.insert_entry(*outpoint, entry.clone());
                }
                UndoOp::Nonce(sender, previous) => match previous {
                    Some(nonce) => {
                        self.nonces.insert(sender.clone(), *nonce);
                    }
                    None => {
                        self.nonces.remove(sender);
                    }
                },
            }
        }
    }

    /// Content hash over sorted entries and nonces
    pub fn digest(&self) -> Hash {
        let mut entries: Vec<_> = self.entries.iter().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        let mut nonces: Vec<_> = self.nonces.iter().collect();
        nonces.sort();

        let mut data = Vec::with_capacity(entries.len() * 100 + nonces.len() * 48);
        for (outpoint, entry) in entries {
            data.extend_from_slice(&outpoint.txid);
            data.extend_from_slice(&outpoint.index.to_le_bytes());
            data.extend_from_slice(entry.address.as_str().as_bytes());
            data.extend_from_slice(&entry.amount.to_le_bytes());
            data.extend_from_slice(&entry.height.to_le_bytes());
            data.push(entry.coinbase as u8);
        }
        for (sender, nonce) in nonces {
            data.extend_from_slice(sender.as_str().as_bytes());
            data.extend_from_slice(&nonce.to_le_bytes());
        }
        sha256d(&data)
    }

    // ============================================================================
    // HELPER FUNCTIONS
    // ============================================================================

    /// Apply one transaction, journaling into `undo`
    ///
    /// On error the journal may hold a partial application; the caller
    /// reverts it.
    pub fn apply_transaction(&mut self, tx: &Transaction, height: Height, undo: &mut BlockUndo) -> Result<()> {
        let coinbase = is_coinbase(tx);

        for input in &tx.inputs {
            match self.remove_entry(&input.prevout) {
                Some(entry) => undo.journal.push(UndoOp::Spent(input.prevout, entry)),
                None => return Err(RejectReason::DoubleSpend(input.prevout)),
            }
        }

        let txid = tx.txid();
        for (i, output) in tx.outputs.iter().enumerate() {
            let outpoint = OutPoint::new(txid, i as u32);
            if self.entries.contains_key(&outpoint) {
                return Err(RejectReason::StructurallyInvalid(format!(
                    "output {} already exists",
                    outpoint
                )));
            }
            self.insert_entry(
                outpoint,
                UtxoEntry {
                    address: output.address.clone(),
                    amount: output.amount,
                    height,
                    coinbase,
                },
            );
            undo.journal.push(UndoOp::Created(outpoint));
        }

        if let Some(sender) = sender_of(tx) {
            let previous = self.nonces.insert(sender.clone(), tx.nonce);
            undo.journal.push(UndoOp::Nonce(sender, previous));
        }

        Ok(())
    }

    fn insert_entry(&mut self, outpoint: OutPoint, entry: UtxoEntry) {
        self.total_value = self.total_value.saturating_add(entry.amount);
        self.by_address
            .entry(entry.address.clone())
            .or_default()
            .insert(outpoint);
        self.entries.insert(outpoint, entry);
    }

    fn remove_entry(&mut self, outpoint: &OutPoint) -> Option<UtxoEntry> {
        let entry = self.entries.remove(outpoint)?;
        self.total_value = self.total_value.saturating_sub(entry.amount);
        if let Some(outpoints) = self.by_address.get_mut(&entry.address) {
            outpoints.remove(outpoint);
            if outpoints.is_empty() {
                self.by_address.remove(&entry.address);
            }
        }
        Some(entry)
    }
}

impl UtxoView for UtxoSet {
    fn get(&self, outpoint: &OutPoint) -> Option<UtxoEntry> {
        self.entries.get(outpoint).cloned()
    }

    fn confirmed_nonce(&self, sender: &Address) -> Option<u64> {
        self.nonce_of(sender)
    }
}
