//! Pool of validated, unconfirmed transactions
//!
//! Admission validates against the confirmed UTXO set layered with pending
//! outputs and spends. Conflicts are resolved only by replace-by-fee;
//! replacement and capacity eviction are reported in [`Admission`], never as
//! errors.

use crate::config::MempoolPolicy;
use crate::error::{RejectReason, Result};
use crate::transaction::{check_transaction, is_coinbase, sender_of, validate, ValidationContext};
use crate::types::*;
use crate::utxo::UtxoView;
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap, HashSet};

/// Lower bounds of the fee-rate histogram buckets, base units per byte
const FEE_HISTOGRAM_BUCKETS: [u64; 10] = [0, 1, 2, 5, 10, 20, 50, 100, 500, 1000];

/// A pending transaction with its admission metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MempoolEntry {
    pub tx: Transaction,
    pub txid: Txid,
    pub sender: Address,
    pub fee: Amount,
    pub size: usize,
    pub admitted_at: Timestamp,
    /// Monotonic admission order, the FIFO tie-breaker
    pub sequence: u64,
    /// Times this transaction was put back after its block left the chain
    pub retry_count: u32,
}

/// Exact fee-rate comparison by cross-multiplication
pub fn compare_fee_rate(fee: Amount, size: usize, other_fee: Amount, other_size: usize) -> Ordering {
    let lhs = fee as u128 * other_size.max(1) as u128;
    let rhs = other_fee as u128 * size.max(1) as u128;
    lhs.cmp(&rhs)
}

impl MempoolEntry {
    pub fn cmp_fee_rate(&self, other: &MempoolEntry) -> Ordering {
        compare_fee_rate(self.fee, self.size, other.fee, other.size)
    }

    /// Whole base units per byte, for reporting
    pub fn fee_rate(&self) -> u64 {
        self.fee / self.size.max(1) as u64
    }
}

/// Outcome of a successful submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    pub txid: Txid,
    /// Entries superseded by replace-by-fee, descendants included
    pub replaced: Vec<Txid>,
    /// Entries dropped to stay under the byte ceiling
    pub evicted: Vec<Txid>,
}

/// One histogram bucket
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct FeeBucket {
    pub min_fee_rate: u64,
    pub count: usize,
    pub bytes: usize,
}

/// Summary exposed to external callers
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct MempoolSnapshot {
    pub size: usize,
    pub bytes: usize,
    pub fee_histogram: Vec<FeeBucket>,
}

/// Confirmed set seen through the pool: pending spends hidden, pending outputs visible
struct PendingView<'a> {
    confirmed: &'a dyn UtxoView,
    pool: &'a Mempool,
    excluded: &'a HashSet<Txid>,
}

impl UtxoView for PendingView<'_> {
    fn get(&self, outpoint: &OutPoint) -> Option<UtxoEntry> {
        if let Some(spender) = self.pool.spends.get(outpoint) {
            if !self.excluded.contains(spender) {
                return None;
            }
        }
        if let Some(entry) = self.confirmed.get(outpoint) {
            return Some(entry);
        }
        if self.excluded.contains(&outpoint.txid) {
            return None;
        }
        let parent = self.pool.entries.get(&outpoint.txid)?;
        let output = parent.tx.outputs.get(outpoint.index as usize)?;
        Some(UtxoEntry {
            address: output.address.clone(),
            amount: output.amount,
            height: 0,
            coinbase: false,
        })
    }

    fn confirmed_nonce(&self, sender: &Address) -> Option<u64> {
        self.confirmed.confirmed_nonce(sender)
    }
}

/// Mempool
#[derive(Debug, Clone)]
pub struct Mempool {
    policy: MempoolPolicy,
    ctx: ValidationContext,
    entries: HashMap<Txid, MempoolEntry>,
    spends: HashMap<OutPoint, Txid>,
    by_sender_nonce: HashMap<(Address, u64), Txid>,
    total_bytes: usize,
    next_sequence: u64,
}

impl Mempool {
    pub fn new(policy: MempoolPolicy, dust_threshold: Amount) -> Self {
        Mempool {
            policy,
            ctx: ValidationContext::new(dust_threshold),
            entries: HashMap::new(),
            spends: HashMap::new(),
            by_sender_nonce: HashMap::new(),
            total_bytes: 0,
            next_sequence: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn bytes(&self) -> usize {
        self.total_bytes
    }

    pub fn contains(&self, txid: &Txid) -> bool {
        self.entries.contains_key(txid)
    }

    pub fn get(&self, txid: &Txid) -> Option<&MempoolEntry> {
        self.entries.get(txid)
    }

    /// Pending transactions in admission order
    pub fn transactions(&self) -> Vec<Transaction> {
        let mut entries: Vec<_> = self.entries.values().collect();
        entries.sort_by_key(|e| e.sequence);
        entries.into_iter().map(|e| e.tx.clone()).collect()
    }

    /// AcceptToMemoryPool: 𝒯𝒳 × 𝒰𝒱 → admission | reason
    ///
    /// 1. Reject duplicates and coinbases
    /// 2. Collect pending conflicts: shared inputs and the same (sender, nonce)
    /// 3. Conflicts require replace-by-fee with a sufficient fee bump
    /// 4. Validate against the confirmed set layered with the pool, minus replaced entries
    /// 5. Make room under the byte ceiling, or reject if this transaction would be evicted
    /// 6. Remove replaced and evicted entries, insert the new one
    pub fn submit(&mut self, tx: Transaction, confirmed: &dyn UtxoView, now: Timestamp) -> Result<Admission> {
        // 1. Duplicates and shape
        let txid = tx.txid();
        if self.entries.contains_key(&txid) {
            return Err(RejectReason::AlreadyKnown);
        }
        check_transaction(&tx)?;
        if is_coinbase(&tx) {
            return Err(RejectReason::StructurallyInvalid(
                "coinbase cannot enter the mempool".to_string(),
            ));
        }
        let sender = sender_of(&tx)
            .ok_or_else(|| RejectReason::StructurallyInvalid("transaction has no sender".to_string()))?;

        // 2. Conflicts
        let mut conflicts = BTreeSet::new();
        let mut conflicting_input = None;
        for input in &tx.inputs {
            if let Some(spender) = self.spends.get(&input.prevout) {
                conflicts.insert(*spender);
                conflicting_input.get_or_insert(input.prevout);
            }
        }
        if let Some(pending) = self.by_sender_nonce.get(&(sender.clone(), tx.nonce)) {
            conflicts.insert(*pending);
        }

        // 3. Replace-by-fee
        let replaced = if conflicts.is_empty() {
            Vec::new()
        } else {
            self.check_replacement(&tx, &conflicts, conflicting_input)?
        };
        let excluded: HashSet<Txid> = replaced.iter().copied().collect();

        // 4. Validate
        let fee = {
            let view = PendingView {
                confirmed,
                pool: self,
                excluded: &excluded,
            };
            validate(&tx, &view, &self.ctx)?
        };

        // 5. Capacity
        let size = tx.size();
        let evicted = self.plan_eviction(&tx, fee, size, &excluded)?;

        // 6. Commit
        for id in replaced.iter().chain(evicted.iter()) {
            self.remove_entry(id);
        }
        let entry = MempoolEntry {
            txid,
            sender,
            fee,
            size,
            admitted_at: now,
            sequence: self.next_sequence,
            retry_count: 0,
            tx,
        };
        self.next_sequence += 1;
        self.insert_entry(entry);

        if !replaced.is_empty() {
            tracing::debug!(txid = %hex::encode(txid), replaced = replaced.len(), "replace-by-fee");
        }
        if !evicted.is_empty() {
            tracing::debug!(evicted = evicted.len(), bytes = self.total_bytes, "mempool capacity eviction");
        }
        Ok(Admission {
            txid,
            replaced,
            evicted,
        })
    }

    /// SelectForBlock: highest fee rate first, FIFO among equal rates
    ///
    /// A transaction is skipped if it conflicts with one already selected, if
    /// a pending parent or an earlier nonce of its sender is not selected yet,
    /// or if it would exceed `max_bytes`. The result is in non-increasing
    /// fee-rate order and can be included in a block as is.
    pub fn select_for_block(&self, max_bytes: usize) -> Vec<Transaction> {
        let mut candidates: Vec<&MempoolEntry> = self.entries.values().collect();
        candidates.sort_by(|a, b| b.cmp_fee_rate(a).then(a.sequence.cmp(&b.sequence)));

        let mut pending_nonces: HashMap<&Address, BTreeSet<u64>> = HashMap::new();
        for entry in &candidates {
            pending_nonces.entry(&entry.sender).or_default().insert(entry.tx.nonce);
        }

        let mut selected = Vec::new();
        let mut selected_ids = HashSet::new();
        let mut selected_nonces: HashSet<(&Address, u64)> = HashSet::new();
        let mut spent = HashSet::new();
        let mut bytes = 0usize;

        for entry in candidates {
            if bytes + entry.size > max_bytes {
                continue;
            }
            let inputs_free = entry.tx.inputs.iter().all(|i| !spent.contains(&i.prevout));
            let parents_ready = entry.tx.inputs.iter().all(|i| {
                !self.entries.contains_key(&i.prevout.txid) || selected_ids.contains(&i.prevout.txid)
            });
            let nonces_ready = pending_nonces
                .get(&entry.sender)
                .map(|nonces| {
                    nonces
                        .range(..entry.tx.nonce)
                        .all(|n| selected_nonces.contains(&(&entry.sender, *n)))
                })
                .unwrap_or(true);
            if !(inputs_free && parents_ready && nonces_ready) {
                continue;
            }

            spent.extend(entry.tx.inputs.iter().map(|i| i.prevout));
            selected_ids.insert(entry.txid);
            selected_nonces.insert((&entry.sender, entry.tx.nonce));
            bytes += entry.size;
            selected.push(entry.tx.clone());
        }

        selected
    }

    /// Drop entries included in a block; their children stay
    pub fn remove_confirmed(&mut self, txids: &[Txid]) -> usize {
        txids
            .iter()
            .filter(|id| self.remove_entry(id).is_some())
            .count()
    }

    /// Evict entries older than the configured age, with their descendants
    pub fn evict_expired(&mut self, now: Timestamp) -> Vec<Txid> {
        let expired: Vec<Txid> = self
            .entries
            .values()
            .filter(|e| now.saturating_sub(e.admitted_at) > self.policy.max_age_secs)
            .map(|e| e.txid)
            .collect();
        if expired.is_empty() {
            return Vec::new();
        }
        let doomed = self.with_descendants(&expired);
        for id in &doomed {
            self.remove_entry(id);
        }
        tracing::debug!(count = doomed.len(), "expired mempool entries");
        doomed
    }

    /// Re-check every entry against a new confirmed tip
    ///
    /// Parents are checked before the entries spending them, otherwise in
    /// admission order. Entries that no longer validate are dropped along
    /// with anything that depended on them. Returns the dropped txids.
    pub fn revalidate(&mut self, confirmed: &dyn UtxoView) -> Vec<Txid> {
        let mut pending: Vec<MempoolEntry> = self.entries.drain().map(|(_, e)| e).collect();
        pending.sort_by_key(|e| e.sequence);
        self.spends.clear();
        self.by_sender_nonce.clear();
        self.total_bytes = 0;

        let mut dropped = Vec::new();
        let none = HashSet::new();
        while !pending.is_empty() {
            let waiting: HashSet<Txid> = pending.iter().map(|e| e.txid).collect();
            let (ready, deferred): (Vec<MempoolEntry>, Vec<MempoolEntry>) = pending
                .into_iter()
                .partition(|e| !e.tx.inputs.iter().any(|i| waiting.contains(&i.prevout.txid)));
            if ready.is_empty() {
                // Only a dependency cycle leaves nothing ready
                dropped.extend(deferred.iter().map(|e| e.txid));
                break;
            }

            for entry in ready {
                let conflict = entry.tx.inputs.iter().any(|i| self.spends.contains_key(&i.prevout))
                    || self
                        .by_sender_nonce
                        .contains_key(&(entry.sender.clone(), entry.tx.nonce));
                let valid = !conflict && {
                    let view = PendingView {
                        confirmed,
                        pool: self,
                        excluded: &none,
                    };
                    validate(&entry.tx, &view, &self.ctx).is_ok()
                };
                if valid {
                    self.insert_entry(entry);
                } else {
                    dropped.push(entry.txid);
                }
            }
            pending = deferred;
        }
        if !dropped.is_empty() {
            tracing::debug!(count = dropped.len(), "mempool entries invalidated by new tip");
        }
        dropped
    }

    /// Put transactions from disconnected blocks back into the pool
    ///
    /// Each is admitted like a fresh submission; those still valid are
    /// counted as retries. Returns the txids admitted.
    pub fn readmit(&mut self, txs: Vec<Transaction>, confirmed: &dyn UtxoView, now: Timestamp) -> Vec<Txid> {
        let mut admitted = Vec::new();
        for tx in txs {
            match self.submit(tx, confirmed, now) {
                Ok(admission) => {
                    if let Some(entry) = self.entries.get_mut(&admission.txid) {
                        entry.retry_count += 1;
                    }
                    admitted.push(admission.txid);
                }
                Err(reason) => {
                    tracing::debug!(%reason, "reverted transaction not readmitted");
                }
            }
        }
        admitted
    }

    pub fn snapshot(&self) -> MempoolSnapshot {
        let mut fee_histogram: Vec<FeeBucket> = FEE_HISTOGRAM_BUCKETS
            .iter()
            .map(|&min_fee_rate| FeeBucket {
                min_fee_rate,
                count: 0,
                bytes: 0,
            })
            .collect();
        for entry in self.entries.values() {
            let rate = entry.fee_rate();
            let index = FEE_HISTOGRAM_BUCKETS
                .iter()
                .rposition(|&floor| rate >= floor)
                .unwrap_or(0);
            fee_histogram[index].count += 1;
            fee_histogram[index].bytes += entry.size;
        }
        fee_histogram.retain(|bucket| bucket.count > 0);

        MempoolSnapshot {
            size: self.entries.len(),
            bytes: self.total_bytes,
            fee_histogram,
        }
    }

    // ============================================================================
    // HELPER FUNCTIONS
    // ============================================================================

    /// Replacement rules; returns every entry the new transaction supersedes
    ///
    /// 1. The new transaction must signal replace-by-fee
    /// 2. Fee ≥ Σ replaced fees + max(absolute bump, percentage bump), and strictly greater
    /// 3. It must not spend outputs of anything it replaces
    fn check_replacement(
        &self,
        tx: &Transaction,
        conflicts: &BTreeSet<Txid>,
        conflicting_input: Option<OutPoint>,
    ) -> Result<Vec<Txid>> {
        // 1. Signal
        if !tx.replace_by_fee {
            return Err(match conflicting_input {
                Some(outpoint) => RejectReason::DoubleSpend(outpoint),
                None => RejectReason::ReplacementRejected(format!(
                    "nonce {} already pending without replace-by-fee",
                    tx.nonce
                )),
            });
        }

        // 2. Fee bump
        let roots: Vec<Txid> = conflicts.iter().copied().collect();
        let replaced = self.with_descendants(&roots);
        let replaced_fees: Amount = replaced
            .iter()
            .filter_map(|id| self.entries.get(id))
            .map(|e| e.fee)
            .fold(0u64, |acc, fee| acc.saturating_add(fee));
        let percent_bump = replaced_fees.saturating_mul(self.policy.rbf_min_bump_percent) / 100;
        let required = replaced_fees.saturating_add(self.policy.rbf_min_bump_abs.max(percent_bump));
        if tx.fee < required || tx.fee <= replaced_fees {
            return Err(RejectReason::ReplacementRejected(format!(
                "fee {} below required {}",
                tx.fee, required
            )));
        }

        // 3. No spending of replaced outputs
        if tx.inputs.iter().any(|i| replaced.contains(&i.prevout.txid)) {
            return Err(RejectReason::ReplacementRejected(
                "spends an output of a replaced transaction".to_string(),
            ));
        }

        Ok(replaced)
    }

    /// Entries to evict so the new transaction fits; `MempoolFull` if it would go itself
    fn plan_eviction(
        &self,
        tx: &Transaction,
        fee: Amount,
        size: usize,
        excluded: &HashSet<Txid>,
    ) -> Result<Vec<Txid>> {
        let replaced_bytes: usize = excluded
            .iter()
            .filter_map(|id| self.entries.get(id))
            .map(|e| e.size)
            .sum();
        let projected = self.total_bytes - replaced_bytes + size;
        if projected <= self.policy.max_bytes {
            return Ok(Vec::new());
        }
        if size > self.policy.max_bytes {
            return Err(RejectReason::MempoolFull);
        }

        // Lowest fee rate first; among equals the most recent goes first
        let mut victims: Vec<&MempoolEntry> = self
            .entries
            .values()
            .filter(|e| !excluded.contains(&e.txid))
            .collect();
        victims.sort_by(|a, b| a.cmp_fee_rate(b).then(b.sequence.cmp(&a.sequence)));

        let mut evicted: Vec<Txid> = Vec::new();
        let mut evicted_set = HashSet::new();
        let mut remaining = projected;
        for victim in victims {
            if remaining <= self.policy.max_bytes {
                break;
            }
            if compare_fee_rate(fee, size, victim.fee, victim.size) != Ordering::Greater {
                return Err(RejectReason::MempoolFull);
            }
            if evicted_set.contains(&victim.txid) {
                continue;
            }
            for id in self.with_descendants(&[victim.txid]) {
                if evicted_set.insert(id) {
                    remaining -= self.entries.get(&id).map(|e| e.size).unwrap_or(0);
                    evicted.push(id);
                }
            }
        }
        if remaining > self.policy.max_bytes {
            return Err(RejectReason::MempoolFull);
        }
        // The newcomer may not depend on anything it pushes out
        if tx.inputs.iter().any(|i| evicted_set.contains(&i.prevout.txid)) {
            return Err(RejectReason::MempoolFull);
        }
        Ok(evicted)
    }

    /// `roots` plus every pending transaction that spends their outputs, transitively
    fn with_descendants(&self, roots: &[Txid]) -> Vec<Txid> {
        let mut result: Vec<Txid> = Vec::new();
        let mut seen: HashSet<Txid> = HashSet::new();
        let mut stack: Vec<Txid> = roots.to_vec();
        while let Some(id) = stack.pop() {
            if !seen.insert(id) {
                continue;
            }
            result.push(id);
            if let Some(entry) = self.entries.get(&id) {
                for index in 0..entry.tx.outputs.len() {
                    if let Some(child) = self.spends.get(&OutPoint::new(id, index as u32)) {
                        stack.push(*child);
                    }
                }
            }
        }
        result
    }

    fn insert_entry(&mut self, entry: MempoolEntry) {
        for input in &entry.tx.inputs {
            self.spends.insert(input.prevout, entry.txid);
        }
        self.by_sender_nonce
            .insert((entry.sender.clone(), entry.tx.nonce), entry.txid);
        self.total_bytes += entry.size;
        self.entries.insert(entry.txid, entry);
    }

    fn remove_entry(&mut self, txid: &Txid) -> Option<MempoolEntry> {
        let entry = self.entries.remove(txid)?;
        for input in &entry.tx.inputs {
            if self.spends.get(&input.prevout) == Some(txid) {
                self.spends.remove(&input.prevout);
            }
        }
        let key = (entry.sender.clone(), entry.tx.nonce);
        if self.by_sender_nonce.get(&key) == Some(txid) {
            self.by_sender_nonce.remove(&key);
        }
        self.total_bytes -= entry.size;
        Some(entry)
    }
}
