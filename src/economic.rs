//! Reward schedule and supply accounting

use crate::config::ConsensusParams;
use crate::constants::MAX_HALVINGS;
use crate::error::{RejectReason, Result};
use crate::types::*;

/// BlockReward: ℕ → ℤ
///
/// reward(h) = initial >> ⌊h / H⌋, zero at genesis and after 64 halvings.
pub fn block_reward(height: Height, params: &ConsensusParams) -> Amount {
    if height == 0 || params.halving_interval == 0 {
        return 0;
    }
    let halvings = height / params.halving_interval;
    if halvings >= MAX_HALVINGS {
        return 0;
    }
    params.initial_reward >> halvings
}

/// Reward clamped to the headroom left under the supply cap
///
/// `minted` is the supply created by all blocks before `height`.
pub fn clamped_reward(height: Height, minted: Amount, params: &ConsensusParams) -> Amount {
    let headroom = params.max_supply.saturating_sub(minted);
    block_reward(height, params).min(headroom)
}

/// Supply minted by heights 1..=height under the clamped schedule
///
/// Clamping each step to the remaining headroom makes the running total
/// equal to min(uncapped total, cap), so this sums whole halving eras.
pub fn supply_at(height: Height, params: &ConsensusParams) -> Amount {
    if height == 0 || params.halving_interval == 0 {
        return 0;
    }
    let interval = params.halving_interval;
    let mut total: u128 = 0;
    let mut era: u64 = 0;
    while era < MAX_HALVINGS {
        let start = era.saturating_mul(interval).max(1);
        let end = (era + 1).saturating_mul(interval).saturating_sub(1).min(height);
        if start > height {
            break;
        }
        let blocks = (end - start + 1) as u128;
        total += blocks * ((params.initial_reward >> era) as u128);
        if total >= params.max_supply as u128 {
            return params.max_supply;
        }
        era += 1;
    }
    total.min(params.max_supply as u128) as Amount
}

/// Sum of transaction fees, failing on overflow
pub fn total_fees<'a>(fees: impl IntoIterator<Item = &'a Amount>) -> Result<Amount> {
    fees.into_iter().try_fold(0u64, |acc, fee| {
        acc.checked_add(*fee)
            .ok_or_else(|| RejectReason::StructurallyInvalid("fee total overflows".to_string()))
    })
}

/// Validate the coinbase of a block at `height`
///
/// The coinbase must pay exactly clamped reward + fees. Returns the newly
/// minted amount. A block whose reward would push `minted` past the cap is
/// `SupplyCapExceeded`.
pub fn check_coinbase(
    coinbase: &Transaction,
    height: Height,
    fees: Amount,
    minted: Amount,
    params: &ConsensusParams,
) -> Result<Amount> {
    if !coinbase.inputs.is_empty() {
        return Err(RejectReason::BadCoinbase("first transaction has inputs".to_string()));
    }
    if coinbase.nonce != height {
        return Err(RejectReason::BadCoinbase(format!(
            "coinbase nonce {} does not commit to height {}",
            coinbase.nonce, height
        )));
    }
    let paid = coinbase
        .output_total()
        .ok_or_else(|| RejectReason::StructurallyInvalid("coinbase total overflows".to_string()))?;
    let new_coins = paid
        .checked_sub(fees)
        .ok_or_else(|| RejectReason::BadCoinbase(format!("coinbase {} below fees {}", paid, fees)))?;

    let scheduled = block_reward(height, params);
    if new_coins > scheduled {
        return Err(RejectReason::BadCoinbase(format!(
            "coinbase mints {} above scheduled reward {}",
            new_coins, scheduled
        )));
    }
    match minted.checked_add(new_coins) {
        Some(total) if total <= params.max_supply => {}
        _ => return Err(RejectReason::SupplyCapExceeded),
    }
    let expected = clamped_reward(height, minted, params);
    if new_coins != expected {
        return Err(RejectReason::BadCoinbase(format!(
            "coinbase mints {}, expected {}",
            new_coins, expected
        )));
    }
    Ok(new_coins)
}
