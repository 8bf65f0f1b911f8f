//! Property tests for difficulty bounds and mempool ordering

mod common;

use common::*;
use pow_ledger::mempool::compare_fee_rate;
use pow_ledger::pow::{clamp_timespan, retarget, U256};
use pow_ledger::*;
use proptest::prelude::*;
use std::cmp::Ordering;

proptest! {
    #[test]
    fn prop_retarget_within_clamp(old in 1u128..(u128::MAX >> 2), actual in 0u64..10_000_000) {
        let params = ConsensusParams::regtest();
        let old_target = U256::from_u128(old);
        let new_target = retarget(&old_target, actual, &params);

        let (quarter, _) = old_target.div_rem_u64(params.difficulty_clamp_factor);
        let quadruple = old_target.checked_mul_u64(params.difficulty_clamp_factor).unwrap();
        prop_assert!(new_target >= quarter);
        prop_assert!(new_target <= quadruple);
        prop_assert!(!new_target.is_zero());
    }

    #[test]
    fn prop_retarget_monotonic_in_timespan(old in 1u128..u128::MAX, a in 0u64..5_000_000, b in 0u64..5_000_000) {
        let params = ConsensusParams::regtest();
        let old_target = U256::from_u128(old);
        let (short, long) = if a <= b { (a, b) } else { (b, a) };
        prop_assert!(retarget(&old_target, short, &params) <= retarget(&old_target, long, &params));
    }

    #[test]
    fn prop_clamped_timespan_bounds(actual in any::<u64>()) {
        let params = ConsensusParams::mainnet();
        let expected = params.expected_timespan();
        let clamped = clamp_timespan(actual, &params);
        prop_assert!(clamped >= expected / 4);
        prop_assert!(clamped <= expected * 4);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_selection_in_fee_rate_order(fees in prop::collection::vec(1u64..50_000, 1..12)) {
        let mut set = UtxoSet::new();
        let mut mempool = Mempool::new(MempoolPolicy::regtest(), 1);
        let sink = key(200).address();

        for (i, fee) in fees.iter().enumerate() {
            let sender = key(i as u8 + 1);
            let outpoint = fund(&mut set, &sender.address(), 100_000, i as u8 + 1);
            let tx = transfer(&sender, outpoint, 100_000, &sink, *fee, 1);
            prop_assert!(mempool.submit(tx, &set, NOW).is_ok());
        }

        let selected = mempool.select_for_block(usize::MAX);
        prop_assert_eq!(selected.len(), fees.len());
        for pair in selected.windows(2) {
            let order = compare_fee_rate(pair[0].fee, pair[0].size(), pair[1].fee, pair[1].size());
            prop_assert_ne!(order, Ordering::Less);
        }
    }
}
