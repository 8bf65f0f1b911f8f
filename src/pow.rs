//! Proof of work: 256-bit targets, compact bits, chain work and retargeting

use crate::config::ConsensusParams;
use crate::error::{RejectReason, Result};
use crate::types::*;
use std::cmp::Ordering;

/// 256-bit unsigned integer for target calculations, little-endian words
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct U256([u64; 4]);

impl U256 {
    pub const ZERO: U256 = U256([0; 4]);
    pub const MAX: U256 = U256([u64::MAX; 4]);

    pub fn from_u64(value: u64) -> Self {
        U256([value, 0, 0, 0])
    }

    pub fn from_u128(value: u128) -> Self {
        U256([value as u64, (value >> 64) as u64, 0, 0])
    }

    /// Interpret a hash as a big-endian number
    pub fn from_be_bytes(bytes: &[u8; 32]) -> Self {
        let mut words = [0u64; 4];
        for (i, word) in words.iter_mut().enumerate() {
            let start = (3 - i) * 8;
            let mut chunk = [0u8; 8];
            chunk.copy_from_slice(&bytes[start..start + 8]);
            *word = u64::from_be_bytes(chunk);
        }
        U256(words)
    }

    pub fn to_be_bytes(&self) -> [u8; 32] {
        let mut bytes = [0u8; 32];
        for (i, word) in self.0.iter().enumerate() {
            let start = (3 - i) * 8;
            bytes[start..start + 8].copy_from_slice(&word.to_be_bytes());
        }
        bytes
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&x| x == 0)
    }

    /// Number of significant bits
    pub fn bits(&self) -> u32 {
        for i in (0..4).rev() {
            if self.0[i] != 0 {
                return 64 * i as u32 + 64 - self.0[i].leading_zeros();
            }
        }
        0
    }

    fn low_u64(&self) -> u64 {
        self.0[0]
    }

    /// Value as u128, saturating
    pub fn saturating_to_u128(&self) -> u128 {
        if self.0[2] != 0 || self.0[3] != 0 {
            return u128::MAX;
        }
        (self.0[0] as u128) | ((self.0[1] as u128) << 64)
    }

    pub fn shl(&self, shift: u32) -> Self {
        if shift >= 256 {
            return U256::ZERO;
        }

        let mut result = U256::ZERO;
        let word_shift = (shift / 64) as usize;
        let bit_shift = shift % 64;

        for i in 0..4 {
            if i + word_shift < 4 {
                result.0[i + word_shift] |= self.0[i] << bit_shift;
                if bit_shift > 0 && i + word_shift + 1 < 4 {
                    result.0[i + word_shift + 1] |= self.0[i] >> (64 - bit_shift);
                }
            }
        }

        result
    }

    pub fn shr(&self, shift: u32) -> Self {
        if shift >= 256 {
            return U256::ZERO;
        }

        let mut result = U256::ZERO;
        let word_shift = (shift / 64) as usize;
        let bit_shift = shift % 64;

        for i in word_shift..4 {
            result.0[i - word_shift] |= self.0[i] >> bit_shift;
            if bit_shift > 0 && i > word_shift {
                result.0[i - word_shift - 1] |= self.0[i] << (64 - bit_shift);
            }
        }

        result
    }

    fn not(&self) -> Self {
        U256([!self.0[0], !self.0[1], !self.0[2], !self.0[3]])
    }

    fn bit(&self, index: u32) -> bool {
        (self.0[(index / 64) as usize] >> (index % 64)) & 1 == 1
    }

    fn set_bit(&mut self, index: u32) {
        self.0[(index / 64) as usize] |= 1 << (index % 64);
    }

    pub fn overflowing_add(&self, other: &U256) -> (U256, bool) {
        let mut result = U256::ZERO;
        let mut carry = false;
        for i in 0..4 {
            let (sum, c1) = self.0[i].overflowing_add(other.0[i]);
            let (sum, c2) = sum.overflowing_add(carry as u64);
            result.0[i] = sum;
            carry = c1 || c2;
        }
        (result, carry)
    }

    fn wrapping_sub(&self, other: &U256) -> U256 {
        let mut result = U256::ZERO;
        let mut borrow = false;
        for i in 0..4 {
            let (diff, b1) = self.0[i].overflowing_sub(other.0[i]);
            let (diff, b2) = diff.overflowing_sub(borrow as u64);
            result.0[i] = diff;
            borrow = b1 || b2;
        }
        result
    }

    /// `None` on overflow
    pub fn checked_mul_u64(&self, factor: u64) -> Option<U256> {
        let mut result = U256::ZERO;
        let mut carry: u128 = 0;
        for i in 0..4 {
            let product = (self.0[i] as u128) * (factor as u128) + carry;
            result.0[i] = product as u64;
            carry = product >> 64;
        }
        if carry != 0 {
            return None;
        }
        Some(result)
    }

    /// Quotient and remainder by a non-zero u64
    pub fn div_rem_u64(&self, divisor: u64) -> (U256, u64) {
        debug_assert!(divisor != 0);
        let mut quotient = U256::ZERO;
        let mut rem: u128 = 0;
        for i in (0..4).rev() {
            let acc = (rem << 64) | self.0[i] as u128;
            quotient.0[i] = (acc / divisor as u128) as u64;
            rem = acc % divisor as u128;
        }
        (quotient, rem as u64)
    }

    /// Binary long division; `divisor` must be non-zero
    pub fn div(&self, divisor: &U256) -> U256 {
        let mut quotient = U256::ZERO;
        let mut rem = U256::ZERO;
        for i in (0..self.bits()).rev() {
            let overflow = rem.bit(255);
            rem = rem.shl(1);
            if self.bit(i) {
                rem.0[0] |= 1;
            }
            if overflow || rem >= *divisor {
                rem = rem.wrapping_sub(divisor);
                quotient.set_bit(i);
            }
        }
        quotient
    }
}

impl PartialOrd for U256 {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for U256 {
    fn cmp(&self, other: &Self) -> Ordering {
        for (a, b) in self.0.iter().rev().zip(other.0.iter().rev()) {
            match a.cmp(b) {
                Ordering::Equal => continue,
                other => return other,
            }
        }
        Ordering::Equal
    }
}

/// Expand target from compact representation
///
/// The format is 0xEEMMMMMM: exponent byte E, 23-bit mantissa M, sign bit
/// 0x00800000. Target = M × 256^(E − 3). Negative or overflowing encodings
/// are `None`.
pub fn expand_target(bits: u32) -> Option<U256> {
    let exponent = bits >> 24;
    let mantissa = bits & 0x007f_ffff;

    if bits & 0x0080_0000 != 0 && mantissa != 0 {
        return None;
    }

    if exponent <= 3 {
        let shift = 8 * (3 - exponent);
        return Some(U256::from_u64((mantissa >> shift) as u64));
    }

    let shift = 8 * (exponent - 3);
    let mantissa_bits = 32 - mantissa.leading_zeros();
    if mantissa != 0 && mantissa_bits + shift > 256 {
        return None;
    }
    Some(U256::from_u64(mantissa as u64).shl(shift))
}

/// Encode a target in compact form, truncating the mantissa to 23 bits
pub fn compact_from_target(target: &U256) -> u32 {
    let mut size = (target.bits() + 7) / 8;
    let mut compact = if size <= 3 {
        (target.low_u64() << (8 * (3 - size))) as u32
    } else {
        target.shr(8 * (size - 3)).low_u64() as u32
    };

    // A set sign bit would read back as negative
    if compact & 0x0080_0000 != 0 {
        compact >>= 8;
        size += 1;
    }

    compact | (size << 24)
}

/// CheckProofOfWork: ℍ × ℕ → {true, false}
///
/// The block hash, read as a big-endian number, must not exceed the target
/// encoded by `bits`, and that target must lie within (0, pow limit].
pub fn check_proof_of_work(hash: &Hash, bits: u32, params: &ConsensusParams) -> Result<()> {
    let target = expand_target(bits).ok_or(RejectReason::BadProofOfWork)?;
    let limit = expand_target(params.pow_limit_bits).ok_or(RejectReason::BadProofOfWork)?;
    if target.is_zero() || target > limit {
        return Err(RejectReason::BadProofOfWork);
    }
    if U256::from_be_bytes(hash) > target {
        return Err(RejectReason::BadProofOfWork);
    }
    Ok(())
}

/// True if `hash` satisfies an already-expanded target
pub fn hash_meets_target(hash: &Hash, target: &U256) -> bool {
    U256::from_be_bytes(hash) <= *target
}

/// Expected number of hashes to meet `bits`: 2^256 / (target + 1)
pub fn block_work(bits: u32) -> ChainWork {
    let target = match expand_target(bits) {
        Some(t) if !t.is_zero() => t,
        _ => return 0,
    };
    let (denominator, overflow) = target.overflowing_add(&U256::from_u64(1));
    if overflow {
        return 1;
    }
    // 2^256 / (t + 1) == (!t / (t + 1)) + 1
    let (work, _) = target
        .not()
        .div(&denominator)
        .overflowing_add(&U256::from_u64(1));
    work.saturating_to_u128()
}

/// Timespan clamped to [expected / clamp, expected × clamp]
pub fn clamp_timespan(actual: u64, params: &ConsensusParams) -> u64 {
    let expected = params.expected_timespan().max(1);
    let clamp = params.difficulty_clamp_factor.max(1);
    actual.clamp(expected / clamp, expected.saturating_mul(clamp))
}

/// Retarget: new = old × clamped_actual / expected, capped at the pow limit
pub fn retarget(old_target: &U256, actual_timespan: u64, params: &ConsensusParams) -> U256 {
    let expected = params.expected_timespan().max(1);
    let actual = clamp_timespan(actual_timespan, params);
    let limit = expand_target(params.pow_limit_bits).unwrap_or(U256::MAX);

    // floor(old × actual / expected) = q × actual + (r × actual) / expected
    let (q, r) = old_target.div_rem_u64(expected);
    let low = U256::from_u128((r as u128 * actual as u128) / expected as u128);
    let new_target = match q.checked_mul_u64(actual) {
        Some(high) => match high.overflowing_add(&low) {
            (sum, false) => sum,
            (_, true) => U256::MAX,
        },
        None => U256::MAX,
    };

    if new_target > limit {
        limit
    } else if new_target.is_zero() {
        U256::from_u64(1)
    } else {
        new_target
    }
}

/// GetNextWorkRequired: ℋ × ℕ → ℕ
///
/// Bits for the child of `parent`. At heights that are multiples of the
/// adjustment interval the target is rescaled by the time the last window
/// took; `window_start` returns the timestamp of the ancestor at the given
/// height on the parent's branch. Elsewhere the parent's bits carry over.
pub fn get_next_work_required(
    parent: &BlockHeader,
    params: &ConsensusParams,
    window_start: impl FnOnce(Height) -> Option<Timestamp>,
) -> u32 {
    let height = parent.height + 1;
    let interval = params.difficulty_adjustment_interval;
    if interval == 0 || height % interval != 0 {
        return parent.bits;
    }

    let first_timestamp = match window_start(height - interval) {
        Some(ts) => ts,
        None => return parent.bits,
    };
    let actual = parent.timestamp.saturating_sub(first_timestamp);

    let old_target = match expand_target(parent.bits) {
        Some(t) => t,
        None => return params.pow_limit_bits,
    };
    let new_target = retarget(&old_target, actual, params);
    let new_bits = compact_from_target(&new_target);
    tracing::debug!(
        height,
        actual,
        old_bits = format_args!("{:#010x}", parent.bits),
        new_bits = format_args!("{:#010x}", new_bits),
        "difficulty retarget"
    );
    new_bits
}
