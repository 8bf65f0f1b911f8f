//! Default consensus and policy constants
//!
//! Anything a deployment may want to tune lives in [`crate::config`]; these
//! are the defaults those structures start from.

/// Base units per coin
pub const COIN: u64 = 100_000_000;

/// Initial block reward: 12 coins
pub const INITIAL_REWARD: u64 = 12 * COIN;

/// Halving interval: 262,800 blocks
pub const HALVING_INTERVAL: u64 = 262_800;

/// Maximum money supply: 6,307,200 coins (2 × INITIAL_REWARD × HALVING_INTERVAL)
pub const MAX_SUPPLY: u64 = 6_307_200 * COIN;

/// Reward is zero after this many halvings
pub const MAX_HALVINGS: u64 = 64;

/// Maximum transaction size in bytes
pub const MAX_TX_SIZE: usize = 100_000;

/// Maximum block size in bytes
pub const MAX_BLOCK_SIZE: usize = 1_000_000;

/// Maximum number of inputs per transaction
pub const MAX_INPUTS: usize = 1000;

/// Maximum number of outputs per transaction
pub const MAX_OUTPUTS: usize = 1000;

/// Compressed secp256k1 public key length
pub const PUBLIC_KEY_LEN: usize = 33;

/// Compact ECDSA signature length
pub const SIGNATURE_LEN: usize = 64;

/// Outputs below this amount are dust and rejected
pub const DUST_THRESHOLD: u64 = 546;

/// Minimum RBF fee bump, percent of the replaced fees
pub const RBF_MIN_BUMP_PERCENT: u64 = 10;

/// Minimum RBF fee bump in base units
pub const RBF_MIN_BUMP_ABS: u64 = 1_000;

/// Deepest reorganization the validator will perform
pub const MAX_REORG_DEPTH: u64 = 100;

/// Difficulty adjustment interval in blocks
pub const DIFFICULTY_ADJUSTMENT_INTERVAL: u64 = 2016;

/// Target time per block: 2 minutes
pub const TARGET_BLOCK_TIME: u64 = 120;

/// Largest multiplicative difficulty change per adjustment
pub const DIFFICULTY_CLAMP_FACTOR: u64 = 4;

/// Easiest allowed target for mainnet
pub const MAINNET_POW_LIMIT_BITS: u32 = 0x1e0f_ffff;

/// Easiest allowed target for regtest: roughly every other hash wins
pub const REGTEST_POW_LIMIT_BITS: u32 = 0x207f_ffff;

/// Blocks may not be timestamped further than this into the future
pub const MAX_FUTURE_BLOCK_TIME: u64 = 2 * 60 * 60;

/// Fixed genesis timestamp
pub const GENESIS_TIMESTAMP: u64 = 1_700_000_000;

/// Mempool ceiling in bytes
pub const MEMPOOL_MAX_BYTES: usize = 32_000_000;

/// Maximum mempool residency: 14 days
pub const MEMPOOL_MAX_AGE_SECS: u64 = 14 * 24 * 60 * 60;

/// Orphan blocks held while waiting for a parent
pub const ORPHAN_LIMIT: usize = 64;

/// Orphan blocks are discarded after this many seconds
pub const ORPHAN_TTL_SECS: u64 = 20 * 60;

/// Hashes remembered as invalid; the oldest are forgotten first
pub const INVALID_CACHE_LIMIT: usize = 4_096;

/// PoW loop checks its cancel token every this many hashes
pub const CANCEL_POLL_INTERVAL: u64 = 256;

/// Version tag of the persisted chain layout
pub const STORAGE_FORMAT_VERSION: u32 = 1;

/// Version tag of the JSON wire envelope for transactions and blocks
pub const WIRE_FORMAT_VERSION: u32 = 1;
