//! Error types for ledger validation and storage

use crate::types::{Address, OutPoint};
use thiserror::Error;

/// Why a transaction or block was rejected
///
/// Rejection is an ordinary value: every validation boundary returns
/// `Result<T, RejectReason>`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    #[error("structurally invalid: {0}")]
    StructurallyInvalid(String),

    #[error("duplicate input {0}")]
    DuplicateInput(OutPoint),

    #[error("input {0} is not an unspent output")]
    DoubleSpend(OutPoint),

    #[error("bad signature on input {0}")]
    BadSignature(usize),

    #[error("nonce {nonce} for {sender} not above confirmed nonce {confirmed}")]
    NonceTooLow {
        sender: Address,
        nonce: u64,
        confirmed: u64,
    },

    #[error("output {index} amount {amount} below dust threshold")]
    DustOutput { index: usize, amount: u64 },

    #[error("transaction already known")]
    AlreadyKnown,

    #[error("replacement rejected: {0}")]
    ReplacementRejected(String),

    #[error("mempool full: fee rate too low")]
    MempoolFull,

    #[error("unknown parent block")]
    UnknownParent,

    #[error("bad proof of work")]
    BadProofOfWork,

    #[error("bad merkle root")]
    BadMerkleRoot,

    #[error("unexpected difficulty bits {actual:#010x}, expected {expected:#010x}")]
    BadDifficulty { expected: u32, actual: u32 },

    #[error("bad timestamp: {0}")]
    BadTimestamp(String),

    #[error("bad coinbase: {0}")]
    BadCoinbase(String),

    #[error("supply cap exceeded")]
    SupplyCapExceeded,

    #[error("fork at or below checkpoint height {0}")]
    BelowCheckpoint(u64),

    #[error("reorganization depth {depth} exceeds limit {limit}")]
    ReorgTooDeep { depth: u64, limit: u64 },

    #[error("genesis block does not match")]
    BadGenesis,

    #[error("block previously marked invalid")]
    KnownInvalid,
}

/// Coarse classification of a rejection, for callers deciding on retries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Malformed encoding or shape; never retried
    Structural,
    /// Violates a consensus rule; reported, never retried
    Consensus,
    /// Depends on data not yet seen; may succeed later
    Contextual,
    /// Local policy (mempool) rather than consensus
    Policy,
}

impl RejectReason {
    pub fn class(&self) -> ErrorClass {
        match self {
            RejectReason::StructurallyInvalid(_)
            | RejectReason::DuplicateInput(_)
            | RejectReason::BadMerkleRoot => ErrorClass::Structural,
            RejectReason::UnknownParent => ErrorClass::Contextual,
            RejectReason::DustOutput { .. }
            | RejectReason::AlreadyKnown
            | RejectReason::ReplacementRejected(_)
            | RejectReason::MempoolFull => ErrorClass::Policy,
            _ => ErrorClass::Consensus,
        }
    }

    /// Whether a block rejected for this reason stays invalid under its hash
    ///
    /// Signatures sit outside the txid, so a relayer can swap them without
    /// changing the block hash.
    pub fn is_bound_to_hash(&self) -> bool {
        self.class() != ErrorClass::Contextual && !matches!(self, RejectReason::BadSignature(_))
    }
}

/// Persistence failures
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("no persisted chain found")]
    NotFound,

    #[error("corrupt chain state: {0}")]
    Corrupt(String),

    #[error("unsupported format version {found}, expected {expected}")]
    VersionMismatch { found: u32, expected: u32 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, RejectReason>;
