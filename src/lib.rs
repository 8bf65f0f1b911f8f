//! # pow-ledger
//!
//! Proof-of-work UTXO ledger and consensus engine.
//!
//! The crate validates transactions and blocks, keeps the set of unspent
//! outputs, orders pending transactions for inclusion, mines blocks, and
//! chooses between competing branches by cumulative work. Transport, wallets
//! and RPC are left to the embedding application, which talks to a [`Node`].
//!
//! ## Architecture
//!
//! - Pure validation functions (`transaction`, `block`, `economic`, `pow`)
//! - Stateful cores built on them (`utxo`, `mempool`, `chain`)
//! - The node facade wiring cores, persistence and the miner together (`node`)
//!
//! ## Design Principles
//!
//! 1. **Rejections are values**: every validation boundary returns `Result<_, RejectReason>`
//! 2. **Single writer**: only the chain mutates the UTXO set; readers take snapshots
//! 3. **All or nothing**: a failed block or reorganization leaves state untouched
//! 4. **Exact Version Pinning**: consensus-critical cryptography is pinned to exact versions
//!
//! ## Usage
//!
//! ```rust
//! use pow_ledger::mining::{mine_block, CancelToken, MiningLimits, MiningOutcome};
//! use pow_ledger::{Address, Node, NodeConfig, NoopRelay};
//! use std::sync::Arc;
//!
//! let node = Node::in_memory(NodeConfig::regtest("./unused"), Arc::new(NoopRelay));
//! let miner = Address::from_key_hash([7; 20]);
//!
//! let template = node.block_template(miner.clone(), &CancelToken::new());
//! let limits = MiningLimits::unbounded(u64::MAX);
//! if let MiningOutcome::Found(block) = mine_block(template, &CancelToken::new(), limits) {
//!     assert!(node.submit_block_value(block).accepted);
//! }
//! assert_eq!(node.get_chain_info().height, 1);
//! assert_eq!(node.get_balance(&miner), node.params().initial_reward);
//! ```

pub mod types;
pub mod constants;
pub mod config;
pub mod error;
pub mod crypto;
pub mod transaction;
pub mod utxo;
pub mod economic;
pub mod pow;
pub mod block;
pub mod mempool;
pub mod mining;
pub mod reorganization;
pub mod chain;
pub mod storage;
pub mod node;
pub mod telemetry;

// Re-export commonly used types
pub use types::*;
pub use constants::*;
pub use config::{Checkpoint, ConsensusParams, MempoolPolicy, NodeConfig};
pub use error::{ErrorClass, RejectReason, Result, StorageError};
pub use chain::{BlockOutcome, BlockRejection, ChainState, ChainUpdate, ValidationStage};
pub use mempool::Mempool;
pub use node::{ChainInfo, Health, Node, NoopRelay, PayoutAddressSource, Relay, SubmitResult};
pub use utxo::{UtxoSet, UtxoSnapshot};
