//! # Synnergy Core
//!
//! The core of the Synnergy permissioned blockchain platform: an
//! append-only ledger over a prefix-iterable state store, a hybrid
//! consensus engine that hops between proof-of-work, proof-of-stake and
//! proof-of-history, and a validated transaction pipeline with cross-shard
//! receipt routing and authority-gated reversals.
//!
//! This crate provides:
//! - Versioned key/value state with staged, atomic block commits
//! - Account records, gas accounting and block finalization
//! - A role-weighted authority set with candidate votes, electorate
//!   sampling and penalty slashing
//! - A bounded, priority-ordered transaction pool with signature, nonce
//!   and balance admission checks
//! - Sub-block proposal, block aggregation, PoS vote tallying and view
//!   changes
//! - Topic-based gossip with de-duplication and backpressure
//! - Deterministic address sharding, cross-shard receipts and resharding
//! - A deterministic contract runtime with gas metering and receipts
//!
//! ## Architecture
//!
//! Transactions enter the pool (locally or over gossip), are validated and
//! queued. The consensus engine drains the pool into sub-blocks,
//! aggregates them, consults the authority set for the slot leader, and
//! seals blocks into the ledger. All state changes flow through the
//! ledger's within-block staging scope; a block commits atomically or not
//! at all. Cross-shard transactions persist receipts that the destination
//! shard drains exactly once. Token standards beyond the native coin, the
//! compliance manager and the anomaly scorer live behind narrow traits
//! consumed at the boundary.

pub mod authority;
pub mod balances;
pub mod block;
pub mod consensus;
pub mod contracts;
pub mod crypto;
pub mod error;
pub mod ledger;
pub mod merkle;
pub mod network;
pub mod pool;
pub mod sharding;
pub mod state;
pub mod transaction;

// Re-export the types callers touch most
pub use authority::{AuthorityNode, AuthorityRole, AuthoritySet, PenaltyManager, StakeRecord};
pub use balances::{AssetId, BalanceTable, TokenRegistry, NATIVE_ASSET};
pub use block::{Block, BlockHeader, SubBlock};
pub use consensus::{
    mode_for, threshold, ConsensusConfig, ConsensusEngine, ConsensusMode, PosVote,
};
pub use contracts::{contract_address, ContractRuntime, ExecStatus, LogEntry, Receipt};
pub use crypto::{Address, Hash, KeyPair, Signature};
pub use error::{ErrorKind, Result, SynnergyError};
pub use ledger::{Account, AuthorityView, ChainAppend, Ledger, LedgerView, PenaltyRecord};
pub use merkle::{state_root, MerkleProof, MerkleTree};
pub use network::{GossipHub, InboundMsg, Network, Subscription};
pub use pool::{
    AnomalyFlag, AnomalyService, ComplianceManager, PoolConfig, PoolOrdering, TxPool, TxSource,
};
pub use sharding::{shard_of, CrossShardTx, LoadSample, SelectionPolicy, ShardCoordinator};
pub use state::{StateBatch, StateError, StateStore};
pub use transaction::{Transaction, TxType};

/// Protocol version string
pub const PROTOCOL_VERSION: &str = "1.0.0";

/// Fee sink account; gas burned by transactions accumulates here.
/// Fixed at genesis.
pub const FEE_SINK: Address = Address([0xFE; 20]);

/// Distinct active-authority signatures required to admit a reversal
pub const REVERSAL_AUTHORITY_QUORUM: usize = 3;

/// Penalty points at which an authority is slashed and deactivated
pub const AUTHORITY_PENALTY_THRESHOLD: u64 = 100;

/// Address-space partition width: 10 bits, 1024 shards
pub const SHARD_BITS: u8 = 10;

/// Resharding is only allowed when `height % RESHARD_EPOCH == 0`
pub const RESHARD_EPOCH: u64 = 100;

/// Default byte bound over pending pool transactions
pub const MAX_POOL_BYTES: usize = 4 * 1024 * 1024;
