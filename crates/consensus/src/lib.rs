//! # Triad Core Consensus
//!
//! Stake-weighted, pipelined BFT consensus with three-chain finalization.
//!
//! Time is partitioned into epochs. Each epoch a deterministic, stake-
//! weighted draw elects one proposer, which extends the longest notarized
//! chain with a new block. Validators vote by signing ordinary transactions
//! that write into `/consensus/number/<N>/<addr>`; a block whose vote stake
//! exceeds two thirds of its validator snapshot is *notarized*. When the
//! last three blocks of a notarized chain carry strictly consecutive
//! epochs, everything before the tip is *finalized*: appended to the chain
//! log, its state version promoted, the pool pruned.
//!
//! ## Crate layout
//!
//! - [`block_pool`] - the DAG of candidate blocks with per-branch state
//! - [`proposer`] - deterministic stake-weighted proposer selection
//! - [`epoch`] - the epoch clock with its clamped time adjustment
//! - [`engine`] - proposal construction/verification, voting, finalization
//!   and catch-up
//! - [`types`] - block infos, engine messages, vote/proposal transactions

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![deny(unsafe_code)]

pub mod block_pool;
pub mod engine;
pub mod epoch;
pub mod proposer;
pub mod types;

pub use block_pool::BlockPool;
pub use engine::{bootstrap_genesis, ConsensusEngine, EngineConfig, EngineEvent};
pub use epoch::{EpochClock, ManualTimeSource, SystemTimeSource, TimeSource};
pub use proposer::select_proposer;
pub use types::{
    build_proposal_tx, build_vote_tx, parse_proposal, parse_vote, BlockInfo, CatchUpEntry,
    ConsensusMessage, EngineStatus, NodeStatus, ParsedProposal, ParsedVote,
};

/// Result type alias for consensus operations
pub type Result<T> = std::result::Result<T, ConsensusError>;

/// Errors that can occur during consensus operations
#[derive(Debug, thiserror::Error)]
pub enum ConsensusError {
    /// A message or block failed structural checks
    #[error("malformed: {0}")]
    Malformed(String),

    /// The message refers to a past epoch or outdated block
    #[error("stale: {0}")]
    Stale(String),

    /// A signature or whitelist check failed
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The proposal or vote is already known
    #[error("duplicate: {0}")]
    Duplicate(String),

    /// A replay produced different gas totals or state proof than claimed
    #[error("inconsistent: {0}")]
    Inconsistent(String),

    /// The node is not serving yet
    #[error("not ready: {0}")]
    NotReady(String),

    /// The engine cannot act on this yet and requested catch-up
    #[error("out of sync: {0}")]
    OutOfSync(String),

    /// State version bookkeeping failure
    #[error(transparent)]
    State(#[from] triad_statedb::StateDbError),

    /// Chain log failure
    #[error(transparent)]
    Chain(#[from] triad_chain::ChainError),

    /// Type-level failure
    #[error(transparent)]
    Types(#[from] triad_types::Error),

    /// Crypto failure
    #[error(transparent)]
    Crypto(#[from] triad_crypto::CryptoError),

    /// Internal invariant breach
    #[error("internal: {0}")]
    Internal(String),
}
