//! # Triad Core State Database
//!
//! The versioned state substrate the consensus engine rides on:
//!
//! - [`StateTree`] - an immutable path tree with structural sharing; writes
//!   copy nodes along the written path and share everything else
//! - [`StateVersionManager`] - named roots with fork / finalize / delete /
//!   transfer, exactly one finalized version, and RAII [`TempVersion`] guards
//!   for speculative forks
//! - [`DatabaseView`] - a handle bound to one version and one block number
//!   that executes transactions against write rules and owners
//! - [`RuleEngine`] - the rule/owner evaluation seam, with [`ConsensusRules`]
//!   as the built-in implementation covering the consensus paths
//!
//! Multiple speculative branches co-exist as separate version names pointing
//! into the shared node forest; finalization is a rename, not a copy.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![deny(unsafe_code)]

pub mod rules;
pub mod tree;
pub mod versions;
pub mod view;

pub use rules::{
    consensus_record_path, proposal_path, staking_balance, staking_deposit_path, vote_path,
    ConsensusRules, RuleEngine, RuleViolation, WriteContext, WriteKind,
};
pub use tree::{split_path, StateInfo, StateTree};
pub use versions::{StateVersionManager, TempVersion};
pub use view::{DatabaseView, ExecCode, ExecResult, MAX_TX_GAS};

/// Result type alias for state database operations
pub type Result<T> = std::result::Result<T, StateDbError>;

/// Errors that can occur in the state database
#[derive(Debug, thiserror::Error)]
pub enum StateDbError {
    /// The named version does not exist
    #[error("unknown state version: {0}")]
    UnknownVersion(String),

    /// The version name is already taken
    #[error("duplicate state version: {0}")]
    DuplicateVersion(String),

    /// The operation would drop the finalized version
    #[error("version {0} is finalized and cannot be deleted")]
    DeleteFinalized(String),

    /// The version manager holds no finalized version yet
    #[error("no finalized version")]
    NoFinalVersion,

    /// JSON encoding failure while hashing state
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
