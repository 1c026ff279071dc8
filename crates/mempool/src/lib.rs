//! # Triad Core Mempool
//!
//! The transaction pool: per-account ordered queues with a global
//! fingerprint set for O(1) dedup. The pool admits executable transactions,
//! answers "what may appear in the next block" with a gap-free nonce drain,
//! and prunes itself when blocks finalize. It knows nothing of consensus -
//! the engine drains it into each proposal.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![deny(unsafe_code)]

pub mod pool;

pub use pool::{AdmitDecision, PoolConfig, TransactionPool};

/// Result type alias for pool operations
pub type Result<T> = std::result::Result<T, MempoolError>;

/// Errors that can occur in the transaction pool
#[derive(Debug, thiserror::Error)]
pub enum MempoolError {
    /// The transaction is already tracked
    #[error("transaction already in pool")]
    AlreadyExists,

    /// The global pool is at capacity
    #[error("pool is full ({0} transactions)")]
    PoolFull(usize),

    /// The sender's queue is at capacity
    #[error("per-account queue is full ({0} transactions)")]
    PerAccountFull(usize),

    /// The transaction failed a structural or signature check
    #[error("invalid transaction: {0}")]
    Invalid(String),
}
