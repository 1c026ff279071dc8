//! # Triad Core Types
//!
//! Core type definitions for the Triad Core ledger:
//! - [`Address`] - 20-byte account addresses
//! - [`H256`] - 32-byte keccak digests
//! - [`Operation`], [`TxBody`], [`Transaction`] - signed state writes
//! - [`Block`] - consensus blocks with stake snapshots and carried votes
//!
//! All protocol hashes are keccak256 over the canonical JSON encoding of the
//! hashed structure; JSON is the protocol's native wire format, so the hash
//! preimage and the wire bytes share one encoding.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![deny(unsafe_code)]

pub mod address;
pub mod block;
pub mod hash;
pub mod transaction;

pub use address::Address;
pub use block::Block;
pub use hash::H256;
pub use transaction::{Operation, Transaction, TxBody, UNORDERED_NONCE};

/// Stake balance of a single validator.
pub type Stake = u64;

/// Result type alias for type-level operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur when working with Triad Core types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid hex string
    #[error("invalid hex: {0}")]
    InvalidHex(#[from] hex::FromHexError),

    /// Invalid length for a fixed-size type
    #[error("invalid length: expected {expected}, got {actual}")]
    InvalidLength {
        /// Expected length
        expected: usize,
        /// Actual length
        actual: usize,
    },

    /// Invalid address format
    #[error("invalid address format: {0}")]
    InvalidAddress(String),

    /// Invalid hash format
    #[error("invalid hash format: {0}")]
    InvalidHash(String),

    /// The transaction failed a structural or signature check
    #[error("invalid transaction: {0}")]
    InvalidTransaction(String),

    /// The block failed a structural check
    #[error("invalid block: {0}")]
    InvalidBlock(String),

    /// JSON encoding failure
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Underlying cryptographic failure
    #[error("crypto error: {0}")]
    Crypto(#[from] triad_crypto::CryptoError),
}
