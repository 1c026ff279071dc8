//! # Triad Core Crypto
//!
//! Cryptographic primitives for Triad Core:
//! - Keccak256 hashing ([`keccak256`], [`keccak256_concat`])
//! - ECDSA signing and public-key recovery on secp256k1 ([`PrivateKey`],
//!   [`Signature`])
//! - Address derivation from public keys
//!
//! Every signed artifact in the protocol (transactions, handshakes) carries a
//! recoverable signature; verification recovers the signer address and
//! compares it against the claimed one.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![deny(unsafe_code)]

pub mod ecdsa;
pub mod hash;

pub use ecdsa::{PrivateKey, PublicKey, RawAddress, Signature};
pub use hash::{keccak256, keccak256_concat};

/// Result type alias for crypto operations
pub type Result<T> = std::result::Result<T, CryptoError>;

/// Errors that can occur during cryptographic operations
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// The private key bytes are not a valid scalar
    #[error("invalid private key: {0}")]
    InvalidPrivateKey(String),

    /// The public key bytes do not encode a curve point
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    /// Signature bytes are malformed or recovery failed
    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    /// A hex string could not be decoded
    #[error("invalid hex: {0}")]
    InvalidHex(#[from] hex::FromHexError),

    /// A fixed-size input had the wrong length
    #[error("invalid length: expected {expected}, got {actual}")]
    InvalidLength {
        /// Expected byte length
        expected: usize,
        /// Actual byte length
        actual: usize,
    },
}
