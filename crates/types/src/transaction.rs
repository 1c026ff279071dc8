//! Transactions and their operations.
//!
//! A transaction is a signed [`TxBody`]; the body's canonical JSON encoding
//! is hashed with keccak256, the digest is signed, and the signer address is
//! recovered from the signature. Consensus votes and proposals are ordinary
//! transactions writing under `/consensus/number/...`.

use crate::{Address, Error, H256, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use triad_crypto::{PrivateKey, Signature};

/// Nonce value marking a transaction as unordered.
///
/// Unordered transactions skip the per-account nonce sequence and are
/// replay-protected by requiring a strictly increasing timestamp per account.
pub const UNORDERED_NONCE: i64 = -1;

/// A single state-write operation.
///
/// `SET` batches an ordered list of the other four kinds; nesting `SET`
/// inside `SET` is rejected at execution time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Operation {
    /// Write a value at `ref_path`.
    #[serde(rename = "SET_VALUE")]
    SetValue {
        /// Slash-separated state path
        ref_path: String,
        /// JSON value to store
        value: Value,
    },
    /// Write a rule configuration at `ref_path`.
    #[serde(rename = "SET_RULE")]
    SetRule {
        /// Slash-separated state path
        ref_path: String,
        /// Rule configuration
        value: Value,
    },
    /// Write a function configuration at `ref_path`.
    #[serde(rename = "SET_FUNCTION")]
    SetFunction {
        /// Slash-separated state path
        ref_path: String,
        /// Function configuration
        value: Value,
    },
    /// Write an owner configuration at `ref_path`.
    #[serde(rename = "SET_OWNER")]
    SetOwner {
        /// Slash-separated state path
        ref_path: String,
        /// Owner configuration
        value: Value,
    },
    /// An ordered batch of the other operation kinds.
    #[serde(rename = "SET")]
    Set {
        /// Operations applied in order; all-or-nothing
        op_list: Vec<Operation>,
    },
}

impl Operation {
    /// Convenience constructor for a `SET_VALUE`.
    pub fn set_value(ref_path: impl Into<String>, value: Value) -> Self {
        Operation::SetValue {
            ref_path: ref_path.into(),
            value,
        }
    }

    /// The leaf operations in application order (a non-batch operation
    /// yields itself).
    pub fn leaves(&self) -> Vec<&Operation> {
        match self {
            Operation::Set { op_list } => op_list.iter().collect(),
            other => vec![other],
        }
    }

    /// The target path of a leaf operation; `None` for a batch.
    pub fn ref_path(&self) -> Option<&str> {
        match self {
            Operation::SetValue { ref_path, .. }
            | Operation::SetRule { ref_path, .. }
            | Operation::SetFunction { ref_path, .. }
            | Operation::SetOwner { ref_path, .. } => Some(ref_path),
            Operation::Set { .. } => None,
        }
    }
}

/// The signed payload of a transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TxBody {
    /// The state write to perform
    pub operation: Operation,
    /// Per-account sequence number; [`UNORDERED_NONCE`] for unordered
    pub nonce: i64,
    /// Unix timestamp in milliseconds
    pub timestamp: u64,
    /// Optional gas price; total cost = gas_amount * gas_price
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gas_price: Option<u64>,
    /// Optional causal parent transaction
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_tx_hash: Option<H256>,
}

impl TxBody {
    /// Creates an ordered body.
    pub fn new(operation: Operation, nonce: i64, timestamp: u64) -> Self {
        Self {
            operation,
            nonce,
            timestamp,
            gas_price: None,
            parent_tx_hash: None,
        }
    }

    /// Creates an unordered body (`nonce = -1`).
    pub fn unordered(operation: Operation, timestamp: u64) -> Self {
        Self::new(operation, UNORDERED_NONCE, timestamp)
    }

    /// The canonical digest of this body.
    ///
    /// Keccak256 over the canonical JSON bytes; JSON object keys serialize
    /// in sorted order, so the digest is encoding-stable.
    pub fn hash(&self) -> Result<H256> {
        let bytes = serde_json::to_vec(self)?;
        Ok(H256::keccak256(&bytes))
    }
}

/// A signed transaction.
///
/// Invariant: `hash == tx_body.hash()` and `address` is the signer recovered
/// from `signature` over `hash`. [`Transaction::verify`] re-checks both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    /// The signed payload
    pub tx_body: TxBody,
    /// Recoverable ECDSA signature over the body digest
    pub signature: Signature,
    /// Signer address recovered from the signature
    pub address: Address,
    /// Digest of the body
    pub hash: H256,
}

impl Transaction {
    /// Signs a body with the given key, producing a complete transaction.
    pub fn sign(tx_body: TxBody, key: &PrivateKey) -> Result<Self> {
        let hash = tx_body.hash()?;
        let signature = key.sign_digest(hash.as_fixed_bytes())?;
        let address = Address::from(signature.recover_address(hash.as_fixed_bytes())?);
        Ok(Self {
            tx_body,
            signature,
            address,
            hash,
        })
    }

    /// Re-derives the hash and signer and compares them against the carried
    /// fields. Any mismatch is a malformed transaction.
    pub fn verify(&self) -> Result<()> {
        let hash = self.tx_body.hash()?;
        if hash != self.hash {
            return Err(Error::InvalidTransaction(format!(
                "hash mismatch: carried {}, computed {}",
                self.hash.short(),
                hash.short()
            )));
        }
        let recovered = Address::from(self.signature.recover_address(hash.as_fixed_bytes())?);
        if recovered != self.address {
            return Err(Error::InvalidTransaction(format!(
                "signer mismatch: carried {}, recovered {}",
                self.address, recovered
            )));
        }
        Ok(())
    }

    /// Whether this transaction participates in the per-account nonce
    /// sequence.
    pub fn is_nonce_ordered(&self) -> bool {
        self.tx_body.nonce != UNORDERED_NONCE
    }

    /// The transaction timestamp in milliseconds.
    pub fn timestamp(&self) -> u64 {
        self.tx_body.timestamp
    }
}

impl fmt::Display for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Tx({} from {} nonce {})",
            self.hash.short(),
            self.address,
            self.tx_body.nonce
        )
    }
}
