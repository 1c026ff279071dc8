//! Block type for the Triad Core ledger.
//!
//! A block carries the proposer's stake snapshot (`validators`), the ordered
//! transactions, and `last_votes` - the predecessor's proposal transaction
//! plus every vote seen for it, which is how the predecessor's notarization
//! travels with the chain.

use crate::{Address, Error, H256, Result, Stake, Transaction};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A consensus block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    /// Finalized-order position; genesis is 0
    pub number: u64,
    /// Epoch this block was proposed at; strictly increasing along any chain
    pub epoch: u64,
    /// Unix timestamp in milliseconds
    pub timestamp: u64,
    /// Hash of the predecessor block; `H256::NIL` for genesis
    pub last_hash: H256,
    /// Digest over the remaining fields
    pub hash: H256,
    /// Address of the proposer; zero for genesis
    pub proposer: Address,
    /// Stake snapshot used for this block's quorum math
    pub validators: BTreeMap<Address, Stake>,
    /// Ordered transactions applied by this block
    pub transactions: Vec<Transaction>,
    /// Predecessor's proposal plus the votes that notarize it
    pub last_votes: Vec<Transaction>,
    /// Sum of gas amounts over `transactions`
    pub gas_amount_total: u64,
    /// Sum of gas costs over `transactions`
    pub gas_cost_total: u64,
    /// Proof hash of the post-execution state root; `None` in lightweight mode
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_proof_hash: Option<H256>,
}

/// The hash preimage: every field except `hash` itself, with transaction
/// lists collapsed to their digests.
#[derive(Serialize)]
struct BlockDigestFields<'a> {
    number: u64,
    epoch: u64,
    timestamp: u64,
    last_hash: &'a H256,
    proposer: &'a Address,
    validators: &'a BTreeMap<Address, Stake>,
    transactions: Vec<&'a H256>,
    last_votes: Vec<&'a H256>,
    gas_amount_total: u64,
    gas_cost_total: u64,
    state_proof_hash: &'a Option<H256>,
}

impl Block {
    /// Builds a block, computing its hash from the remaining fields.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        number: u64,
        epoch: u64,
        timestamp: u64,
        last_hash: H256,
        proposer: Address,
        validators: BTreeMap<Address, Stake>,
        transactions: Vec<Transaction>,
        last_votes: Vec<Transaction>,
        gas_amount_total: u64,
        gas_cost_total: u64,
        state_proof_hash: Option<H256>,
    ) -> Result<Self> {
        let mut block = Self {
            number,
            epoch,
            timestamp,
            last_hash,
            hash: H256::NIL,
            proposer,
            validators,
            transactions,
            last_votes,
            gas_amount_total,
            gas_cost_total,
            state_proof_hash,
        };
        block.hash = block.compute_hash()?;
        Ok(block)
    }

    /// The genesis block: number 0, nil last hash, fixed timestamp, the
    /// configured whitelist as its stake snapshot.
    pub fn genesis(validators: BTreeMap<Address, Stake>, timestamp: u64) -> Result<Self> {
        Self::new(
            0,
            0,
            timestamp,
            H256::NIL,
            Address::ZERO,
            validators,
            Vec::new(),
            Vec::new(),
            0,
            0,
            None,
        )
    }

    /// Recomputes the digest over the block's fields.
    pub fn compute_hash(&self) -> Result<H256> {
        let fields = BlockDigestFields {
            number: self.number,
            epoch: self.epoch,
            timestamp: self.timestamp,
            last_hash: &self.last_hash,
            proposer: &self.proposer,
            validators: &self.validators,
            transactions: self.transactions.iter().map(|tx| &tx.hash).collect(),
            last_votes: self.last_votes.iter().map(|tx| &tx.hash).collect(),
            gas_amount_total: self.gas_amount_total,
            gas_cost_total: self.gas_cost_total,
            state_proof_hash: &self.state_proof_hash,
        };
        let bytes = serde_json::to_vec(&fields)?;
        Ok(H256::keccak256(&bytes))
    }

    /// Digest over the carried `last_votes`, in order. Feeds the proposer
    /// selection seed for epochs extending this block.
    pub fn last_votes_hash(&self) -> H256 {
        let slices: Vec<&[u8]> = self
            .last_votes
            .iter()
            .map(|tx| tx.hash.as_bytes())
            .collect();
        H256::keccak256_concat(&slices)
    }

    /// Total stake of this block's validator snapshot.
    pub fn total_stake(&self) -> Stake {
        self.validators.values().sum()
    }

    /// Whether this is the genesis block.
    pub fn is_genesis(&self) -> bool {
        self.number == 0
    }

    /// Structural checks that need no chain context: internal hash, linkage
    /// shape, proposer membership, and transaction signatures.
    pub fn validate_basic(&self) -> Result<()> {
        let computed = self.compute_hash()?;
        if computed != self.hash {
            return Err(Error::InvalidBlock(format!(
                "internal hash mismatch at number {}: carried {}, computed {}",
                self.number,
                self.hash.short(),
                computed.short()
            )));
        }

        if self.is_genesis() {
            if !self.last_hash.is_nil() {
                return Err(Error::InvalidBlock("genesis must have nil last_hash".into()));
            }
            return Ok(());
        }

        if self.last_hash.is_nil() {
            return Err(Error::InvalidBlock(format!(
                "non-genesis block {} has nil last_hash",
                self.number
            )));
        }
        if self.epoch == 0 {
            return Err(Error::InvalidBlock(format!(
                "non-genesis block {} has epoch 0",
                self.number
            )));
        }
        if !self.validators.contains_key(&self.proposer) {
            return Err(Error::InvalidBlock(format!(
                "proposer {} not in validator snapshot of block {}",
                self.proposer, self.number
            )));
        }

        for tx in self.transactions.iter().chain(self.last_votes.iter()) {
            tx.verify()?;
        }
        Ok(())
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Block #{} (epoch {}, hash {}, parent {}, {} txs)",
            self.number,
            self.epoch,
            self.hash.short(),
            self.last_hash.short(),
            self.transactions.len()
        )
    }
}
