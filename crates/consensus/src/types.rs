//! Consensus-specific types: block infos, engine messages, and the vote and
//! proposal transactions that carry consensus through the state tree.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::str::FromStr;

use triad_crypto::PrivateKey;
use triad_statedb::{consensus_record_path, proposal_path, vote_path};
use triad_types::{Address, Block, H256, Operation, Stake, Transaction, TxBody};

use crate::{ConsensusError, Result};

/// Lifecycle of the consensus engine itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineStatus {
    /// Created but not yet initialized
    Starting,
    /// Epoch clock running
    Running,
    /// Stopped; the epoch interval is cleared
    Stopped,
}

/// Node-level status the engine gates on. Proposals and votes are ignored
/// unless the node is `Serving`; chain-segment exchange always proceeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    /// Booting: loading config and genesis
    Starting,
    /// Catching up with peers
    Syncing,
    /// Fully participating in consensus
    Serving,
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeStatus::Starting => write!(f, "starting"),
            NodeStatus::Syncing => write!(f, "syncing"),
            NodeStatus::Serving => write!(f, "serving"),
        }
    }
}

/// Consensus messages exchanged between engines (the node adapts these to
/// the wire envelope).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ConsensusMessage {
    /// A new block proposal with its proposal transaction
    Proposal {
        /// The proposed block
        block: Block,
        /// The transaction recording the proposal in state
        proposal_tx: Transaction,
    },
    /// A validator vote
    Vote {
        /// The vote transaction
        vote_tx: Transaction,
    },
}

/// A candidate block in the pool with its consensus bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockInfo {
    /// The block itself
    pub block: Block,
    /// The proposal transaction, absent only for the finalized root entry
    pub proposal: Option<Transaction>,
    /// Votes seen for this block, in arrival order
    pub votes: Vec<Transaction>,
    /// Whether vote stake crossed two thirds of the snapshot
    pub notarized: bool,
    /// Sum of voting stake over unique signers
    pub tally: Stake,
}

impl BlockInfo {
    /// Wraps a freshly accepted block.
    pub fn new(block: Block, proposal: Option<Transaction>) -> Self {
        // Genesis needs no votes.
        let notarized = block.is_genesis();
        Self {
            block,
            proposal,
            votes: Vec::new(),
            notarized,
            tally: 0,
        }
    }

    /// Whether `voter` already has a vote recorded for this block.
    pub fn has_vote_from(&self, voter: &Address) -> bool {
        self.votes.iter().any(|v| v.address == *voter)
    }

    /// Re-tallies the vote stake against the block's validator snapshot and
    /// updates the notarization flag. Returns true if the flag flipped on.
    pub fn retally(&mut self) -> bool {
        let mut tally: Stake = 0;
        for vote in &self.votes {
            if let Some(stake) = self.block.validators.get(&vote.address) {
                tally = tally.saturating_add(*stake);
            }
        }
        self.tally = tally;
        let total = self.block.total_stake();
        let now_notarized = (tally as u128) * 3 > (total as u128) * 2;
        let flipped = now_notarized && !self.notarized;
        if now_notarized {
            self.notarized = true;
        }
        flipped
    }

    /// The proposal plus votes, the shape carried as the next block's
    /// `last_votes`.
    pub fn last_votes_for_child(&self) -> Vec<Transaction> {
        let mut out = Vec::with_capacity(self.votes.len() + 1);
        if let Some(p) = &self.proposal {
            out.push(p.clone());
        }
        out.extend(self.votes.iter().cloned());
        out
    }
}

/// A catch-up payload entry: one pool entry from a serving peer, replayed
/// through the normal proposal/vote path on receipt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatchUpEntry {
    /// The candidate block
    pub block: Block,
    /// Its proposal transaction
    pub proposal: Option<Transaction>,
    /// Votes the peer has seen for it
    pub votes: Vec<Transaction>,
}

impl From<&BlockInfo> for CatchUpEntry {
    fn from(info: &BlockInfo) -> Self {
        Self {
            block: info.block.clone(),
            proposal: info.proposal.clone(),
            votes: info.votes.clone(),
        }
    }
}

/// A parsed vote transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedVote {
    /// Block number voted at
    pub number: u64,
    /// The voting validator (path segment; the signer must match)
    pub voter: Address,
    /// Hash of the block voted for
    pub block_hash: H256,
    /// Stake the voter claims
    pub stake: Stake,
}

/// A parsed proposal transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedProposal {
    /// Proposed block number
    pub number: u64,
    /// Hash of the proposed block
    pub block_hash: H256,
    /// The proposer recorded in the value
    pub proposer: Address,
}

/// Builds a vote transaction writing
/// `/consensus/number/<number>/<voter> = { block_hash, stake }`.
pub fn build_vote_tx(
    key: &PrivateKey,
    number: u64,
    block_hash: &H256,
    stake: Stake,
    timestamp: u64,
) -> Result<Transaction> {
    let voter = Address::from(key.address());
    let op = Operation::set_value(
        format!("/{}", vote_path(number, &voter).join("/")),
        json!({ "block_hash": block_hash.to_hex(), "stake": stake }),
    );
    Ok(Transaction::sign(TxBody::unordered(op, timestamp), key)?)
}

/// Builds a proposal transaction writing the proposal record for `block`,
/// retiring the consensus record that falls out of the retention window.
pub fn build_proposal_tx(
    key: &PrivateKey,
    block: &Block,
    max_consensus_states: u64,
    timestamp: u64,
) -> Result<Transaction> {
    let record = json!({
        "number": block.number,
        "epoch": block.epoch,
        "validators": block.validators,
        "total_at_stake": block.total_stake(),
        "proposer": block.proposer.to_hex(),
        "block_hash": block.hash.to_hex(),
        "last_hash": block.last_hash.to_hex(),
        "timestamp": block.timestamp,
        "gas_cost_total": block.gas_cost_total,
    });
    let propose = Operation::set_value(
        format!("/{}", proposal_path(block.number).join("/")),
        record,
    );
    let op = if block.number > max_consensus_states {
        let retired = block.number - max_consensus_states;
        Operation::Set {
            op_list: vec![
                propose,
                Operation::set_value(
                    format!("/{}", consensus_record_path(retired).join("/")),
                    Value::Null,
                ),
            ],
        }
    } else {
        propose
    };
    Ok(Transaction::sign(TxBody::unordered(op, timestamp), key)?)
}

/// Parses a vote transaction; errors if the shape is not a vote.
pub fn parse_vote(tx: &Transaction) -> Result<ParsedVote> {
    let (ref_path, value) = single_value_write(&tx.tx_body.operation)
        .ok_or_else(|| ConsensusError::Malformed("vote is not a single value write".into()))?;
    let segments = triad_statedb::split_path(ref_path);
    if segments.len() != 4 || segments[0] != "consensus" || segments[1] != "number" {
        return Err(ConsensusError::Malformed(format!(
            "vote path has unexpected shape: {}",
            ref_path
        )));
    }
    let number: u64 = segments[2]
        .parse()
        .map_err(|_| ConsensusError::Malformed("vote number is not numeric".into()))?;
    let voter = Address::from_str(&segments[3])
        .map_err(|_| ConsensusError::Malformed("vote path is not an address".into()))?;
    let block_hash = value
        .get("block_hash")
        .and_then(|v| v.as_str())
        .and_then(|s| H256::from_hex(s).ok())
        .ok_or_else(|| ConsensusError::Malformed("vote has no block_hash".into()))?;
    let stake = value.get("stake").and_then(|v| v.as_u64()).unwrap_or(0);
    Ok(ParsedVote {
        number,
        voter,
        block_hash,
        stake,
    })
}

/// Parses a proposal transaction; errors if the shape is not a proposal.
pub fn parse_proposal(tx: &Transaction) -> Result<ParsedProposal> {
    // A proposal is either the bare record write or a SET batch whose first
    // leaf is the record write (the second retires an old record).
    let leaves = tx.tx_body.operation.leaves();
    let (ref_path, value) = leaves
        .first()
        .and_then(|op| single_value_write(op))
        .ok_or_else(|| ConsensusError::Malformed("proposal has no record write".into()))?;
    let segments = triad_statedb::split_path(ref_path);
    if segments.len() != 4
        || segments[0] != "consensus"
        || segments[1] != "number"
        || segments[3] != "propose"
    {
        return Err(ConsensusError::Malformed(format!(
            "proposal path has unexpected shape: {}",
            ref_path
        )));
    }
    let number: u64 = segments[2]
        .parse()
        .map_err(|_| ConsensusError::Malformed("proposal number is not numeric".into()))?;
    let block_hash = value
        .get("block_hash")
        .and_then(|v| v.as_str())
        .and_then(|s| H256::from_hex(s).ok())
        .ok_or_else(|| ConsensusError::Malformed("proposal has no block_hash".into()))?;
    let proposer = value
        .get("proposer")
        .and_then(|v| v.as_str())
        .and_then(|s| Address::from_str(s).ok())
        .ok_or_else(|| ConsensusError::Malformed("proposal has no proposer".into()))?;
    Ok(ParsedProposal {
        number,
        block_hash,
        proposer,
    })
}

fn single_value_write(op: &Operation) -> Option<(&str, &Value)> {
    match op {
        Operation::SetValue { ref_path, value } => Some((ref_path.as_str(), value)),
        _ => None,
    }
}
