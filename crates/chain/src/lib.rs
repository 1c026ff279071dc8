//! # Triad Core Chain
//!
//! The append-only log of finalized blocks. Appends validate linkage
//! (number, `last_hash`, epoch monotonicity) against the current tip;
//! catch-up peers are served [`CHAIN_SEGMENT_LENGTH`]-block segments, and
//! incoming segments are validated with the same linkage rules before they
//! are applied.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![deny(unsafe_code)]

use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::{debug, info};

use triad_types::{Block, H256};

/// Maximum number of blocks in one chain segment response.
pub const CHAIN_SEGMENT_LENGTH: usize = 20;

/// Result type alias for chain operations
pub type Result<T> = std::result::Result<T, ChainError>;

/// Errors that can occur in the finalized chain
#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    /// The appended block does not extend the tip
    #[error("block does not link to the chain tip: {0}")]
    BrokenLink(String),

    /// The block failed structural validation
    #[error("invalid block: {0}")]
    InvalidBlock(#[from] triad_types::Error),

    /// A segment is internally inconsistent
    #[error("invalid chain segment: {0}")]
    InvalidSegment(String),
}

#[derive(Default)]
struct Inner {
    blocks: Vec<Block>,
    by_hash: HashMap<H256, u64>,
}

/// The finalized chain.
pub struct Blockchain {
    inner: RwLock<Inner>,
}

impl Blockchain {
    /// Creates a chain holding only the genesis block.
    pub fn new(genesis: Block) -> Result<Self> {
        genesis.validate_basic()?;
        if !genesis.is_genesis() {
            return Err(ChainError::BrokenLink(format!(
                "chain must start at number 0, got {}",
                genesis.number
            )));
        }
        let mut inner = Inner::default();
        inner.by_hash.insert(genesis.hash, 0);
        inner.blocks.push(genesis);
        Ok(Self {
            inner: RwLock::new(inner),
        })
    }

    /// Appends a finalized block. The block must link to the current tip
    /// with `number = tip.number + 1` and a strictly greater epoch.
    pub fn append(&self, block: Block) -> Result<()> {
        block.validate_basic()?;
        let mut inner = self.inner.write();
        let tip = inner.blocks.last().expect("chain always has genesis");

        if block.number != tip.number + 1 {
            return Err(ChainError::BrokenLink(format!(
                "expected number {}, got {}",
                tip.number + 1,
                block.number
            )));
        }
        if block.last_hash != tip.hash {
            return Err(ChainError::BrokenLink(format!(
                "expected last_hash {}, got {}",
                tip.hash.short(),
                block.last_hash.short()
            )));
        }
        if block.epoch <= tip.epoch {
            return Err(ChainError::BrokenLink(format!(
                "epoch {} does not increase over tip epoch {}",
                block.epoch, tip.epoch
            )));
        }

        info!(number = block.number, epoch = block.epoch, hash = %block.hash.short(), "appended finalized block");
        inner.by_hash.insert(block.hash, block.number);
        inner.blocks.push(block);
        Ok(())
    }

    /// The current tip.
    pub fn last_block(&self) -> Block {
        self.inner.read().blocks.last().expect("chain always has genesis").clone()
    }

    /// The tip's number.
    pub fn last_number(&self) -> u64 {
        self.last_block().number
    }

    /// A block by number.
    pub fn block_by_number(&self, number: u64) -> Option<Block> {
        self.inner.read().blocks.get(number as usize).cloned()
    }

    /// A block by hash.
    pub fn block_by_hash(&self, hash: &H256) -> Option<Block> {
        let inner = self.inner.read();
        inner
            .by_hash
            .get(hash)
            .and_then(|n| inner.blocks.get(*n as usize))
            .cloned()
    }

    /// Whether the chain holds the hash.
    pub fn has_block(&self, hash: &H256) -> bool {
        self.inner.read().by_hash.contains_key(hash)
    }

    /// Up to [`CHAIN_SEGMENT_LENGTH`] consecutive blocks beginning right
    /// after the requester's tip. `None` for the whole-chain request shape
    /// returns from the block after genesis.
    pub fn chain_segment(&self, requester_tip: Option<&Block>) -> Vec<Block> {
        let inner = self.inner.read();
        let start = match requester_tip {
            // An unknown or diverged tip yields an empty segment; the
            // requester is on another branch and cannot be helped here.
            Some(tip) => match inner.by_hash.get(&tip.hash) {
                Some(number) => *number + 1,
                None => return Vec::new(),
            },
            None => 1,
        };
        inner
            .blocks
            .iter()
            .skip(start as usize)
            .take(CHAIN_SEGMENT_LENGTH)
            .cloned()
            .collect()
    }

    /// Validates that a segment extends this chain's tip: consecutive
    /// numbers, hash linkage, increasing epochs and internal validity.
    pub fn validate_segment(&self, segment: &[Block]) -> Result<()> {
        if segment.is_empty() {
            return Err(ChainError::InvalidSegment("empty segment".into()));
        }
        let tip = self.last_block();
        let mut prev_number = tip.number;
        let mut prev_hash = tip.hash;
        let mut prev_epoch = tip.epoch;
        for block in segment {
            block.validate_basic()?;
            if block.number != prev_number + 1 {
                return Err(ChainError::InvalidSegment(format!(
                    "expected number {}, got {}",
                    prev_number + 1,
                    block.number
                )));
            }
            if block.last_hash != prev_hash {
                return Err(ChainError::InvalidSegment(format!(
                    "broken hash link at number {}",
                    block.number
                )));
            }
            if block.epoch <= prev_epoch {
                return Err(ChainError::InvalidSegment(format!(
                    "epoch does not increase at number {}",
                    block.number
                )));
            }
            prev_number = block.number;
            prev_hash = block.hash;
            prev_epoch = block.epoch;
        }
        debug!(len = segment.len(), from = segment[0].number, "validated chain segment");
        Ok(())
    }

    /// Chain length including genesis.
    pub fn len(&self) -> usize {
        self.inner.read().blocks.len()
    }

    /// Never true: the chain always holds genesis.
    pub fn is_empty(&self) -> bool {
        false
    }
}
