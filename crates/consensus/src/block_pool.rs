//! The DAG of candidate blocks.
//!
//! Every valid proposal this node has seen lives here until the branch it
//! sits on is finalized or pruned. The pool tracks, per block: the proposal
//! and vote transactions, the stake tally, and the name of the state
//! version produced by replaying the block. Votes that arrive before their
//! block are parked and folded in when the block shows up.

use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, trace, warn};

use triad_statedb::StateVersionManager;
use triad_types::{Address, Block, H256, Transaction};

use crate::types::{parse_vote, BlockInfo};

struct Inner {
    /// Primary index
    by_hash: HashMap<H256, BlockInfo>,
    /// The block this node voted for at each epoch (one-vote rule)
    by_epoch: HashMap<u64, H256>,
    /// All candidate hashes per number
    by_number: HashMap<u64, HashSet<H256>>,
    /// Parent hash to child hashes, for DAG traversal
    children: HashMap<H256, HashSet<H256>>,
    /// Block hash to owned state version name
    state_by_hash: HashMap<H256, String>,
    /// Votes for blocks not yet seen
    pending_votes: HashMap<H256, Vec<Transaction>>,
    /// Tips of the longest notarized chains, refreshed on notarization
    longest_notarized_tips: Vec<H256>,
    /// The finalized tip everything in the pool extends
    root: Block,
}

/// The block pool.
pub struct BlockPool {
    mgr: Arc<StateVersionManager>,
    inner: RwLock<Inner>,
}

impl BlockPool {
    /// Creates a pool rooted at the finalized tip (genesis at boot).
    pub fn new(mgr: Arc<StateVersionManager>, root: Block) -> Self {
        Self {
            mgr,
            inner: RwLock::new(Inner {
                by_hash: HashMap::new(),
                by_epoch: HashMap::new(),
                by_number: HashMap::new(),
                children: HashMap::new(),
                state_by_hash: HashMap::new(),
                pending_votes: HashMap::new(),
                longest_notarized_tips: Vec::new(),
                root,
            }),
        }
    }

    /// The finalized tip the pool is rooted at.
    pub fn root(&self) -> Block {
        self.inner.read().root.clone()
    }

    /// Whether a block hash is known (pool or root).
    pub fn has_seen_block(&self, hash: &H256) -> bool {
        let inner = self.inner.read();
        inner.root.hash == *hash || inner.by_hash.contains_key(hash)
    }

    /// The pool entry for a hash.
    pub fn get(&self, hash: &H256) -> Option<BlockInfo> {
        self.inner.read().by_hash.get(hash).cloned()
    }

    /// The state version registered for a block.
    pub fn state_version(&self, hash: &H256) -> Option<String> {
        self.inner.read().state_by_hash.get(hash).cloned()
    }

    /// Records the state version a block's replay produced. The pool owns
    /// the version from here: it is destroyed when the block is pruned.
    pub fn register_state(&self, hash: H256, version: String) {
        self.inner.write().state_by_hash.insert(hash, version);
    }

    /// Adds a freshly verified block. Idempotent: returns false when the
    /// hash is already known. Votes that arrived early are folded in.
    pub fn add_seen_block(&self, block: Block, proposal: Transaction) -> bool {
        let mut inner = self.inner.write();
        let hash = block.hash;
        if inner.by_hash.contains_key(&hash) || inner.root.hash == hash {
            return false;
        }

        let number = block.number;
        let parent = block.last_hash;
        let mut info = BlockInfo::new(block, Some(proposal));

        if let Some(parked) = inner.pending_votes.remove(&hash) {
            for vote in parked {
                if !info.has_vote_from(&vote.address) {
                    info.votes.push(vote);
                }
            }
        }
        let flipped = info.retally();

        inner.by_number.entry(number).or_default().insert(hash);
        inner.children.entry(parent).or_default().insert(hash);
        inner.by_hash.insert(hash, info);
        if flipped {
            Self::refresh_tips(&mut inner);
        }
        trace!(number, hash = %hash.short(), "added block to pool");
        true
    }

    /// Appends a verified vote to its block. Re-tallies; when the tally
    /// crosses two thirds the block flips to notarized and the longest
    /// notarized tips are refreshed. A vote for an unseen block is parked.
    ///
    /// A second vote from the same validator for the same block is
    /// discarded idempotently.
    pub fn add_seen_vote(&self, vote: Transaction) {
        let parsed = match parse_vote(&vote) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "dropping unparseable vote");
                return;
            }
        };
        let mut inner = self.inner.write();
        match inner.by_hash.get_mut(&parsed.block_hash) {
            Some(info) => {
                if info.has_vote_from(&vote.address) {
                    trace!(voter = %vote.address, "duplicate vote discarded");
                    return;
                }
                info.votes.push(vote);
                let flipped = info.retally();
                let (number, tally) = (info.block.number, info.tally);
                if flipped {
                    debug!(number, tally, hash = %parsed.block_hash.short(), "block notarized");
                    Self::refresh_tips(&mut inner);
                }
            }
            None => {
                if inner.root.hash == parsed.block_hash {
                    // Votes for the already finalized root carry no new
                    // information.
                    return;
                }
                let parked = inner.pending_votes.entry(parsed.block_hash).or_default();
                if !parked.iter().any(|v| v.address == vote.address) {
                    parked.push(vote);
                }
            }
        }
    }

    /// Records that this node voted for `hash` at `epoch`. Returns false if
    /// it already voted at that epoch (the one-vote rule).
    pub fn record_epoch_vote(&self, epoch: u64, hash: H256) -> bool {
        let mut inner = self.inner.write();
        match inner.by_epoch.get(&epoch) {
            Some(_) => false,
            None => {
                inner.by_epoch.insert(epoch, hash);
                true
            }
        }
    }

    /// Whether this node has voted at `epoch`.
    pub fn has_voted_at(&self, epoch: u64) -> bool {
        self.inner.read().by_epoch.contains_key(&epoch)
    }

    /// The chain of hashes from the root (exclusive) to `tip` (inclusive),
    /// or empty when `tip` does not connect.
    pub fn extending_chain(&self, tip: &H256) -> Vec<H256> {
        let inner = self.inner.read();
        let mut path = Vec::new();
        let mut cursor = *tip;
        loop {
            if cursor == inner.root.hash {
                path.reverse();
                return path;
            }
            match inner.by_hash.get(&cursor) {
                Some(info) => {
                    path.push(cursor);
                    cursor = info.block.last_hash;
                }
                None => return Vec::new(),
            }
        }
    }

    /// The tip of the longest notarized chain: greatest length, ties broken
    /// by greatest epoch on the last block, then by hash for determinism.
    /// `None` when no pool block is notarized (the root is the tip then).
    pub fn longest_notarized_tip(&self) -> Option<BlockInfo> {
        let inner = self.inner.read();
        inner
            .longest_notarized_tips
            .first()
            .and_then(|h| inner.by_hash.get(h))
            .cloned()
    }

    /// The current longest-notarized tip hashes, best first.
    pub fn longest_notarized_tips(&self) -> Vec<H256> {
        self.inner.read().longest_notarized_tips.clone()
    }

    /// The longest notarized chain as pool entries, oldest first, when its
    /// last three blocks carry strictly consecutive epochs. Everything
    /// strictly before the last entry is ready to finalize.
    pub fn finalizable_chain(&self) -> Vec<BlockInfo> {
        let inner = self.inner.read();
        let tip = match inner.longest_notarized_tips.first() {
            Some(t) => *t,
            None => return Vec::new(),
        };
        let chain = Self::notarized_chain_to(&inner, &tip);
        if chain.len() < 3 {
            return Vec::new();
        }
        let epochs: Vec<u64> = chain[chain.len() - 3..]
            .iter()
            .map(|h| inner.by_hash[h].block.epoch)
            .collect();
        if epochs[1] != epochs[0] + 1 || epochs[2] != epochs[1] + 1 {
            return Vec::new();
        }
        chain.iter().map(|h| inner.by_hash[h].clone()).collect()
    }

    /// Prunes every block at number <= `finalized.number` except the
    /// finalized ancestor itself, destroying their state versions, and
    /// re-roots the pool at `finalized`.
    pub fn clean_up_after_finalization(&self, finalized: &Block) {
        let mut inner = self.inner.write();
        let keep = finalized.hash;

        let doomed: Vec<H256> = inner
            .by_hash
            .iter()
            .filter(|(h, info)| info.block.number <= finalized.number && **h != keep)
            .map(|(h, _)| *h)
            .collect();
        for hash in &doomed {
            if let Some(info) = inner.by_hash.remove(hash) {
                if let Some(set) = inner.by_number.get_mut(&info.block.number) {
                    set.remove(hash);
                    if set.is_empty() {
                        inner.by_number.remove(&info.block.number);
                    }
                }
                if let Some(set) = inner.children.get_mut(&info.block.last_hash) {
                    set.remove(hash);
                }
            }
            inner.children.remove(hash);
            if let Some(version) = inner.state_by_hash.remove(hash) {
                if let Err(e) = self.mgr.delete(&version) {
                    trace!(version = %version, error = %e, "pruned version was already gone");
                }
            }
            inner.pending_votes.remove(hash);
        }

        // The finalized block leaves the speculative indexes too; its state
        // version has been transferred to the finalized name by the engine.
        if let Some(info) = inner.by_hash.remove(&keep) {
            if let Some(set) = inner.by_number.get_mut(&info.block.number) {
                set.remove(&keep);
                if set.is_empty() {
                    inner.by_number.remove(&info.block.number);
                }
            }
            if let Some(set) = inner.children.get_mut(&info.block.last_hash) {
                set.remove(&keep);
            }
        }
        inner.state_by_hash.remove(&keep);
        inner.by_epoch.retain(|e, _| *e > finalized.epoch);
        inner.root = finalized.clone();
        Self::refresh_tips(&mut inner);
        debug!(
            pruned = doomed.len(),
            root = finalized.number,
            live = inner.by_hash.len(),
            "pruned pool after finalization"
        );
    }

    /// Number of live candidate blocks.
    pub fn len(&self) -> usize {
        self.inner.read().by_hash.len()
    }

    /// Whether the pool holds no candidates.
    pub fn is_empty(&self) -> bool {
        self.inner.read().by_hash.is_empty()
    }

    /// All pool entries, for catch-up payloads.
    pub fn entries(&self) -> Vec<BlockInfo> {
        self.inner.read().by_hash.values().cloned().collect()
    }

    /// The notarized chain ending at `tip`, root-exclusive, oldest first.
    fn notarized_chain_to(inner: &Inner, tip: &H256) -> Vec<H256> {
        let mut path = Vec::new();
        let mut cursor = *tip;
        while cursor != inner.root.hash {
            match inner.by_hash.get(&cursor) {
                Some(info) if info.notarized => {
                    path.push(cursor);
                    cursor = info.block.last_hash;
                }
                _ => return Vec::new(),
            }
        }
        path.reverse();
        path
    }

    /// Recomputes the longest-notarized tips by walking notarized paths
    /// from the root.
    fn refresh_tips(inner: &mut Inner) {
        let mut best: Vec<(usize, u64, H256)> = Vec::new();
        let mut stack: Vec<(H256, usize)> = vec![(inner.root.hash, 0)];
        while let Some((cursor, depth)) = stack.pop() {
            let mut extended = false;
            if let Some(kids) = inner.children.get(&cursor) {
                for kid in kids {
                    if let Some(info) = inner.by_hash.get(kid) {
                        if info.notarized {
                            stack.push((*kid, depth + 1));
                            extended = true;
                        }
                    }
                }
            }
            if !extended && depth > 0 {
                let epoch = inner.by_hash[&cursor].block.epoch;
                best.push((depth, epoch, cursor));
            }
        }
        // Longest first; ties by greatest epoch, then smallest hash.
        best.sort_by(|a, b| b.0.cmp(&a.0).then(b.1.cmp(&a.1)).then(a.2.cmp(&b.2)));
        inner.longest_notarized_tips = best.into_iter().map(|(_, _, h)| h).collect();
    }

    /// Hashes of blocks proposed by `proposer` at `epoch`, for the
    /// first-wins duplicate-proposal rule.
    pub fn proposals_at_epoch(&self, epoch: u64, proposer: &Address) -> Vec<H256> {
        let inner = self.inner.read();
        inner
            .by_hash
            .iter()
            .filter(|(_, info)| info.block.epoch == epoch && info.block.proposer == *proposer)
            .map(|(h, _)| *h)
            .collect()
    }
}
