//! Tests for the candidate block DAG: notarization, one-vote idempotence,
//! three-chain detection and pruning.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::json;
use triad_consensus::{build_vote_tx, BlockPool};
use triad_crypto::PrivateKey;
use triad_statedb::StateVersionManager;
use triad_types::{Block, H256, Operation, Transaction, TxBody};

const TS: u64 = 1_700_000_000_000;
const STAKE: u64 = 100_000;

struct Fixture {
    keys: Vec<PrivateKey>,
    validators: BTreeMap<triad_types::Address, u64>,
    mgr: Arc<StateVersionManager>,
    genesis: Block,
    ts: std::cell::Cell<u64>,
}

impl Fixture {
    fn new(n: usize) -> Self {
        let keys: Vec<PrivateKey> = (0..n).map(|_| PrivateKey::random()).collect();
        let validators: BTreeMap<_, _> =
            keys.iter().map(|k| (k.address().into(), STAKE)).collect();
        let mgr = Arc::new(StateVersionManager::new());
        mgr.clone_version("", "final:0").unwrap();
        mgr.finalize("final:0").unwrap();
        let genesis = Block::genesis(validators.clone(), TS).unwrap();
        Self {
            keys,
            validators,
            mgr,
            genesis,
            ts: std::cell::Cell::new(TS),
        }
    }

    fn pool(&self) -> BlockPool {
        BlockPool::new(Arc::clone(&self.mgr), self.genesis.clone())
    }

    fn next_ts(&self) -> u64 {
        let t = self.ts.get() + 1;
        self.ts.set(t);
        t
    }

    fn block(&self, parent: &Block, epoch: u64) -> (Block, Transaction) {
        let block = Block::new(
            parent.number + 1,
            epoch,
            self.next_ts(),
            parent.hash,
            self.keys[0].address().into(),
            self.validators.clone(),
            Vec::new(),
            Vec::new(),
            0,
            0,
            None,
        )
        .unwrap();
        let proposal = Transaction::sign(
            TxBody::unordered(
                Operation::set_value(
                    format!("/consensus/number/{}/propose", block.number),
                    json!({
                        "proposer": block.proposer.to_hex(),
                        "block_hash": block.hash.to_hex(),
                    }),
                ),
                self.next_ts(),
            ),
            &self.keys[0],
        )
        .unwrap();
        (block, proposal)
    }

    fn vote(&self, validator: usize, block: &Block) -> Transaction {
        build_vote_tx(
            &self.keys[validator],
            block.number,
            &block.hash,
            STAKE,
            self.next_ts(),
        )
        .unwrap()
    }

    /// Adds a block and enough votes to notarize it (4 of 5 at equal stake).
    fn notarize(&self, pool: &BlockPool, block: &Block, proposal: Transaction) {
        assert!(pool.add_seen_block(block.clone(), proposal));
        for v in 0..4 {
            pool.add_seen_vote(self.vote(v, block));
        }
        assert!(pool.get(&block.hash).unwrap().notarized);
    }
}

#[test]
fn add_seen_block_is_idempotent() {
    let fx = Fixture::new(5);
    let pool = fx.pool();
    let (block, proposal) = fx.block(&fx.genesis, 1);

    assert!(pool.add_seen_block(block.clone(), proposal.clone()));
    assert!(!pool.add_seen_block(block.clone(), proposal));
    assert!(pool.has_seen_block(&block.hash));
    assert_eq!(pool.len(), 1);
}

#[test]
fn notarization_flips_strictly_above_two_thirds() {
    let fx = Fixture::new(5);
    let pool = fx.pool();
    let (block, proposal) = fx.block(&fx.genesis, 1);
    pool.add_seen_block(block.clone(), proposal);

    // 3 of 5 at equal stake is 60%: not notarized.
    for v in 0..3 {
        pool.add_seen_vote(fx.vote(v, &block));
    }
    let info = pool.get(&block.hash).unwrap();
    assert_eq!(info.tally, 3 * STAKE);
    assert!(!info.notarized);

    // The fourth vote crosses 2/3.
    pool.add_seen_vote(fx.vote(3, &block));
    let info = pool.get(&block.hash).unwrap();
    assert!(info.notarized);
    assert_eq!(pool.longest_notarized_tips(), vec![block.hash]);
}

#[test]
fn duplicate_votes_are_discarded() {
    let fx = Fixture::new(5);
    let pool = fx.pool();
    let (block, proposal) = fx.block(&fx.genesis, 1);
    pool.add_seen_block(block.clone(), proposal);

    let vote = fx.vote(0, &block);
    pool.add_seen_vote(vote.clone());
    pool.add_seen_vote(vote);
    // A different vote transaction from the same validator also counts once.
    pool.add_seen_vote(fx.vote(0, &block));

    let info = pool.get(&block.hash).unwrap();
    assert_eq!(info.votes.len(), 1);
    assert_eq!(info.tally, STAKE);
    assert!(!info.notarized);
}

#[test]
fn votes_from_outside_the_snapshot_carry_no_stake() {
    let fx = Fixture::new(5);
    let pool = fx.pool();
    let (block, proposal) = fx.block(&fx.genesis, 1);
    pool.add_seen_block(block.clone(), proposal);

    let outsider = PrivateKey::random();
    let vote = build_vote_tx(&outsider, block.number, &block.hash, STAKE, TS + 99).unwrap();
    pool.add_seen_vote(vote);
    assert_eq!(pool.get(&block.hash).unwrap().tally, 0);
}

#[test]
fn early_votes_park_and_fold_in() {
    let fx = Fixture::new(5);
    let pool = fx.pool();
    let (block, proposal) = fx.block(&fx.genesis, 1);

    for v in 0..4 {
        pool.add_seen_vote(fx.vote(v, &block));
    }
    assert!(pool.get(&block.hash).is_none());

    assert!(pool.add_seen_block(block.clone(), proposal));
    let info = pool.get(&block.hash).unwrap();
    assert_eq!(info.votes.len(), 4);
    assert!(info.notarized);
}

#[test]
fn one_vote_per_epoch_rule() {
    let fx = Fixture::new(5);
    let pool = fx.pool();
    let (block, _) = fx.block(&fx.genesis, 1);

    assert!(pool.record_epoch_vote(1, block.hash));
    assert!(!pool.record_epoch_vote(1, H256::keccak256(b"other")));
    assert!(pool.has_voted_at(1));
    assert!(!pool.has_voted_at(2));
}

#[test]
fn finalizable_chain_requires_consecutive_epochs() {
    let fx = Fixture::new(5);
    let pool = fx.pool();

    let (b1, p1) = fx.block(&fx.genesis, 1);
    let (b2, p2) = fx.block(&b1, 2);
    let (b3, p3) = fx.block(&b2, 4); // gap: epoch 3 missing
    fx.notarize(&pool, &b1, p1);
    fx.notarize(&pool, &b2, p2);
    fx.notarize(&pool, &b3, p3);
    assert!(pool.finalizable_chain().is_empty());

    // Extend with two more consecutive epochs: suffix (4, 5, 6) finalizes.
    let (b4, p4) = fx.block(&b3, 5);
    let (b5, p5) = fx.block(&b4, 6);
    fx.notarize(&pool, &b4, p4);
    fx.notarize(&pool, &b5, p5);

    let chain = pool.finalizable_chain();
    let numbers: Vec<u64> = chain.iter().map(|i| i.block.number).collect();
    assert_eq!(numbers, vec![1, 2, 3, 4, 5]);
}

#[test]
fn extending_chain_walks_to_the_root() {
    let fx = Fixture::new(5);
    let pool = fx.pool();
    let (b1, p1) = fx.block(&fx.genesis, 1);
    let (b2, p2) = fx.block(&b1, 2);
    pool.add_seen_block(b1.clone(), p1);
    pool.add_seen_block(b2.clone(), p2);

    assert_eq!(pool.extending_chain(&b2.hash), vec![b1.hash, b2.hash]);
    assert!(pool
        .extending_chain(&H256::keccak256(b"disconnected"))
        .is_empty());
}

#[test]
fn longest_tip_breaks_ties_by_epoch() {
    let fx = Fixture::new(5);
    let pool = fx.pool();

    // Two notarized children of genesis at different epochs.
    let (low, lp) = fx.block(&fx.genesis, 1);
    let (high, hp) = fx.block(&fx.genesis, 3);
    fx.notarize(&pool, &low, lp);
    fx.notarize(&pool, &high, hp);

    let tip = pool.longest_notarized_tip().unwrap();
    assert_eq!(tip.block.hash, high.hash);
}

#[test]
fn cleanup_prunes_losing_branches_and_their_versions() {
    let fx = Fixture::new(5);
    let pool = fx.pool();

    let (winner, wp) = fx.block(&fx.genesis, 1);
    let (loser, lp) = fx.block(&fx.genesis, 2);
    fx.notarize(&pool, &winner, wp);
    pool.add_seen_block(loser.clone(), lp);

    // Register state versions the pool owns.
    fx.mgr.clone_version("final:0", "block:winner").unwrap();
    fx.mgr.clone_version("final:0", "block:loser").unwrap();
    pool.register_state(winner.hash, "block:winner".into());
    pool.register_state(loser.hash, "block:loser".into());

    // Simulate the engine's transfer of the winner's version, then prune.
    fx.mgr.transfer("block:winner", "final:1").unwrap();
    fx.mgr.finalize("final:1").unwrap();
    pool.clean_up_after_finalization(&winner);

    assert_eq!(pool.root().hash, winner.hash);
    assert!(pool.get(&loser.hash).is_none());
    assert!(pool.is_empty());
    assert!(!fx.mgr.has_version("block:loser"));
    assert_eq!(fx.mgr.num_versions(), 1);
    assert_eq!(fx.mgr.final_version().as_deref(), Some("final:1"));
}

#[test]
fn catch_up_entries_round_trip() {
    let fx = Fixture::new(5);
    let pool = fx.pool();
    let (block, proposal) = fx.block(&fx.genesis, 1);
    fx.notarize(&pool, &block, proposal);

    let entries = pool.entries();
    assert_eq!(entries.len(), 1);
    let encoded = serde_json::to_string(&entries[0]).unwrap();
    let decoded: triad_consensus::BlockInfo = serde_json::from_str(&encoded).unwrap();
    assert_eq!(decoded.block.hash, block.hash);
    assert_eq!(decoded.votes.len(), 4);
}
