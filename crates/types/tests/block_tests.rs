//! Tests for block construction and structural validation.

use std::collections::BTreeMap;

use serde_json::json;
use triad_crypto::PrivateKey;
use triad_types::{Address, Block, H256, Operation, Stake, Transaction, TxBody};

fn validator_set(n: usize) -> (BTreeMap<Address, Stake>, Vec<PrivateKey>) {
    let mut validators = BTreeMap::new();
    let mut keys = Vec::new();
    for _ in 0..n {
        let key = PrivateKey::random();
        validators.insert(key.address().into(), 100_000);
        keys.push(key);
    }
    (validators, keys)
}

fn signed_tx(key: &PrivateKey, nonce: i64) -> Transaction {
    Transaction::sign(
        TxBody::new(
            Operation::set_value("/apps/demo/x", json!(nonce)),
            nonce,
            1_700_000_000_000 + nonce as u64,
        ),
        key,
    )
    .unwrap()
}

fn child_block(parent: &Block, proposer: &PrivateKey, epoch: u64) -> Block {
    Block::new(
        parent.number + 1,
        epoch,
        parent.timestamp + 20_000,
        parent.hash,
        proposer.address().into(),
        parent.validators.clone(),
        vec![signed_tx(proposer, 0)],
        Vec::new(),
        1,
        0,
        Some(H256::keccak256(b"state")),
    )
    .unwrap()
}

#[test]
fn genesis_shape() {
    let (validators, _) = validator_set(5);
    let genesis = Block::genesis(validators.clone(), 1_700_000_000_000).unwrap();

    assert_eq!(genesis.number, 0);
    assert!(genesis.last_hash.is_nil());
    assert!(genesis.is_genesis());
    assert_eq!(genesis.total_stake(), 500_000);
    genesis.validate_basic().unwrap();
}

#[test]
fn hash_covers_all_fields() {
    let (validators, keys) = validator_set(3);
    let genesis = Block::genesis(validators, 1_700_000_000_000).unwrap();
    let block = child_block(&genesis, &keys[0], 1);

    let mut tampered = block.clone();
    tampered.gas_cost_total += 1;
    assert_ne!(tampered.compute_hash().unwrap(), block.hash);

    let mut tampered = block.clone();
    tampered.epoch += 1;
    assert_ne!(tampered.compute_hash().unwrap(), block.hash);
}

#[test]
fn validate_basic_rejects_tampering() {
    let (validators, keys) = validator_set(3);
    let genesis = Block::genesis(validators, 1_700_000_000_000).unwrap();
    let block = child_block(&genesis, &keys[0], 1);
    block.validate_basic().unwrap();

    let mut tampered = block.clone();
    tampered.number += 1;
    assert!(tampered.validate_basic().is_err());
}

#[test]
fn validate_basic_rejects_foreign_proposer() {
    let (validators, keys) = validator_set(3);
    let genesis = Block::genesis(validators, 1_700_000_000_000).unwrap();
    let outsider = PrivateKey::random();
    let block = child_block(&genesis, &outsider, 1);

    // Outsider is not in the snapshot carried from genesis.
    assert!(block.validate_basic().is_err());
    drop(keys);
}

#[test]
fn last_votes_hash_tracks_vote_order() {
    let (validators, keys) = validator_set(2);
    let genesis = Block::genesis(validators.clone(), 1_700_000_000_000).unwrap();

    let votes = vec![signed_tx(&keys[0], 0), signed_tx(&keys[1], 0)];
    let a = Block::new(
        1,
        1,
        genesis.timestamp + 20_000,
        genesis.hash,
        keys[0].address().into(),
        validators.clone(),
        Vec::new(),
        votes.clone(),
        0,
        0,
        None,
    )
    .unwrap();
    let mut reversed = votes;
    reversed.reverse();
    let b = Block::new(
        1,
        1,
        genesis.timestamp + 20_000,
        genesis.hash,
        keys[0].address().into(),
        validators,
        Vec::new(),
        reversed,
        0,
        0,
        None,
    )
    .unwrap();

    assert_ne!(a.last_votes_hash(), b.last_votes_hash());
    assert_ne!(a.hash, b.hash);
}

#[test]
fn json_round_trip() {
    let (validators, keys) = validator_set(3);
    let genesis = Block::genesis(validators, 1_700_000_000_000).unwrap();
    let block = child_block(&genesis, &keys[0], 1);

    let encoded = serde_json::to_string(&block).unwrap();
    let decoded: Block = serde_json::from_str(&encoded).unwrap();
    assert_eq!(decoded, block);
    decoded.validate_basic().unwrap();
}
