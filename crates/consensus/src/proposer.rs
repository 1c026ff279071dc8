//! Deterministic stake-weighted proposer selection.
//!
//! For epoch `E` extending block `B`, the seed is
//! `keccak256(B.last_votes_hash || E_le_bytes)`. A ChaCha20 PRNG over the
//! seed draws uniformly in `[0, total_stake)`; validators are walked in
//! canonical (byte-lexicographic address) order summing stake, and the
//! first whose cumulative stake exceeds the draw proposes. Every node
//! computing this over the same snapshot picks the same validator.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use std::collections::BTreeMap;

use triad_types::{Address, H256, Stake};

/// Selects the proposer for `epoch` from `validators`, seeded by the
/// extended block's `last_votes_hash`. `None` when the set is empty or
/// carries no stake.
pub fn select_proposer(
    validators: &BTreeMap<Address, Stake>,
    last_votes_hash: &H256,
    epoch: u64,
) -> Option<Address> {
    let total: u128 = validators.values().map(|s| *s as u128).sum();
    if total == 0 {
        return None;
    }

    let seed = triad_crypto::keccak256_concat(&[
        last_votes_hash.as_bytes(),
        &epoch.to_le_bytes(),
    ]);
    let mut rng = ChaCha20Rng::from_seed(seed);
    let draw: u128 = rng.gen_range(0..total);

    // BTreeMap iterates in address order, which is the canonical order.
    let mut cumulative: u128 = 0;
    for (addr, stake) in validators {
        cumulative += *stake as u128;
        if cumulative > draw {
            return Some(*addr);
        }
    }
    // Unreachable: the final cumulative sum equals total > draw.
    None
}
