//! Keccak256 hashing helpers.

use sha3::{Digest, Keccak256};

/// Computes the Keccak256 hash of the given data.
pub fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(data);
    let result = hasher.finalize();
    let mut bytes = [0u8; 32];
    bytes.copy_from_slice(&result);
    bytes
}

/// Computes the Keccak256 hash of multiple data slices.
///
/// Equivalent to hashing the concatenation, without allocating it.
pub fn keccak256_concat(data: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    for slice in data {
        hasher.update(slice);
    }
    let result = hasher.finalize();
    let mut bytes = [0u8; 32];
    bytes.copy_from_slice(&result);
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn concat_matches_contiguous() {
        let whole = keccak256(b"hello world");
        let parts = keccak256_concat(&[b"hello", b" ", b"world"]);
        assert_eq!(whole, parts);
    }

    #[test]
    fn empty_input_is_stable() {
        assert_eq!(keccak256(b""), keccak256_concat(&[]));
    }
}
