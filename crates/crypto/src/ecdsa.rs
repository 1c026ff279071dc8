//! ECDSA signing and recovery on secp256k1.
//!
//! Signatures are 65 bytes (`r || s || v`) where `v` is the recovery id.
//! Recovery re-derives the signer's public key from the signature and the
//! message digest, which is how the protocol authenticates transactions and
//! handshakes without shipping public keys on the wire.

use k256::ecdsa::{RecoveryId, Signature as K256Signature, SigningKey, VerifyingKey};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use k256::SecretKey;
use rand::rngs::OsRng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

use crate::hash::keccak256;
use crate::{CryptoError, Result};

/// A raw 20-byte account address, before the `triad-types` newtype wraps it.
pub type RawAddress = [u8; 20];

/// ECDSA private key (32 bytes).
#[derive(Clone)]
pub struct PrivateKey {
    inner: SigningKey,
}

impl PrivateKey {
    /// Generate a random private key using the OS RNG.
    pub fn random() -> Self {
        let secret = SecretKey::random(&mut OsRng);
        Self {
            inner: SigningKey::from(secret),
        }
    }

    /// Create a private key from raw bytes.
    pub fn from_bytes(bytes: &[u8; 32]) -> Result<Self> {
        let secret = SecretKey::from_bytes(bytes.into())
            .map_err(|e| CryptoError::InvalidPrivateKey(e.to_string()))?;
        Ok(Self {
            inner: SigningKey::from(secret),
        })
    }

    /// Create a private key from a hex string, with or without `0x` prefix.
    pub fn from_hex(hex_str: &str) -> Result<Self> {
        let hex_str = hex_str.strip_prefix("0x").unwrap_or(hex_str);
        let bytes = hex::decode(hex_str)?;
        if bytes.len() != 32 {
            return Err(CryptoError::InvalidLength {
                expected: 32,
                actual: bytes.len(),
            });
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Self::from_bytes(&arr)
    }

    /// Raw bytes of the private key.
    pub fn to_bytes(&self) -> [u8; 32] {
        self.inner.to_bytes().into()
    }

    /// The corresponding public key.
    pub fn public_key(&self) -> PublicKey {
        PublicKey {
            inner: *self.inner.verifying_key(),
        }
    }

    /// The address derived from the public key.
    pub fn address(&self) -> RawAddress {
        self.public_key().to_address()
    }

    /// Sign a 32-byte digest, producing a recoverable signature.
    pub fn sign_digest(&self, digest: &[u8; 32]) -> Result<Signature> {
        let (sig, recid) = self
            .inner
            .sign_prehash_recoverable(digest)
            .map_err(|e| CryptoError::InvalidSignature(e.to_string()))?;
        Ok(Signature::from_parts(sig, recid))
    }

    /// Hash a message with keccak256, then sign the digest.
    pub fn sign(&self, message: &[u8]) -> Result<Signature> {
        self.sign_digest(&keccak256(message))
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never print key material.
        write!(f, "PrivateKey(..)")
    }
}

/// ECDSA public key.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PublicKey {
    inner: VerifyingKey,
}

impl PublicKey {
    /// Derive the 20-byte address: low 20 bytes of
    /// `keccak256(uncompressed_point[1..])`.
    pub fn to_address(&self) -> RawAddress {
        let point = self.inner.to_encoded_point(false);
        let digest = keccak256(&point.as_bytes()[1..]);
        let mut addr = [0u8; 20];
        addr.copy_from_slice(&digest[12..]);
        addr
    }

    /// SEC1 compressed encoding (33 bytes).
    pub fn to_compressed_bytes(&self) -> Vec<u8> {
        self.inner.to_encoded_point(true).as_bytes().to_vec()
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey(0x{})", hex::encode(self.to_compressed_bytes()))
    }
}

/// A recoverable ECDSA signature: `r || s || v`, 65 bytes.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Signature {
    bytes: [u8; 65],
}

impl Signature {
    fn from_parts(sig: K256Signature, recid: RecoveryId) -> Self {
        let mut bytes = [0u8; 65];
        bytes[..64].copy_from_slice(&sig.to_bytes());
        bytes[64] = recid.to_byte();
        Self { bytes }
    }

    /// Construct from 65 raw bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != 65 {
            return Err(CryptoError::InvalidLength {
                expected: 65,
                actual: bytes.len(),
            });
        }
        let mut arr = [0u8; 65];
        arr.copy_from_slice(bytes);
        Ok(Self { bytes: arr })
    }

    /// Construct from a hex string, with or without `0x` prefix.
    pub fn from_hex(hex_str: &str) -> Result<Self> {
        let hex_str = hex_str.strip_prefix("0x").unwrap_or(hex_str);
        Self::from_bytes(&hex::decode(hex_str)?)
    }

    /// The raw 65-byte encoding.
    pub fn as_bytes(&self) -> &[u8; 65] {
        &self.bytes
    }

    /// Hex encoding with `0x` prefix.
    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.bytes))
    }

    /// Recover the signer's public key from a 32-byte digest.
    pub fn recover_digest(&self, digest: &[u8; 32]) -> Result<PublicKey> {
        let sig = K256Signature::from_slice(&self.bytes[..64])
            .map_err(|e| CryptoError::InvalidSignature(e.to_string()))?;
        let recid = RecoveryId::from_byte(self.bytes[64])
            .ok_or_else(|| CryptoError::InvalidSignature("bad recovery id".into()))?;
        let key = VerifyingKey::recover_from_prehash(digest, &sig, recid)
            .map_err(|e| CryptoError::InvalidSignature(e.to_string()))?;
        Ok(PublicKey { inner: key })
    }

    /// Recover the signer address from a 32-byte digest.
    pub fn recover_address(&self, digest: &[u8; 32]) -> Result<RawAddress> {
        Ok(self.recover_digest(digest)?.to_address())
    }

    /// Hash a message with keccak256, then recover the signer address.
    pub fn recover(&self, message: &[u8]) -> Result<RawAddress> {
        self.recover_address(&keccak256(message))
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({})", self.to_hex())
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl Serialize for Signature {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Signature {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_recover_round_trip() {
        let key = PrivateKey::random();
        let sig = key.sign(b"triad handshake").unwrap();
        let recovered = sig.recover(b"triad handshake").unwrap();
        assert_eq!(recovered, key.address());
    }

    #[test]
    fn recover_with_wrong_message_yields_different_address() {
        let key = PrivateKey::random();
        let sig = key.sign(b"message a").unwrap();
        let recovered = sig.recover(b"message b").unwrap();
        assert_ne!(recovered, key.address());
    }

    #[test]
    fn signature_hex_round_trip() {
        let key = PrivateKey::random();
        let sig = key.sign(b"payload").unwrap();
        let parsed = Signature::from_hex(&sig.to_hex()).unwrap();
        assert_eq!(parsed, sig);
    }

    #[test]
    fn private_key_hex_round_trip() {
        let key = PrivateKey::random();
        let hex_str = hex::encode(key.to_bytes());
        let restored = PrivateKey::from_hex(&hex_str).unwrap();
        assert_eq!(restored.address(), key.address());
    }
}
