//! Hashing utilities for the wallet client
//!
//! Provides the SHA-256 helpers used for WebAuthn client-data hashing,
//! recovery-phrase hashing and Anchor instruction discriminators.

use sha2::{Digest, Sha256};

/// Computes SHA-256 hash of the input data
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Computes SHA-256 hash and returns it as a hex string
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(sha256(data))
}

/// Hash a guardian recovery phrase into the 32-byte value stored on-chain
///
/// The phrase is truncated (or zero padded) to exactly 32 bytes before
/// hashing, which is what the wallet program expects to compare against.
pub fn hash_recovery_phrase(phrase: &str) -> [u8; 32] {
    let bytes = phrase.as_bytes();
    let mut input = [0u8; 32];
    let len = bytes.len().min(32);
    input[..len].copy_from_slice(&bytes[..len]);
    sha256(&input)
}

/// Anchor-style 8-byte discriminator: `sha256("<namespace>:<name>")[..8]`
pub fn discriminator(namespace: &str, name: &str) -> [u8; 8] {
    let hash = sha256(format!("{}:{}", namespace, name).as_bytes());
    let mut out = [0u8; 8];
    out.copy_from_slice(&hash[..8]);
    out
}
