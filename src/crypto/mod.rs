//! Cryptographic utilities for the wallet client
//!
//! This module provides:
//! - SHA-256 hashing (client data, recovery phrases, discriminators)
//! - Fee-payer key loading (ed25519)
//! - secp256r1 signature and public key normalization for passkeys

pub mod hash;
pub mod keys;
pub mod secp256r1;

pub use hash::{discriminator, hash_recovery_phrase, sha256, sha256_hex};
pub use keys::{fee_payer_from_secret, load_fee_payer, KeyError};
pub use secp256r1::{
    compress_public_key, der_to_raw, flip_parity, is_low_s, normalize_low_s,
    signature_from_bytes, COMPRESSED_PUBKEY_SIZE, SECP256R1_HALF_ORDER, SECP256R1_ORDER,
    SIGNATURE_SIZE,
};
