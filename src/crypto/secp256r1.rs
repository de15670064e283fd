//! secp256r1 (P-256) helpers for WebAuthn credentials
//!
//! Passkeys sign with P-256. The on-chain verification program accepts only
//! compressed public keys and low-S `r || s` signatures, while
//! authenticators hand out uncompressed keys and DER signatures of either
//! S form. Everything here bridges that gap.

use super::keys::KeyError;
use p256::elliptic_curve::bigint::Encoding;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::U256;

/// Size of a compressed SEC1 public key
pub const COMPRESSED_PUBKEY_SIZE: usize = 33;
/// Size of an uncompressed SEC1 public key
pub const UNCOMPRESSED_PUBKEY_SIZE: usize = 65;
/// Size of a raw `r || s` signature
pub const SIGNATURE_SIZE: usize = 64;

/// Order `n` of the P-256 group
pub const SECP256R1_ORDER: U256 =
    U256::from_be_hex("FFFFFFFF00000000FFFFFFFFFFFFFFFFBCE6FAADA7179E84F3B9CAC2FC632551");

/// `n / 2`, the largest canonical S value
pub const SECP256R1_HALF_ORDER: U256 = SECP256R1_ORDER.shr_vartime(1);

/// Check whether the S half of a raw signature is already canonical
pub fn is_low_s(signature: &[u8; SIGNATURE_SIZE]) -> bool {
    U256::from_be_slice(&signature[32..]) <= SECP256R1_HALF_ORDER
}

/// Normalize a raw `r || s` signature to its low-S form
///
/// When `s > n/2` the signature is rewritten as `r || (n - s)`, which is the
/// other valid signature for the same message and key. Low-S input is
/// returned unchanged, so the function is idempotent.
pub fn normalize_low_s(signature: &[u8; SIGNATURE_SIZE]) -> [u8; SIGNATURE_SIZE] {
    if is_low_s(signature) {
        return *signature;
    }

    let s = U256::from_be_slice(&signature[32..]);
    let low_s = SECP256R1_ORDER.wrapping_sub(&s);

    let mut normalized = [0u8; SIGNATURE_SIZE];
    normalized[..32].copy_from_slice(&signature[..32]);
    normalized[32..].copy_from_slice(&low_s.to_be_bytes());
    normalized
}

/// Convert a DER-encoded ECDSA signature to raw `r || s`
pub fn der_to_raw(der: &[u8]) -> Result<[u8; SIGNATURE_SIZE], KeyError> {
    let signature = p256::ecdsa::Signature::from_der(der)
        .map_err(|e| KeyError::InvalidSignature(format!("malformed DER: {}", e)))?;

    let mut raw = [0u8; SIGNATURE_SIZE];
    raw.copy_from_slice(&signature.to_bytes());
    Ok(raw)
}

/// Accept a signature either as raw 64 bytes or as DER
pub fn signature_from_bytes(bytes: &[u8]) -> Result<[u8; SIGNATURE_SIZE], KeyError> {
    if bytes.len() == SIGNATURE_SIZE {
        let mut raw = [0u8; SIGNATURE_SIZE];
        raw.copy_from_slice(bytes);
        return Ok(raw);
    }
    if bytes.first() == Some(&0x30) {
        return der_to_raw(bytes);
    }
    Err(KeyError::InvalidSignature(format!(
        "expected 64 raw bytes or DER, got {} bytes",
        bytes.len()
    )))
}

/// Compress a P-256 public key to its 33-byte SEC1 form
///
/// Accepts a 65-byte uncompressed key (0x04 prefix) or an already
/// compressed key. The point is validated to lie on the curve.
pub fn compress_public_key(bytes: &[u8]) -> Result<[u8; COMPRESSED_PUBKEY_SIZE], KeyError> {
    if bytes.len() != COMPRESSED_PUBKEY_SIZE && bytes.len() != UNCOMPRESSED_PUBKEY_SIZE {
        return Err(KeyError::InvalidPublicKey(format!(
            "expected {} or {} bytes, got {}",
            COMPRESSED_PUBKEY_SIZE,
            UNCOMPRESSED_PUBKEY_SIZE,
            bytes.len()
        )));
    }

    let key = p256::PublicKey::from_sec1_bytes(bytes)
        .map_err(|_| KeyError::InvalidPublicKey("not a point on P-256".to_string()))?;

    let mut compressed = [0u8; COMPRESSED_PUBKEY_SIZE];
    compressed.copy_from_slice(key.to_encoded_point(true).as_bytes());
    Ok(compressed)
}

/// Swap the parity prefix of a compressed key (0x02 <-> 0x03)
pub fn flip_parity(public_key: &[u8; COMPRESSED_PUBKEY_SIZE]) -> [u8; COMPRESSED_PUBKEY_SIZE] {
    let mut flipped = *public_key;
    flipped[0] ^= 0x01;
    flipped
}
