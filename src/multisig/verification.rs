//! secp256r1 signature-verification instruction
//!
//! The ledger's native `Secp256r1SigVerify` program checks a P-256
//! signature carried entirely in its own instruction data. Placing that
//! instruction directly before a wallet instruction lets the wallet program
//! inspect the instructions sysvar and trust that the passkey approved the
//! adjacent operation.
//!
//! Payload layout (all integers little-endian):
//!
//! ```text
//! 0       u8   signature count (1)
//! 1       u8   padding (0)
//! 2..4    u16  signature offset            (16)
//! 4..6    u16  signature instruction index (0xFFFF = this instruction)
//! 6..8    u16  public key offset           (80)
//! 8..10   u16  public key instruction index (0xFFFF)
//! 10..12  u16  message offset              (113)
//! 12..14  u16  message length
//! 14..16  u16  message instruction index   (0xFFFF)
//! 16..80       signature (r || s, low-S)
//! 80..113      compressed public key
//! 113..        message
//! ```

use crate::crypto::{
    compress_public_key, flip_parity, normalize_low_s, sha256, signature_from_bytes, KeyError,
    COMPRESSED_PUBKEY_SIZE, SIGNATURE_SIZE,
};
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use serde::{Deserialize, Serialize};
use solana_sdk::instruction::Instruction;
use solana_sdk::pubkey::Pubkey;
use std::fmt;
use thiserror::Error;

/// Native secp256r1 verification program
pub const SECP256R1_PROGRAM_ID: Pubkey =
    solana_sdk::pubkey!("Secp256r1SigVerify1111111111111111111111111");

/// Header plus the three offset descriptors
pub const DATA_START: usize = 16;
/// Where the offset descriptors begin
pub const SIGNATURE_OFFSETS_START: usize = 2;
/// Descriptor value meaning "data lives in this instruction"
pub const SAME_INSTRUCTION: u16 = 0xFFFF;

const SIGNATURE_OFFSET: usize = DATA_START;
const PUBLIC_KEY_OFFSET: usize = SIGNATURE_OFFSET + SIGNATURE_SIZE;
const MESSAGE_OFFSET: usize = PUBLIC_KEY_OFFSET + COMPRESSED_PUBKEY_SIZE;

/// Largest message the u16 length descriptor can describe
pub const MAX_MESSAGE_LEN: usize = u16::MAX as usize;

/// Errors from encoding the verification payload
#[derive(Error, Debug, PartialEq, Eq)]
pub enum CodecError {
    #[error("Signature must be {expected} bytes, got {actual}")]
    SignatureLength { expected: usize, actual: usize },
    #[error("Public key must be {expected} bytes, got {actual}")]
    PublicKeyLength { expected: usize, actual: usize },
    #[error("Message of {0} bytes does not fit the u16 length descriptor")]
    MessageTooLong(usize),
    #[error("Field {0} is not valid base64")]
    Encoding(&'static str),
}

/// Size of the payload for a message of `message_len` bytes
pub fn payload_len(message_len: usize) -> usize {
    DATA_START + SIGNATURE_SIZE + COMPRESSED_PUBKEY_SIZE + message_len
}

/// Encode the raw verification payload
///
/// `signature` is embedded as given; callers normalize it first (see
/// [`AuthorizationProof`]). When `flip_public_key_parity` is set the key's
/// prefix byte is swapped between 0x02 and 0x03.
pub fn encode_verification_payload(
    message: &[u8],
    public_key: &[u8],
    signature: &[u8],
    flip_public_key_parity: bool,
) -> Result<Vec<u8>, CodecError> {
    if signature.len() != SIGNATURE_SIZE {
        return Err(CodecError::SignatureLength {
            expected: SIGNATURE_SIZE,
            actual: signature.len(),
        });
    }
    if public_key.len() != COMPRESSED_PUBKEY_SIZE {
        return Err(CodecError::PublicKeyLength {
            expected: COMPRESSED_PUBKEY_SIZE,
            actual: public_key.len(),
        });
    }
    if message.len() > MAX_MESSAGE_LEN {
        return Err(CodecError::MessageTooLong(message.len()));
    }

    let mut data = Vec::with_capacity(payload_len(message.len()));
    data.push(1); // signature count
    data.push(0); // padding

    data.extend_from_slice(&(SIGNATURE_OFFSET as u16).to_le_bytes());
    data.extend_from_slice(&SAME_INSTRUCTION.to_le_bytes());

    data.extend_from_slice(&(PUBLIC_KEY_OFFSET as u16).to_le_bytes());
    data.extend_from_slice(&SAME_INSTRUCTION.to_le_bytes());

    data.extend_from_slice(&(MESSAGE_OFFSET as u16).to_le_bytes());
    data.extend_from_slice(&(message.len() as u16).to_le_bytes());
    data.extend_from_slice(&SAME_INSTRUCTION.to_le_bytes());

    data.extend_from_slice(signature);
    if flip_public_key_parity {
        let mut key = [0u8; COMPRESSED_PUBKEY_SIZE];
        key.copy_from_slice(public_key);
        data.extend_from_slice(&flip_parity(&key));
    } else {
        data.extend_from_slice(public_key);
    }
    data.extend_from_slice(message);

    debug_assert_eq!(data.len(), payload_len(message.len()));
    Ok(data)
}

/// Build the verification instruction (no account references)
pub fn encode_verification_instruction(
    message: &[u8],
    public_key: &[u8],
    signature: &[u8],
    flip_public_key_parity: bool,
) -> Result<Instruction, CodecError> {
    let data =
        encode_verification_payload(message, public_key, signature, flip_public_key_parity)?;
    log::debug!(
        "secp256r1 verification instruction: {} bytes, message {} bytes",
        data.len(),
        message.len()
    );
    Ok(Instruction {
        program_id: SECP256R1_PROGRAM_ID,
        accounts: vec![],
        data,
    })
}

/// A passkey assertion as returned by `navigator.credentials.get`
#[derive(Clone)]
pub struct WebAuthnAssertion {
    pub authenticator_data: Vec<u8>,
    pub client_data_json: Vec<u8>,
    /// DER or raw `r || s`
    pub signature: Vec<u8>,
    /// Compressed or uncompressed SEC1 key of the asserting credential
    pub public_key: Vec<u8>,
}

impl WebAuthnAssertion {
    /// The bytes the authenticator actually signed:
    /// `authenticator_data || SHA-256(client_data_json)`
    pub fn verification_message(&self) -> Vec<u8> {
        let client_data_hash = sha256(&self.client_data_json);
        let mut message = Vec::with_capacity(self.authenticator_data.len() + 32);
        message.extend_from_slice(&self.authenticator_data);
        message.extend_from_slice(&client_data_hash);
        message
    }

    /// Normalize key and signature into a proof ready for encoding
    pub fn into_proof(self, flip_public_key_parity: bool) -> Result<AuthorizationProof, KeyError> {
        let message = self.verification_message();
        let public_key = compress_public_key(&self.public_key)?;
        let signature = normalize_low_s(&signature_from_bytes(&self.signature)?);
        Ok(AuthorizationProof {
            message,
            public_key,
            signature,
            flip_public_key_parity,
        })
    }
}

impl fmt::Debug for WebAuthnAssertion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebAuthnAssertion")
            .field("authenticator_data_len", &self.authenticator_data.len())
            .field("client_data_json_len", &self.client_data_json.len())
            .field("signature_len", &self.signature.len())
            .field("public_key", &"<redacted>")
            .finish()
    }
}

/// Signature-verification payload: message, compressed key, low-S signature
#[derive(Clone, PartialEq, Eq)]
pub struct AuthorizationProof {
    pub message: Vec<u8>,
    pub public_key: [u8; COMPRESSED_PUBKEY_SIZE],
    pub signature: [u8; SIGNATURE_SIZE],
    pub flip_public_key_parity: bool,
}

impl AuthorizationProof {
    /// Build a proof from already-prepared parts, normalizing the signature
    pub fn new(
        message: Vec<u8>,
        public_key: [u8; COMPRESSED_PUBKEY_SIZE],
        signature: [u8; SIGNATURE_SIZE],
        flip_public_key_parity: bool,
    ) -> Self {
        Self {
            message,
            public_key,
            signature: normalize_low_s(&signature),
            flip_public_key_parity,
        }
    }

    /// The verification instruction for this proof
    pub fn instruction(&self) -> Result<Instruction, CodecError> {
        encode_verification_instruction(
            &self.message,
            &self.public_key,
            &self.signature,
            self.flip_public_key_parity,
        )
    }
}

impl fmt::Debug for AuthorizationProof {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthorizationProof")
            .field("message_len", &self.message.len())
            .field("public_key", &"<redacted>")
            .field("flip_public_key_parity", &self.flip_public_key_parity)
            .finish()
    }
}

/// Decoded view of a verification payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationPayload<'a> {
    pub signature: &'a [u8],
    pub public_key: &'a [u8],
    pub message: &'a [u8],
}

/// Parse a single-signature payload that references only itself
///
/// Returns `None` for anything the encoder would not have produced.
pub fn decode_verification_payload(data: &[u8]) -> Option<VerificationPayload<'_>> {
    if data.len() < DATA_START || data[0] != 1 {
        return None;
    }
    let read_u16 = |at: usize| u16::from_le_bytes([data[at], data[at + 1]]) as usize;

    let sig_offset = read_u16(2);
    let key_offset = read_u16(6);
    let msg_offset = read_u16(10);
    let msg_len = read_u16(12);
    let same = SAME_INSTRUCTION as usize;
    if read_u16(4) != same || read_u16(8) != same || read_u16(14) != same {
        return None;
    }

    Some(VerificationPayload {
        signature: data.get(sig_offset..sig_offset + SIGNATURE_SIZE)?,
        public_key: data.get(key_offset..key_offset + COMPRESSED_PUBKEY_SIZE)?,
        message: data.get(msg_offset..msg_offset + msg_len)?,
    })
}

/// Decode browser-supplied base64, standard or URL-safe, padded or not
pub fn decode_base64(field: &'static str, text: &str) -> Result<Vec<u8>, CodecError> {
    let trimmed = text.trim().trim_end_matches('=');
    URL_SAFE_NO_PAD
        .decode(trimmed)
        .or_else(|_| STANDARD.decode(text.trim()))
        .map_err(|_| CodecError::Encoding(field))
}

/// A [`WebAuthnAssertion`] as it travels in JSON, every field base64
#[derive(Clone, Serialize, Deserialize)]
pub struct EncodedAssertion {
    pub authenticator_data: String,
    pub client_data_json: String,
    pub signature: String,
    pub public_key: String,
}

impl EncodedAssertion {
    pub fn decode(&self) -> Result<WebAuthnAssertion, CodecError> {
        Ok(WebAuthnAssertion {
            authenticator_data: decode_base64("authenticator_data", &self.authenticator_data)?,
            client_data_json: decode_base64("client_data_json", &self.client_data_json)?,
            signature: decode_base64("signature", &self.signature)?,
            public_key: decode_base64("public_key", &self.public_key)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use p256::ecdsa::{signature::Signer, Signature, SigningKey};
    use rand::rngs::OsRng;

    fn sample_key() -> [u8; 33] {
        let mut key = [0xAB; 33];
        key[0] = 0x02;
        key
    }

    #[test]
    fn test_payload_size_and_header() {
        for len in [0usize, 1, 37, 300] {
            let message = vec![0x5A; len];
            let data =
                encode_verification_payload(&message, &sample_key(), &[0x11; 64], false).unwrap();

            assert_eq!(data.len(), 16 + 64 + 33 + len);
            assert_eq!(data[0], 1);
            assert_eq!(data[1], 0);
            assert_eq!(u16::from_le_bytes([data[2], data[3]]), 16);
            assert_eq!(u16::from_le_bytes([data[4], data[5]]), 0xFFFF);
            assert_eq!(u16::from_le_bytes([data[6], data[7]]), 80);
            assert_eq!(u16::from_le_bytes([data[8], data[9]]), 0xFFFF);
            assert_eq!(u16::from_le_bytes([data[10], data[11]]), 113);
            assert_eq!(u16::from_le_bytes([data[12], data[13]]) as usize, len);
            assert_eq!(u16::from_le_bytes([data[14], data[15]]), 0xFFFF);
        }
    }

    #[test]
    fn test_payload_body_placement() {
        let message = b"authenticator-data||client-hash".to_vec();
        let data =
            encode_verification_payload(&message, &sample_key(), &[0x11; 64], false).unwrap();

        assert_eq!(&data[16..80], &[0x11; 64]);
        assert_eq!(&data[80..113], &sample_key());
        assert_eq!(&data[113..], message.as_slice());
    }

    #[test]
    fn test_parity_flip_only_touches_prefix() {
        let data = encode_verification_payload(b"m", &sample_key(), &[0x11; 64], true).unwrap();
        assert_eq!(data[80], 0x03);
        assert_eq!(&data[81..113], &sample_key()[1..]);
    }

    #[test]
    fn test_malformed_inputs_rejected() {
        assert_eq!(
            encode_verification_payload(b"m", &sample_key(), &[0u8; 63], false),
            Err(CodecError::SignatureLength {
                expected: 64,
                actual: 63
            })
        );
        assert_eq!(
            encode_verification_payload(b"m", &[2u8; 65], &[0u8; 64], false),
            Err(CodecError::PublicKeyLength {
                expected: 33,
                actual: 65
            })
        );
        let huge = vec![0u8; MAX_MESSAGE_LEN + 1];
        assert_eq!(
            encode_verification_payload(&huge, &sample_key(), &[0u8; 64], false),
            Err(CodecError::MessageTooLong(MAX_MESSAGE_LEN + 1))
        );
    }

    #[test]
    fn test_instruction_has_no_accounts() {
        let ix = encode_verification_instruction(b"m", &sample_key(), &[0u8; 64], false).unwrap();
        assert_eq!(ix.program_id, SECP256R1_PROGRAM_ID);
        assert!(ix.accounts.is_empty());
    }

    #[test]
    fn test_decode_matches_encode() {
        let message = vec![9u8; 50];
        let data =
            encode_verification_payload(&message, &sample_key(), &[0x22; 64], false).unwrap();
        let decoded = decode_verification_payload(&data).unwrap();
        assert_eq!(decoded.signature, &[0x22; 64]);
        assert_eq!(decoded.public_key, &sample_key());
        assert_eq!(decoded.message, message.as_slice());

        assert!(decode_verification_payload(&data[..10]).is_none());
        assert!(decode_verification_payload(&data[..100]).is_none());
    }

    #[test]
    fn test_assertion_into_proof() {
        let key = SigningKey::random(&mut OsRng);
        let authenticator_data = vec![0x49; 37];
        let client_data_json = br#"{"type":"webauthn.get","challenge":"abc"}"#.to_vec();

        let mut signed = authenticator_data.clone();
        signed.extend_from_slice(&sha256(&client_data_json));
        let sig: Signature = key.sign(&signed);

        let assertion = WebAuthnAssertion {
            authenticator_data,
            client_data_json,
            signature: sig.to_der().as_bytes().to_vec(),
            public_key: key.verifying_key().to_encoded_point(false).as_bytes().to_vec(),
        };
        assert_eq!(assertion.verification_message(), signed);

        let proof = assertion.into_proof(false).unwrap();
        assert_eq!(proof.message, signed);
        assert_eq!(
            proof.public_key.as_slice(),
            key.verifying_key().to_encoded_point(true).as_bytes()
        );
        assert!(crate::crypto::is_low_s(&proof.signature));

        let ix = proof.instruction().unwrap();
        assert_eq!(ix.data.len(), payload_len(signed.len()));
    }

    #[test]
    fn test_debug_redacts_key_material() {
        let proof = AuthorizationProof::new(vec![1, 2, 3], sample_key(), [0x11; 64], false);
        let rendered = format!("{:?}", proof);
        assert!(rendered.contains("<redacted>"));
        assert!(!rendered.contains("171, 171"));
    }

    #[test]
    fn test_encoded_assertion_accepts_both_alphabets() {
        let encoded = EncodedAssertion {
            authenticator_data: "SUlJSQ".into(),
            client_data_json: "eyJ0eXBlIjoid2ViYXV0aG4uZ2V0In0=".into(),
            signature: "-_8".into(),
            public_key: "+/8=".into(),
        };
        let assertion = encoded.decode().unwrap();
        assert_eq!(assertion.authenticator_data, vec![0x49; 4]);
        assert_eq!(assertion.client_data_json, br#"{"type":"webauthn.get"}"#.to_vec());
        assert_eq!(assertion.signature, vec![0xfb, 0xff]);
        assert_eq!(assertion.public_key, vec![0xfb, 0xff]);

        let bad = EncodedAssertion {
            signature: "not base64!".into(),
            ..encoded
        };
        assert_eq!(bad.decode().unwrap_err(), CodecError::Encoding("signature"));
    }
}
