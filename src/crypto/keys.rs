//! Fee-payer key management
//!
//! The fee payer is the only conventional (ed25519) key in the system. It
//! pays for and co-signs every transaction; authority over the multisig
//! itself always comes from a passkey.

use solana_sdk::signature::Keypair;
use thiserror::Error;

/// Errors that can occur during key operations
#[derive(Error, Debug)]
pub enum KeyError {
    #[error("Invalid secret key: {0}")]
    InvalidSecretKey(String),
    #[error("Invalid public key: {0}")]
    InvalidPublicKey(String),
    #[error("Invalid signature: {0}")]
    InvalidSignature(String),
}

/// Parse a fee-payer keypair from its textual secret
///
/// Two encodings are accepted:
/// - a comma-separated list of 64 (or 65, trailing byte ignored) decimal bytes
/// - a base58 string of the 64-byte keypair
pub fn fee_payer_from_secret(secret: &str) -> Result<Keypair, KeyError> {
    let secret = secret.trim();
    if secret.is_empty() {
        return Err(KeyError::InvalidSecretKey("secret is empty".to_string()));
    }

    let mut bytes = if secret.contains(',') {
        secret
            .split(',')
            .map(|s| s.trim().parse::<u8>())
            .collect::<Result<Vec<u8>, _>>()
            .map_err(|e| KeyError::InvalidSecretKey(format!("bad byte list: {}", e)))?
    } else {
        bs58::decode(secret)
            .into_vec()
            .map_err(|e| KeyError::InvalidSecretKey(format!("bad base58: {}", e)))?
    };

    if bytes.len() == 65 {
        bytes.truncate(64);
    }
    if bytes.len() != 64 {
        return Err(KeyError::InvalidSecretKey(format!(
            "expected 64 or 65 bytes, got {}",
            bytes.len()
        )));
    }

    Keypair::try_from(bytes.as_slice()).map_err(|e| KeyError::InvalidSecretKey(e.to_string()))
}

/// Load the fee payer, falling back to a fresh ephemeral keypair
pub fn load_fee_payer(secret: Option<&str>) -> Result<Keypair, KeyError> {
    match secret {
        Some(secret) => fee_payer_from_secret(secret),
        None => {
            log::warn!("No fee payer secret configured, generating an ephemeral keypair");
            Ok(Keypair::new())
        }
    }
}
