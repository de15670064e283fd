//! Program-derived address (PDA) derivation
//!
//! Addresses for the multisig account, every guardian slot, proposals and
//! their approvals are pure functions of their seeds and the wallet
//! program id. The seed layout has
//! to match the deployed program byte for byte, otherwise the derived
//! addresses silently point at accounts the program never created.

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use solana_sdk::pubkey::Pubkey;
use thiserror::Error;

/// Seed constants for PDA derivation
pub mod seeds {
    pub const SEED_MULTISIG: &[u8] = b"multisig";
    pub const SEED_GUARDIAN: &[u8] = b"guardian";
    pub const SEED_PROPOSAL: &[u8] = b"proposal";
    pub const SEED_SIGNATURE: &[u8] = b"signature";
}

/// Credential ids are folded into this many bytes so that
/// `"multisig" + seed` stays within the 32-byte seed limit
pub const CREDENTIAL_SEED_LEN: usize = 24;

/// Maximum credential id length the program accepts
pub const MAX_CREDENTIAL_ID_LEN: usize = 64;

/// The deployed wallet program
pub const DEFAULT_PROGRAM_ID: &str = "5tFJskbgqrPxb992SUf6JzcQWJGbJuvsta2pRnZBcygN";

/// Errors raised while preparing seed material
#[derive(Error, Debug, PartialEq, Eq)]
pub enum AddressError {
    #[error("Credential id is empty")]
    EmptyCredentialId,
    #[error("Credential id is {0} bytes, at most 64 allowed")]
    CredentialIdTooLong(usize),
    #[error("Credential id is not valid base64")]
    InvalidCredentialId,
    #[error("Invalid program id: {0}")]
    InvalidProgramId(String),
}

/// Fold a credential id into the fixed-width multisig seed
///
/// Short ids are copied and zero padded; longer ids are XOR-folded
/// (`seed[i % 24] ^= byte`).
pub fn credential_seed(credential_id: &[u8]) -> [u8; CREDENTIAL_SEED_LEN] {
    let mut seed = [0u8; CREDENTIAL_SEED_LEN];
    if credential_id.len() > CREDENTIAL_SEED_LEN {
        for (i, byte) in credential_id.iter().enumerate() {
            seed[i % CREDENTIAL_SEED_LEN] ^= *byte;
        }
    } else {
        seed[..credential_id.len()].copy_from_slice(credential_id);
    }
    seed
}

/// Check that a credential id is well-formed base64 of an acceptable size
pub fn validate_credential_id(credential_id_base64: &str) -> Result<(), AddressError> {
    if credential_id_base64.is_empty() {
        return Err(AddressError::EmptyCredentialId);
    }
    if credential_id_base64.len() > MAX_CREDENTIAL_ID_LEN {
        return Err(AddressError::CredentialIdTooLong(
            credential_id_base64.len(),
        ));
    }
    // Passkey raw ids arrive as standard or url-safe base64
    STANDARD
        .decode(credential_id_base64)
        .or_else(|_| URL_SAFE_NO_PAD.decode(credential_id_base64))
        .map_err(|_| AddressError::InvalidCredentialId)?;
    Ok(())
}

/// Derives multisig and guardian addresses for one wallet program
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressDeriver {
    program_id: Pubkey,
}

impl AddressDeriver {
    /// Create a deriver for the given program
    pub fn new(program_id: Pubkey) -> Self {
        Self { program_id }
    }

    /// Create a deriver from a base58 program id
    pub fn from_program_id(program_id: &str) -> Result<Self, AddressError> {
        let program_id = program_id
            .parse::<Pubkey>()
            .map_err(|e| AddressError::InvalidProgramId(e.to_string()))?;
        Ok(Self::new(program_id))
    }

    /// The wallet program addresses are derived for
    pub fn program_id(&self) -> &Pubkey {
        &self.program_id
    }

    /// Derive the multisig address owned by a passkey credential
    ///
    /// Seeds: `["multisig", credential_seed(credential id)]`. The program
    /// folds the credential id exactly as it receives it in
    /// `initialize_multisig`, i.e. the base64 text.
    pub fn multisig_address(
        &self,
        owner_credential_id_base64: &str,
    ) -> Result<(Pubkey, u8), AddressError> {
        validate_credential_id(owner_credential_id_base64)?;
        let seed = credential_seed(owner_credential_id_base64.as_bytes());
        Ok(Pubkey::find_program_address(
            &[seeds::SEED_MULTISIG, &seed],
            &self.program_id,
        ))
    }

    /// Derive the address of guardian slot `guardian_id`
    ///
    /// Seeds: `["guardian", multisig address, guardian_id as u64 LE]`.
    pub fn guardian_address(&self, multisig: &Pubkey, guardian_id: u64) -> (Pubkey, u8) {
        Pubkey::find_program_address(
            &[
                seeds::SEED_GUARDIAN,
                multisig.as_ref(),
                &guardian_id.to_le_bytes(),
            ],
            &self.program_id,
        )
    }
}

impl AddressDeriver {
    /// Derive the address of proposal `proposal_id`
    ///
    /// Seeds: `["proposal", multisig address, proposal_id as u64 LE]`.
    pub fn proposal_address(&self, multisig: &Pubkey, proposal_id: u64) -> (Pubkey, u8) {
        Pubkey::find_program_address(
            &[
                seeds::SEED_PROPOSAL,
                multisig.as_ref(),
                &proposal_id.to_le_bytes(),
            ],
            &self.program_id,
        )
    }

    /// Derive the record of one guardian's approval of a proposal
    ///
    /// Seeds: `["signature", proposal address, guardian_id as u64 LE]`.
    /// The account existing is what stops a guardian approving twice.
    pub fn signature_address(&self, proposal: &Pubkey, guardian_id: u64) -> (Pubkey, u8) {
        Pubkey::find_program_address(
            &[
                seeds::SEED_SIGNATURE,
                proposal.as_ref(),
                &guardian_id.to_le_bytes(),
            ],
            &self.program_id,
        )
    }
}

impl Default for AddressDeriver {
    fn default() -> Self {
        Self::new(solana_sdk::pubkey!("5tFJskbgqrPxb992SUf6JzcQWJGbJuvsta2pRnZBcygN"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CREDENTIAL: &str = "AQIDBAUGBwgJCgsMDQ4PEA==";

    #[test]
    fn test_default_program_id() {
        let deriver = AddressDeriver::default();
        assert_eq!(deriver.program_id().to_string(), DEFAULT_PROGRAM_ID);
    }

    #[test]
    fn test_multisig_address_determinism() {
        let deriver = AddressDeriver::default();
        let (a, bump_a) = deriver.multisig_address(CREDENTIAL).unwrap();
        let (b, bump_b) = deriver.multisig_address(CREDENTIAL).unwrap();
        assert_eq!(a, b);
        assert_eq!(bump_a, bump_b);

        let (other, _) = deriver.multisig_address("BQYHCAkKCwwNDg8QERITFA==").unwrap();
        assert_ne!(a, other);
    }

    #[test]
    fn test_multisig_address_matches_seed_layout() {
        let deriver = AddressDeriver::default();
        let seed = credential_seed(CREDENTIAL.as_bytes());
        let expected =
            Pubkey::find_program_address(&[b"multisig", &seed], deriver.program_id());
        assert_eq!(deriver.multisig_address(CREDENTIAL).unwrap(), expected);
    }

    #[test]
    fn test_multisig_address_rejects_bad_credential() {
        let deriver = AddressDeriver::default();
        assert_eq!(
            deriver.multisig_address(""),
            Err(AddressError::EmptyCredentialId)
        );
        assert_eq!(
            deriver.multisig_address("!!not base64!!"),
            Err(AddressError::InvalidCredentialId)
        );
        let long = "A".repeat(68);
        assert_eq!(
            deriver.multisig_address(&long),
            Err(AddressError::CredentialIdTooLong(68))
        );
    }

    #[test]
    fn test_url_safe_credential_accepted() {
        let deriver = AddressDeriver::default();
        assert!(deriver.multisig_address("q-_w3Q").is_ok());
    }

    #[test]
    fn test_credential_seed_padding_and_folding() {
        let short = credential_seed(b"abc");
        assert_eq!(&short[..3], b"abc");
        assert!(short[3..].iter().all(|b| *b == 0));

        let long: Vec<u8> = (0u8..30).collect();
        let folded = credential_seed(&long);
        // bytes 24..30 fold back onto 0..6
        for i in 0..6 {
            assert_eq!(folded[i], (i as u8) ^ (i as u8 + 24));
        }
        for i in 6..24 {
            assert_eq!(folded[i], i as u8);
        }
    }

    #[test]
    fn test_guardian_addresses_are_distinct() {
        let deriver = AddressDeriver::default();
        let (multisig, _) = deriver.multisig_address(CREDENTIAL).unwrap();

        let (g1, _) = deriver.guardian_address(&multisig, 1);
        let (g2, _) = deriver.guardian_address(&multisig, 2);
        assert_ne!(g1, g2);
        assert_eq!(deriver.guardian_address(&multisig, 1).0, g1);

        // Same id under a different multisig lands elsewhere
        let other = Pubkey::new_unique();
        assert_ne!(deriver.guardian_address(&other, 1).0, g1);
    }

    #[test]
    fn test_guardian_seed_is_little_endian_u64() {
        let deriver = AddressDeriver::default();
        let multisig = Pubkey::new_unique();
        let id: u64 = 0x0102;
        let expected = Pubkey::find_program_address(
            &[b"guardian", multisig.as_ref(), &[0x02, 0x01, 0, 0, 0, 0, 0, 0]],
            deriver.program_id(),
        );
        assert_eq!(deriver.guardian_address(&multisig, id), expected);
    }

    #[test]
    fn test_proposal_and_signature_seeds() {
        let deriver = AddressDeriver::default();
        let multisig = Pubkey::new_unique();
        let proposal_id: u64 = 1_700_000_000_123;

        let (proposal, _) = deriver.proposal_address(&multisig, proposal_id);
        let expected = Pubkey::find_program_address(
            &[b"proposal", multisig.as_ref(), &proposal_id.to_le_bytes()],
            deriver.program_id(),
        );
        assert_eq!(proposal, expected.0);
        assert_ne!(proposal, deriver.proposal_address(&multisig, proposal_id + 1).0);
        // Proposal and guardian ids share no address space
        assert_ne!(proposal, deriver.guardian_address(&multisig, proposal_id).0);

        let (approval, _) = deriver.signature_address(&proposal, 2);
        let expected = Pubkey::find_program_address(
            &[b"signature", proposal.as_ref(), &2u64.to_le_bytes()],
            deriver.program_id(),
        );
        assert_eq!(approval, expected.0);
        assert_ne!(approval, deriver.signature_address(&proposal, 3).0);
    }
}
