//! On-chain account decoding
//!
//! Program accounts start with an 8-byte discriminator,
//! `sha256("account:<TypeName>")[..8]`, followed by Borsh fields.
//! Accounts may be allocated larger than their current contents, so
//! decoding tolerates trailing bytes.

use crate::crypto::{discriminator, COMPRESSED_PUBKEY_SIZE};
use crate::multisig::instructions::ProposalParams;
use borsh::{BorshDeserialize, BorshSerialize};
use solana_sdk::pubkey::Pubkey;
use thiserror::Error;

/// Account type names used for discriminators
pub const MULTISIG_ACCOUNT_NAME: &str = "MultiSigWallet";
pub const GUARDIAN_ACCOUNT_NAME: &str = "Guardian";
pub const PROPOSAL_ACCOUNT_NAME: &str = "TransactionProposal";
pub const APPROVAL_ACCOUNT_NAME: &str = "ProposalSignature";

/// Byte offset of `transaction_nonce` in a multisig account
pub const TRANSACTION_NONCE_OFFSET: usize = 19;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum AccountError {
    #[error("Account data too short: {0} bytes")]
    TooShort(usize),
    #[error("Account discriminator does not match {0}")]
    WrongDiscriminator(&'static str),
    #[error("Malformed account data: {0}")]
    Malformed(String),
}

/// State of a multisig wallet account
#[derive(BorshSerialize, BorshDeserialize, Debug, Clone, PartialEq, Eq)]
pub struct MultisigAccount {
    pub threshold: u8,
    pub guardian_count: u8,
    pub recovery_nonce: u64,
    pub bump: u8,
    pub transaction_nonce: u64,
    pub last_transaction_timestamp: i64,
    pub owner: [u8; 32],
    pub credential_id: String,
}

/// State of one guardian slot
#[derive(BorshSerialize, BorshDeserialize, Clone, PartialEq, Eq)]
pub struct GuardianAccount {
    pub wallet: [u8; 32],
    pub guardian_id: u64,
    pub name: String,
    pub is_active: bool,
    pub recovery_hash: [u8; 32],
    pub is_owner: bool,
    pub webauthn_pubkey: Option<[u8; COMPRESSED_PUBKEY_SIZE]>,
    pub bump: u8,
}

impl std::fmt::Debug for GuardianAccount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuardianAccount")
            .field("wallet", &Pubkey::new_from_array(self.wallet))
            .field("guardian_id", &self.guardian_id)
            .field("name", &self.name)
            .field("is_active", &self.is_active)
            .field("is_owner", &self.is_owner)
            .field("has_webauthn_pubkey", &self.webauthn_pubkey.is_some())
            .finish()
    }
}

/// Lifecycle of a proposal, stored as one byte
#[derive(BorshSerialize, BorshDeserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProposalStatus {
    Pending,
    Executed,
    Rejected,
    Expired,
}

/// A transaction proposal awaiting guardian approvals
#[derive(BorshSerialize, BorshDeserialize, Debug, Clone, PartialEq, Eq)]
pub struct ProposalAccount {
    pub multisig: [u8; 32],
    pub proposal_id: u64,
    pub description: String,
    pub action: String,
    pub status: ProposalStatus,
    pub signatures_count: u8,
    pub required_signatures: u8,
    pub created_at: i64,
    /// Address of the proposing guardian
    pub proposer: [u8; 32],
    pub params: ProposalParams,
    pub executed_at: Option<i64>,
    pub bump: u8,
}

/// One guardian's approval of a proposal
#[derive(BorshSerialize, BorshDeserialize, Debug, Clone, PartialEq, Eq)]
pub struct ApprovalAccount {
    pub proposal: [u8; 32],
    pub guardian_id: u64,
    pub signed_at: i64,
    pub bump: u8,
}

fn decode<T: BorshDeserialize>(data: &[u8], name: &'static str) -> Result<T, AccountError> {
    if data.len() < 8 {
        return Err(AccountError::TooShort(data.len()));
    }
    if data[..8] != discriminator("account", name) {
        return Err(AccountError::WrongDiscriminator(name));
    }
    let mut rest = &data[8..];
    T::deserialize(&mut rest).map_err(|e| AccountError::Malformed(e.to_string()))
}

fn encode<T: BorshSerialize>(value: &T, name: &str) -> Vec<u8> {
    let mut data = discriminator("account", name).to_vec();
    let _ = value.serialize(&mut data);
    data
}

impl MultisigAccount {
    /// Decode from raw account data
    pub fn decode(data: &[u8]) -> Result<Self, AccountError> {
        decode(data, MULTISIG_ACCOUNT_NAME)
    }

    /// Encode to raw account data
    pub fn encode(&self) -> Vec<u8> {
        encode(self, MULTISIG_ACCOUNT_NAME)
    }

    pub fn owner(&self) -> Pubkey {
        Pubkey::new_from_array(self.owner)
    }

    /// Nonce the next transfer must carry
    pub fn next_transfer_nonce(&self) -> u64 {
        self.transaction_nonce.saturating_add(1)
    }
}

impl GuardianAccount {
    /// Decode from raw account data
    pub fn decode(data: &[u8]) -> Result<Self, AccountError> {
        decode(data, GUARDIAN_ACCOUNT_NAME)
    }

    /// Encode to raw account data
    pub fn encode(&self) -> Vec<u8> {
        encode(self, GUARDIAN_ACCOUNT_NAME)
    }

    pub fn wallet(&self) -> Pubkey {
        Pubkey::new_from_array(self.wallet)
    }
}

impl ProposalAccount {
    pub fn decode(data: &[u8]) -> Result<Self, AccountError> {
        decode(data, PROPOSAL_ACCOUNT_NAME)
    }

    pub fn encode(&self) -> Vec<u8> {
        encode(self, PROPOSAL_ACCOUNT_NAME)
    }

    pub fn is_approved(&self) -> bool {
        self.signatures_count >= self.required_signatures
    }
}

impl ApprovalAccount {
    pub fn decode(data: &[u8]) -> Result<Self, AccountError> {
        decode(data, APPROVAL_ACCOUNT_NAME)
    }

    pub fn encode(&self) -> Vec<u8> {
        encode(self, APPROVAL_ACCOUNT_NAME)
    }
}

/// Read only the transaction nonce, without decoding the whole account
pub fn read_transaction_nonce(data: &[u8]) -> Result<u64, AccountError> {
    let bytes = data
        .get(TRANSACTION_NONCE_OFFSET..TRANSACTION_NONCE_OFFSET + 8)
        .ok_or(AccountError::TooShort(data.len()))?;
    let mut nonce = [0u8; 8];
    nonce.copy_from_slice(bytes);
    Ok(u64::from_le_bytes(nonce))
}
