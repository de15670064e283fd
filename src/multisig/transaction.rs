//! Transaction assembly
//!
//! Builds unsigned ledger transactions for every wallet operation. For
//! operations a passkey must authorize, the secp256r1 verification
//! instruction is placed first so the program can find it through the
//! instructions sysvar. Nothing here touches the network.

use crate::crypto::{sha256, KeyError, COMPRESSED_PUBKEY_SIZE};
use crate::multisig::instructions::{
    self, ActionParams, AddGuardianArgs, ApproveProposalArgs, CreateProposalArgs,
    ExecuteProposalArgs, InitializeMultisigArgs, ProposalParams, RecoverAccessArgs,
    RemoveGuardianArgs, UpdateGuardianStatusArgs, VerifyAndExecuteArgs, TRANSFER_ACTION,
};
use crate::multisig::pda::{AddressDeriver, AddressError};
use crate::multisig::verification::{AuthorizationProof, CodecError};
use solana_sdk::hash::Hash;
use solana_sdk::instruction::Instruction;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::{Keypair, Signer};
use solana_sdk::transaction::Transaction;
use thiserror::Error;

/// Longest guardian display name the program stores
pub const MAX_GUARDIAN_NAME_LEN: usize = 32;

/// Id of the guardian created together with the multisig
pub const OWNER_GUARDIAN_ID: u64 = 1;

/// Longest proposal description the program stores
pub const MAX_PROPOSAL_DESCRIPTION_LEN: usize = 256;

/// Errors raised while assembling a transaction
#[derive(Error, Debug)]
pub enum TransactionError {
    #[error("Missing required field: {0}")]
    MissingField(&'static str),
    #[error("Invalid threshold: {0}")]
    InvalidThreshold(String),
    #[error("Invalid guardian name: {0}")]
    InvalidGuardianName(String),
    #[error("Invalid guardian id: {0}")]
    InvalidGuardianId(u64),
    #[error("Guardian {0} is the owning guardian and cannot be changed")]
    ProtectedGuardian(u64),
    #[error("Amount must be greater than zero")]
    InvalidAmount,
    #[error("Invalid description: {0}")]
    InvalidDescription(String),
    #[error("Fee payer {expected} does not match signer {actual}")]
    FeePayerMismatch { expected: Pubkey, actual: Pubkey },
    #[error("Signing failed: {0}")]
    Signing(String),
    #[error("Address error: {0}")]
    Address(#[from] AddressError),
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("Key error: {0}")]
    Key(#[from] KeyError),
}

/// Everything needed to create a wallet and its owning guardian
#[derive(Clone)]
pub struct NewWallet {
    pub credential_id: String,
    pub threshold: u8,
    pub owner_name: String,
    pub recovery_hash: [u8; 32],
    pub owner_public_key: [u8; COMPRESSED_PUBKEY_SIZE],
}

/// An invited guardian about to be admitted
#[derive(Clone)]
pub struct GuardianAdmission {
    pub multisig: Pubkey,
    pub guardian_id: u64,
    pub name: String,
    pub recovery_hash: [u8; 32],
    pub webauthn_public_key: [u8; COMPRESSED_PUBKEY_SIZE],
}

/// A native-token transfer out of the multisig
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub destination: Pubkey,
    pub amount: u64,
    /// Must exceed the multisig's current transaction nonce
    pub nonce: u64,
    /// Unix seconds
    pub timestamp: i64,
    pub message: Vec<u8>,
}

/// A native-token transfer put up for guardian approval
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProposalRequest {
    pub multisig: Pubkey,
    /// Unique per multisig; millisecond timestamps work
    pub proposal_id: u64,
    pub proposer_guardian_id: u64,
    pub description: String,
    pub destination: Pubkey,
    pub amount: u64,
}

/// One guardian approving a proposal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProposalApproval {
    pub multisig: Pubkey,
    pub proposal_id: u64,
    pub guardian_id: u64,
    /// Unix seconds
    pub timestamp: i64,
}

/// Restoring a guardian's access with its recovery phrase
#[derive(Clone)]
pub struct AccessRecovery {
    pub multisig: Pubkey,
    pub old_guardian_id: u64,
    /// Equal to `old_guardian_id` to replace the passkey in place
    pub new_guardian_id: u64,
    pub recovery_hash: [u8; 32],
    pub new_webauthn_public_key: [u8; COMPRESSED_PUBKEY_SIZE],
}

/// Text a guardian approves a proposal with
///
/// `approve:proposal_<id>,guardian_<id>,timestamp:<ts>,pubkey:<hex>` where
/// the key part is the first 6 bytes of `sha256(passkey public key)`.
pub fn approval_message(
    proposal_id: u64,
    guardian_id: u64,
    timestamp: i64,
    webauthn_public_key: &[u8],
) -> Vec<u8> {
    let key_tag = hex::encode(&sha256(webauthn_public_key)[..6]);
    format!(
        "approve:proposal_{},guardian_{},timestamp:{},pubkey:{}",
        proposal_id, guardian_id, timestamp, key_tag
    )
    .into_bytes()
}

pub fn validate_guardian_name(name: &str) -> Result<(), TransactionError> {
    if name.trim().is_empty() {
        return Err(TransactionError::MissingField("guardian_name"));
    }
    if name.len() > MAX_GUARDIAN_NAME_LEN {
        return Err(TransactionError::InvalidGuardianName(format!(
            "{} bytes, at most {} allowed",
            name.len(),
            MAX_GUARDIAN_NAME_LEN
        )));
    }
    Ok(())
}

fn validate_guardian_id(guardian_id: u64) -> Result<(), TransactionError> {
    if guardian_id == 0 {
        return Err(TransactionError::InvalidGuardianId(guardian_id));
    }
    Ok(())
}

/// Builds wallet transactions for one program and fee payer
#[derive(Debug, Clone, Copy)]
pub struct TransactionBuilder {
    deriver: AddressDeriver,
    fee_payer: Pubkey,
}

impl TransactionBuilder {
    pub fn new(deriver: AddressDeriver, fee_payer: Pubkey) -> Self {
        Self { deriver, fee_payer }
    }

    pub fn deriver(&self) -> &AddressDeriver {
        &self.deriver
    }

    pub fn fee_payer(&self) -> &Pubkey {
        &self.fee_payer
    }

    fn program_id(&self) -> &Pubkey {
        self.deriver.program_id()
    }

    fn transaction(&self, instructions: &[Instruction]) -> Transaction {
        Transaction::new_with_payer(instructions, Some(&self.fee_payer))
    }

    fn initialize_instruction(
        &self,
        credential_id: &str,
        threshold: u8,
    ) -> Result<(Pubkey, Instruction), TransactionError> {
        if threshold == 0 {
            return Err(TransactionError::InvalidThreshold(
                "threshold must be at least 1".to_string(),
            ));
        }
        let (multisig, _) = self.deriver.multisig_address(credential_id)?;
        let args = InitializeMultisigArgs {
            threshold,
            credential_id: credential_id.to_string(),
        };
        let ix = instructions::initialize_multisig(
            self.program_id(),
            &multisig,
            &self.fee_payer,
            &args,
        );
        Ok((multisig, ix))
    }

    /// `initialize_multisig` on its own
    pub fn initialize_multisig(
        &self,
        credential_id: &str,
        threshold: u8,
    ) -> Result<Transaction, TransactionError> {
        let (_, ix) = self.initialize_instruction(credential_id, threshold)?;
        Ok(self.transaction(&[ix]))
    }

    /// Create the multisig and its owning guardian (id 1) in one transaction
    ///
    /// Returns the multisig address alongside the transaction.
    pub fn create_wallet(&self, wallet: &NewWallet) -> Result<(Pubkey, Transaction), TransactionError> {
        validate_guardian_name(&wallet.owner_name)?;
        let (multisig, init) =
            self.initialize_instruction(&wallet.credential_id, wallet.threshold)?;

        let (guardian, _) = self.deriver.guardian_address(&multisig, OWNER_GUARDIAN_ID);
        let args = AddGuardianArgs {
            guardian_id: OWNER_GUARDIAN_ID,
            guardian_name: wallet.owner_name.clone(),
            recovery_hash: wallet.recovery_hash,
            is_owner: true,
            webauthn_pubkey: Some(wallet.owner_public_key),
        };
        let add = instructions::add_guardian(
            self.program_id(),
            &multisig,
            &guardian,
            &self.fee_payer,
            &args,
        );

        log::debug!("Built wallet creation for multisig {}", multisig);
        Ok((multisig, self.transaction(&[init, add])))
    }

    /// Admit an invited guardian, authorized by an owner passkey
    pub fn add_guardian(
        &self,
        admission: &GuardianAdmission,
        proof: &AuthorizationProof,
    ) -> Result<Transaction, TransactionError> {
        validate_guardian_id(admission.guardian_id)?;
        if admission.guardian_id == OWNER_GUARDIAN_ID {
            return Err(TransactionError::ProtectedGuardian(OWNER_GUARDIAN_ID));
        }
        validate_guardian_name(&admission.name)?;

        let (guardian, _) = self
            .deriver
            .guardian_address(&admission.multisig, admission.guardian_id);
        let args = AddGuardianArgs {
            guardian_id: admission.guardian_id,
            guardian_name: admission.name.clone(),
            recovery_hash: admission.recovery_hash,
            is_owner: false,
            webauthn_pubkey: Some(admission.webauthn_public_key),
        };

        let verify = proof.instruction()?;
        let add = instructions::add_guardian(
            self.program_id(),
            &admission.multisig,
            &guardian,
            &self.fee_payer,
            &args,
        );
        Ok(self.transaction(&[verify, add]))
    }

    /// Remove a guardian on behalf of an owner guardian
    pub fn remove_guardian(
        &self,
        multisig: &Pubkey,
        guardian_id: u64,
        owner_guardian_id: u64,
        proof: Option<&AuthorizationProof>,
    ) -> Result<Transaction, TransactionError> {
        validate_guardian_id(guardian_id)?;
        validate_guardian_id(owner_guardian_id)?;
        if guardian_id == OWNER_GUARDIAN_ID {
            return Err(TransactionError::ProtectedGuardian(guardian_id));
        }

        let (guardian, _) = self.deriver.guardian_address(multisig, guardian_id);
        let (owner, _) = self.deriver.guardian_address(multisig, owner_guardian_id);
        let args = RemoveGuardianArgs {
            guardian_id,
            owner_guardian_id,
        };
        let ix = instructions::remove_guardian(
            self.program_id(),
            multisig,
            &guardian,
            &owner,
            &self.fee_payer,
            &args,
        );
        self.with_optional_proof(proof, ix)
    }

    /// Activate or deactivate a guardian on behalf of an owner guardian
    pub fn update_guardian_status(
        &self,
        multisig: &Pubkey,
        guardian_id: u64,
        owner_guardian_id: u64,
        is_active: bool,
        proof: Option<&AuthorizationProof>,
    ) -> Result<Transaction, TransactionError> {
        validate_guardian_id(guardian_id)?;
        validate_guardian_id(owner_guardian_id)?;
        if guardian_id == OWNER_GUARDIAN_ID && !is_active {
            return Err(TransactionError::ProtectedGuardian(guardian_id));
        }

        let (guardian, _) = self.deriver.guardian_address(multisig, guardian_id);
        let (owner, _) = self.deriver.guardian_address(multisig, owner_guardian_id);
        let args = UpdateGuardianStatusArgs {
            guardian_id,
            owner_guardian_id,
            is_active,
        };
        let ix = instructions::update_guardian_status(
            self.program_id(),
            multisig,
            &guardian,
            &owner,
            &self.fee_payer,
            &args,
        );
        self.with_optional_proof(proof, ix)
    }

    /// Transfer lamports out of the multisig, authorized by a guardian passkey
    pub fn transfer(
        &self,
        multisig: &Pubkey,
        guardian_id: u64,
        request: &TransferRequest,
        proof: &AuthorizationProof,
    ) -> Result<Transaction, TransactionError> {
        validate_guardian_id(guardian_id)?;
        if request.amount == 0 {
            return Err(TransactionError::InvalidAmount);
        }
        if request.message.is_empty() {
            return Err(TransactionError::MissingField("message"));
        }
        if request.destination == Pubkey::default() {
            return Err(TransactionError::MissingField("destination"));
        }

        let (guardian, _) = self.deriver.guardian_address(multisig, guardian_id);
        let args = VerifyAndExecuteArgs {
            action: TRANSFER_ACTION.to_string(),
            params: ActionParams {
                amount: request.amount,
                destination: request.destination.to_bytes(),
                token_mint: None,
            },
            nonce: request.nonce,
            timestamp: request.timestamp,
            message: request.message.clone(),
        };

        let verify = proof.instruction()?;
        let execute = instructions::verify_and_execute(
            self.program_id(),
            multisig,
            &guardian,
            &self.fee_payer,
            &request.destination,
            &args,
        );
        Ok(self.transaction(&[verify, execute]))
    }

    /// Propose a transfer for the guardians to approve
    ///
    /// Returns the proposal address alongside the transaction. Creating a
    /// proposal needs no passkey; approvals do.
    pub fn create_proposal(
        &self,
        request: &ProposalRequest,
    ) -> Result<(Pubkey, Transaction), TransactionError> {
        validate_guardian_id(request.proposer_guardian_id)?;
        if request.amount == 0 {
            return Err(TransactionError::InvalidAmount);
        }
        if request.destination == Pubkey::default() {
            return Err(TransactionError::MissingField("destination"));
        }
        if request.description.len() > MAX_PROPOSAL_DESCRIPTION_LEN {
            return Err(TransactionError::InvalidDescription(format!(
                "{} bytes, at most {} allowed",
                request.description.len(),
                MAX_PROPOSAL_DESCRIPTION_LEN
            )));
        }

        let (proposal, _) = self
            .deriver
            .proposal_address(&request.multisig, request.proposal_id);
        let (proposer, _) = self
            .deriver
            .guardian_address(&request.multisig, request.proposer_guardian_id);
        let args = CreateProposalArgs {
            proposal_id: request.proposal_id,
            description: request.description.clone(),
            proposer_guardian_id: request.proposer_guardian_id,
            action: TRANSFER_ACTION.to_string(),
            params: ProposalParams {
                amount: Some(request.amount),
                destination: Some(request.destination.to_bytes()),
                token_mint: None,
            },
        };
        let ix = instructions::create_proposal(
            self.program_id(),
            &request.multisig,
            &proposal,
            &proposer,
            &self.fee_payer,
            &args,
        );
        Ok((proposal, self.transaction(&[ix])))
    }

    /// Approve a proposal, authorized by the approving guardian's passkey
    pub fn approve_proposal(
        &self,
        approval: &ProposalApproval,
        proof: &AuthorizationProof,
    ) -> Result<Transaction, TransactionError> {
        validate_guardian_id(approval.guardian_id)?;

        let deriver = &self.deriver;
        let (proposal, _) = deriver.proposal_address(&approval.multisig, approval.proposal_id);
        let (record, _) = deriver.signature_address(&proposal, approval.guardian_id);
        let (guardian, _) = deriver.guardian_address(&approval.multisig, approval.guardian_id);
        let args = ApproveProposalArgs {
            proposal_id: approval.proposal_id,
            guardian_id: approval.guardian_id,
            timestamp: approval.timestamp,
            message: approval_message(
                approval.proposal_id,
                approval.guardian_id,
                approval.timestamp,
                &proof.public_key,
            ),
        };

        let verify = proof.instruction()?;
        let approve = instructions::approve_proposal(
            self.program_id(),
            &approval.multisig,
            &proposal,
            &record,
            &guardian,
            &self.fee_payer,
            &args,
        );
        Ok(self.transaction(&[verify, approve]))
    }

    /// Execute a proposal once enough guardians approved it
    ///
    /// `destination` is required for transfer proposals.
    pub fn execute_proposal(
        &self,
        multisig: &Pubkey,
        proposal_id: u64,
        destination: Option<&Pubkey>,
    ) -> Result<Transaction, TransactionError> {
        let (proposal, _) = self.deriver.proposal_address(multisig, proposal_id);
        let ix = instructions::execute_proposal(
            self.program_id(),
            multisig,
            &proposal,
            &self.fee_payer,
            destination,
            &ExecuteProposalArgs { proposal_id },
        );
        Ok(self.transaction(&[ix]))
    }

    /// Bind a new passkey to a guardian whose recovery phrase is known
    pub fn recover_access(&self, recovery: &AccessRecovery) -> Result<Transaction, TransactionError> {
        validate_guardian_id(recovery.old_guardian_id)?;
        validate_guardian_id(recovery.new_guardian_id)?;

        let (old_guardian, _) = self
            .deriver
            .guardian_address(&recovery.multisig, recovery.old_guardian_id);
        let (new_guardian, _) = self
            .deriver
            .guardian_address(&recovery.multisig, recovery.new_guardian_id);
        let args = RecoverAccessArgs {
            old_guardian_id: recovery.old_guardian_id,
            new_guardian_id: recovery.new_guardian_id,
            recovery_hash: recovery.recovery_hash,
            new_webauthn_pubkey: recovery.new_webauthn_public_key,
        };
        let ix = instructions::recover_access_by_guardian(
            self.program_id(),
            &recovery.multisig,
            &old_guardian,
            &new_guardian,
            &self.fee_payer,
            &args,
        );
        Ok(self.transaction(&[ix]))
    }

    fn with_optional_proof(
        &self,
        proof: Option<&AuthorizationProof>,
        ix: Instruction,
    ) -> Result<Transaction, TransactionError> {
        match proof {
            Some(proof) => Ok(self.transaction(&[proof.instruction()?, ix])),
            None => Ok(self.transaction(&[ix])),
        }
    }
}

/// Set the blockhash and sign with the fee payer, which must sign last
pub fn sign_with_fee_payer(
    transaction: &mut Transaction,
    fee_payer: &Keypair,
    recent_blockhash: Hash,
) -> Result<(), TransactionError> {
    let expected = transaction
        .message
        .account_keys
        .first()
        .copied()
        .ok_or(TransactionError::MissingField("fee_payer"))?;
    if expected != fee_payer.pubkey() {
        return Err(TransactionError::FeePayerMismatch {
            expected,
            actual: fee_payer.pubkey(),
        });
    }
    transaction
        .try_sign(&[fee_payer], recent_blockhash)
        .map_err(|e| TransactionError::Signing(e.to_string()))
}
