//! Passkey multisig wallet service
//!
//! Ties the transaction builder to a ledger and the fee payer: wallet
//! creation, transfers, proposals, guardian recovery and on-chain state
//! reads for one wallet program.

use crate::crypto::{compress_public_key, KeyError};
use crate::ledger::{LedgerClient, LedgerError};
use crate::multisig::accounts::{AccountError, GuardianAccount, MultisigAccount, ProposalAccount};
use crate::multisig::transaction::{
    sign_with_fee_payer, AccessRecovery, NewWallet, ProposalApproval, ProposalRequest,
    TransactionBuilder, TransactionError, TransferRequest,
};
use crate::multisig::verification::WebAuthnAssertion;
use chrono::Utc;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::{Keypair, Signature, Signer};
use solana_sdk::transaction::Transaction;
use std::sync::Arc;
use thiserror::Error;

/// Errors related to wallet operations
#[derive(Error, Debug)]
pub enum WalletError {
    #[error("Multisig not found: {0}")]
    MultisigNotFound(Pubkey),
    #[error("Guardian {guardian_id} not found in {multisig}")]
    GuardianNotFound { multisig: Pubkey, guardian_id: u64 },
    #[error("Proposal {proposal_id} not found in {multisig}")]
    ProposalNotFound { multisig: Pubkey, proposal_id: u64 },
    #[error("Transaction error: {0}")]
    Transaction(#[from] TransactionError),
    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),
    #[error("Key error: {0}")]
    Key(#[from] KeyError),
    #[error("Account error: {0}")]
    Account(#[from] AccountError),
}

impl WalletError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, WalletError::Ledger(e) if e.is_retryable())
    }
}

/// Result of creating a wallet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedWallet {
    pub multisig: Pubkey,
    pub owner_guardian: Pubkey,
    pub signature: Signature,
}

/// A decoded guardian slot together with its address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuardianEntry {
    pub address: Pubkey,
    pub account: GuardianAccount,
}

/// A proposal put up for approval
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedProposal {
    pub proposal_id: u64,
    pub address: Pubkey,
    pub signature: Signature,
}

/// A decoded proposal together with its address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProposalEntry {
    pub address: Pubkey,
    pub account: ProposalAccount,
}

/// Wallet operations against one ledger, paid for by one fee payer
#[derive(Clone)]
pub struct WalletService {
    builder: TransactionBuilder,
    ledger: Arc<dyn LedgerClient>,
    fee_payer: Arc<Keypair>,
    flip_public_key_parity: bool,
}

impl WalletService {
    pub fn new(
        builder: TransactionBuilder,
        ledger: Arc<dyn LedgerClient>,
        fee_payer: Arc<Keypair>,
    ) -> Self {
        Self {
            builder,
            ledger,
            fee_payer,
            flip_public_key_parity: false,
        }
    }

    /// Flip the compressed-key parity byte in every verification instruction
    ///
    /// Whether the target verification program needs this is determined
    /// against that program, not inferred here.
    pub fn with_parity_flip(mut self, flip: bool) -> Self {
        self.flip_public_key_parity = flip;
        self
    }

    pub fn builder(&self) -> &TransactionBuilder {
        &self.builder
    }

    pub fn ledger(&self) -> &Arc<dyn LedgerClient> {
        &self.ledger
    }

    pub fn fee_payer(&self) -> Pubkey {
        self.fee_payer.pubkey()
    }

    pub fn flip_public_key_parity(&self) -> bool {
        self.flip_public_key_parity
    }

    /// Sign with the fee payer against a fresh blockhash and submit
    pub async fn submit(&self, mut transaction: Transaction) -> Result<Signature, WalletError> {
        let blockhash = self.ledger.latest_blockhash().await?;
        sign_with_fee_payer(&mut transaction, &self.fee_payer, blockhash)?;
        Ok(self.ledger.submit_transaction(&transaction).await?)
    }

    /// Create a multisig owned by a passkey, with the owner as guardian 1
    pub async fn create_wallet(
        &self,
        credential_id: &str,
        threshold: u8,
        owner_name: &str,
        recovery_hash: [u8; 32],
        owner_public_key: &[u8],
    ) -> Result<CreatedWallet, WalletError> {
        let wallet = NewWallet {
            credential_id: credential_id.to_string(),
            threshold,
            owner_name: owner_name.to_string(),
            recovery_hash,
            owner_public_key: compress_public_key(owner_public_key)?,
        };
        let (multisig, transaction) = self.builder.create_wallet(&wallet)?;
        let signature = self.submit(transaction).await?;
        let (owner_guardian, _) = self.builder.deriver().guardian_address(&multisig, 1);

        log::info!("Created multisig {} (tx {})", multisig, signature);
        Ok(CreatedWallet {
            multisig,
            owner_guardian,
            signature,
        })
    }

    /// Prepare a transfer with the next nonce and the message to sign
    ///
    /// The returned `message` is what the passkey assertion should use as
    /// its challenge.
    pub async fn prepare_transfer(
        &self,
        multisig: &Pubkey,
        destination: Pubkey,
        amount: u64,
    ) -> Result<TransferRequest, WalletError> {
        let state = self
            .fetch_multisig(multisig)
            .await?
            .ok_or(WalletError::MultisigNotFound(*multisig))?;
        let nonce = state.next_transfer_nonce();
        let timestamp = Utc::now().timestamp();
        let message = format!(
            "transfer:{}:{}:{}:{}",
            amount, destination, nonce, timestamp
        )
        .into_bytes();

        Ok(TransferRequest {
            destination,
            amount,
            nonce,
            timestamp,
            message,
        })
    }

    /// Execute a transfer authorized by a guardian's passkey assertion
    pub async fn transfer(
        &self,
        multisig: &Pubkey,
        guardian_id: u64,
        request: &TransferRequest,
        assertion: WebAuthnAssertion,
    ) -> Result<Signature, WalletError> {
        let proof = assertion.into_proof(self.flip_public_key_parity)?;
        let transaction = self
            .builder
            .transfer(multisig, guardian_id, request, &proof)?;
        let signature = self.submit(transaction).await?;
        log::info!(
            "Transferred {} lamports from {} to {} (tx {})",
            request.amount,
            multisig,
            request.destination,
            signature
        );
        Ok(signature)
    }

    /// Propose a transfer out of the multisig
    ///
    /// The proposal id is the current time in milliseconds.
    pub async fn create_proposal(
        &self,
        multisig: &Pubkey,
        proposer_guardian_id: u64,
        description: &str,
        destination: Pubkey,
        amount: u64,
    ) -> Result<CreatedProposal, WalletError> {
        if !self.guardian_exists(multisig, proposer_guardian_id).await? {
            return Err(WalletError::GuardianNotFound {
                multisig: *multisig,
                guardian_id: proposer_guardian_id,
            });
        }
        let request = ProposalRequest {
            multisig: *multisig,
            proposal_id: Utc::now().timestamp_millis().max(0) as u64,
            proposer_guardian_id,
            description: description.to_string(),
            destination,
            amount,
        };
        let (address, transaction) = self.builder.create_proposal(&request)?;
        let signature = self.submit(transaction).await?;
        log::info!(
            "Guardian {} proposed sending {} lamports from {} to {} (proposal {})",
            proposer_guardian_id,
            amount,
            multisig,
            destination,
            request.proposal_id
        );
        Ok(CreatedProposal {
            proposal_id: request.proposal_id,
            address,
            signature,
        })
    }

    /// Approve a proposal with a guardian's passkey assertion
    pub async fn approve_proposal(
        &self,
        multisig: &Pubkey,
        proposal_id: u64,
        guardian_id: u64,
        assertion: WebAuthnAssertion,
    ) -> Result<Signature, WalletError> {
        self.fetch_proposal(multisig, proposal_id)
            .await?
            .ok_or(WalletError::ProposalNotFound {
                multisig: *multisig,
                proposal_id,
            })?;
        let approval = ProposalApproval {
            multisig: *multisig,
            proposal_id,
            guardian_id,
            timestamp: Utc::now().timestamp(),
        };
        let proof = assertion.into_proof(self.flip_public_key_parity)?;
        let transaction = self.builder.approve_proposal(&approval, &proof)?;
        let signature = self.submit(transaction).await?;
        log::info!(
            "Guardian {} approved proposal {} on {} (tx {})",
            guardian_id,
            proposal_id,
            multisig,
            signature
        );
        Ok(signature)
    }

    /// Execute a proposal that gathered enough approvals
    pub async fn execute_proposal(
        &self,
        multisig: &Pubkey,
        proposal_id: u64,
    ) -> Result<Signature, WalletError> {
        let entry = self
            .fetch_proposal(multisig, proposal_id)
            .await?
            .ok_or(WalletError::ProposalNotFound {
                multisig: *multisig,
                proposal_id,
            })?;
        let destination = entry.account.params.destination.map(Pubkey::new_from_array);
        let transaction =
            self.builder
                .execute_proposal(multisig, proposal_id, destination.as_ref())?;
        let signature = self.submit(transaction).await?;
        log::info!(
            "Executed proposal {} on {} (tx {})",
            proposal_id,
            multisig,
            signature
        );
        Ok(signature)
    }

    /// Read and decode a proposal
    pub async fn fetch_proposal(
        &self,
        multisig: &Pubkey,
        proposal_id: u64,
    ) -> Result<Option<ProposalEntry>, WalletError> {
        let (address, _) = self.builder.deriver().proposal_address(multisig, proposal_id);
        match self.program_account(&address).await? {
            Some(data) => Ok(Some(ProposalEntry {
                address,
                account: ProposalAccount::decode(&data)?,
            })),
            None => Ok(None),
        }
    }

    /// Replace a guardian's passkey, authorized by its recovery hash
    ///
    /// Passing the same id twice keeps the guardian in its slot.
    pub async fn recover_access(
        &self,
        multisig: &Pubkey,
        old_guardian_id: u64,
        new_guardian_id: u64,
        recovery_hash: [u8; 32],
        new_public_key: &[u8],
    ) -> Result<Signature, WalletError> {
        if !self.guardian_exists(multisig, old_guardian_id).await? {
            return Err(WalletError::GuardianNotFound {
                multisig: *multisig,
                guardian_id: old_guardian_id,
            });
        }
        let recovery = AccessRecovery {
            multisig: *multisig,
            old_guardian_id,
            new_guardian_id,
            recovery_hash,
            new_webauthn_public_key: compress_public_key(new_public_key)?,
        };
        let transaction = self.builder.recover_access(&recovery)?;
        let signature = self.submit(transaction).await?;
        log::info!(
            "Recovered guardian {} on {} as guardian {} (tx {})",
            old_guardian_id,
            multisig,
            new_guardian_id,
            signature
        );
        Ok(signature)
    }

    /// Read and decode a multisig account
    pub async fn fetch_multisig(
        &self,
        multisig: &Pubkey,
    ) -> Result<Option<MultisigAccount>, WalletError> {
        match self.program_account(multisig).await? {
            Some(data) => Ok(Some(MultisigAccount::decode(&data)?)),
            None => Ok(None),
        }
    }

    /// Read and decode one guardian slot
    pub async fn fetch_guardian(
        &self,
        multisig: &Pubkey,
        guardian_id: u64,
    ) -> Result<Option<GuardianEntry>, WalletError> {
        let (address, _) = self.builder.deriver().guardian_address(multisig, guardian_id);
        match self.program_account(&address).await? {
            Some(data) => Ok(Some(GuardianEntry {
                address,
                account: GuardianAccount::decode(&data)?,
            })),
            None => Ok(None),
        }
    }

    /// Whether a guardian slot already holds a program-owned account
    pub async fn guardian_exists(
        &self,
        multisig: &Pubkey,
        guardian_id: u64,
    ) -> Result<bool, WalletError> {
        let (address, _) = self.builder.deriver().guardian_address(multisig, guardian_id);
        Ok(self.program_account(&address).await?.is_some())
    }

    /// Decode every guardian in slots `1..=max_guardians`
    pub async fn list_guardians(
        &self,
        multisig: &Pubkey,
        max_guardians: u64,
    ) -> Result<Vec<GuardianEntry>, WalletError> {
        let mut guardians = Vec::new();
        for guardian_id in 1..=max_guardians {
            if let Some(entry) = self.fetch_guardian(multisig, guardian_id).await? {
                guardians.push(entry);
            }
        }
        Ok(guardians)
    }

    async fn program_account(&self, address: &Pubkey) -> Result<Option<Vec<u8>>, WalletError> {
        let account = self.ledger.get_account(address).await?;
        Ok(account
            .filter(|a| a.owner == *self.builder.deriver().program_id())
            .map(|a| a.data))
    }
}
