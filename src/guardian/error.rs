//! Guardian lifecycle errors

use super::invitation::InvitationStatus;
use crate::ledger::LedgerError;
use crate::multisig::{AccountError, TransactionError, WalletError};
use crate::storage::StoreError;
use solana_sdk::pubkey::Pubkey;
use thiserror::Error;

/// Errors raised by the guardian manager
///
/// Messages carry the invite code or guardian id involved, never key
/// material.
#[derive(Error, Debug)]
pub enum GuardianError {
    #[error("Validation failed: {0}")]
    Validation(String),
    #[error("Invitation not found: {0}")]
    InvitationNotFound(String),
    #[error("Invitation {invite_code} is {actual}, expected {expected}")]
    StateConflict {
        invite_code: String,
        expected: InvitationStatus,
        actual: InvitationStatus,
    },
    #[error("Admission of invitation {0} is already in progress")]
    AdmissionInProgress(String),
    #[error("Invitation {0} kept changing under concurrent updates")]
    Contention(String),
    #[error("Ledger submission failed for {context}: {source}")]
    LedgerSubmission {
        context: String,
        #[source]
        source: LedgerError,
    },
    #[error("Guardian {0} is the owning guardian and cannot be removed or deactivated")]
    ProtectedGuardian(u64),
    #[error("Guardian {guardian_id} not found in {multisig}")]
    GuardianNotFound { multisig: Pubkey, guardian_id: u64 },
    #[error("Malformed on-chain account: {0}")]
    Account(#[from] AccountError),
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),
}

impl GuardianError {
    /// Whether the same call may succeed if repeated later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GuardianError::LedgerSubmission { .. }
                | GuardianError::AdmissionInProgress(_)
                | GuardianError::Contention(_)
        )
    }

    /// Wrap a wallet error, naming what was being attempted
    pub(crate) fn from_wallet(error: WalletError, context: impl Into<String>) -> Self {
        match error {
            WalletError::Ledger(source) => GuardianError::LedgerSubmission {
                context: context.into(),
                source,
            },
            WalletError::Transaction(e) => e.into(),
            WalletError::Key(e) => {
                GuardianError::Validation(format!("{}: {}", context.into(), e))
            }
            WalletError::Account(e) => GuardianError::Account(e),
            WalletError::MultisigNotFound(multisig) => {
                GuardianError::Validation(format!("multisig {} not found", multisig))
            }
            WalletError::GuardianNotFound {
                multisig,
                guardian_id,
            } => GuardianError::GuardianNotFound {
                multisig,
                guardian_id,
            },
            WalletError::ProposalNotFound {
                multisig,
                proposal_id,
            } => GuardianError::Validation(format!(
                "proposal {} not found in {}",
                proposal_id, multisig
            )),
        }
    }
}

impl From<TransactionError> for GuardianError {
    fn from(error: TransactionError) -> Self {
        match error {
            TransactionError::ProtectedGuardian(id) => GuardianError::ProtectedGuardian(id),
            other => GuardianError::Validation(other.to_string()),
        }
    }
}
