//! Ledger access
//!
//! The wallet only needs three things from the ledger: a recent blockhash,
//! transaction submission and account reads. [`LedgerClient`] is that seam;
//! [`RpcLedger`] talks to a real cluster and [`MemoryLedger`] runs the
//! wallet program in process.

pub mod memory;
pub mod rpc;

pub use memory::MemoryLedger;
pub use rpc::RpcLedger;

use async_trait::async_trait;
use solana_sdk::account::Account;
use solana_sdk::hash::Hash;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::Signature;
use solana_sdk::transaction::Transaction;
use thiserror::Error;

/// Errors reported by a ledger client
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("Ledger request timed out: {0}")]
    Timeout(String),
    #[error("RPC error: {0}")]
    Rpc(String),
    #[error("Transaction rejected: {0}")]
    Rejected(String),
    #[error("Invalid transaction: {0}")]
    InvalidTransaction(String),
}

impl LedgerError {
    /// Whether resubmitting the same request may succeed
    ///
    /// A transaction that is malformed on the client side will fail the same
    /// way every time; everything else depends on ledger state or the network.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, LedgerError::InvalidTransaction(_))
    }
}

/// Minimal ledger interface the wallet depends on
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Blockhash to sign new transactions against
    async fn latest_blockhash(&self) -> Result<Hash, LedgerError>;

    /// Submit a fully signed transaction and wait for confirmation
    async fn submit_transaction(&self, transaction: &Transaction)
        -> Result<Signature, LedgerError>;

    /// Fetch an account, `None` if it does not exist
    async fn get_account(&self, address: &Pubkey) -> Result<Option<Account>, LedgerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(LedgerError::Timeout("30s".into()).is_retryable());
        assert!(LedgerError::Rpc("connection refused".into()).is_retryable());
        assert!(LedgerError::Rejected("insufficient funds".into()).is_retryable());
        assert!(!LedgerError::InvalidTransaction("unsigned".into()).is_retryable());
    }
}
