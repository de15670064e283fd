//! JSON-RPC ledger client

use super::{LedgerClient, LedgerError};
use async_trait::async_trait;
use solana_client::client_error::{ClientError, ClientErrorKind};
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_sdk::account::Account;
use solana_sdk::commitment_config::CommitmentConfig;
use solana_sdk::hash::Hash;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::Signature;
use solana_sdk::transaction::Transaction;
use std::future::Future;
use std::time::Duration;

/// Ledger client backed by a cluster RPC endpoint
pub struct RpcLedger {
    client: RpcClient,
    timeout: Duration,
}

impl RpcLedger {
    /// Connect to `url` with confirmed commitment
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        let client = RpcClient::new_with_timeout_and_commitment(
            url.into(),
            timeout,
            CommitmentConfig::confirmed(),
        );
        Self { client, timeout }
    }

    pub fn url(&self) -> String {
        self.client.url()
    }

    /// Bound a request by the configured timeout
    ///
    /// Confirmation polling can outlive the per-request HTTP timeout, so the
    /// whole call is capped as well.
    async fn bounded<T, F>(&self, what: &str, request: F) -> Result<T, LedgerError>
    where
        F: Future<Output = Result<T, ClientError>>,
    {
        match tokio::time::timeout(self.timeout * 2, request).await {
            Ok(result) => result.map_err(map_client_error),
            Err(_) => Err(LedgerError::Timeout(format!(
                "{} exceeded {:?}",
                what,
                self.timeout * 2
            ))),
        }
    }
}

fn map_client_error(error: ClientError) -> LedgerError {
    match error.kind() {
        ClientErrorKind::Reqwest(e) if e.is_timeout() => LedgerError::Timeout(e.to_string()),
        ClientErrorKind::TransactionError(e) => LedgerError::Rejected(e.to_string()),
        ClientErrorKind::SigningError(e) => LedgerError::InvalidTransaction(e.to_string()),
        _ => LedgerError::Rpc(error.to_string()),
    }
}

#[async_trait]
impl LedgerClient for RpcLedger {
    async fn latest_blockhash(&self) -> Result<Hash, LedgerError> {
        self.bounded("getLatestBlockhash", self.client.get_latest_blockhash())
            .await
    }

    async fn submit_transaction(
        &self,
        transaction: &Transaction,
    ) -> Result<Signature, LedgerError> {
        let signature = self
            .bounded(
                "sendAndConfirmTransaction",
                self.client.send_and_confirm_transaction(transaction),
            )
            .await?;
        log::info!("Transaction confirmed: {}", signature);
        Ok(signature)
    }

    async fn get_account(&self, address: &Pubkey) -> Result<Option<Account>, LedgerError> {
        let response = self
            .bounded(
                "getAccountInfo",
                self.client
                    .get_account_with_commitment(address, CommitmentConfig::confirmed()),
            )
            .await?;
        Ok(response.value)
    }
}
