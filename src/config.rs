//! Client configuration
//!
//! One [`WalletConfig`] describes the whole client: which cluster and
//! program to talk to, where invitations live, and who pays fees. The CLI
//! builds it from flags and environment variables; library users can build
//! it directly or deserialize it.

use crate::crypto::{load_fee_payer, KeyError};
use crate::guardian::{minimum_admission_lease, GuardianManager, ManagerConfig};
use crate::ledger::{LedgerClient, RpcLedger};
use crate::multisig::{AddressDeriver, AddressError, TransactionBuilder, WalletService};
use crate::storage::{FileInvitationStore, StoreConfig, StoreError};
use serde::{Deserialize, Serialize};
use solana_sdk::signature::Signer;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Default cluster endpoint
pub const DEFAULT_RPC_URL: &str = "https://api.devnet.solana.com";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid program id: {0}")]
    Address(#[from] AddressError),
    #[error("Invalid fee payer: {0}")]
    Key(#[from] KeyError),
    #[error("Cannot open invitation store: {0}")]
    Store(#[from] StoreError),
    #[error("Admission lease of {lease_secs}s must exceed {minimum_secs}s for a {timeout_secs}s request timeout")]
    LeaseTooShort {
        lease_secs: u64,
        minimum_secs: i64,
        timeout_secs: u64,
    },
}

/// Wallet client configuration
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WalletConfig {
    pub rpc_url: String,
    /// Base58 id of the multisig program
    pub program_id: String,
    pub request_timeout_secs: u64,
    pub data_dir: PathBuf,
    /// Guardian slots `1..=max_guardians` are scanned when listing
    pub max_guardians: u64,
    /// Must outlast every ledger call made while admitting
    pub admission_lease_secs: u64,
    pub invitation_ttl_secs: u64,
    /// Flip the compressed-key parity byte in verification instructions
    pub flip_public_key_parity: bool,
    /// Comma-separated byte list or base58; `None` uses an ephemeral key
    #[serde(skip_serializing)]
    pub fee_payer_secret: Option<String>,
}

impl Default for WalletConfig {
    fn default() -> Self {
        Self {
            rpc_url: DEFAULT_RPC_URL.to_string(),
            program_id: crate::multisig::DEFAULT_PROGRAM_ID.to_string(),
            request_timeout_secs: 30,
            data_dir: PathBuf::from(".passkey_wallet"),
            max_guardians: 8,
            admission_lease_secs: 300,
            invitation_ttl_secs: 30 * 60,
            flip_public_key_parity: false,
            fee_payer_secret: None,
        }
    }
}

impl std::fmt::Debug for WalletConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WalletConfig")
            .field("rpc_url", &self.rpc_url)
            .field("program_id", &self.program_id)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("data_dir", &self.data_dir)
            .field("max_guardians", &self.max_guardians)
            .field("admission_lease_secs", &self.admission_lease_secs)
            .field("invitation_ttl_secs", &self.invitation_ttl_secs)
            .field("flip_public_key_parity", &self.flip_public_key_parity)
            .field(
                "fee_payer_secret",
                &self.fee_payer_secret.as_ref().map(|_| "<redacted>"),
            )
            .finish()
    }
}

impl WalletConfig {
    pub fn deriver(&self) -> Result<AddressDeriver, AddressError> {
        AddressDeriver::from_program_id(&self.program_id)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            data_dir: self.data_dir.clone(),
            ..Default::default()
        }
    }

    /// Check settings that only make sense together
    pub fn validate(&self) -> Result<(), ConfigError> {
        let minimum = minimum_admission_lease(self.request_timeout());
        if chrono::Duration::seconds(self.admission_lease_secs as i64) <= minimum {
            return Err(ConfigError::LeaseTooShort {
                lease_secs: self.admission_lease_secs,
                minimum_secs: minimum.num_seconds(),
                timeout_secs: self.request_timeout_secs,
            });
        }
        Ok(())
    }

    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            max_guardians: self.max_guardians,
            admission_lease: chrono::Duration::seconds(self.admission_lease_secs as i64),
            invitation_ttl: chrono::Duration::seconds(self.invitation_ttl_secs as i64),
        }
    }

    /// RPC ledger for the configured endpoint
    pub fn rpc_ledger(&self) -> RpcLedger {
        RpcLedger::new(self.rpc_url.clone(), self.request_timeout())
    }

    /// Wallet service over `ledger`, paid for by the configured fee payer
    pub fn wallet_service(
        &self,
        ledger: Arc<dyn LedgerClient>,
    ) -> Result<WalletService, ConfigError> {
        let fee_payer = Arc::new(load_fee_payer(self.fee_payer_secret.as_deref())?);
        let builder = TransactionBuilder::new(self.deriver()?, fee_payer.pubkey());
        Ok(WalletService::new(builder, ledger, fee_payer)
            .with_parity_flip(self.flip_public_key_parity))
    }

    /// Guardian manager over `ledger` with a file-backed invitation store
    pub fn guardian_manager(
        &self,
        ledger: Arc<dyn LedgerClient>,
    ) -> Result<GuardianManager, ConfigError> {
        self.validate()?;
        let wallet = self.wallet_service(ledger)?;
        let store = Arc::new(FileInvitationStore::open(self.store_config())?);
        log::debug!(
            "Guardian manager for program {} at {} (store {:?})",
            self.program_id,
            self.rpc_url,
            self.data_dir
        );
        Ok(GuardianManager::new(wallet, store, self.manager_config()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::MemoryLedger;

    #[test]
    fn test_defaults() {
        let config = WalletConfig::default();
        assert_eq!(config.max_guardians, 8);
        assert_eq!(config.manager_config().admission_lease, chrono::Duration::seconds(300));
        assert!(config.validate().is_ok());
        assert!(!config.flip_public_key_parity);
        assert_eq!(
            config.deriver().unwrap().program_id().to_string(),
            crate::multisig::DEFAULT_PROGRAM_ID
        );
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: WalletConfig =
            serde_json::from_str(r#"{"rpc_url":"http://localhost:8899","max_guardians":4}"#)
                .unwrap();
        assert_eq!(config.rpc_url, "http://localhost:8899");
        assert_eq!(config.max_guardians, 4);
        assert_eq!(config.admission_lease_secs, 300);
    }

    #[test]
    fn test_secret_is_never_printed_or_serialized() {
        let config = WalletConfig {
            fee_payer_secret: Some("5secretsecretsecret".into()),
            ..Default::default()
        };
        assert!(!format!("{:?}", config).contains("5secretsecretsecret"));
        assert!(!serde_json::to_string(&config)
            .unwrap()
            .contains("5secretsecretsecret"));
    }

    #[test]
    fn test_invalid_program_id() {
        let config = WalletConfig {
            program_id: "not-a-key".into(),
            ..Default::default()
        };
        let ledger: Arc<dyn LedgerClient> =
            Arc::new(MemoryLedger::new(*AddressDeriver::default().program_id()));
        assert!(matches!(
            config.wallet_service(ledger),
            Err(ConfigError::Address(_))
        ));
    }

    #[test]
    fn test_guardian_manager_opens_store() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config = WalletConfig {
            data_dir: temp_dir.path().to_path_buf(),
            max_guardians: 5,
            ..Default::default()
        };
        let ledger: Arc<dyn LedgerClient> =
            Arc::new(MemoryLedger::new(*AddressDeriver::default().program_id()));
        let manager = config.guardian_manager(ledger).unwrap();
        assert_eq!(manager.config().max_guardians, 5);
    }

    #[test]
    fn test_lease_must_outlast_admission_calls() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config = WalletConfig {
            data_dir: temp_dir.path().to_path_buf(),
            request_timeout_secs: 30,
            admission_lease_secs: 120,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::LeaseTooShort {
                lease_secs: 120,
                minimum_secs: 180,
                timeout_secs: 30,
            })
        ));
        let ledger: Arc<dyn LedgerClient> =
            Arc::new(MemoryLedger::new(*AddressDeriver::default().program_id()));
        assert!(matches!(
            config.guardian_manager(ledger.clone()),
            Err(ConfigError::LeaseTooShort { .. })
        ));

        let shorter_timeout = WalletConfig {
            request_timeout_secs: 10,
            ..config
        };
        assert!(shorter_timeout.validate().is_ok());
        assert!(shorter_timeout.guardian_manager(ledger).is_ok());
    }
}
