//! Passkey Multisig: a client for passkey-authorized multisig wallets
//!
//! This crate provides:
//! - secp256r1 (WebAuthn) signature normalization and verification payloads
//! - Program-derived addresses for multisigs and guardians
//! - Transaction building for wallet creation, guardian changes, transfers,
//!   threshold-approved proposals and passkey recovery
//! - A guardian lifecycle manager with invitation, registration and
//!   at-most-once admission
//! - Ledger access over RPC or in memory, and JSON-persisted invitations
//!
//! # Example
//!
//! ```rust,no_run
//! use passkey_multisig::config::WalletConfig;
//! use passkey_multisig::ledger::LedgerClient;
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = WalletConfig::default();
//! let ledger: Arc<dyn LedgerClient> = Arc::new(config.rpc_ledger());
//! let manager = config.guardian_manager(ledger)?;
//!
//! let multisig = "11111111111111111111111111111111".parse()?;
//! let invitation = manager.create_invitation(&multisig, "Alice", 1).await?;
//! println!("Share invite code {}", invitation.invite_code);
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod cli;
pub mod config;
pub mod crypto;
pub mod guardian;
pub mod ledger;
pub mod multisig;
pub mod storage;

// Re-export commonly used types
pub use api::{create_router, ApiState};
pub use config::WalletConfig;
pub use guardian::{Admission, GuardianError, GuardianInvitation, GuardianManager, InvitationStatus};
pub use ledger::{LedgerClient, LedgerError, MemoryLedger, RpcLedger};
pub use multisig::{
    AddressDeriver, AuthorizationProof, TransactionBuilder, WalletService, WebAuthnAssertion,
};
pub use storage::{FileInvitationStore, InvitationStore, MemoryInvitationStore};
