//! Invitation store interface
//!
//! Implementations must make `compare_and_swap` and `allocate_guardian_id`
//! atomic per key. The guardian manager relies on nothing else for its
//! concurrency guarantees and takes no locks of its own.

use crate::guardian::GuardianInvitation;
use async_trait::async_trait;
use solana_sdk::pubkey::Pubkey;
use std::io;
use thiserror::Error;

/// Storage errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
    #[error("Invitation already exists: {0}")]
    AlreadyExists(String),
    #[error("Invalid data: {0}")]
    InvalidData(String),
}

/// Keyed storage for guardian invitations
#[async_trait]
pub trait InvitationStore: Send + Sync {
    /// Load an invitation by invite code
    async fn load(&self, invite_code: &str) -> Result<Option<GuardianInvitation>, StoreError>;

    /// Store a new invitation; fails if the code is taken
    async fn save(&self, invitation: &GuardianInvitation) -> Result<(), StoreError>;

    /// Replace an invitation only if its stored revision is `expected_revision`
    ///
    /// On success the stored copy carries revision `expected_revision + 1`.
    /// Returns `false`, leaving the record untouched, if the revision moved
    /// on or the invitation does not exist.
    async fn compare_and_swap(
        &self,
        invitation: &GuardianInvitation,
        expected_revision: u64,
    ) -> Result<bool, StoreError>;

    /// Reserve the next guardian id for a multisig
    ///
    /// The result is greater than `floor` and than every id previously
    /// returned for the same multisig.
    async fn allocate_guardian_id(&self, multisig: &Pubkey, floor: u64)
        -> Result<u64, StoreError>;

    /// Highest guardian id handed out for a multisig, if any
    async fn last_guardian_id(&self, multisig: &Pubkey) -> Result<Option<u64>, StoreError>;

    /// All invitations targeting a multisig
    async fn list_for_multisig(
        &self,
        multisig: &Pubkey,
    ) -> Result<Vec<GuardianInvitation>, StoreError>;

    /// Every stored invitation
    async fn list_all(&self) -> Result<Vec<GuardianInvitation>, StoreError>;

    /// Delete an invitation, returning whether it existed
    async fn delete(&self, invite_code: &str) -> Result<bool, StoreError>;
}

/// Apply a compare-and-swap to an in-memory map entry
pub(crate) fn swap_in(
    slot: Option<&mut GuardianInvitation>,
    invitation: &GuardianInvitation,
    expected_revision: u64,
) -> bool {
    match slot {
        Some(stored) if stored.revision == expected_revision => {
            let mut next = invitation.clone();
            next.revision = expected_revision + 1;
            *stored = next;
            true
        }
        _ => false,
    }
}

/// Next id after `last` and `floor`
pub(crate) fn next_guardian_id(last: Option<u64>, floor: u64) -> u64 {
    last.unwrap_or(0).max(floor) + 1
}
