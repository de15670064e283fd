//! In-memory invitation store

use super::store::{next_guardian_id, swap_in, InvitationStore, StoreError};
use crate::guardian::GuardianInvitation;
use async_trait::async_trait;
use solana_sdk::pubkey::Pubkey;
use std::collections::HashMap;
use tokio::sync::RwLock;

#[derive(Default)]
struct Inner {
    invitations: HashMap<String, GuardianInvitation>,
    guardian_counters: HashMap<Pubkey, u64>,
}

/// Invitation store held in process memory
#[derive(Default)]
pub struct MemoryInvitationStore {
    inner: RwLock<Inner>,
}

impl MemoryInvitationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl InvitationStore for MemoryInvitationStore {
    async fn load(&self, invite_code: &str) -> Result<Option<GuardianInvitation>, StoreError> {
        Ok(self.inner.read().await.invitations.get(invite_code).cloned())
    }

    async fn save(&self, invitation: &GuardianInvitation) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        if inner.invitations.contains_key(&invitation.invite_code) {
            return Err(StoreError::AlreadyExists(invitation.invite_code.clone()));
        }
        inner
            .invitations
            .insert(invitation.invite_code.clone(), invitation.clone());
        Ok(())
    }

    async fn compare_and_swap(
        &self,
        invitation: &GuardianInvitation,
        expected_revision: u64,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.write().await;
        let slot = inner.invitations.get_mut(&invitation.invite_code);
        Ok(swap_in(slot, invitation, expected_revision))
    }

    async fn allocate_guardian_id(
        &self,
        multisig: &Pubkey,
        floor: u64,
    ) -> Result<u64, StoreError> {
        let mut inner = self.inner.write().await;
        let id = next_guardian_id(inner.guardian_counters.get(multisig).copied(), floor);
        inner.guardian_counters.insert(*multisig, id);
        Ok(id)
    }

    async fn last_guardian_id(&self, multisig: &Pubkey) -> Result<Option<u64>, StoreError> {
        Ok(self.inner.read().await.guardian_counters.get(multisig).copied())
    }

    async fn list_for_multisig(
        &self,
        multisig: &Pubkey,
    ) -> Result<Vec<GuardianInvitation>, StoreError> {
        let inner = self.inner.read().await;
        let mut found: Vec<_> = inner
            .invitations
            .values()
            .filter(|i| i.multisig == *multisig)
            .cloned()
            .collect();
        found.sort_by_key(|i| i.guardian_id);
        Ok(found)
    }

    async fn list_all(&self) -> Result<Vec<GuardianInvitation>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.invitations.values().cloned().collect())
    }

    async fn delete(&self, invite_code: &str) -> Result<bool, StoreError> {
        Ok(self
            .inner
            .write()
            .await
            .invitations
            .remove(invite_code)
            .is_some())
    }
}
