//! File-backed invitation store
//!
//! The whole store is one JSON document. Every mutation rewrites it through
//! a temporary file and an atomic rename, optionally rotating backups.
//! File IO runs on tokio's blocking pool while the store lock is held, so
//! writes stay ordered without stalling async workers.

use super::store::{next_guardian_id, swap_in, InvitationStore, StoreError};
use crate::guardian::GuardianInvitation;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use solana_sdk::pubkey::Pubkey;
use std::collections::BTreeMap;
use std::fs;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::PathBuf;
use tokio::sync::Mutex;

/// Storage configuration
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub data_dir: PathBuf,
    pub invitations_file: String,
    pub backup_enabled: bool,
    pub max_backups: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(".passkey_wallet"),
            invitations_file: "invitations.json".to_string(),
            backup_enabled: true,
            max_backups: 5,
        }
    }
}

/// On-disk document
#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    invitations: BTreeMap<String, GuardianInvitation>,
    /// Last allocated guardian id per multisig (base58)
    guardian_counters: BTreeMap<String, u64>,
}

/// Invitation store persisted to a JSON file
pub struct FileInvitationStore {
    config: StoreConfig,
    snapshot: Mutex<Snapshot>,
}

impl FileInvitationStore {
    /// Open the store, loading existing data if present
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        fs::create_dir_all(&config.data_dir)?;
        let path = config.store_path();

        let snapshot = if path.exists() {
            let reader = BufReader::new(fs::File::open(&path)?);
            serde_json::from_reader(reader)?
        } else {
            Snapshot::default()
        };
        log::debug!(
            "Opened invitation store {:?} ({} invitations)",
            path,
            snapshot.invitations.len()
        );

        Ok(Self {
            config,
            snapshot: Mutex::new(snapshot),
        })
    }

    /// Open with default configuration
    pub fn with_defaults() -> Result<Self, StoreError> {
        Self::open(StoreConfig::default())
    }

    /// Write the snapshot to disk
    ///
    /// Serialization happens under the caller's lock; file IO runs on the
    /// blocking pool.
    async fn persist(&self, snapshot: &Snapshot) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(snapshot)?;
        let config = self.config.clone();
        tokio::task::spawn_blocking(move || write_snapshot(&config, &bytes))
            .await
            .map_err(|e| StoreError::IoError(io::Error::other(e)))?
    }

    /// List available backups
    pub fn list_backups(&self) -> Vec<usize> {
        (0..self.config.max_backups)
            .filter(|i| self.config.backup_path(*i).exists())
            .collect()
    }
}

impl StoreConfig {
    fn store_path(&self) -> PathBuf {
        self.data_dir.join(&self.invitations_file)
    }

    fn backup_path(&self, index: usize) -> PathBuf {
        self.data_dir
            .join(format!("{}.backup.{}", self.invitations_file, index))
    }
}

fn write_snapshot(config: &StoreConfig, bytes: &[u8]) -> Result<(), StoreError> {
    let path = config.store_path();

    if config.backup_enabled && path.exists() {
        rotate_backups(config)?;
        fs::copy(&path, config.backup_path(0))?;
    }

    // Write to temporary file first
    let temp_path = config
        .data_dir
        .join(format!("{}.tmp", config.invitations_file));
    let mut writer = BufWriter::new(fs::File::create(&temp_path)?);
    writer.write_all(bytes)?;
    writer.flush()?;
    drop(writer);

    // Atomic rename
    fs::rename(&temp_path, &path)?;
    Ok(())
}

/// Rotate backup files
fn rotate_backups(config: &StoreConfig) -> Result<(), StoreError> {
    if config.max_backups == 0 {
        return Ok(());
    }
    let oldest = config.backup_path(config.max_backups - 1);
    if oldest.exists() {
        fs::remove_file(&oldest)?;
    }

    for i in (0..config.max_backups - 1).rev() {
        let current = config.backup_path(i);
        if current.exists() {
            fs::rename(&current, config.backup_path(i + 1))?;
        }
    }
    Ok(())
}

#[async_trait]
impl InvitationStore for FileInvitationStore {
    async fn load(&self, invite_code: &str) -> Result<Option<GuardianInvitation>, StoreError> {
        Ok(self.snapshot.lock().await.invitations.get(invite_code).cloned())
    }

    async fn save(&self, invitation: &GuardianInvitation) -> Result<(), StoreError> {
        let mut snapshot = self.snapshot.lock().await;
        if snapshot.invitations.contains_key(&invitation.invite_code) {
            return Err(StoreError::AlreadyExists(invitation.invite_code.clone()));
        }
        snapshot
            .invitations
            .insert(invitation.invite_code.clone(), invitation.clone());
        if let Err(e) = self.persist(&snapshot).await {
            snapshot.invitations.remove(&invitation.invite_code);
            return Err(e);
        }
        Ok(())
    }

    async fn compare_and_swap(
        &self,
        invitation: &GuardianInvitation,
        expected_revision: u64,
    ) -> Result<bool, StoreError> {
        let mut snapshot = self.snapshot.lock().await;
        let previous = snapshot.invitations.get(&invitation.invite_code).cloned();
        let slot = snapshot.invitations.get_mut(&invitation.invite_code);
        if !swap_in(slot, invitation, expected_revision) {
            return Ok(false);
        }
        if let Err(e) = self.persist(&snapshot).await {
            if let Some(previous) = previous {
                snapshot
                    .invitations
                    .insert(invitation.invite_code.clone(), previous);
            }
            return Err(e);
        }
        Ok(true)
    }

    async fn allocate_guardian_id(
        &self,
        multisig: &Pubkey,
        floor: u64,
    ) -> Result<u64, StoreError> {
        let mut snapshot = self.snapshot.lock().await;
        let key = multisig.to_string();
        let previous = snapshot.guardian_counters.get(&key).copied();
        let id = next_guardian_id(previous, floor);
        snapshot.guardian_counters.insert(key.clone(), id);
        if let Err(e) = self.persist(&snapshot).await {
            match previous {
                Some(last) => snapshot.guardian_counters.insert(key, last),
                None => snapshot.guardian_counters.remove(&key),
            };
            return Err(e);
        }
        Ok(id)
    }

    async fn last_guardian_id(&self, multisig: &Pubkey) -> Result<Option<u64>, StoreError> {
        let snapshot = self.snapshot.lock().await;
        Ok(snapshot.guardian_counters.get(&multisig.to_string()).copied())
    }

    async fn list_for_multisig(
        &self,
        multisig: &Pubkey,
    ) -> Result<Vec<GuardianInvitation>, StoreError> {
        let snapshot = self.snapshot.lock().await;
        let mut found: Vec<_> = snapshot
            .invitations
            .values()
            .filter(|i| i.multisig == *multisig)
            .cloned()
            .collect();
        found.sort_by_key(|i| i.guardian_id);
        Ok(found)
    }

    async fn list_all(&self) -> Result<Vec<GuardianInvitation>, StoreError> {
        let snapshot = self.snapshot.lock().await;
        Ok(snapshot.invitations.values().cloned().collect())
    }

    async fn delete(&self, invite_code: &str) -> Result<bool, StoreError> {
        let mut snapshot = self.snapshot.lock().await;
        let Some(removed) = snapshot.invitations.remove(invite_code) else {
            return Ok(false);
        };
        if let Err(e) = self.persist(&snapshot).await {
            snapshot.invitations.insert(invite_code.to_string(), removed);
            return Err(e);
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guardian::InvitationStatus;

    fn config(dir: &tempfile::TempDir) -> StoreConfig {
        StoreConfig {
            data_dir: dir.path().to_path_buf(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_reopen_keeps_invitations_and_counters() {
        let temp_dir = tempfile::tempdir().unwrap();
        let multisig = Pubkey::new_unique();

        {
            let store = FileInvitationStore::open(config(&temp_dir)).unwrap();
            let id = store.allocate_guardian_id(&multisig, 1).await.unwrap();
            let mut inv =
                GuardianInvitation::new("CODE0001".into(), multisig, id, "Alice".into());
            store.save(&inv).await.unwrap();

            inv.status = InvitationStatus::Ready;
            inv.recovery_hash = Some([1u8; 32]);
            assert!(store.compare_and_swap(&inv, 0).await.unwrap());
        }

        let store = FileInvitationStore::open(config(&temp_dir)).unwrap();
        let loaded = store.load("CODE0001").await.unwrap().unwrap();
        assert_eq!(loaded.status, InvitationStatus::Ready);
        assert_eq!(loaded.revision, 1);
        assert_eq!(loaded.recovery_hash, Some([1u8; 32]));

        // Counter survived the restart
        assert_eq!(store.last_guardian_id(&multisig).await.unwrap(), Some(2));
        assert_eq!(store.allocate_guardian_id(&multisig, 1).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_backup_rotation() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = FileInvitationStore::open(StoreConfig {
            max_backups: 3,
            ..config(&temp_dir)
        })
        .unwrap();
        let multisig = Pubkey::new_unique();

        for i in 0..5 {
            let inv = GuardianInvitation::new(format!("CODE000{}", i), multisig, i + 2, "g".into());
            store.save(&inv).await.unwrap();
        }

        let backups = store.list_backups();
        assert!(!backups.is_empty());
        assert!(backups.len() <= 3);
    }

    #[tokio::test]
    async fn test_delete_persists() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = FileInvitationStore::open(config(&temp_dir)).unwrap();
        let inv = GuardianInvitation::new("CODE0001".into(), Pubkey::new_unique(), 2, "A".into());
        store.save(&inv).await.unwrap();
        assert!(store.delete("CODE0001").await.unwrap());

        let reopened = FileInvitationStore::open(config(&temp_dir)).unwrap();
        assert!(reopened.load("CODE0001").await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_writes_all_reach_disk() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = std::sync::Arc::new(FileInvitationStore::open(config(&temp_dir)).unwrap());
        let multisig = Pubkey::new_unique();

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move {
                    let id = store.allocate_guardian_id(&multisig, 1).await.unwrap();
                    let inv = GuardianInvitation::new(format!("CODE{:04}", i), multisig, id, "g".into());
                    store.save(&inv).await.unwrap();
                    id
                })
            })
            .collect();
        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap());
        }
        ids.sort();
        assert_eq!(ids, (2..10).collect::<Vec<u64>>());

        let reopened = FileInvitationStore::open(config(&temp_dir)).unwrap();
        assert_eq!(reopened.list_for_multisig(&multisig).await.unwrap().len(), 8);
        assert_eq!(reopened.last_guardian_id(&multisig).await.unwrap(), Some(9));
    }
}
