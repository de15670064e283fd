//! Guardian lifecycle management
//!
//! An invitation moves `pending -> ready -> completed`, never backwards and
//! never skipping a state:
//!
//! - the owner creates an invitation, which reserves a guardian id;
//! - the invitee registers a passkey, which makes the invitation ready;
//! - the owner confirms, which admits the guardian on the ledger.
//!
//! Confirmation is the only step that submits a transaction, and it must
//! do so at most once per invitation. A confirm attempt first takes an
//! admission lease on the ready record with a compare-and-swap; only the
//! holder submits. Failed submissions give the lease back and leave the
//! invitation ready, so a confirm can always be retried.

use super::error::GuardianError;
use super::invitation::{generate_invite_code, GuardianInvitation, InvitationStatus};
use crate::crypto::compress_public_key;
use crate::multisig::pda::validate_credential_id;
use crate::multisig::transaction::{validate_guardian_name, GuardianAdmission};
use crate::multisig::{GuardianEntry, WalletService, OWNER_GUARDIAN_ID};
use crate::multisig::verification::WebAuthnAssertion;
use crate::storage::{InvitationStore, StoreError};
use chrono::{Duration, Utc};
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::Signature;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Recorded instead of a signature when the guardian was already on the ledger
pub const ALREADY_ON_LEDGER: &str = "already_exists";

/// Attempts at generating an unused invite code
const INVITE_CODE_ATTEMPTS: usize = 5;
/// Re-reads of a record after losing a compare-and-swap
const CAS_ATTEMPTS: usize = 4;
/// Ledger round trips made while holding an admission lease: the guardian
/// lookup, the blockhash fetch and the submission itself
pub const ADMISSION_LEDGER_CALLS: u32 = 3;

/// Shortest admission lease that outlasts a leased admission
///
/// Each ledger call is capped at twice the request timeout.
pub fn minimum_admission_lease(request_timeout: std::time::Duration) -> Duration {
    let bound = request_timeout * 2 * ADMISSION_LEDGER_CALLS;
    Duration::from_std(bound).unwrap_or(Duration::max_value())
}

/// Guardian manager configuration
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Guardian slots scanned on the ledger, at least `1..=max_guardians`
    /// and up to the last id handed out
    pub max_guardians: u64,
    /// How long a confirm attempt owns an admission
    pub admission_lease: Duration,
    /// Open invitations older than this are purged
    pub invitation_ttl: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_guardians: 8,
            admission_lease: Duration::seconds(300),
            invitation_ttl: Duration::minutes(30),
        }
    }
}

/// Outcome of a successful confirm
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// This call submitted the admission transaction
    Admitted {
        signature: Signature,
        guardian_address: Pubkey,
    },
    /// The guardian account already existed; no transaction was sent
    AlreadyOnLedger { guardian_address: Pubkey },
    /// The invitation had already been completed; nothing was done
    AlreadyCompleted { transaction_signature: Option<String> },
}

/// Drives guardian invitations and owner-side guardian changes
#[derive(Clone)]
pub struct GuardianManager {
    wallet: WalletService,
    store: Arc<dyn InvitationStore>,
    config: ManagerConfig,
}

impl GuardianManager {
    pub fn new(
        wallet: WalletService,
        store: Arc<dyn InvitationStore>,
        config: ManagerConfig,
    ) -> Self {
        Self {
            wallet,
            store,
            config,
        }
    }

    pub fn wallet(&self) -> &WalletService {
        &self.wallet
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Invite a new guardian to `multisig` on behalf of an owner guardian
    ///
    /// Reserves the next guardian id above every guardian already on the
    /// ledger and every id handed out before, then stores a pending
    /// invitation under a fresh invite code. Ids are never reused, so
    /// purged or abandoned invitations leave gaps rather than blocking
    /// later ones.
    pub async fn create_invitation(
        &self,
        multisig: &Pubkey,
        guardian_name: &str,
        acting_owner_id: u64,
    ) -> Result<GuardianInvitation, GuardianError> {
        validate_guardian_name(guardian_name)?;
        let guardian_name = guardian_name.trim();

        self.wallet
            .fetch_multisig(multisig)
            .await
            .map_err(|e| GuardianError::from_wallet(e, format!("multisig {}", multisig)))?
            .ok_or_else(|| GuardianError::Validation(format!("multisig {} not found", multisig)))?;
        self.require_owner(multisig, acting_owner_id).await?;

        let floor = self
            .list_guardians(multisig)
            .await?
            .iter()
            .map(|g| g.account.guardian_id)
            .max()
            .unwrap_or(OWNER_GUARDIAN_ID);
        let guardian_id = self.store.allocate_guardian_id(multisig, floor).await?;

        for _ in 0..INVITE_CODE_ATTEMPTS {
            let invitation = GuardianInvitation::new(
                generate_invite_code(),
                *multisig,
                guardian_id,
                guardian_name.to_string(),
            );
            match self.store.save(&invitation).await {
                Ok(()) => {
                    log::info!(
                        "Created invitation {} for guardian {} of {}",
                        invitation.invite_code,
                        guardian_id,
                        multisig
                    );
                    return Ok(invitation);
                }
                Err(StoreError::AlreadyExists(code)) => {
                    log::debug!("Invite code {} collided, regenerating", code);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(GuardianError::Validation(
            "could not generate an unused invite code".to_string(),
        ))
    }

    /// Look up an invitation
    pub async fn invitation(&self, invite_code: &str) -> Result<GuardianInvitation, GuardianError> {
        self.store
            .load(invite_code)
            .await?
            .ok_or_else(|| GuardianError::InvitationNotFound(invite_code.to_string()))
    }

    /// All invitations for a multisig, ordered by guardian id
    pub async fn list_invitations(
        &self,
        multisig: &Pubkey,
    ) -> Result<Vec<GuardianInvitation>, GuardianError> {
        Ok(self.store.list_for_multisig(multisig).await?)
    }

    /// Record the invitee's passkey registration (`pending -> ready`)
    pub async fn register_invitee(
        &self,
        invite_code: &str,
        recovery_hash: [u8; 32],
        webauthn_public_key: &[u8],
        credential_id: &str,
    ) -> Result<GuardianInvitation, GuardianError> {
        let public_key = compress_public_key(webauthn_public_key)
            .map_err(|e| GuardianError::Validation(format!("invitation {}: {}", invite_code, e)))?;
        validate_credential_id(credential_id)
            .map_err(|e| GuardianError::Validation(format!("invitation {}: {}", invite_code, e)))?;

        for _ in 0..CAS_ATTEMPTS {
            let current = self.invitation(invite_code).await?;
            if current.status != InvitationStatus::Pending {
                return Err(GuardianError::StateConflict {
                    invite_code: invite_code.to_string(),
                    expected: InvitationStatus::Pending,
                    actual: current.status,
                });
            }

            let mut ready = current.clone();
            ready.status = InvitationStatus::Ready;
            ready.recovery_hash = Some(recovery_hash);
            ready.webauthn_public_key = Some(public_key);
            ready.webauthn_credential_id = Some(credential_id.to_string());
            ready.updated_at = Utc::now();

            if self.store.compare_and_swap(&ready, current.revision).await? {
                ready.revision = current.revision + 1;
                log::info!(
                    "Invitation {} is ready (guardian {})",
                    invite_code,
                    ready.guardian_id
                );
                return Ok(ready);
            }
        }
        Err(GuardianError::Contention(invite_code.to_string()))
    }

    /// Admit the invited guardian on the ledger (`ready -> completed`)
    ///
    /// `owner_assertion` is an owner guardian's passkey approval; its
    /// verification instruction precedes the `add_guardian` instruction.
    /// Confirming a completed invitation succeeds without submitting.
    pub async fn confirm(
        &self,
        invite_code: &str,
        owner_assertion: WebAuthnAssertion,
    ) -> Result<Admission, GuardianError> {
        for _ in 0..CAS_ATTEMPTS {
            let current = self.invitation(invite_code).await?;
            match current.status {
                InvitationStatus::Completed => {
                    log::info!("Invitation {} already completed", invite_code);
                    return Ok(Admission::AlreadyCompleted {
                        transaction_signature: current.transaction_signature,
                    });
                }
                InvitationStatus::Pending => {
                    return Err(GuardianError::StateConflict {
                        invite_code: invite_code.to_string(),
                        expected: InvitationStatus::Ready,
                        actual: current.status,
                    });
                }
                InvitationStatus::Ready => {}
            }

            let now = Utc::now();
            if current.lease_active(now, self.config.admission_lease) {
                return Err(GuardianError::AdmissionInProgress(invite_code.to_string()));
            }

            let mut leased = current.clone();
            leased.admission_lease = Some(now);
            leased.updated_at = now;
            if !self.store.compare_and_swap(&leased, current.revision).await? {
                // Someone else moved the record; look again
                continue;
            }
            leased.revision = current.revision + 1;

            return self.admit(leased, owner_assertion).await;
        }
        Err(GuardianError::Contention(invite_code.to_string()))
    }

    /// Run [`confirm`](Self::confirm) in the background
    ///
    /// Callers that render optimistically can do so while the handle
    /// resolves.
    pub fn spawn_confirm(
        &self,
        invite_code: String,
        owner_assertion: WebAuthnAssertion,
    ) -> JoinHandle<Result<Admission, GuardianError>> {
        let manager = self.clone();
        tokio::spawn(async move { manager.confirm(&invite_code, owner_assertion).await })
    }

    /// Submit the admission while holding the lease
    async fn admit(
        &self,
        leased: GuardianInvitation,
        owner_assertion: WebAuthnAssertion,
    ) -> Result<Admission, GuardianError> {
        let invite_code = leased.invite_code.clone();
        let context = format!("invitation {}", invite_code);
        let (guardian_address, _) = self
            .wallet
            .builder()
            .deriver()
            .guardian_address(&leased.multisig, leased.guardian_id);

        let exists = match self
            .wallet
            .guardian_exists(&leased.multisig, leased.guardian_id)
            .await
        {
            Ok(exists) => exists,
            Err(e) => {
                self.release_lease(&leased).await;
                return Err(GuardianError::from_wallet(e, context));
            }
        };
        if exists {
            log::warn!(
                "Guardian {} of {} already on ledger, completing invitation {} without submitting",
                leased.guardian_id,
                leased.multisig,
                invite_code
            );
            self.complete(&leased, ALREADY_ON_LEDGER).await;
            return Ok(Admission::AlreadyOnLedger { guardian_address });
        }

        let transaction = match self.admission_transaction(&leased, owner_assertion) {
            Ok(tx) => tx,
            Err(e) => {
                self.release_lease(&leased).await;
                return Err(e);
            }
        };

        log::info!(
            "Submitting admission of guardian {} to {} (invitation {})",
            leased.guardian_id,
            leased.multisig,
            invite_code
        );
        let signature = match self.wallet.submit(transaction).await {
            Ok(signature) => signature,
            Err(e) => {
                log::warn!("Admission for invitation {} failed: {}", invite_code, e);
                self.release_lease(&leased).await;
                return Err(GuardianError::from_wallet(e, context));
            }
        };

        self.complete(&leased, &signature.to_string()).await;
        log::info!(
            "Guardian {} admitted to {} (invitation {}, tx {})",
            leased.guardian_id,
            leased.multisig,
            invite_code,
            signature
        );
        Ok(Admission::Admitted {
            signature,
            guardian_address,
        })
    }

    fn admission_transaction(
        &self,
        invitation: &GuardianInvitation,
        owner_assertion: WebAuthnAssertion,
    ) -> Result<solana_sdk::transaction::Transaction, GuardianError> {
        let missing = |field: &str| {
            GuardianError::Validation(format!(
                "invitation {} has no {}",
                invitation.invite_code, field
            ))
        };
        let admission = GuardianAdmission {
            multisig: invitation.multisig,
            guardian_id: invitation.guardian_id,
            name: invitation.guardian_name.clone(),
            recovery_hash: invitation.recovery_hash.ok_or_else(|| missing("recovery hash"))?,
            webauthn_public_key: invitation
                .webauthn_public_key
                .ok_or_else(|| missing("passkey"))?,
        };
        let proof = owner_assertion
            .into_proof(self.wallet.flip_public_key_parity())
            .map_err(|e| {
                GuardianError::Validation(format!(
                    "invitation {}: owner assertion: {}",
                    invitation.invite_code, e
                ))
            })?;
        Ok(self.wallet.builder().add_guardian(&admission, &proof)?)
    }

    /// Record the admission as completed
    ///
    /// The ledger already holds the outcome, so this never fails the
    /// caller. If the lease was taken over meanwhile, the record is
    /// re-read and completed from whatever state it reached; a completion
    /// carrying a real signature is kept.
    async fn complete(&self, leased: &GuardianInvitation, transaction_signature: &str) {
        let mut expected = leased.clone();
        for _ in 0..CAS_ATTEMPTS {
            let mut completed = expected.clone();
            completed.status = InvitationStatus::Completed;
            completed.transaction_signature = Some(transaction_signature.to_string());
            completed.admission_lease = None;
            completed.updated_at = Utc::now();

            match self.store.compare_and_swap(&completed, expected.revision).await {
                Ok(true) => return,
                Ok(false) => {
                    log::warn!(
                        "Invitation {} changed while admitting; re-reading",
                        leased.invite_code
                    );
                }
                Err(e) => {
                    log::warn!(
                        "Failed to record completion of invitation {}: {}",
                        leased.invite_code,
                        e
                    );
                    continue;
                }
            }

            match self.store.load(&leased.invite_code).await {
                Ok(Some(current))
                    if current.status == InvitationStatus::Completed
                        && (current.transaction_signature.as_deref() != Some(ALREADY_ON_LEDGER)
                            || transaction_signature == ALREADY_ON_LEDGER) =>
                {
                    return;
                }
                Ok(Some(current)) => expected = current,
                Ok(None) => {
                    log::warn!(
                        "Invitation {} was deleted while admitting (tx {})",
                        leased.invite_code,
                        transaction_signature
                    );
                    return;
                }
                Err(e) => log::warn!(
                    "Failed to re-read invitation {}: {}",
                    leased.invite_code,
                    e
                ),
            }
        }
        log::error!(
            "Invitation {} admitted on ledger (tx {}) but completion was not recorded",
            leased.invite_code,
            transaction_signature
        );
    }

    /// Give the lease back, leaving the invitation ready
    async fn release_lease(&self, leased: &GuardianInvitation) {
        let mut released = leased.clone();
        released.admission_lease = None;
        released.updated_at = Utc::now();
        match self.store.compare_and_swap(&released, leased.revision).await {
            Ok(true) => {}
            Ok(false) => log::warn!(
                "Invitation {} changed while admitting; lease not released",
                leased.invite_code
            ),
            Err(e) => log::error!(
                "Failed to release lease on invitation {}: {}",
                leased.invite_code,
                e
            ),
        }
    }

    /// Remove a guardian on behalf of an owner guardian
    pub async fn remove_guardian(
        &self,
        multisig: &Pubkey,
        guardian_id: u64,
        acting_owner_id: u64,
        owner_assertion: Option<WebAuthnAssertion>,
    ) -> Result<Signature, GuardianError> {
        if guardian_id == OWNER_GUARDIAN_ID {
            return Err(GuardianError::ProtectedGuardian(guardian_id));
        }
        self.require_owner(multisig, acting_owner_id).await?;
        self.require_guardian(multisig, guardian_id).await?;

        let proof = self.optional_proof(owner_assertion, guardian_id)?;
        let transaction = self.wallet.builder().remove_guardian(
            multisig,
            guardian_id,
            acting_owner_id,
            proof.as_ref(),
        )?;
        let signature = self
            .wallet
            .submit(transaction)
            .await
            .map_err(|e| GuardianError::from_wallet(e, format!("removing guardian {}", guardian_id)))?;

        log::info!(
            "Guardian {} removed from {} by guardian {} (tx {})",
            guardian_id,
            multisig,
            acting_owner_id,
            signature
        );
        Ok(signature)
    }

    /// Activate or deactivate a guardian on behalf of an owner guardian
    pub async fn set_guardian_status(
        &self,
        multisig: &Pubkey,
        guardian_id: u64,
        acting_owner_id: u64,
        is_active: bool,
        owner_assertion: Option<WebAuthnAssertion>,
    ) -> Result<Signature, GuardianError> {
        if guardian_id == OWNER_GUARDIAN_ID && !is_active {
            return Err(GuardianError::ProtectedGuardian(guardian_id));
        }
        self.require_owner(multisig, acting_owner_id).await?;
        self.require_guardian(multisig, guardian_id).await?;

        let proof = self.optional_proof(owner_assertion, guardian_id)?;
        let transaction = self.wallet.builder().update_guardian_status(
            multisig,
            guardian_id,
            acting_owner_id,
            is_active,
            proof.as_ref(),
        )?;
        let signature = self.wallet.submit(transaction).await.map_err(|e| {
            GuardianError::from_wallet(e, format!("updating guardian {}", guardian_id))
        })?;

        log::info!(
            "Guardian {} of {} set {} (tx {})",
            guardian_id,
            multisig,
            if is_active { "active" } else { "inactive" },
            signature
        );
        Ok(signature)
    }

    /// Bind a new passkey to a guardian that lost its own
    ///
    /// Authorized by the guardian's recovery hash alone. The guardian keeps
    /// its id, its name and its owner flag.
    pub async fn recover_access(
        &self,
        multisig: &Pubkey,
        guardian_id: u64,
        recovery_hash: [u8; 32],
        new_public_key: &[u8],
    ) -> Result<Signature, GuardianError> {
        let entry = self.require_guardian(multisig, guardian_id).await?;
        if !entry.account.is_active {
            return Err(GuardianError::Validation(format!(
                "guardian {} of {} is inactive",
                guardian_id, multisig
            )));
        }
        let signature = self
            .wallet
            .recover_access(multisig, guardian_id, guardian_id, recovery_hash, new_public_key)
            .await
            .map_err(|e| GuardianError::from_wallet(e, format!("recovering guardian {}", guardian_id)))?;

        log::info!(
            "Guardian {} of {} recovered with a new passkey (tx {})",
            guardian_id,
            multisig,
            signature
        );
        Ok(signature)
    }

    /// Guardians currently on the ledger
    pub async fn list_guardians(&self, multisig: &Pubkey) -> Result<Vec<GuardianEntry>, GuardianError> {
        let last_allocated = self.store.last_guardian_id(multisig).await?.unwrap_or(0);
        self.wallet
            .list_guardians(multisig, self.config.max_guardians.max(last_allocated))
            .await
            .map_err(|e| GuardianError::from_wallet(e, format!("listing guardians of {}", multisig)))
    }

    /// Delete open invitations older than `max_age` (default: configured TTL)
    ///
    /// Invitations with a live admission lease are left alone.
    pub async fn purge_stale(&self, max_age: Option<Duration>) -> Result<usize, GuardianError> {
        let max_age = max_age.unwrap_or(self.config.invitation_ttl);
        let now = Utc::now();
        let mut purged = 0;

        for invitation in self.store.list_all().await? {
            if !invitation.is_stale(now, max_age)
                || invitation.lease_active(now, self.config.admission_lease)
            {
                continue;
            }
            if self.store.delete(&invitation.invite_code).await? {
                log::info!(
                    "Purged stale {} invitation {}",
                    invitation.status,
                    invitation.invite_code
                );
                purged += 1;
            }
        }
        Ok(purged)
    }

    async fn require_owner(&self, multisig: &Pubkey, guardian_id: u64) -> Result<(), GuardianError> {
        let entry = self.require_guardian(multisig, guardian_id).await?;
        if !entry.account.is_owner || !entry.account.is_active {
            return Err(GuardianError::Validation(format!(
                "guardian {} is not an active owner of {}",
                guardian_id, multisig
            )));
        }
        Ok(())
    }

    async fn require_guardian(
        &self,
        multisig: &Pubkey,
        guardian_id: u64,
    ) -> Result<GuardianEntry, GuardianError> {
        self.wallet
            .fetch_guardian(multisig, guardian_id)
            .await
            .map_err(|e| GuardianError::from_wallet(e, format!("guardian {}", guardian_id)))?
            .ok_or(GuardianError::GuardianNotFound {
                multisig: *multisig,
                guardian_id,
            })
    }

    fn optional_proof(
        &self,
        assertion: Option<WebAuthnAssertion>,
        guardian_id: u64,
    ) -> Result<Option<crate::multisig::AuthorizationProof>, GuardianError> {
        assertion
            .map(|a| a.into_proof(self.wallet.flip_public_key_parity()))
            .transpose()
            .map_err(|e| {
                GuardianError::Validation(format!("guardian {}: owner assertion: {}", guardian_id, e))
            })
    }
}
