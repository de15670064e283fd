//! Guardian invitation records
//!
//! An invitation tracks one guardian admission off-ledger, from the owner's
//! invite through the invitee's passkey registration to the admission
//! transaction.

use chrono::{DateTime, Duration, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use solana_sdk::pubkey::Pubkey;
use std::fmt;

/// Length of generated invite codes
pub const INVITE_CODE_LEN: usize = 8;

/// Admission progress of an invitation
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum InvitationStatus {
    /// Created by the owner, waiting for the invitee
    Pending,
    /// Invitee registered a passkey; waiting for owner confirmation
    Ready,
    /// Admitted on the ledger
    Completed,
}

impl fmt::Display for InvitationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InvitationStatus::Pending => "pending",
            InvitationStatus::Ready => "ready",
            InvitationStatus::Completed => "completed",
        };
        write!(f, "{}", s)
    }
}

/// Generate a fresh invite code
pub fn generate_invite_code() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(INVITE_CODE_LEN)
        .map(char::from)
        .collect()
}

/// Off-ledger record of an in-flight guardian admission
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GuardianInvitation {
    pub invite_code: String,
    #[serde(with = "base58_pubkey")]
    pub multisig: Pubkey,
    pub guardian_id: u64,
    pub guardian_name: String,
    pub status: InvitationStatus,
    #[serde(default, with = "opt_hex")]
    pub recovery_hash: Option<[u8; 32]>,
    #[serde(default, with = "opt_hex")]
    pub webauthn_public_key: Option<[u8; 33]>,
    #[serde(default)]
    pub webauthn_credential_id: Option<String>,
    /// Admission transaction signature, or a marker if the guardian was
    /// found already present on the ledger
    #[serde(default)]
    pub transaction_signature: Option<String>,
    /// Bumped by the store on every successful compare-and-swap
    #[serde(default)]
    pub revision: u64,
    /// Set while one confirm attempt owns the admission
    #[serde(default)]
    pub admission_lease: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl GuardianInvitation {
    /// Create a pending invitation
    pub fn new(
        invite_code: String,
        multisig: Pubkey,
        guardian_id: u64,
        guardian_name: String,
    ) -> Self {
        let now = Utc::now();
        Self {
            invite_code,
            multisig,
            guardian_id,
            guardian_name,
            status: InvitationStatus::Pending,
            recovery_hash: None,
            webauthn_public_key: None,
            webauthn_credential_id: None,
            transaction_signature: None,
            revision: 0,
            admission_lease: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == InvitationStatus::Completed
    }

    /// Whether another confirm attempt currently owns the admission
    pub fn lease_active(&self, now: DateTime<Utc>, lease: Duration) -> bool {
        self.admission_lease
            .map(|taken| now < taken + lease)
            .unwrap_or(false)
    }

    /// Whether the invitation is still open and older than `max_age`
    pub fn is_stale(&self, now: DateTime<Utc>, max_age: Duration) -> bool {
        !self.is_completed() && now - self.created_at > max_age
    }

    /// Public view without key material
    pub fn summary(&self) -> InvitationSummary {
        InvitationSummary {
            invite_code: self.invite_code.clone(),
            multisig: self.multisig.to_string(),
            guardian_id: self.guardian_id,
            guardian_name: self.guardian_name.clone(),
            status: self.status,
            has_passkey: self.webauthn_public_key.is_some(),
            transaction_signature: self.transaction_signature.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

impl fmt::Debug for GuardianInvitation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GuardianInvitation")
            .field("invite_code", &self.invite_code)
            .field("multisig", &self.multisig)
            .field("guardian_id", &self.guardian_id)
            .field("guardian_name", &self.guardian_name)
            .field("status", &self.status)
            .field("recovery_hash", &self.recovery_hash.map(|_| "<redacted>"))
            .field(
                "webauthn_public_key",
                &self.webauthn_public_key.map(|_| "<redacted>"),
            )
            .field("transaction_signature", &self.transaction_signature)
            .field("revision", &self.revision)
            .field("admission_lease", &self.admission_lease)
            .finish()
    }
}

/// Invitation fields that are safe to show to either party
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct InvitationSummary {
    pub invite_code: String,
    pub multisig: String,
    pub guardian_id: u64,
    pub guardian_name: String,
    pub status: InvitationStatus,
    pub has_passkey: bool,
    pub transaction_signature: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

mod base58_pubkey {
    use serde::{de, Deserialize, Deserializer, Serializer};
    use solana_sdk::pubkey::Pubkey;

    pub fn serialize<S: Serializer>(key: &Pubkey, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&key.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Pubkey, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(de::Error::custom)
    }
}

mod opt_hex {
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer, const N: usize>(
        bytes: &Option<[u8; N]>,
        s: S,
    ) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(b) => s.serialize_some(&hex::encode(b)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>, const N: usize>(
        d: D,
    ) -> Result<Option<[u8; N]>, D::Error> {
        let Some(text) = Option::<String>::deserialize(d)? else {
            return Ok(None);
        };
        let bytes = hex::decode(&text).map_err(de::Error::custom)?;
        let array = <[u8; N]>::try_from(bytes.as_slice())
            .map_err(|_| de::Error::custom(format!("expected {} bytes", N)))?;
        Ok(Some(array))
    }
}
