//! REST API handlers for guardian operations

use crate::guardian::{Admission, GuardianError, GuardianManager, InvitationSummary};
use crate::multisig::{decode_base64, EncodedAssertion, GuardianEntry};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use solana_sdk::pubkey::Pubkey;
use std::sync::Arc;

/// Shared application state for API handlers
#[derive(Clone)]
pub struct ApiState {
    pub manager: Arc<GuardianManager>,
}

impl ApiState {
    pub fn new(manager: GuardianManager) -> Self {
        Self {
            manager: Arc::new(manager),
        }
    }
}

// ============================================================================
// Response Types
// ============================================================================

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    pub retryable: bool,
}

type ApiResult<T> = Result<Json<T>, (StatusCode, Json<ApiError>)>;

#[derive(Serialize)]
pub struct ConfirmResponse {
    /// `admitted`, `already_on_ledger` or `already_completed`
    pub outcome: &'static str,
    pub transaction_signature: Option<String>,
    pub guardian_address: Option<String>,
}

impl From<Admission> for ConfirmResponse {
    fn from(admission: Admission) -> Self {
        match admission {
            Admission::Admitted {
                signature,
                guardian_address,
            } => Self {
                outcome: "admitted",
                transaction_signature: Some(signature.to_string()),
                guardian_address: Some(guardian_address.to_string()),
            },
            Admission::AlreadyOnLedger { guardian_address } => Self {
                outcome: "already_on_ledger",
                transaction_signature: None,
                guardian_address: Some(guardian_address.to_string()),
            },
            Admission::AlreadyCompleted {
                transaction_signature,
            } => Self {
                outcome: "already_completed",
                transaction_signature,
                guardian_address: None,
            },
        }
    }
}

#[derive(Serialize)]
pub struct GuardianInfo {
    pub guardian_id: u64,
    pub address: String,
    pub name: String,
    pub is_active: bool,
    pub is_owner: bool,
    pub has_passkey: bool,
}

impl From<&GuardianEntry> for GuardianInfo {
    fn from(entry: &GuardianEntry) -> Self {
        Self {
            guardian_id: entry.account.guardian_id,
            address: entry.address.to_string(),
            name: entry.account.name.clone(),
            is_active: entry.account.is_active,
            is_owner: entry.account.is_owner,
            has_passkey: entry.account.webauthn_pubkey.is_some(),
        }
    }
}

#[derive(Serialize)]
pub struct SignatureResponse {
    pub transaction_signature: String,
}

// ============================================================================
// Request Types
// ============================================================================

#[derive(Deserialize)]
pub struct InviteRequest {
    pub multisig: String,
    pub guardian_name: String,
    /// Owner guardian issuing the invitation
    pub owner_guardian_id: u64,
}

#[derive(Deserialize)]
pub struct RegisterRequest {
    /// Hex SHA-256 of the invitee's recovery phrase
    pub recovery_hash: String,
    /// Base64 SEC1 public key from the passkey registration
    pub public_key: String,
    pub credential_id: String,
}

#[derive(Deserialize)]
pub struct ConfirmRequest {
    pub owner_assertion: EncodedAssertion,
}

#[derive(Deserialize)]
pub struct RemoveRequest {
    pub multisig: String,
    pub guardian_id: u64,
    pub owner_guardian_id: u64,
    pub owner_assertion: Option<EncodedAssertion>,
}

#[derive(Deserialize)]
pub struct RecoverRequest {
    pub multisig: String,
    pub guardian_id: u64,
    /// Hex SHA-256 of the guardian's recovery phrase
    pub recovery_hash: String,
    /// Base64 SEC1 public key of the replacement passkey
    pub public_key: String,
}

#[derive(Deserialize)]
pub struct StatusRequest {
    pub multisig: String,
    pub guardian_id: u64,
    pub owner_guardian_id: u64,
    pub is_active: bool,
    pub owner_assertion: Option<EncodedAssertion>,
}

// ============================================================================
// Error mapping
// ============================================================================

fn bad_request(message: impl Into<String>) -> (StatusCode, Json<ApiError>) {
    (
        StatusCode::BAD_REQUEST,
        Json(ApiError {
            error: message.into(),
            retryable: false,
        }),
    )
}

fn guardian_error(error: GuardianError) -> (StatusCode, Json<ApiError>) {
    let status = match &error {
        GuardianError::Validation(_) | GuardianError::ProtectedGuardian(_) => {
            StatusCode::BAD_REQUEST
        }
        GuardianError::InvitationNotFound(_) | GuardianError::GuardianNotFound { .. } => {
            StatusCode::NOT_FOUND
        }
        GuardianError::StateConflict { .. }
        | GuardianError::AdmissionInProgress(_)
        | GuardianError::Contention(_) => StatusCode::CONFLICT,
        GuardianError::LedgerSubmission { .. } | GuardianError::Account(_) => {
            StatusCode::BAD_GATEWAY
        }
        GuardianError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        log::error!("API request failed: {}", error);
    }
    (
        status,
        Json(ApiError {
            retryable: error.is_retryable(),
            error: error.to_string(),
        }),
    )
}

fn parse_pubkey(field: &str, value: &str) -> Result<Pubkey, (StatusCode, Json<ApiError>)> {
    value
        .parse::<Pubkey>()
        .map_err(|_| bad_request(format!("{} is not a valid address", field)))
}

fn parse_recovery_hash(value: &str) -> Result<[u8; 32], (StatusCode, Json<ApiError>)> {
    hex::decode(value.trim())
        .ok()
        .and_then(|bytes| bytes.try_into().ok())
        .ok_or_else(|| bad_request("recovery_hash must be 32 hex-encoded bytes"))
}

fn parse_assertion(
    encoded: Option<EncodedAssertion>,
) -> Result<Option<crate::multisig::WebAuthnAssertion>, (StatusCode, Json<ApiError>)> {
    encoded
        .map(|a| a.decode())
        .transpose()
        .map_err(|e| bad_request(e.to_string()))
}

// ============================================================================
// Handlers
// ============================================================================

/// GET /health - Health check
pub async fn health_check() -> &'static str {
    "OK"
}

/// POST /api/guardian/invite - Create an invitation
pub async fn create_invitation(
    State(state): State<ApiState>,
    Json(req): Json<InviteRequest>,
) -> ApiResult<InvitationSummary> {
    let multisig = parse_pubkey("multisig", &req.multisig)?;
    let invitation = state
        .manager
        .create_invitation(&multisig, &req.guardian_name, req.owner_guardian_id)
        .await
        .map_err(guardian_error)?;
    Ok(Json(invitation.summary()))
}

/// GET /api/guardian/{code} - Invitation status
pub async fn get_invitation(
    State(state): State<ApiState>,
    Path(code): Path<String>,
) -> ApiResult<InvitationSummary> {
    let invitation = state.manager.invitation(&code).await.map_err(guardian_error)?;
    Ok(Json(invitation.summary()))
}

/// POST /api/guardian/{code}/register - Invitee passkey registration
pub async fn register_invitee(
    State(state): State<ApiState>,
    Path(code): Path<String>,
    Json(req): Json<RegisterRequest>,
) -> ApiResult<InvitationSummary> {
    let recovery_hash = parse_recovery_hash(&req.recovery_hash)?;
    let public_key =
        decode_base64("public_key", &req.public_key).map_err(|e| bad_request(e.to_string()))?;

    let invitation = state
        .manager
        .register_invitee(&code, recovery_hash, &public_key, &req.credential_id)
        .await
        .map_err(guardian_error)?;
    Ok(Json(invitation.summary()))
}

/// POST /api/guardian/{code}/confirm - Owner confirms the admission
pub async fn confirm_invitation(
    State(state): State<ApiState>,
    Path(code): Path<String>,
    Json(req): Json<ConfirmRequest>,
) -> ApiResult<ConfirmResponse> {
    let assertion = req
        .owner_assertion
        .decode()
        .map_err(|e| bad_request(e.to_string()))?;
    let admission = state
        .manager
        .confirm(&code, assertion)
        .await
        .map_err(guardian_error)?;
    Ok(Json(admission.into()))
}

/// POST /api/guardian/remove - Remove a guardian
pub async fn remove_guardian(
    State(state): State<ApiState>,
    Json(req): Json<RemoveRequest>,
) -> ApiResult<SignatureResponse> {
    let multisig = parse_pubkey("multisig", &req.multisig)?;
    let assertion = parse_assertion(req.owner_assertion)?;
    let signature = state
        .manager
        .remove_guardian(&multisig, req.guardian_id, req.owner_guardian_id, assertion)
        .await
        .map_err(guardian_error)?;
    Ok(Json(SignatureResponse {
        transaction_signature: signature.to_string(),
    }))
}

/// POST /api/guardian/status - Activate or deactivate a guardian
pub async fn set_guardian_status(
    State(state): State<ApiState>,
    Json(req): Json<StatusRequest>,
) -> ApiResult<SignatureResponse> {
    let multisig = parse_pubkey("multisig", &req.multisig)?;
    let assertion = parse_assertion(req.owner_assertion)?;
    let signature = state
        .manager
        .set_guardian_status(
            &multisig,
            req.guardian_id,
            req.owner_guardian_id,
            req.is_active,
            assertion,
        )
        .await
        .map_err(guardian_error)?;
    Ok(Json(SignatureResponse {
        transaction_signature: signature.to_string(),
    }))
}

/// POST /api/wallet/recover - Bind a new passkey using the recovery phrase hash
pub async fn recover_access(
    State(state): State<ApiState>,
    Json(req): Json<RecoverRequest>,
) -> ApiResult<SignatureResponse> {
    let multisig = parse_pubkey("multisig", &req.multisig)?;
    let recovery_hash = parse_recovery_hash(&req.recovery_hash)?;
    let public_key =
        decode_base64("public_key", &req.public_key).map_err(|e| bad_request(e.to_string()))?;
    let signature = state
        .manager
        .recover_access(&multisig, req.guardian_id, recovery_hash, &public_key)
        .await
        .map_err(guardian_error)?;
    Ok(Json(SignatureResponse {
        transaction_signature: signature.to_string(),
    }))
}

/// GET /api/multisig/{address}/guardians - Guardians on the ledger
pub async fn list_guardians(
    State(state): State<ApiState>,
    Path(address): Path<String>,
) -> ApiResult<Vec<GuardianInfo>> {
    let multisig = parse_pubkey("address", &address)?;
    let guardians = state
        .manager
        .list_guardians(&multisig)
        .await
        .map_err(guardian_error)?;
    Ok(Json(guardians.iter().map(GuardianInfo::from).collect()))
}

/// GET /api/multisig/{address}/invitations - Open and completed invitations
pub async fn list_invitations(
    State(state): State<ApiState>,
    Path(address): Path<String>,
) -> ApiResult<Vec<InvitationSummary>> {
    let multisig = parse_pubkey("address", &address)?;
    let invitations = state
        .manager
        .list_invitations(&multisig)
        .await
        .map_err(guardian_error)?;
    Ok(Json(invitations.iter().map(|i| i.summary()).collect()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{hash_recovery_phrase, sha256};
    use crate::guardian::{InvitationStatus, ManagerConfig};
    use crate::ledger::MemoryLedger;
    use crate::multisig::{AddressDeriver, TransactionBuilder, WalletService};
    use crate::storage::MemoryInvitationStore;
    use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
    use base64::Engine;
    use p256::ecdsa::{signature::Signer as _, Signature as P256Signature, SigningKey};
    use rand::rngs::OsRng;
    use solana_sdk::signature::{Keypair, Signer};

    async fn state() -> (ApiState, Pubkey, SigningKey) {
        let ledger = Arc::new(MemoryLedger::new(*AddressDeriver::default().program_id()));
        let payer = Arc::new(Keypair::new());
        let builder = TransactionBuilder::new(AddressDeriver::default(), payer.pubkey());
        let wallet = WalletService::new(builder, ledger, payer);
        let owner = SigningKey::random(&mut OsRng);
        let created = wallet
            .create_wallet(
                "c2VjcmV0LWNyZWQ",
                1,
                "Owner",
                hash_recovery_phrase("owner"),
                owner.verifying_key().to_encoded_point(true).as_bytes(),
            )
            .await
            .unwrap();
        let manager = GuardianManager::new(
            wallet,
            Arc::new(MemoryInvitationStore::new()),
            ManagerConfig::default(),
        );
        (ApiState::new(manager), created.multisig, owner)
    }

    fn encoded_assertion(key: &SigningKey) -> EncodedAssertion {
        let authenticator_data = vec![0x49; 37];
        let client_data_json = br#"{"type":"webauthn.get","challenge":"YWRk"}"#.to_vec();
        let mut signed = authenticator_data.clone();
        signed.extend_from_slice(&sha256(&client_data_json));
        let sig: P256Signature = key.sign(&signed);
        EncodedAssertion {
            authenticator_data: URL_SAFE_NO_PAD.encode(&authenticator_data),
            client_data_json: URL_SAFE_NO_PAD.encode(&client_data_json),
            signature: URL_SAFE_NO_PAD.encode(sig.to_der().as_bytes()),
            public_key: STANDARD.encode(key.verifying_key().to_encoded_point(false).as_bytes()),
        }
    }

    #[tokio::test]
    async fn test_invite_register_confirm() {
        let (state, multisig, owner) = state().await;

        let Json(created) = create_invitation(
            State(state.clone()),
            Json(InviteRequest {
                multisig: multisig.to_string(),
                guardian_name: "Alice".into(),
                owner_guardian_id: 1,
            }),
        )
        .await
        .unwrap();
        assert_eq!(created.status, InvitationStatus::Pending);
        assert_eq!(created.guardian_id, 2);

        let invitee = SigningKey::random(&mut OsRng);
        let Json(ready) = register_invitee(
            State(state.clone()),
            Path(created.invite_code.clone()),
            Json(RegisterRequest {
                recovery_hash: hex::encode(hash_recovery_phrase("alice")),
                public_key: URL_SAFE_NO_PAD
                    .encode(invitee.verifying_key().to_encoded_point(false).as_bytes()),
                credential_id: "YWxpY2UtY3JlZA".into(),
            }),
        )
        .await
        .unwrap();
        assert_eq!(ready.status, InvitationStatus::Ready);
        assert!(ready.has_passkey);

        let Json(confirmed) = confirm_invitation(
            State(state.clone()),
            Path(created.invite_code.clone()),
            Json(ConfirmRequest {
                owner_assertion: encoded_assertion(&owner),
            }),
        )
        .await
        .unwrap();
        assert_eq!(confirmed.outcome, "admitted");

        let Json(again) = confirm_invitation(
            State(state.clone()),
            Path(created.invite_code.clone()),
            Json(ConfirmRequest {
                owner_assertion: encoded_assertion(&owner),
            }),
        )
        .await
        .unwrap();
        assert_eq!(again.outcome, "already_completed");
        assert_eq!(again.transaction_signature, confirmed.transaction_signature);

        let Json(guardians) = list_guardians(State(state), Path(multisig.to_string()))
            .await
            .unwrap();
        assert_eq!(guardians.len(), 2);
        assert_eq!(guardians[1].name, "Alice");
    }

    #[tokio::test]
    async fn test_error_statuses() {
        let (state, multisig, _) = state().await;

        let (status, _) = get_invitation(State(state.clone()), Path("NOSUCH00".into()))
            .await
            .err()
            .unwrap();
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, Json(body)) = remove_guardian(
            State(state.clone()),
            Json(RemoveRequest {
                multisig: multisig.to_string(),
                guardian_id: 1,
                owner_guardian_id: 1,
                owner_assertion: None,
            }),
        )
        .await
        .err()
        .unwrap();
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(!body.retryable);

        let (status, _) = list_guardians(State(state.clone()), Path("garbage".into()))
            .await
            .err()
            .unwrap();
        assert_eq!(status, StatusCode::BAD_REQUEST);

        // Only an existing owner guardian may invite
        let (status, _) = create_invitation(
            State(state.clone()),
            Json(InviteRequest {
                multisig: multisig.to_string(),
                guardian_name: "Bob".into(),
                owner_guardian_id: 9,
            }),
        )
        .await
        .err()
        .unwrap();
        assert_eq!(status, StatusCode::NOT_FOUND);

        let Json(created) = create_invitation(
            State(state.clone()),
            Json(InviteRequest {
                multisig: multisig.to_string(),
                guardian_name: "Bob".into(),
                owner_guardian_id: 1,
            }),
        )
        .await
        .unwrap();
        let (status, _) = register_invitee(
            State(state.clone()),
            Path(created.invite_code.clone()),
            Json(RegisterRequest {
                recovery_hash: "abcd".into(),
                public_key: "AA".into(),
                credential_id: "Ym9i".into(),
            }),
        )
        .await
        .err()
        .unwrap();
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_recover_access() {
        let (state, multisig, _) = state().await;
        let replacement = SigningKey::random(&mut OsRng);
        let request = |phrase: &str| RecoverRequest {
            multisig: multisig.to_string(),
            guardian_id: 1,
            recovery_hash: hex::encode(hash_recovery_phrase(phrase)),
            public_key: STANDARD.encode(replacement.verifying_key().to_encoded_point(true).as_bytes()),
        };

        let (status, Json(body)) = recover_access(State(state.clone()), Json(request("guess")))
            .await
            .err()
            .unwrap();
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert!(body.error.contains("recovery phrase"));

        let (status, _) = recover_access(
            State(state.clone()),
            Json(RecoverRequest {
                recovery_hash: "00".into(),
                ..request("owner")
            }),
        )
        .await
        .err()
        .unwrap();
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let Json(done) = recover_access(State(state.clone()), Json(request("owner")))
            .await
            .unwrap();
        assert!(!done.transaction_signature.is_empty());

        // The replacement passkey now approves admissions
        let Json(created) = create_invitation(
            State(state.clone()),
            Json(InviteRequest {
                multisig: multisig.to_string(),
                guardian_name: "Erin".into(),
                owner_guardian_id: 1,
            }),
        )
        .await
        .unwrap();
        let invitee = SigningKey::random(&mut OsRng);
        register_invitee(
            State(state.clone()),
            Path(created.invite_code.clone()),
            Json(RegisterRequest {
                recovery_hash: hex::encode(hash_recovery_phrase("erin")),
                public_key: STANDARD.encode(invitee.verifying_key().to_encoded_point(true).as_bytes()),
                credential_id: "ZXJpbi1jcmVk".into(),
            }),
        )
        .await
        .unwrap();
        let Json(confirmed) = confirm_invitation(
            State(state),
            Path(created.invite_code),
            Json(ConfirmRequest {
                owner_assertion: encoded_assertion(&replacement),
            }),
        )
        .await
        .unwrap();
        assert_eq!(confirmed.outcome, "admitted");
    }

    #[test]
    fn test_conflict_maps_to_409() {
        let (status, Json(body)) = guardian_error(GuardianError::AdmissionInProgress("X".into()));
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(body.retryable);
        let (status, Json(body)) = guardian_error(GuardianError::Contention("X".into()));
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(body.retryable);
        let (status, _) = guardian_error(GuardianError::LedgerSubmission {
            context: "x".into(),
            source: crate::ledger::LedgerError::Timeout("30s".into()),
        });
        assert_eq!(status, StatusCode::BAD_GATEWAY);
    }
}
