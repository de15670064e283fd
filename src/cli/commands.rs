//! CLI commands for the wallet client
//!
//! Implements all command handlers for the CLI interface.

use crate::crypto::{compress_public_key, hash_recovery_phrase, signature_from_bytes};
use crate::guardian::{Admission, GuardianManager, InvitationSummary};
use crate::multisig::verification::encode_verification_payload;
use crate::multisig::{AddressDeriver, EncodedAssertion, WebAuthnAssertion};
use solana_sdk::pubkey::Pubkey;
use std::fs;
use std::path::Path;

/// Result type for CLI operations
pub type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

/// Parse a base58 address argument
pub fn parse_pubkey(value: &str) -> CliResult<Pubkey> {
    value
        .parse::<Pubkey>()
        .map_err(|e| format!("invalid address {}: {}", value, e).into())
}

/// Read an owner assertion from a JSON file of base64 fields
pub fn read_assertion(path: &Path) -> CliResult<WebAuthnAssertion> {
    let data = fs::read_to_string(path)?;
    let encoded: EncodedAssertion = serde_json::from_str(&data)?;
    Ok(encoded.decode()?)
}

/// Recovery hash from a hex digest or a phrase
pub fn recovery_hash(hash_hex: Option<&str>, phrase: Option<&str>) -> CliResult<[u8; 32]> {
    match (hash_hex, phrase) {
        (Some(hash), None) => hex::decode(hash.trim())?
            .try_into()
            .map_err(|_| "recovery hash must be 32 bytes".into()),
        (None, Some(phrase)) => Ok(hash_recovery_phrase(phrase)),
        _ => Err("give exactly one of --recovery-hash or --recovery-phrase".into()),
    }
}

fn print_invitation(summary: &InvitationSummary) {
    println!("   ├─ Code: {}", summary.invite_code);
    println!("   ├─ Multisig: {}", summary.multisig);
    println!("   ├─ Guardian: #{} {}", summary.guardian_id, summary.guardian_name);
    println!("   ├─ Status: {}", summary.status);
    if let Some(sig) = &summary.transaction_signature {
        println!("   ├─ Transaction: {}", sig);
    }
    println!("   └─ Created: {}", summary.created_at.to_rfc3339());
}

// ============================================================================
// Offline commands
// ============================================================================

/// Derive the multisig address for a credential id
pub fn cmd_derive_multisig(deriver: &AddressDeriver, credential_id: &str) -> CliResult<()> {
    let (address, bump) = deriver.multisig_address(credential_id)?;
    println!("🔑 Multisig address");
    println!("   ├─ Program: {}", deriver.program_id());
    println!("   ├─ Address: {}", address);
    println!("   └─ Bump: {}", bump);
    Ok(())
}

/// Derive a guardian address
pub fn cmd_derive_guardian(
    deriver: &AddressDeriver,
    multisig: &str,
    guardian_id: u64,
) -> CliResult<()> {
    let multisig = parse_pubkey(multisig)?;
    let (address, bump) = deriver.guardian_address(&multisig, guardian_id);
    println!("🛡️  Guardian #{} of {}", guardian_id, multisig);
    println!("   ├─ Address: {}", address);
    println!("   └─ Bump: {}", bump);
    Ok(())
}

/// Encode a verification payload and print it as hex
///
/// The signature may be DER or raw `r || s`; it is normalized to low-S
/// before encoding.
pub fn cmd_encode(
    message_hex: &str,
    public_key_hex: &str,
    signature_hex: &str,
    flip_public_key_parity: bool,
) -> CliResult<String> {
    let message = hex::decode(message_hex.trim())?;
    let public_key = compress_public_key(&hex::decode(public_key_hex.trim())?)?;
    let signature = signature_from_bytes(&hex::decode(signature_hex.trim())?)?;
    let signature = crate::crypto::normalize_low_s(&signature);
    let payload =
        encode_verification_payload(&message, &public_key, &signature, flip_public_key_parity)?;
    Ok(hex::encode(payload))
}

// ============================================================================
// Wallet commands
// ============================================================================

/// Create a multisig owned by a passkey
pub async fn cmd_wallet_create(
    manager: &GuardianManager,
    credential_id: &str,
    threshold: u8,
    owner_name: &str,
    recovery_hash: [u8; 32],
    public_key_hex: &str,
) -> CliResult<()> {
    let public_key = hex::decode(public_key_hex.trim())?;
    let created = manager
        .wallet()
        .create_wallet(credential_id, threshold, owner_name, recovery_hash, &public_key)
        .await?;
    println!("✅ Multisig created!");
    println!("   ├─ Address: {}", created.multisig);
    println!("   ├─ Owner guardian: {}", created.owner_guardian);
    println!("   └─ Transaction: {}", created.signature);
    Ok(())
}

/// Show a multisig account
pub async fn cmd_wallet_show(manager: &GuardianManager, multisig: &str) -> CliResult<()> {
    let multisig = parse_pubkey(multisig)?;
    let Some(state) = manager.wallet().fetch_multisig(&multisig).await? else {
        println!("📭 No multisig at {}", multisig);
        return Ok(());
    };
    println!("🏦 Multisig {}", multisig);
    println!("   ├─ Owner: {}", state.owner());
    println!("   ├─ Threshold: {}", state.threshold);
    println!("   ├─ Guardians: {}", state.guardian_count);
    println!("   ├─ Transaction nonce: {}", state.transaction_nonce);
    println!("   └─ Credential: {}", state.credential_id);
    Ok(())
}

/// Replace a guardian's lost passkey
pub async fn cmd_wallet_recover(
    manager: &GuardianManager,
    multisig: &str,
    guardian_id: u64,
    recovery_hash: [u8; 32],
    public_key_hex: &str,
) -> CliResult<()> {
    let multisig = parse_pubkey(multisig)?;
    let public_key = hex::decode(public_key_hex.trim())?;
    let signature = manager
        .recover_access(&multisig, guardian_id, recovery_hash, &public_key)
        .await?;
    println!("🔐 Guardian #{} recovered with a new passkey", guardian_id);
    println!("   └─ Transaction: {}", signature);
    Ok(())
}

// ============================================================================
// Proposal commands
// ============================================================================

/// Propose a transfer for guardian approval
pub async fn cmd_proposal_create(
    manager: &GuardianManager,
    multisig: &str,
    proposer_guardian_id: u64,
    destination: &str,
    amount: u64,
    description: &str,
) -> CliResult<()> {
    let multisig = parse_pubkey(multisig)?;
    let destination = parse_pubkey(destination)?;
    let created = manager
        .wallet()
        .create_proposal(&multisig, proposer_guardian_id, description, destination, amount)
        .await?;
    println!("📝 Proposal created!");
    println!("   ├─ Id: {}", created.proposal_id);
    println!("   ├─ Address: {}", created.address);
    println!("   └─ Transaction: {}", created.signature);
    Ok(())
}

/// Approve a proposal with a guardian's passkey assertion
pub async fn cmd_proposal_approve(
    manager: &GuardianManager,
    multisig: &str,
    proposal_id: u64,
    guardian_id: u64,
    assertion_file: &Path,
) -> CliResult<()> {
    let multisig = parse_pubkey(multisig)?;
    let assertion = read_assertion(assertion_file)?;
    let signature = manager
        .wallet()
        .approve_proposal(&multisig, proposal_id, guardian_id, assertion)
        .await?;
    println!("✍️  Guardian #{} approved proposal {} (tx {})", guardian_id, proposal_id, signature);
    Ok(())
}

/// Execute an approved proposal
pub async fn cmd_proposal_execute(
    manager: &GuardianManager,
    multisig: &str,
    proposal_id: u64,
) -> CliResult<()> {
    let multisig = parse_pubkey(multisig)?;
    let signature = manager
        .wallet()
        .execute_proposal(&multisig, proposal_id)
        .await?;
    println!("✅ Proposal {} executed (tx {})", proposal_id, signature);
    Ok(())
}

/// Show a proposal
pub async fn cmd_proposal_show(manager: &GuardianManager, multisig: &str, proposal_id: u64) -> CliResult<()> {
    let multisig = parse_pubkey(multisig)?;
    let Some(entry) = manager.wallet().fetch_proposal(&multisig, proposal_id).await? else {
        println!("📭 No proposal {} on {}", proposal_id, multisig);
        return Ok(());
    };
    let proposal = &entry.account;
    println!("📝 Proposal {} ({})", proposal.proposal_id, entry.address);
    println!("   ├─ Action: {}", proposal.action);
    if let (Some(amount), Some(destination)) = (proposal.params.amount, proposal.params.destination) {
        println!(
            "   ├─ Transfer: {} lamports to {}",
            amount,
            Pubkey::new_from_array(destination)
        );
    }
    println!("   ├─ Description: {}", proposal.description);
    println!("   ├─ Status: {:?}", proposal.status);
    println!(
        "   └─ Approvals: {}/{}",
        proposal.signatures_count, proposal.required_signatures
    );
    Ok(())
}

// ============================================================================
// Invitation commands
// ============================================================================

/// Create an invitation
pub async fn cmd_invite_create(
    manager: &GuardianManager,
    multisig: &str,
    guardian_name: &str,
    owner_guardian_id: u64,
) -> CliResult<()> {
    let multisig = parse_pubkey(multisig)?;
    let invitation = manager
        .create_invitation(&multisig, guardian_name, owner_guardian_id)
        .await?;
    println!("📨 Invitation created!");
    print_invitation(&invitation.summary());
    Ok(())
}

/// Record the invitee's passkey
pub async fn cmd_invite_register(
    manager: &GuardianManager,
    code: &str,
    recovery_hash: [u8; 32],
    public_key_hex: &str,
    credential_id: &str,
) -> CliResult<()> {
    let public_key = hex::decode(public_key_hex.trim())?;
    let invitation = manager
        .register_invitee(code, recovery_hash, &public_key, credential_id)
        .await?;
    println!("🔐 Passkey registered, waiting for owner confirmation");
    print_invitation(&invitation.summary());
    Ok(())
}

/// Confirm an invitation with an owner assertion
pub async fn cmd_invite_confirm(
    manager: &GuardianManager,
    code: &str,
    assertion_file: &Path,
) -> CliResult<()> {
    let assertion = read_assertion(assertion_file)?;
    match manager.confirm(code, assertion).await? {
        Admission::Admitted {
            signature,
            guardian_address,
        } => {
            println!("✅ Guardian admitted!");
            println!("   ├─ Guardian: {}", guardian_address);
            println!("   └─ Transaction: {}", signature);
        }
        Admission::AlreadyOnLedger { guardian_address } => {
            println!("ℹ️  Guardian {} was already on the ledger", guardian_address);
        }
        Admission::AlreadyCompleted {
            transaction_signature,
        } => {
            println!(
                "ℹ️  Invitation {} already completed ({})",
                code,
                transaction_signature.as_deref().unwrap_or("-")
            );
        }
    }
    Ok(())
}

/// Show one invitation
pub async fn cmd_invite_show(manager: &GuardianManager, code: &str) -> CliResult<()> {
    let invitation = manager.invitation(code).await?;
    println!("📨 Invitation");
    print_invitation(&invitation.summary());
    Ok(())
}

/// List invitations for a multisig
pub async fn cmd_invite_list(manager: &GuardianManager, multisig: &str) -> CliResult<()> {
    let multisig = parse_pubkey(multisig)?;
    let invitations = manager.list_invitations(&multisig).await?;
    if invitations.is_empty() {
        println!("📭 No invitations for {}", multisig);
        return Ok(());
    }
    println!("📋 Invitations for {}:", multisig);
    for invitation in &invitations {
        println!(
            "   {} #{} {} - {}",
            invitation.invite_code, invitation.guardian_id, invitation.guardian_name, invitation.status
        );
    }
    Ok(())
}

/// Delete stale open invitations
pub async fn cmd_invite_purge(manager: &GuardianManager, max_age_minutes: Option<i64>) -> CliResult<()> {
    let purged = manager
        .purge_stale(max_age_minutes.map(chrono::Duration::minutes))
        .await?;
    println!("🧹 Purged {} stale invitation(s)", purged);
    Ok(())
}

// ============================================================================
// Guardian commands
// ============================================================================

/// List guardians on the ledger
pub async fn cmd_guardian_list(manager: &GuardianManager, multisig: &str) -> CliResult<()> {
    let multisig = parse_pubkey(multisig)?;
    let guardians = manager.list_guardians(&multisig).await?;
    if guardians.is_empty() {
        println!("📭 No guardians found for {}", multisig);
        return Ok(());
    }
    println!("🛡️  Guardians of {}:", multisig);
    for entry in &guardians {
        let g = &entry.account;
        println!(
            "   #{} {} ({}){}{}",
            g.guardian_id,
            g.name,
            entry.address,
            if g.is_owner { " owner" } else { "" },
            if g.is_active { "" } else { " inactive" }
        );
    }
    Ok(())
}

/// Remove a guardian
pub async fn cmd_guardian_remove(
    manager: &GuardianManager,
    multisig: &str,
    guardian_id: u64,
    owner_guardian_id: u64,
    assertion_file: Option<&Path>,
) -> CliResult<()> {
    let multisig = parse_pubkey(multisig)?;
    let assertion = assertion_file.map(read_assertion).transpose()?;
    let signature = manager
        .remove_guardian(&multisig, guardian_id, owner_guardian_id, assertion)
        .await?;
    println!("🗑️  Guardian #{} removed (tx {})", guardian_id, signature);
    Ok(())
}

/// Activate or deactivate a guardian
pub async fn cmd_guardian_status(
    manager: &GuardianManager,
    multisig: &str,
    guardian_id: u64,
    owner_guardian_id: u64,
    is_active: bool,
    assertion_file: Option<&Path>,
) -> CliResult<()> {
    let multisig = parse_pubkey(multisig)?;
    let assertion = assertion_file.map(read_assertion).transpose()?;
    let signature = manager
        .set_guardian_status(&multisig, guardian_id, owner_guardian_id, is_active, assertion)
        .await?;
    println!(
        "🔄 Guardian #{} is now {} (tx {})",
        guardian_id,
        if is_active { "active" } else { "inactive" },
        signature
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::multisig::verification::{decode_verification_payload, DATA_START};
    use p256::ecdsa::{signature::Signer as _, Signature as P256Signature, SigningKey};
    use rand::rngs::OsRng;

    #[test]
    fn test_encode_command_payload() {
        let key = SigningKey::random(&mut OsRng);
        let message = b"approve".to_vec();
        let sig: P256Signature = key.sign(&message);
        let hex_payload = cmd_encode(
            &hex::encode(&message),
            &hex::encode(key.verifying_key().to_encoded_point(false).as_bytes()),
            &hex::encode(sig.to_der().as_bytes()),
            false,
        )
        .unwrap();

        let payload = hex::decode(hex_payload).unwrap();
        assert_eq!(payload.len(), 113 + message.len());
        assert_eq!(payload[0], 1);
        let decoded = decode_verification_payload(&payload).unwrap();
        assert_eq!(decoded.message, message.as_slice());
        assert_eq!(
            decoded.public_key,
            key.verifying_key().to_encoded_point(true).as_bytes()
        );
        assert!(payload.len() > DATA_START);
    }

    #[test]
    fn test_encode_rejects_bad_key() {
        assert!(cmd_encode("00", "0102", &"11".repeat(64), false).is_err());
    }

    #[test]
    fn test_recovery_hash_arguments() {
        assert_eq!(
            recovery_hash(None, Some("phrase")).unwrap(),
            hash_recovery_phrase("phrase")
        );
        assert_eq!(
            recovery_hash(Some(&"ab".repeat(32)), None).unwrap(),
            [0xab; 32]
        );
        assert!(recovery_hash(Some("abcd"), None).is_err());
        assert!(recovery_hash(None, None).is_err());
        assert!(recovery_hash(Some(&"ab".repeat(32)), Some("phrase")).is_err());
    }

    #[test]
    fn test_read_assertion_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("assertion.json");
        fs::write(
            &path,
            r#"{"authenticator_data":"SUlJSQ","client_data_json":"e30","signature":"AQI","public_key":"AgM"}"#,
        )
        .unwrap();
        let assertion = read_assertion(&path).unwrap();
        assert_eq!(assertion.authenticator_data, vec![0x49; 4]);
        assert_eq!(assertion.client_data_json, b"{}".to_vec());

        assert!(parse_pubkey("not-a-key").is_err());
    }
}
