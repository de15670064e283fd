//! Wallet program instructions
//!
//! Instruction data is an 8-byte discriminator, `sha256("global:<name>")[..8]`,
//! followed by the Borsh encoding of the instruction arguments in
//! declaration order.

use crate::crypto::{discriminator, COMPRESSED_PUBKEY_SIZE};
use borsh::{BorshDeserialize, BorshSerialize};
use solana_sdk::instruction::{AccountMeta, Instruction};
use solana_sdk::pubkey::Pubkey;
use solana_sdk::{system_program, sysvar};

/// Instruction names as the program exposes them
pub mod names {
    pub const INITIALIZE_MULTISIG: &str = "initialize_multisig";
    pub const ADD_GUARDIAN: &str = "add_guardian";
    pub const REMOVE_GUARDIAN: &str = "remove_guardian";
    pub const UPDATE_GUARDIAN_STATUS: &str = "update_guardian_status";
    pub const VERIFY_AND_EXECUTE: &str = "verify_and_execute";
    pub const CREATE_PROPOSAL: &str = "create_proposal";
    pub const APPROVE_PROPOSAL: &str = "approve_proposal";
    pub const EXECUTE_PROPOSAL: &str = "execute_proposal";
    pub const RECOVER_ACCESS_BY_GUARDIAN: &str = "recover_access_by_guardian";
}

/// Action string understood by `verify_and_execute`
pub const TRANSFER_ACTION: &str = "transfer";

/// Discriminator of a program instruction
pub fn instruction_discriminator(name: &str) -> [u8; 8] {
    discriminator("global", name)
}

#[derive(BorshSerialize, BorshDeserialize, Debug, Clone, PartialEq, Eq)]
pub struct InitializeMultisigArgs {
    pub threshold: u8,
    pub credential_id: String,
}

#[derive(BorshSerialize, BorshDeserialize, Clone, PartialEq, Eq)]
pub struct AddGuardianArgs {
    pub guardian_id: u64,
    pub guardian_name: String,
    pub recovery_hash: [u8; 32],
    pub is_owner: bool,
    pub webauthn_pubkey: Option<[u8; COMPRESSED_PUBKEY_SIZE]>,
}

impl std::fmt::Debug for AddGuardianArgs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AddGuardianArgs")
            .field("guardian_id", &self.guardian_id)
            .field("guardian_name", &self.guardian_name)
            .field("is_owner", &self.is_owner)
            .field("has_webauthn_pubkey", &self.webauthn_pubkey.is_some())
            .finish()
    }
}

#[derive(BorshSerialize, BorshDeserialize, Debug, Clone, PartialEq, Eq)]
pub struct RemoveGuardianArgs {
    pub guardian_id: u64,
    pub owner_guardian_id: u64,
}

#[derive(BorshSerialize, BorshDeserialize, Debug, Clone, PartialEq, Eq)]
pub struct UpdateGuardianStatusArgs {
    pub guardian_id: u64,
    pub owner_guardian_id: u64,
    pub is_active: bool,
}

/// `ActionParams` of `verify_and_execute`
#[derive(BorshSerialize, BorshDeserialize, Debug, Clone, PartialEq, Eq)]
pub struct ActionParams {
    pub amount: u64,
    pub destination: [u8; 32],
    pub token_mint: Option<[u8; 32]>,
}

#[derive(BorshSerialize, BorshDeserialize, Debug, Clone, PartialEq, Eq)]
pub struct VerifyAndExecuteArgs {
    pub action: String,
    pub params: ActionParams,
    pub nonce: u64,
    pub timestamp: i64,
    pub message: Vec<u8>,
}

/// `ActionParams` as stored on a proposal; every field is optional
#[derive(BorshSerialize, BorshDeserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct ProposalParams {
    pub amount: Option<u64>,
    pub destination: Option<[u8; 32]>,
    pub token_mint: Option<[u8; 32]>,
}

#[derive(BorshSerialize, BorshDeserialize, Debug, Clone, PartialEq, Eq)]
pub struct CreateProposalArgs {
    pub proposal_id: u64,
    pub description: String,
    pub proposer_guardian_id: u64,
    pub action: String,
    pub params: ProposalParams,
}

#[derive(BorshSerialize, BorshDeserialize, Debug, Clone, PartialEq, Eq)]
pub struct ApproveProposalArgs {
    pub proposal_id: u64,
    pub guardian_id: u64,
    pub timestamp: i64,
    pub message: Vec<u8>,
}

#[derive(BorshSerialize, BorshDeserialize, Debug, Clone, PartialEq, Eq)]
pub struct ExecuteProposalArgs {
    pub proposal_id: u64,
}

/// Arguments of `recover_access_by_guardian`
///
/// The program compares `recovery_hash` with the hash stored on the old
/// guardian; no passkey is involved since the old one is lost.
#[derive(BorshSerialize, BorshDeserialize, Clone, PartialEq, Eq)]
pub struct RecoverAccessArgs {
    pub old_guardian_id: u64,
    pub new_guardian_id: u64,
    pub recovery_hash: [u8; 32],
    pub new_webauthn_pubkey: [u8; COMPRESSED_PUBKEY_SIZE],
}

impl std::fmt::Debug for RecoverAccessArgs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoverAccessArgs")
            .field("old_guardian_id", &self.old_guardian_id)
            .field("new_guardian_id", &self.new_guardian_id)
            .finish_non_exhaustive()
    }
}

/// Discriminator followed by the Borsh-encoded arguments
pub fn instruction_data<T: BorshSerialize>(name: &str, args: &T) -> Vec<u8> {
    let mut data = instruction_discriminator(name).to_vec();
    // Writing into a Vec cannot fail
    let _ = args.serialize(&mut data);
    data
}

/// Split instruction data into its discriminator and argument bytes
pub fn split_instruction_data(data: &[u8]) -> Option<([u8; 8], &[u8])> {
    if data.len() < 8 {
        return None;
    }
    let mut disc = [0u8; 8];
    disc.copy_from_slice(&data[..8]);
    Some((disc, &data[8..]))
}

/// `initialize_multisig`: [multisig (w), fee payer (s, w), system program]
pub fn initialize_multisig(
    program_id: &Pubkey,
    multisig: &Pubkey,
    fee_payer: &Pubkey,
    args: &InitializeMultisigArgs,
) -> Instruction {
    Instruction {
        program_id: *program_id,
        accounts: vec![
            AccountMeta::new(*multisig, false),
            AccountMeta::new(*fee_payer, true),
            AccountMeta::new_readonly(system_program::id(), false),
        ],
        data: instruction_data(names::INITIALIZE_MULTISIG, args),
    }
}

/// `add_guardian`: [multisig (w), guardian (w), guardian wallet, payer (s, w),
/// system program]
///
/// The guardian has no ledger key of its own; the fee payer stands in as the
/// guardian's wallet reference.
pub fn add_guardian(
    program_id: &Pubkey,
    multisig: &Pubkey,
    guardian: &Pubkey,
    fee_payer: &Pubkey,
    args: &AddGuardianArgs,
) -> Instruction {
    Instruction {
        program_id: *program_id,
        accounts: vec![
            AccountMeta::new(*multisig, false),
            AccountMeta::new(*guardian, false),
            AccountMeta::new_readonly(*fee_payer, false),
            AccountMeta::new(*fee_payer, true),
            AccountMeta::new_readonly(system_program::id(), false),
        ],
        data: instruction_data(names::ADD_GUARDIAN, args),
    }
}

/// `remove_guardian`: [multisig (w), guardian (w), owner guardian, payer (s, w),
/// instructions sysvar]
pub fn remove_guardian(
    program_id: &Pubkey,
    multisig: &Pubkey,
    guardian: &Pubkey,
    owner_guardian: &Pubkey,
    fee_payer: &Pubkey,
    args: &RemoveGuardianArgs,
) -> Instruction {
    Instruction {
        program_id: *program_id,
        accounts: vec![
            AccountMeta::new(*multisig, false),
            AccountMeta::new(*guardian, false),
            AccountMeta::new_readonly(*owner_guardian, false),
            AccountMeta::new(*fee_payer, true),
            AccountMeta::new_readonly(sysvar::instructions::id(), false),
        ],
        data: instruction_data(names::REMOVE_GUARDIAN, args),
    }
}

/// `update_guardian_status`: same accounts as `remove_guardian`
pub fn update_guardian_status(
    program_id: &Pubkey,
    multisig: &Pubkey,
    guardian: &Pubkey,
    owner_guardian: &Pubkey,
    fee_payer: &Pubkey,
    args: &UpdateGuardianStatusArgs,
) -> Instruction {
    Instruction {
        program_id: *program_id,
        accounts: vec![
            AccountMeta::new(*multisig, false),
            AccountMeta::new(*guardian, false),
            AccountMeta::new_readonly(*owner_guardian, false),
            AccountMeta::new(*fee_payer, true),
            AccountMeta::new_readonly(sysvar::instructions::id(), false),
        ],
        data: instruction_data(names::UPDATE_GUARDIAN_STATUS, args),
    }
}

/// `verify_and_execute`: [multisig (w), guardian, clock, instructions sysvar,
/// system program, payer (s, w), destination (w)]
pub fn verify_and_execute(
    program_id: &Pubkey,
    multisig: &Pubkey,
    guardian: &Pubkey,
    fee_payer: &Pubkey,
    destination: &Pubkey,
    args: &VerifyAndExecuteArgs,
) -> Instruction {
    Instruction {
        program_id: *program_id,
        accounts: vec![
            AccountMeta::new(*multisig, false),
            AccountMeta::new_readonly(*guardian, false),
            AccountMeta::new_readonly(sysvar::clock::id(), false),
            AccountMeta::new_readonly(sysvar::instructions::id(), false),
            AccountMeta::new_readonly(system_program::id(), false),
            AccountMeta::new(*fee_payer, true),
            AccountMeta::new(*destination, false),
        ],
        data: instruction_data(names::VERIFY_AND_EXECUTE, args),
    }
}

/// `create_proposal`: [multisig (w), proposal (w), proposer guardian,
/// payer (s, w), clock, system program]
pub fn create_proposal(
    program_id: &Pubkey,
    multisig: &Pubkey,
    proposal: &Pubkey,
    proposer_guardian: &Pubkey,
    fee_payer: &Pubkey,
    args: &CreateProposalArgs,
) -> Instruction {
    Instruction {
        program_id: *program_id,
        accounts: vec![
            AccountMeta::new(*multisig, false),
            AccountMeta::new(*proposal, false),
            AccountMeta::new_readonly(*proposer_guardian, false),
            AccountMeta::new(*fee_payer, true),
            AccountMeta::new_readonly(sysvar::clock::id(), false),
            AccountMeta::new_readonly(system_program::id(), false),
        ],
        data: instruction_data(names::CREATE_PROPOSAL, args),
    }
}

/// `approve_proposal`: [multisig (w), proposal (w), approval record (w),
/// guardian, payer (s, w), instructions sysvar, clock, system program]
pub fn approve_proposal(
    program_id: &Pubkey,
    multisig: &Pubkey,
    proposal: &Pubkey,
    approval: &Pubkey,
    guardian: &Pubkey,
    fee_payer: &Pubkey,
    args: &ApproveProposalArgs,
) -> Instruction {
    Instruction {
        program_id: *program_id,
        accounts: vec![
            AccountMeta::new(*multisig, false),
            AccountMeta::new(*proposal, false),
            AccountMeta::new(*approval, false),
            AccountMeta::new_readonly(*guardian, false),
            AccountMeta::new(*fee_payer, true),
            AccountMeta::new_readonly(sysvar::instructions::id(), false),
            AccountMeta::new_readonly(sysvar::clock::id(), false),
            AccountMeta::new_readonly(system_program::id(), false),
        ],
        data: instruction_data(names::APPROVE_PROPOSAL, args),
    }
}

/// `execute_proposal`: [multisig (w), proposal (w), payer (s, w),
/// destination (w, transfers only), clock, system program]
pub fn execute_proposal(
    program_id: &Pubkey,
    multisig: &Pubkey,
    proposal: &Pubkey,
    fee_payer: &Pubkey,
    destination: Option<&Pubkey>,
    args: &ExecuteProposalArgs,
) -> Instruction {
    let mut accounts = vec![
        AccountMeta::new(*multisig, false),
        AccountMeta::new(*proposal, false),
        AccountMeta::new(*fee_payer, true),
    ];
    if let Some(destination) = destination {
        accounts.push(AccountMeta::new(*destination, false));
    }
    accounts.push(AccountMeta::new_readonly(sysvar::clock::id(), false));
    accounts.push(AccountMeta::new_readonly(system_program::id(), false));
    Instruction {
        program_id: *program_id,
        accounts,
        data: instruction_data(names::EXECUTE_PROPOSAL, args),
    }
}

/// `recover_access_by_guardian`: [multisig (w), old guardian (w),
/// guardian wallet, new guardian (w), payer (s, w), system program]
pub fn recover_access_by_guardian(
    program_id: &Pubkey,
    multisig: &Pubkey,
    old_guardian: &Pubkey,
    new_guardian: &Pubkey,
    fee_payer: &Pubkey,
    args: &RecoverAccessArgs,
) -> Instruction {
    Instruction {
        program_id: *program_id,
        accounts: vec![
            AccountMeta::new(*multisig, false),
            AccountMeta::new(*old_guardian, false),
            AccountMeta::new_readonly(*fee_payer, false),
            AccountMeta::new(*new_guardian, false),
            AccountMeta::new(*fee_payer, true),
            AccountMeta::new_readonly(system_program::id(), false),
        ],
        data: instruction_data(names::RECOVER_ACCESS_BY_GUARDIAN, args),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_discriminators() {
        assert_eq!(
            instruction_discriminator(names::ADD_GUARDIAN),
            [167, 189, 170, 27, 74, 240, 201, 241]
        );
        assert_eq!(
            instruction_discriminator(names::INITIALIZE_MULTISIG),
            [220, 130, 117, 21, 27, 227, 78, 213]
        );
        assert_eq!(
            instruction_discriminator(names::REMOVE_GUARDIAN),
            [72, 117, 160, 244, 155, 185, 71, 18]
        );
        assert_eq!(
            instruction_discriminator(names::UPDATE_GUARDIAN_STATUS),
            [17, 169, 132, 234, 235, 231, 211, 79]
        );
        assert_eq!(
            instruction_discriminator(names::VERIFY_AND_EXECUTE),
            [37, 165, 237, 189, 225, 188, 58, 41]
        );
        assert_eq!(
            instruction_discriminator(names::CREATE_PROPOSAL),
            [132, 116, 68, 174, 216, 160, 198, 22]
        );
        assert_eq!(
            instruction_discriminator(names::APPROVE_PROPOSAL),
            [136, 108, 102, 85, 98, 114, 7, 147]
        );
        assert_eq!(
            instruction_discriminator(names::EXECUTE_PROPOSAL),
            [186, 60, 116, 133, 108, 128, 111, 28]
        );
        assert_eq!(
            instruction_discriminator(names::RECOVER_ACCESS_BY_GUARDIAN),
            [210, 31, 244, 215, 121, 93, 165, 99]
        );
    }

    #[test]
    fn test_create_proposal_data_layout() {
        let dest = [7u8; 32];
        let args = CreateProposalArgs {
            proposal_id: 5,
            description: "rent".to_string(),
            proposer_guardian_id: 1,
            action: TRANSFER_ACTION.to_string(),
            params: ProposalParams {
                amount: Some(1_000),
                destination: Some(dest),
                token_mint: None,
            },
        };
        let data = instruction_data(names::CREATE_PROPOSAL, &args);
        let rest = &data[8..];
        assert_eq!(&rest[..8], &5u64.to_le_bytes());
        assert_eq!(&rest[8..12], &4u32.to_le_bytes());
        assert_eq!(&rest[12..16], b"rent");
        assert_eq!(&rest[16..24], &1u64.to_le_bytes());
        assert_eq!(&rest[24..28], &8u32.to_le_bytes());
        assert_eq!(&rest[28..36], b"transfer");
        // Some(amount), Some(destination), None
        assert_eq!(rest[36], 1);
        assert_eq!(&rest[37..45], &1_000u64.to_le_bytes());
        assert_eq!(rest[45], 1);
        assert_eq!(&rest[46..78], &dest);
        assert_eq!(rest[78], 0);
        assert_eq!(rest.len(), 79);
    }

    #[test]
    fn test_execute_proposal_optional_destination() {
        let program = Pubkey::new_unique();
        let multisig = Pubkey::new_unique();
        let proposal = Pubkey::new_unique();
        let payer = Pubkey::new_unique();
        let dest = Pubkey::new_unique();
        let args = ExecuteProposalArgs { proposal_id: 9 };

        let with = execute_proposal(&program, &multisig, &proposal, &payer, Some(&dest), &args);
        assert_eq!(with.accounts.len(), 6);
        assert_eq!(with.accounts[3].pubkey, dest);
        assert!(with.accounts[3].is_writable);
        assert_eq!(with.accounts[4].pubkey, sysvar::clock::id());

        let without = execute_proposal(&program, &multisig, &proposal, &payer, None, &args);
        assert_eq!(without.accounts.len(), 5);
        assert_eq!(without.accounts[3].pubkey, sysvar::clock::id());
        assert_eq!(&without.data[8..], &9u64.to_le_bytes());
    }

    #[test]
    fn test_recover_access_layout() {
        let args = RecoverAccessArgs {
            old_guardian_id: 2,
            new_guardian_id: 2,
            recovery_hash: [0xAB; 32],
            new_webauthn_pubkey: [0x03; 33],
        };
        let data = instruction_data(names::RECOVER_ACCESS_BY_GUARDIAN, &args);
        // Fixed-size fields, no length prefixes
        assert_eq!(data.len(), 8 + 8 + 8 + 32 + 33);
        assert_eq!(&data[8..16], &2u64.to_le_bytes());
        assert_eq!(&data[24..56], &[0xAB; 32]);
        assert!(!format!("{:?}", args).contains("171"));
    }

    #[test]
    fn test_initialize_data_layout() {
        let args = InitializeMultisigArgs {
            threshold: 2,
            credential_id: "abc".to_string(),
        };
        let data = instruction_data(names::INITIALIZE_MULTISIG, &args);
        assert_eq!(&data[..8], &[220, 130, 117, 21, 27, 227, 78, 213]);
        // u8 threshold, u32 LE length, bytes
        assert_eq!(&data[8..], &[2, 3, 0, 0, 0, b'a', b'b', b'c']);
    }

    #[test]
    fn test_remove_guardian_data_layout() {
        let args = RemoveGuardianArgs {
            guardian_id: 3,
            owner_guardian_id: 1,
        };
        let data = instruction_data(names::REMOVE_GUARDIAN, &args);
        assert_eq!(data.len(), 8 + 16);
        assert_eq!(&data[8..16], &3u64.to_le_bytes());
        assert_eq!(&data[16..24], &1u64.to_le_bytes());
    }

    #[test]
    fn test_add_guardian_args_decode() {
        let args = AddGuardianArgs {
            guardian_id: 2,
            guardian_name: "Alice".to_string(),
            recovery_hash: [7u8; 32],
            is_owner: false,
            webauthn_pubkey: Some([2u8; 33]),
        };
        let data = instruction_data(names::ADD_GUARDIAN, &args);
        let (disc, rest) = split_instruction_data(&data).unwrap();
        assert_eq!(disc, instruction_discriminator(names::ADD_GUARDIAN));
        assert_eq!(AddGuardianArgs::try_from_slice(rest).unwrap(), args);
        // id + (4 + 5) + 32 + 1 + (1 + 33)
        assert_eq!(rest.len(), 8 + 9 + 32 + 1 + 34);
    }

    #[test]
    fn test_transfer_accounts() {
        let program = Pubkey::new_unique();
        let multisig = Pubkey::new_unique();
        let guardian = Pubkey::new_unique();
        let payer = Pubkey::new_unique();
        let dest = Pubkey::new_unique();
        let args = VerifyAndExecuteArgs {
            action: TRANSFER_ACTION.to_string(),
            params: ActionParams {
                amount: 10,
                destination: dest.to_bytes(),
                token_mint: None,
            },
            nonce: 1,
            timestamp: 1_700_000_000,
            message: b"transfer:10".to_vec(),
        };
        let ix = verify_and_execute(&program, &multisig, &guardian, &payer, &dest, &args);

        assert_eq!(ix.accounts.len(), 7);
        assert!(ix.accounts[0].is_writable);
        assert_eq!(ix.accounts[3].pubkey, sysvar::instructions::id());
        assert!(ix.accounts[5].is_signer);
        assert_eq!(ix.accounts[6].pubkey, dest);
    }

    #[test]
    fn test_args_debug_hides_key_material() {
        let args = AddGuardianArgs {
            guardian_id: 2,
            guardian_name: "Alice".to_string(),
            recovery_hash: [0xEE; 32],
            is_owner: false,
            webauthn_pubkey: Some([0xDD; 33]),
        };
        let rendered = format!("{:?}", args);
        assert!(!rendered.contains("238, 238"));
        assert!(!rendered.contains("221, 221"));
    }
}
