//! In-process ledger
//!
//! Executes the wallet program's instructions against an account map so the
//! whole admission and transfer flow can run without a cluster. Each
//! transaction is applied to a scratch copy of the state and committed only
//! if every instruction succeeds.

use super::{LedgerClient, LedgerError};
use crate::multisig::accounts::{
    ApprovalAccount, GuardianAccount, MultisigAccount, ProposalAccount, ProposalStatus,
};
use crate::multisig::instructions::{
    instruction_discriminator, names, split_instruction_data, AddGuardianArgs,
    ApproveProposalArgs, CreateProposalArgs, ExecuteProposalArgs, InitializeMultisigArgs,
    RecoverAccessArgs, RemoveGuardianArgs, UpdateGuardianStatusArgs, VerifyAndExecuteArgs,
    TRANSFER_ACTION,
};
use crate::multisig::transaction::{approval_message, MAX_PROPOSAL_DESCRIPTION_LEN};
use crate::multisig::pda::AddressDeriver;
use crate::multisig::verification::{decode_verification_payload, SECP256R1_PROGRAM_ID};
use async_trait::async_trait;
use borsh::BorshDeserialize;
use p256::ecdsa::signature::Verifier;
use p256::ecdsa::{Signature as P256Signature, VerifyingKey};
use solana_sdk::account::Account;
use solana_sdk::hash::Hash;
use solana_sdk::instruction::CompiledInstruction;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::Signature;
use solana_sdk::transaction::Transaction;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;

/// Rent-exempt balance given to every account the program creates
const ACCOUNT_LAMPORTS: u64 = 1_000_000;

#[derive(Default)]
struct LedgerState {
    accounts: HashMap<Pubkey, Account>,
    submissions: usize,
    fail_next: usize,
    clock: i64,
}

/// Deterministic ledger running the wallet program in memory
pub struct MemoryLedger {
    deriver: AddressDeriver,
    blockhash: Hash,
    submit_delay: Duration,
    state: Mutex<LedgerState>,
}

/// Transaction being executed, with account keys resolved
struct Execution<'a> {
    transaction: &'a Transaction,
    /// Verified secp256r1 public key per instruction index
    verified: HashMap<usize, [u8; 33]>,
}

impl<'a> Execution<'a> {
    fn key(&self, ix: &CompiledInstruction, position: usize) -> Result<Pubkey, LedgerError> {
        let index = *ix
            .accounts
            .get(position)
            .ok_or_else(|| reject(format!("missing account #{}", position)))?;
        self.transaction
            .message
            .account_keys
            .get(index as usize)
            .copied()
            .ok_or_else(|| reject("account index out of range"))
    }

    fn program(&self, ix: &CompiledInstruction) -> Pubkey {
        self.transaction.message.account_keys[ix.program_id_index as usize]
    }

    fn fee_payer(&self) -> Pubkey {
        self.transaction.message.account_keys[0]
    }
}

fn reject(reason: impl Into<String>) -> LedgerError {
    LedgerError::Rejected(reason.into())
}

impl MemoryLedger {
    pub fn new(program_id: Pubkey) -> Self {
        Self {
            deriver: AddressDeriver::new(program_id),
            blockhash: Hash::new_unique(),
            submit_delay: Duration::ZERO,
            state: Mutex::new(LedgerState {
                clock: 1_700_000_000,
                ..Default::default()
            }),
        }
    }

    /// Delay every submission, to widen race windows in tests
    pub fn with_submit_delay(mut self, delay: Duration) -> Self {
        self.submit_delay = delay;
        self
    }

    pub fn program_id(&self) -> &Pubkey {
        self.deriver.program_id()
    }

    /// Number of transactions that reached execution (including failures)
    pub async fn submission_count(&self) -> usize {
        self.state.lock().await.submissions
    }

    /// Make the next `count` submissions fail with a retryable RPC error
    pub async fn fail_next_submissions(&self, count: usize) {
        self.state.lock().await.fail_next = count;
    }

    /// Credit lamports to an address
    pub async fn airdrop(&self, address: &Pubkey, lamports: u64) {
        let mut state = self.state.lock().await;
        let account = state.accounts.entry(*address).or_insert_with(|| Account {
            owner: solana_sdk::system_program::id(),
            ..Default::default()
        });
        account.lamports = account.lamports.saturating_add(lamports);
    }

    pub async fn balance(&self, address: &Pubkey) -> u64 {
        let state = self.state.lock().await;
        state.accounts.get(address).map(|a| a.lamports).unwrap_or(0)
    }

    /// Store an arbitrary account
    pub async fn set_account(&self, address: Pubkey, account: Account) {
        self.state.lock().await.accounts.insert(address, account);
    }

    fn execute(
        &self,
        accounts: &mut HashMap<Pubkey, Account>,
        clock: i64,
        transaction: &Transaction,
    ) -> Result<(), LedgerError> {
        let mut execution = Execution {
            transaction,
            verified: HashMap::new(),
        };

        for (index, ix) in transaction.message.instructions.iter().enumerate() {
            let program = execution.program(ix);
            if program == SECP256R1_PROGRAM_ID {
                let key = verify_secp256r1(&ix.data)?;
                execution.verified.insert(index, key);
            } else if program == *self.deriver.program_id() {
                self.execute_program(accounts, clock, &execution, index, ix)?;
            } else if program == solana_sdk::system_program::id() {
                // Plain system transfers are not needed by the wallet flows
                return Err(reject("system program instructions are not supported"));
            } else {
                return Err(reject(format!("unknown program {}", program)));
            }
        }
        Ok(())
    }

    fn execute_program(
        &self,
        accounts: &mut HashMap<Pubkey, Account>,
        clock: i64,
        execution: &Execution<'_>,
        index: usize,
        ix: &CompiledInstruction,
    ) -> Result<(), LedgerError> {
        let (disc, args) =
            split_instruction_data(&ix.data).ok_or_else(|| reject("instruction data too short"))?;

        if disc == instruction_discriminator(names::INITIALIZE_MULTISIG) {
            let args = parse::<InitializeMultisigArgs>(args)?;
            self.initialize_multisig(accounts, execution, ix, args)
        } else if disc == instruction_discriminator(names::ADD_GUARDIAN) {
            let args = parse::<AddGuardianArgs>(args)?;
            self.add_guardian(accounts, execution, index, ix, args)
        } else if disc == instruction_discriminator(names::REMOVE_GUARDIAN) {
            let args = parse::<RemoveGuardianArgs>(args)?;
            self.remove_guardian(accounts, execution, ix, args)
        } else if disc == instruction_discriminator(names::UPDATE_GUARDIAN_STATUS) {
            let args = parse::<UpdateGuardianStatusArgs>(args)?;
            self.update_guardian_status(accounts, execution, ix, args)
        } else if disc == instruction_discriminator(names::VERIFY_AND_EXECUTE) {
            let args = parse::<VerifyAndExecuteArgs>(args)?;
            self.verify_and_execute(accounts, clock, execution, index, ix, args)
        } else if disc == instruction_discriminator(names::CREATE_PROPOSAL) {
            let args = parse::<CreateProposalArgs>(args)?;
            self.create_proposal(accounts, clock, execution, ix, args)
        } else if disc == instruction_discriminator(names::APPROVE_PROPOSAL) {
            let args = parse::<ApproveProposalArgs>(args)?;
            self.approve_proposal(accounts, clock, execution, index, ix, args)
        } else if disc == instruction_discriminator(names::EXECUTE_PROPOSAL) {
            let args = parse::<ExecuteProposalArgs>(args)?;
            self.execute_proposal(accounts, clock, execution, ix, args)
        } else if disc == instruction_discriminator(names::RECOVER_ACCESS_BY_GUARDIAN) {
            let args = parse::<RecoverAccessArgs>(args)?;
            self.recover_access(accounts, execution, ix, args)
        } else {
            Err(reject("unknown instruction discriminator"))
        }
    }

    fn initialize_multisig(
        &self,
        accounts: &mut HashMap<Pubkey, Account>,
        execution: &Execution<'_>,
        ix: &CompiledInstruction,
        args: InitializeMultisigArgs,
    ) -> Result<(), LedgerError> {
        let multisig = execution.key(ix, 0)?;
        let (expected, bump) = self
            .deriver
            .multisig_address(&args.credential_id)
            .map_err(|e| reject(e.to_string()))?;
        if multisig != expected {
            return Err(reject("multisig address does not match seeds"));
        }
        if args.threshold == 0 {
            return Err(reject("invalid threshold"));
        }
        if accounts.contains_key(&multisig) {
            return Err(reject("multisig already initialized"));
        }

        let state = MultisigAccount {
            threshold: args.threshold,
            guardian_count: 0,
            recovery_nonce: 0,
            bump,
            transaction_nonce: 0,
            last_transaction_timestamp: 0,
            owner: execution.fee_payer().to_bytes(),
            credential_id: args.credential_id,
        };
        accounts.insert(multisig, self.program_account(state.encode()));
        log::debug!("memory ledger: initialized multisig {}", multisig);
        Ok(())
    }

    fn add_guardian(
        &self,
        accounts: &mut HashMap<Pubkey, Account>,
        execution: &Execution<'_>,
        index: usize,
        ix: &CompiledInstruction,
        args: AddGuardianArgs,
    ) -> Result<(), LedgerError> {
        let multisig = execution.key(ix, 0)?;
        let guardian = execution.key(ix, 1)?;
        let mut wallet = self.load_multisig(accounts, &multisig)?;

        let (expected, bump) = self.deriver.guardian_address(&multisig, args.guardian_id);
        if guardian != expected {
            return Err(reject("guardian address does not match seeds"));
        }
        if accounts.contains_key(&guardian) {
            return Err(reject(format!("guardian {} already exists", args.guardian_id)));
        }
        if args.guardian_name.len() > 32 {
            return Err(reject("guardian name too long"));
        }

        if args.is_owner {
            if wallet.guardian_count != 0 {
                return Err(reject("owner guardian can only be added at creation"));
            }
        } else {
            // An existing owner guardian must have approved this admission
            let key = previous_verified_key(execution, index)?;
            if !self.is_owner_key(accounts, &multisig, &key) {
                return Err(reject("admission not signed by an owner guardian"));
            }
        }

        let account = GuardianAccount {
            wallet: execution.key(ix, 2)?.to_bytes(),
            guardian_id: args.guardian_id,
            name: args.guardian_name,
            is_active: true,
            recovery_hash: args.recovery_hash,
            is_owner: args.is_owner,
            webauthn_pubkey: args.webauthn_pubkey,
            bump,
        };
        accounts.insert(guardian, self.program_account(account.encode()));

        wallet.guardian_count = wallet.guardian_count.saturating_add(1);
        self.store_multisig(accounts, &multisig, &wallet)?;
        log::debug!(
            "memory ledger: added guardian {} to {}",
            args.guardian_id,
            multisig
        );
        Ok(())
    }

    fn remove_guardian(
        &self,
        accounts: &mut HashMap<Pubkey, Account>,
        execution: &Execution<'_>,
        ix: &CompiledInstruction,
        args: RemoveGuardianArgs,
    ) -> Result<(), LedgerError> {
        let multisig = execution.key(ix, 0)?;
        let guardian = execution.key(ix, 1)?;
        let owner = execution.key(ix, 2)?;
        let mut wallet = self.load_multisig(accounts, &multisig)?;

        if args.guardian_id == 1 {
            return Err(reject("owning guardian cannot be removed"));
        }
        self.check_owner(accounts, &multisig, &owner, args.owner_guardian_id)?;
        if guardian != self.deriver.guardian_address(&multisig, args.guardian_id).0 {
            return Err(reject("guardian address does not match seeds"));
        }
        if accounts.remove(&guardian).is_none() {
            return Err(reject(format!("guardian {} not found", args.guardian_id)));
        }

        wallet.guardian_count = wallet.guardian_count.saturating_sub(1);
        self.store_multisig(accounts, &multisig, &wallet)
    }

    fn update_guardian_status(
        &self,
        accounts: &mut HashMap<Pubkey, Account>,
        execution: &Execution<'_>,
        ix: &CompiledInstruction,
        args: UpdateGuardianStatusArgs,
    ) -> Result<(), LedgerError> {
        let multisig = execution.key(ix, 0)?;
        let guardian = execution.key(ix, 1)?;
        let owner = execution.key(ix, 2)?;
        self.load_multisig(accounts, &multisig)?;
        self.check_owner(accounts, &multisig, &owner, args.owner_guardian_id)?;

        if guardian != self.deriver.guardian_address(&multisig, args.guardian_id).0 {
            return Err(reject("guardian address does not match seeds"));
        }
        let mut state = self.load_guardian(accounts, &guardian)?;
        if state.guardian_id == 1 && !args.is_active {
            return Err(reject("owning guardian cannot be deactivated"));
        }
        state.is_active = args.is_active;
        self.store(accounts, &guardian, state.encode())
    }

    fn verify_and_execute(
        &self,
        accounts: &mut HashMap<Pubkey, Account>,
        clock: i64,
        execution: &Execution<'_>,
        index: usize,
        ix: &CompiledInstruction,
        args: VerifyAndExecuteArgs,
    ) -> Result<(), LedgerError> {
        let multisig = execution.key(ix, 0)?;
        let guardian = execution.key(ix, 1)?;
        let destination = execution.key(ix, 6)?;
        let mut wallet = self.load_multisig(accounts, &multisig)?;
        let signer = self.load_guardian(accounts, &guardian)?;

        if args.action != TRANSFER_ACTION {
            return Err(reject(format!("unsupported action {}", args.action)));
        }
        if !signer.is_active {
            return Err(reject("guardian is inactive"));
        }
        let key = previous_verified_key(execution, index)?;
        if signer.webauthn_pubkey != Some(key) {
            return Err(reject("transfer not signed by the guardian's passkey"));
        }
        if args.nonce <= wallet.transaction_nonce {
            return Err(reject(format!(
                "stale nonce {} (current {})",
                args.nonce, wallet.transaction_nonce
            )));
        }
        if args.params.destination != destination.to_bytes() {
            return Err(reject("destination account mismatch"));
        }
        if args.params.amount == 0 {
            return Err(reject("amount must be positive"));
        }

        let available = accounts
            .get(&multisig)
            .map(|a| a.lamports.saturating_sub(ACCOUNT_LAMPORTS))
            .unwrap_or(0);
        if args.params.amount > available {
            return Err(reject("insufficient funds"));
        }

        wallet.transaction_nonce = args.nonce;
        wallet.last_transaction_timestamp = clock;
        self.store_multisig(accounts, &multisig, &wallet)?;

        if let Some(account) = accounts.get_mut(&multisig) {
            account.lamports -= args.params.amount;
        }
        let target = accounts.entry(destination).or_insert_with(|| Account {
            owner: solana_sdk::system_program::id(),
            ..Default::default()
        });
        target.lamports = target.lamports.saturating_add(args.params.amount);
        Ok(())
    }

    fn create_proposal(
        &self,
        accounts: &mut HashMap<Pubkey, Account>,
        clock: i64,
        execution: &Execution<'_>,
        ix: &CompiledInstruction,
        args: CreateProposalArgs,
    ) -> Result<(), LedgerError> {
        let multisig = execution.key(ix, 0)?;
        let proposal = execution.key(ix, 1)?;
        let proposer = execution.key(ix, 2)?;
        let wallet = self.load_multisig(accounts, &multisig)?;

        let (expected, bump) = self.deriver.proposal_address(&multisig, args.proposal_id);
        if proposal != expected {
            return Err(reject("proposal address does not match seeds"));
        }
        if accounts.contains_key(&proposal) {
            return Err(reject(format!("proposal {} already exists", args.proposal_id)));
        }
        if proposer
            != self
                .deriver
                .guardian_address(&multisig, args.proposer_guardian_id)
                .0
        {
            return Err(reject("proposer address does not match seeds"));
        }
        if !self.load_guardian(accounts, &proposer)?.is_active {
            return Err(reject("proposer is inactive"));
        }
        if args.action != TRANSFER_ACTION {
            return Err(reject(format!("unsupported action {}", args.action)));
        }
        if args.description.len() > MAX_PROPOSAL_DESCRIPTION_LEN {
            return Err(reject("description too long"));
        }
        match (args.params.amount, args.params.destination) {
            (Some(amount), Some(_)) if amount > 0 => {}
            _ => return Err(reject("transfer proposals need an amount and destination")),
        }

        let state = ProposalAccount {
            multisig: multisig.to_bytes(),
            proposal_id: args.proposal_id,
            description: args.description,
            action: args.action,
            status: ProposalStatus::Pending,
            signatures_count: 0,
            required_signatures: wallet.threshold,
            created_at: clock,
            proposer: proposer.to_bytes(),
            params: args.params,
            executed_at: None,
            bump,
        };
        accounts.insert(proposal, self.program_account(state.encode()));
        log::debug!(
            "memory ledger: proposal {} created on {}",
            args.proposal_id,
            multisig
        );
        Ok(())
    }

    fn approve_proposal(
        &self,
        accounts: &mut HashMap<Pubkey, Account>,
        clock: i64,
        execution: &Execution<'_>,
        index: usize,
        ix: &CompiledInstruction,
        args: ApproveProposalArgs,
    ) -> Result<(), LedgerError> {
        let multisig = execution.key(ix, 0)?;
        let proposal = execution.key(ix, 1)?;
        let record = execution.key(ix, 2)?;
        let guardian = execution.key(ix, 3)?;
        self.load_multisig(accounts, &multisig)?;

        if proposal != self.deriver.proposal_address(&multisig, args.proposal_id).0 {
            return Err(reject("proposal address does not match seeds"));
        }
        if guardian != self.deriver.guardian_address(&multisig, args.guardian_id).0 {
            return Err(reject("guardian address does not match seeds"));
        }
        let (expected_record, bump) = self.deriver.signature_address(&proposal, args.guardian_id);
        if record != expected_record {
            return Err(reject("approval address does not match seeds"));
        }

        let signer = self.load_guardian(accounts, &guardian)?;
        if !signer.is_active {
            return Err(reject("guardian is inactive"));
        }
        let key = previous_verified_key(execution, index)?;
        if signer.webauthn_pubkey != Some(key) {
            return Err(reject("approval not signed by the guardian's passkey"));
        }
        if args.message != approval_message(args.proposal_id, args.guardian_id, args.timestamp, &key) {
            return Err(reject("approval message does not match"));
        }

        let mut state = self.load_proposal(accounts, &proposal)?;
        if state.status != ProposalStatus::Pending {
            return Err(reject(format!("proposal is {:?}", state.status)));
        }
        if accounts.contains_key(&record) {
            return Err(reject(format!(
                "guardian {} already approved proposal {}",
                args.guardian_id, args.proposal_id
            )));
        }

        let approval = ApprovalAccount {
            proposal: proposal.to_bytes(),
            guardian_id: args.guardian_id,
            signed_at: clock,
            bump,
        };
        accounts.insert(record, self.program_account(approval.encode()));
        state.signatures_count = state.signatures_count.saturating_add(1);
        self.store(accounts, &proposal, state.encode())
    }

    fn execute_proposal(
        &self,
        accounts: &mut HashMap<Pubkey, Account>,
        clock: i64,
        execution: &Execution<'_>,
        ix: &CompiledInstruction,
        args: ExecuteProposalArgs,
    ) -> Result<(), LedgerError> {
        let multisig = execution.key(ix, 0)?;
        let proposal = execution.key(ix, 1)?;
        let mut wallet = self.load_multisig(accounts, &multisig)?;

        if proposal != self.deriver.proposal_address(&multisig, args.proposal_id).0 {
            return Err(reject("proposal address does not match seeds"));
        }
        let mut state = self.load_proposal(accounts, &proposal)?;
        if state.status != ProposalStatus::Pending {
            return Err(reject(format!("proposal is {:?}", state.status)));
        }
        if !state.is_approved() {
            return Err(reject(format!(
                "proposal has {} of {} approvals",
                state.signatures_count, state.required_signatures
            )));
        }

        let (Some(amount), Some(target)) = (state.params.amount, state.params.destination) else {
            return Err(reject("proposal has no transfer parameters"));
        };
        let destination = execution.key(ix, 3)?;
        if destination.to_bytes() != target {
            return Err(reject("destination account mismatch"));
        }
        let available = accounts
            .get(&multisig)
            .map(|a| a.lamports.saturating_sub(ACCOUNT_LAMPORTS))
            .unwrap_or(0);
        if amount > available {
            return Err(reject("insufficient funds"));
        }

        state.status = ProposalStatus::Executed;
        state.executed_at = Some(clock);
        self.store(accounts, &proposal, state.encode())?;
        wallet.last_transaction_timestamp = clock;
        self.store_multisig(accounts, &multisig, &wallet)?;

        if let Some(account) = accounts.get_mut(&multisig) {
            account.lamports -= amount;
        }
        let target = accounts.entry(destination).or_insert_with(|| Account {
            owner: solana_sdk::system_program::id(),
            ..Default::default()
        });
        target.lamports = target.lamports.saturating_add(amount);
        Ok(())
    }

    fn recover_access(
        &self,
        accounts: &mut HashMap<Pubkey, Account>,
        execution: &Execution<'_>,
        ix: &CompiledInstruction,
        args: RecoverAccessArgs,
    ) -> Result<(), LedgerError> {
        let multisig = execution.key(ix, 0)?;
        let old_guardian = execution.key(ix, 1)?;
        let new_guardian = execution.key(ix, 3)?;
        let mut wallet = self.load_multisig(accounts, &multisig)?;

        if old_guardian
            != self
                .deriver
                .guardian_address(&multisig, args.old_guardian_id)
                .0
        {
            return Err(reject("guardian address does not match seeds"));
        }
        let (expected_new, new_bump) = self
            .deriver
            .guardian_address(&multisig, args.new_guardian_id);
        if new_guardian != expected_new {
            return Err(reject("new guardian address does not match seeds"));
        }

        let mut state = self.load_guardian(accounts, &old_guardian)?;
        if !state.is_active {
            return Err(reject("guardian is inactive"));
        }
        if state.recovery_hash != args.recovery_hash {
            return Err(reject("recovery phrase does not match"));
        }
        VerifyingKey::from_sec1_bytes(&args.new_webauthn_pubkey)
            .map_err(|_| reject("invalid secp256r1 public key"))?;

        state.webauthn_pubkey = Some(args.new_webauthn_pubkey);
        if args.old_guardian_id == args.new_guardian_id {
            self.store(accounts, &old_guardian, state.encode())?;
        } else {
            if accounts.contains_key(&new_guardian) {
                return Err(reject(format!(
                    "guardian {} already exists",
                    args.new_guardian_id
                )));
            }
            state.guardian_id = args.new_guardian_id;
            state.bump = new_bump;
            accounts.remove(&old_guardian);
            accounts.insert(new_guardian, self.program_account(state.encode()));
        }

        wallet.recovery_nonce = wallet.recovery_nonce.saturating_add(1);
        self.store_multisig(accounts, &multisig, &wallet)?;
        log::debug!(
            "memory ledger: guardian {} recovered on {}",
            args.new_guardian_id,
            multisig
        );
        Ok(())
    }

    fn check_owner(
        &self,
        accounts: &HashMap<Pubkey, Account>,
        multisig: &Pubkey,
        owner: &Pubkey,
        owner_guardian_id: u64,
    ) -> Result<(), LedgerError> {
        if *owner != self.deriver.guardian_address(multisig, owner_guardian_id).0 {
            return Err(reject("owner guardian address does not match seeds"));
        }
        let state = self.load_guardian(accounts, owner)?;
        if !state.is_owner || !state.is_active {
            return Err(reject(format!(
                "guardian {} is not an active owner",
                owner_guardian_id
            )));
        }
        Ok(())
    }

    /// Whether some active owner guardian of `multisig` carries `key`
    fn is_owner_key(
        &self,
        accounts: &HashMap<Pubkey, Account>,
        multisig: &Pubkey,
        key: &[u8; 33],
    ) -> bool {
        let count = self
            .load_multisig(accounts, multisig)
            .map(|m| m.guardian_count as u64)
            .unwrap_or(0);
        // Ids are never reused, so scan a little past the live count
        (1..=count + 8).any(|id| {
            let (address, _) = self.deriver.guardian_address(multisig, id);
            accounts
                .get(&address)
                .and_then(|a| GuardianAccount::decode(&a.data).ok())
                .map(|g| g.is_owner && g.is_active && g.webauthn_pubkey.as_ref() == Some(key))
                .unwrap_or(false)
        })
    }

    fn program_account(&self, data: Vec<u8>) -> Account {
        Account {
            lamports: ACCOUNT_LAMPORTS,
            data,
            owner: *self.deriver.program_id(),
            executable: false,
            rent_epoch: 0,
        }
    }

    fn load_multisig(
        &self,
        accounts: &HashMap<Pubkey, Account>,
        address: &Pubkey,
    ) -> Result<MultisigAccount, LedgerError> {
        let account = accounts
            .get(address)
            .filter(|a| a.owner == *self.deriver.program_id())
            .ok_or_else(|| reject(format!("multisig {} not found", address)))?;
        MultisigAccount::decode(&account.data).map_err(|e| reject(e.to_string()))
    }

    fn load_guardian(
        &self,
        accounts: &HashMap<Pubkey, Account>,
        address: &Pubkey,
    ) -> Result<GuardianAccount, LedgerError> {
        let account = accounts
            .get(address)
            .filter(|a| a.owner == *self.deriver.program_id())
            .ok_or_else(|| reject(format!("guardian {} not found", address)))?;
        GuardianAccount::decode(&account.data).map_err(|e| reject(e.to_string()))
    }

    fn load_proposal(
        &self,
        accounts: &HashMap<Pubkey, Account>,
        address: &Pubkey,
    ) -> Result<ProposalAccount, LedgerError> {
        let account = accounts
            .get(address)
            .filter(|a| a.owner == *self.deriver.program_id())
            .ok_or_else(|| reject(format!("proposal {} not found", address)))?;
        ProposalAccount::decode(&account.data).map_err(|e| reject(e.to_string()))
    }

    fn store_multisig(
        &self,
        accounts: &mut HashMap<Pubkey, Account>,
        address: &Pubkey,
        state: &MultisigAccount,
    ) -> Result<(), LedgerError> {
        self.store(accounts, address, state.encode())
    }

    fn store(
        &self,
        accounts: &mut HashMap<Pubkey, Account>,
        address: &Pubkey,
        data: Vec<u8>,
    ) -> Result<(), LedgerError> {
        let account = accounts
            .get_mut(address)
            .ok_or_else(|| reject(format!("account {} not found", address)))?;
        account.data = data;
        Ok(())
    }
}

fn parse<T: BorshDeserialize>(args: &[u8]) -> Result<T, LedgerError> {
    T::try_from_slice(args).map_err(|e| reject(format!("bad instruction arguments: {}", e)))
}

/// The key verified by the instruction right before `index`
fn previous_verified_key(execution: &Execution<'_>, index: usize) -> Result<[u8; 33], LedgerError> {
    index
        .checked_sub(1)
        .and_then(|prev| execution.verified.get(&prev))
        .copied()
        .ok_or_else(|| reject("missing secp256r1 verification instruction"))
}

/// Check a verification payload the way the native program does
fn verify_secp256r1(data: &[u8]) -> Result<[u8; 33], LedgerError> {
    let payload =
        decode_verification_payload(data).ok_or_else(|| reject("malformed secp256r1 payload"))?;
    let key = VerifyingKey::from_sec1_bytes(payload.public_key)
        .map_err(|_| reject("invalid secp256r1 public key"))?;
    let signature = P256Signature::from_slice(payload.signature)
        .map_err(|_| reject("invalid secp256r1 signature"))?;
    if signature.normalize_s().is_some() {
        return Err(reject("secp256r1 signature is not low-S"));
    }
    key.verify(payload.message, &signature)
        .map_err(|_| reject("secp256r1 signature verification failed"))?;

    let mut compressed = [0u8; 33];
    compressed.copy_from_slice(payload.public_key);
    Ok(compressed)
}

#[async_trait]
impl LedgerClient for MemoryLedger {
    async fn latest_blockhash(&self) -> Result<Hash, LedgerError> {
        Ok(self.blockhash)
    }

    async fn submit_transaction(
        &self,
        transaction: &Transaction,
    ) -> Result<Signature, LedgerError> {
        if !self.submit_delay.is_zero() {
            tokio::time::sleep(self.submit_delay).await;
        }
        transaction
            .verify()
            .map_err(|e| LedgerError::InvalidTransaction(e.to_string()))?;

        let mut state = self.state.lock().await;
        state.submissions += 1;
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(LedgerError::Rpc("injected failure".to_string()));
        }

        let mut scratch = state.accounts.clone();
        let clock = state.clock;
        self.execute(&mut scratch, clock, transaction)?;
        state.accounts = scratch;
        state.clock += 1;

        let signature = transaction.signatures.first().copied().unwrap_or_default();
        log::debug!("memory ledger: executed {}", signature);
        Ok(signature)
    }

    async fn get_account(&self, address: &Pubkey) -> Result<Option<Account>, LedgerError> {
        Ok(self.state.lock().await.accounts.get(address).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::multisig::transaction::{
        sign_with_fee_payer, AccessRecovery, GuardianAdmission, NewWallet, ProposalApproval,
        ProposalRequest, TransactionBuilder, TransferRequest,
    };
    use crate::multisig::verification::AuthorizationProof;
    use p256::ecdsa::{signature::Signer as _, SigningKey};
    use rand::rngs::OsRng;
    use solana_sdk::signature::{Keypair, Signer};

    const CREDENTIAL: &str = "AQIDBAUGBwgJCgsMDQ4PEA==";

    fn compressed(key: &SigningKey) -> [u8; 33] {
        let mut out = [0u8; 33];
        out.copy_from_slice(key.verifying_key().to_encoded_point(true).as_bytes());
        out
    }

    fn proof(key: &SigningKey, message: &[u8]) -> AuthorizationProof {
        let sig: P256Signature = key.sign(message);
        let mut raw = [0u8; 64];
        raw.copy_from_slice(&sig.to_bytes());
        AuthorizationProof::new(message.to_vec(), compressed(key), raw, false)
    }

    async fn setup() -> (MemoryLedger, TransactionBuilder, Keypair, SigningKey, Pubkey) {
        let ledger = MemoryLedger::new(*AddressDeriver::default().program_id());
        let payer = Keypair::new();
        let builder = TransactionBuilder::new(AddressDeriver::default(), payer.pubkey());
        let owner_key = SigningKey::random(&mut OsRng);

        let (multisig, mut tx) = builder
            .create_wallet(&NewWallet {
                credential_id: CREDENTIAL.to_string(),
                threshold: 1,
                owner_name: "Owner".to_string(),
                recovery_hash: [1u8; 32],
                owner_public_key: compressed(&owner_key),
            })
            .unwrap();
        sign_with_fee_payer(&mut tx, &payer, ledger.latest_blockhash().await.unwrap()).unwrap();
        ledger.submit_transaction(&tx).await.unwrap();
        (ledger, builder, payer, owner_key, multisig)
    }

    #[tokio::test]
    async fn test_wallet_creation() {
        let (ledger, builder, _, _, multisig) = setup().await;
        let account = ledger.get_account(&multisig).await.unwrap().unwrap();
        let state = MultisigAccount::decode(&account.data).unwrap();
        assert_eq!(state.guardian_count, 1);
        assert_eq!(state.credential_id, CREDENTIAL);

        let (owner, _) = builder.deriver().guardian_address(&multisig, 1);
        let guardian = ledger.get_account(&owner).await.unwrap().unwrap();
        let guardian = GuardianAccount::decode(&guardian.data).unwrap();
        assert!(guardian.is_owner);
        assert!(guardian.is_active);
    }

    #[tokio::test]
    async fn test_admission_requires_owner_signature() {
        let (ledger, builder, payer, owner_key, multisig) = setup().await;
        let invitee = SigningKey::random(&mut OsRng);
        let admission = GuardianAdmission {
            multisig,
            guardian_id: 2,
            name: "Alice".to_string(),
            recovery_hash: [2u8; 32],
            webauthn_public_key: compressed(&invitee),
        };
        let blockhash = ledger.latest_blockhash().await.unwrap();

        // Signed by the invitee instead of the owner
        let mut tx = builder
            .add_guardian(&admission, &proof(&invitee, b"approve"))
            .unwrap();
        sign_with_fee_payer(&mut tx, &payer, blockhash).unwrap();
        assert!(matches!(
            ledger.submit_transaction(&tx).await,
            Err(LedgerError::Rejected(_))
        ));

        let mut tx = builder
            .add_guardian(&admission, &proof(&owner_key, b"approve"))
            .unwrap();
        sign_with_fee_payer(&mut tx, &payer, blockhash).unwrap();
        ledger.submit_transaction(&tx).await.unwrap();

        // Same slot twice is rejected by the ledger
        assert!(ledger.submit_transaction(&tx).await.is_err());
    }

    #[tokio::test]
    async fn test_transfer_enforces_nonce() {
        let (ledger, builder, payer, owner_key, multisig) = setup().await;
        ledger.airdrop(&multisig, 50_000).await;
        let destination = Pubkey::new_unique();
        let blockhash = ledger.latest_blockhash().await.unwrap();

        let request = TransferRequest {
            destination,
            amount: 10_000,
            nonce: 1,
            timestamp: 1_700_000_100,
            message: b"transfer 10000".to_vec(),
        };
        let mut tx = builder
            .transfer(&multisig, 1, &request, &proof(&owner_key, b"transfer 10000"))
            .unwrap();
        sign_with_fee_payer(&mut tx, &payer, blockhash).unwrap();
        ledger.submit_transaction(&tx).await.unwrap();
        assert_eq!(ledger.balance(&destination).await, 10_000);

        // Replaying the same nonce fails
        assert!(ledger.submit_transaction(&tx).await.is_err());
        assert_eq!(ledger.balance(&destination).await, 10_000);
    }

    #[tokio::test]
    async fn test_high_s_signature_rejected() {
        use crate::crypto::SECP256R1_ORDER;
        use p256::elliptic_curve::bigint::Encoding;
        use p256::U256;

        let key = SigningKey::random(&mut OsRng);
        let mut p = proof(&key, b"msg");
        let s = U256::from_be_slice(&p.signature[32..]);
        p.signature[32..].copy_from_slice(&SECP256R1_ORDER.wrapping_sub(&s).to_be_bytes());

        let data = p.instruction().unwrap().data;
        assert!(verify_secp256r1(&data).is_err());
        assert!(verify_secp256r1(&proof(&key, b"msg").instruction().unwrap().data).is_ok());
    }

    #[tokio::test]
    async fn test_injected_failure_leaves_state() {
        let (ledger, builder, payer, owner_key, multisig) = setup().await;
        ledger.fail_next_submissions(1).await;
        let before = ledger.submission_count().await;

        let mut tx = builder
            .update_guardian_status(&multisig, 1, 1, true, Some(&proof(&owner_key, b"x")))
            .unwrap();
        sign_with_fee_payer(&mut tx, &payer, ledger.latest_blockhash().await.unwrap()).unwrap();
        let err = ledger.submit_transaction(&tx).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(ledger.submission_count().await, before + 1);

        ledger.submit_transaction(&tx).await.unwrap();
    }

    async fn admit(
        ledger: &MemoryLedger,
        builder: &TransactionBuilder,
        payer: &Keypair,
        owner_key: &SigningKey,
        multisig: Pubkey,
        guardian_id: u64,
    ) -> SigningKey {
        let key = SigningKey::random(&mut OsRng);
        let admission = GuardianAdmission {
            multisig,
            guardian_id,
            name: format!("Guardian {}", guardian_id),
            recovery_hash: [guardian_id as u8; 32],
            webauthn_public_key: compressed(&key),
        };
        let mut tx = builder
            .add_guardian(&admission, &proof(owner_key, b"approve"))
            .unwrap();
        sign_with_fee_payer(&mut tx, payer, ledger.latest_blockhash().await.unwrap()).unwrap();
        ledger.submit_transaction(&tx).await.unwrap();
        key
    }

    async fn send(ledger: &MemoryLedger, payer: &Keypair, mut tx: Transaction) -> Result<Signature, LedgerError> {
        sign_with_fee_payer(&mut tx, payer, ledger.latest_blockhash().await.unwrap()).unwrap();
        ledger.submit_transaction(&tx).await
    }

    async fn proposal_state(ledger: &MemoryLedger, address: &Pubkey) -> ProposalAccount {
        let account = ledger.get_account(address).await.unwrap().unwrap();
        ProposalAccount::decode(&account.data).unwrap()
    }

    #[tokio::test]
    async fn test_proposal_needs_threshold_approvals() {
        let ledger = MemoryLedger::new(*AddressDeriver::default().program_id());
        let payer = Keypair::new();
        let builder = TransactionBuilder::new(AddressDeriver::default(), payer.pubkey());
        let owner_key = SigningKey::random(&mut OsRng);
        let (multisig, tx) = builder
            .create_wallet(&NewWallet {
                credential_id: CREDENTIAL.to_string(),
                threshold: 2,
                owner_name: "Owner".to_string(),
                recovery_hash: [1u8; 32],
                owner_public_key: compressed(&owner_key),
            })
            .unwrap();
        send(&ledger, &payer, tx).await.unwrap();
        let second = admit(&ledger, &builder, &payer, &owner_key, multisig, 2).await;
        ledger.airdrop(&multisig, 50_000).await;

        let destination = Pubkey::new_unique();
        let request = ProposalRequest {
            multisig,
            proposal_id: 7,
            proposer_guardian_id: 2,
            description: "rent".to_string(),
            destination,
            amount: 20_000,
        };
        let (proposal, tx) = builder.create_proposal(&request).unwrap();
        send(&ledger, &payer, tx).await.unwrap();
        let state = proposal_state(&ledger, &proposal).await;
        assert_eq!(state.status, ProposalStatus::Pending);
        assert_eq!(state.required_signatures, 2);

        let execute = builder
            .execute_proposal(&multisig, 7, Some(&destination))
            .unwrap();
        let approve = |guardian_id: u64, key: &SigningKey| {
            let approval = ProposalApproval {
                multisig,
                proposal_id: 7,
                guardian_id,
                timestamp: 1_700_000_100,
            };
            builder
                .approve_proposal(&approval, &proof(key, b"webauthn assertion"))
                .unwrap()
        };

        send(&ledger, &payer, approve(1, &owner_key)).await.unwrap();
        // Second approval by the same guardian is refused
        assert!(send(&ledger, &payer, approve(1, &owner_key)).await.is_err());
        assert!(send(&ledger, &payer, execute.clone()).await.is_err());
        assert_eq!(ledger.balance(&destination).await, 0);

        // Guardian 2 cannot approve with the owner's passkey
        assert!(send(&ledger, &payer, approve(2, &owner_key)).await.is_err());
        send(&ledger, &payer, approve(2, &second)).await.unwrap();
        assert_eq!(proposal_state(&ledger, &proposal).await.signatures_count, 2);

        send(&ledger, &payer, execute.clone()).await.unwrap();
        assert_eq!(ledger.balance(&destination).await, 20_000);
        let state = proposal_state(&ledger, &proposal).await;
        assert_eq!(state.status, ProposalStatus::Executed);
        assert!(state.executed_at.is_some());

        // Executed proposals do not pay out twice
        assert!(send(&ledger, &payer, execute).await.is_err());
        assert_eq!(ledger.balance(&destination).await, 20_000);
    }

    #[tokio::test]
    async fn test_approval_requires_verify_instruction_first() {
        let (ledger, builder, payer, owner_key, multisig) = setup().await;
        let (proposal, tx) = builder
            .create_proposal(&ProposalRequest {
                multisig,
                proposal_id: 1,
                proposer_guardian_id: 1,
                description: String::new(),
                destination: Pubkey::new_unique(),
                amount: 1,
            })
            .unwrap();
        send(&ledger, &payer, tx).await.unwrap();

        let approval = ProposalApproval {
            multisig,
            proposal_id: 1,
            guardian_id: 1,
            timestamp: 1_700_000_100,
        };
        let tx = builder
            .approve_proposal(&approval, &proof(&owner_key, b"assertion"))
            .unwrap();
        // Drop the secp256r1 instruction and keep only the approval
        let approve_only = Transaction::new_unsigned(solana_sdk::message::Message::new(
            &[solana_sdk::instruction::Instruction {
                program_id: *builder.deriver().program_id(),
                accounts: tx.message.instructions[1]
                    .accounts
                    .iter()
                    .map(|i| {
                        let key = tx.message.account_keys[*i as usize];
                        solana_sdk::instruction::AccountMeta::new(key, key == payer.pubkey())
                    })
                    .collect(),
                data: tx.message.instructions[1].data.clone(),
            }],
            Some(&payer.pubkey()),
        ));
        assert!(send(&ledger, &payer, approve_only).await.is_err());
        assert_eq!(proposal_state(&ledger, &proposal).await.signatures_count, 0);

        send(&ledger, &payer, tx).await.unwrap();
        assert_eq!(proposal_state(&ledger, &proposal).await.signatures_count, 1);
    }

    #[tokio::test]
    async fn test_recovery_rebinds_passkey() {
        let (ledger, builder, payer, owner_key, multisig) = setup().await;
        let lost = admit(&ledger, &builder, &payer, &owner_key, multisig, 2).await;
        let replacement = SigningKey::random(&mut OsRng);
        let recovery = AccessRecovery {
            multisig,
            old_guardian_id: 2,
            new_guardian_id: 2,
            recovery_hash: [9u8; 32],
            new_webauthn_public_key: compressed(&replacement),
        };
        let err = send(&ledger, &payer, builder.recover_access(&recovery).unwrap())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("recovery phrase"));

        let recovery = AccessRecovery {
            recovery_hash: [2u8; 32],
            ..recovery
        };
        send(&ledger, &payer, builder.recover_access(&recovery).unwrap())
            .await
            .unwrap();

        let (address, _) = builder.deriver().guardian_address(&multisig, 2);
        let guardian = ledger.get_account(&address).await.unwrap().unwrap();
        let guardian = GuardianAccount::decode(&guardian.data).unwrap();
        assert_eq!(guardian.webauthn_pubkey, Some(compressed(&replacement)));
        let wallet = ledger.get_account(&multisig).await.unwrap().unwrap();
        assert_eq!(MultisigAccount::decode(&wallet.data).unwrap().recovery_nonce, 1);

        // The lost passkey no longer authorizes transfers
        ledger.airdrop(&multisig, 50_000).await;
        let request = TransferRequest {
            destination: Pubkey::new_unique(),
            amount: 1_000,
            nonce: 1,
            timestamp: 1_700_000_100,
            message: b"transfer".to_vec(),
        };
        let lost_tx = builder
            .transfer(&multisig, 2, &request, &proof(&lost, b"transfer"))
            .unwrap();
        assert!(send(&ledger, &payer, lost_tx).await.is_err());
        let tx = builder
            .transfer(&multisig, 2, &request, &proof(&replacement, b"transfer"))
            .unwrap();
        send(&ledger, &payer, tx).await.unwrap();
    }

    #[tokio::test]
    async fn test_recovery_to_new_guardian_id() {
        let (ledger, builder, payer, owner_key, multisig) = setup().await;
        admit(&ledger, &builder, &payer, &owner_key, multisig, 2).await;
        let replacement = SigningKey::random(&mut OsRng);
        let tx = builder
            .recover_access(&AccessRecovery {
                multisig,
                old_guardian_id: 2,
                new_guardian_id: 5,
                recovery_hash: [2u8; 32],
                new_webauthn_public_key: compressed(&replacement),
            })
            .unwrap();
        send(&ledger, &payer, tx).await.unwrap();

        let old = builder.deriver().guardian_address(&multisig, 2).0;
        let new = builder.deriver().guardian_address(&multisig, 5).0;
        assert!(ledger.get_account(&old).await.unwrap().is_none());
        let moved = ledger.get_account(&new).await.unwrap().unwrap();
        let moved = GuardianAccount::decode(&moved.data).unwrap();
        assert_eq!(moved.guardian_id, 5);
        assert_eq!(moved.recovery_hash, [2u8; 32]);
    }
}
