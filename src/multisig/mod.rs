//! Passkey-authorized multisig wallet client
//!
//! A multisig is controlled by guardians, each bound to one WebAuthn
//! (secp256r1) credential. Authority is proven by placing a native
//! secp256r1 verification instruction right before the wallet instruction
//! it authorizes. Transfers are either signed directly by one guardian or
//! go through a proposal that collects `threshold` approvals.
//!
//! # Example
//!
//! ```ignore
//! use passkey_multisig::multisig::{AddressDeriver, TransactionBuilder};
//!
//! let deriver = AddressDeriver::default();
//! let (multisig, _) = deriver.multisig_address(&credential_id)?;
//! let (guardian, _) = deriver.guardian_address(&multisig, 2);
//!
//! let builder = TransactionBuilder::new(deriver, fee_payer.pubkey());
//! let tx = builder.transfer(&multisig, 1, &request, &proof)?;
//! ```

pub mod accounts;
pub mod instructions;
pub mod pda;
pub mod transaction;
pub mod verification;
pub mod wallet;

pub use accounts::{
    AccountError, ApprovalAccount, GuardianAccount, MultisigAccount, ProposalAccount,
    ProposalStatus,
};
pub use pda::{AddressDeriver, AddressError, DEFAULT_PROGRAM_ID};
pub use transaction::{
    approval_message, sign_with_fee_payer, AccessRecovery, GuardianAdmission, NewWallet,
    ProposalApproval, ProposalRequest, TransactionBuilder, TransactionError, TransferRequest,
    MAX_GUARDIAN_NAME_LEN, MAX_PROPOSAL_DESCRIPTION_LEN, OWNER_GUARDIAN_ID,
};
pub use verification::{
    decode_base64, encode_verification_instruction, AuthorizationProof, CodecError,
    EncodedAssertion, WebAuthnAssertion, SECP256R1_PROGRAM_ID,
};
pub use wallet::{
    CreatedProposal, CreatedWallet, GuardianEntry, ProposalEntry, WalletError, WalletService,
};
