//! Guardian lifecycle
//!
//! Invitations, passkey registration and owner-confirmed admission of new
//! guardians, plus owner-side removal and status changes.

pub mod error;
pub mod invitation;
pub mod manager;

pub use error::GuardianError;
pub use invitation::{
    generate_invite_code, GuardianInvitation, InvitationStatus, InvitationSummary,
    INVITE_CODE_LEN,
};
pub use manager::{
    minimum_admission_lease, Admission, GuardianManager, ManagerConfig, ALREADY_ON_LEDGER,
};
