//! Invitation storage
//!
//! Off-ledger bookkeeping for guardian admissions. Records are small and
//! keyed by invite code.

pub mod memory;
pub mod persistence;
pub mod store;

pub use memory::MemoryInvitationStore;
pub use persistence::{FileInvitationStore, StoreConfig};
pub use store::{InvitationStore, StoreError};
