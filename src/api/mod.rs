//! REST API module
//!
//! HTTP access to the guardian lifecycle for browser front ends.
//!
//! # Endpoints
//!
//! ## Invitations
//! - `POST /api/guardian/invite` - Owner creates an invitation
//! - `GET /api/guardian/{code}` - Invitation status
//! - `POST /api/guardian/{code}/register` - Invitee registers a passkey
//! - `POST /api/guardian/{code}/confirm` - Owner approves the admission
//!
//! ## Owner actions
//! - `POST /api/guardian/remove` - Remove a guardian
//! - `POST /api/guardian/status` - Activate or deactivate a guardian
//!
//! ## Recovery
//! - `POST /api/wallet/recover` - Replace a guardian's passkey using its
//!   recovery phrase hash
//!
//! ## Multisig
//! - `GET /api/multisig/{address}/guardians` - Guardians on the ledger
//! - `GET /api/multisig/{address}/invitations` - Invitations for the multisig
//!
//! Errors are JSON `{"error", "retryable"}` with 400 for invalid input or a
//! protected guardian, 404 for unknown invitations or guardians, 409 for
//! state conflicts and admissions in progress, and 502 for ledger failures.

pub mod handlers;
pub mod routes;

pub use handlers::ApiState;
pub use routes::create_router;
