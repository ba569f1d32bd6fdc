//! # pbxgate-session
//!
//! The Session Admission Controller: the atomic validate / create /
//! heartbeat / end protocol backed by the atomic session cache and the
//! durable session store, plus the signed session tokens it issues.

pub mod controller;
pub mod store;
pub mod token;

pub use controller::{
    AdmissionController, ClientMeta, CreatedSession, RegistrationValidation, SetupOutcome,
    ValidationOutcome,
};
pub use store::{PgSessionStore, SessionStore};
pub use token::{SessionTokenClaims, SessionTokens};
