//! # pbxgate-license
//!
//! The license cache lifecycle: fetching licenses from the master server,
//! TTL/staleness management, grace-period fallback, fingerprint binding,
//! and the offline development license that keeps a standalone server
//! operable when the master was never reachable.

pub mod engine;
pub mod fingerprint;
pub mod master;
pub mod store;

pub use engine::LicenseSyncEngine;
pub use fingerprint::{FingerprintProvider, HostFingerprint};
pub use master::{ActivityEvent, FetchError, LicensePayload, MasterApi, MasterHttpClient, SessionActivity};
pub use store::{LicenseStore, PgLicenseStore};
