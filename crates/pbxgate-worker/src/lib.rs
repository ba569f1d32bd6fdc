//! # pbxgate-worker
//!
//! Long-lived background jobs, each a supervised loop with its own
//! cancellation channel so shutdown can await their completion: the
//! cache reconciliation service and the periodic license refresh.

pub mod reconciler;
pub mod refresh;

pub use reconciler::{PassSummary, ReconciliationService};
pub use refresh::LicenseRefreshService;
