//! License entities: cached license rows, feature grants, fingerprint audit.

pub mod feature;
pub mod model;

pub use feature::{Feature, FeatureSet};
pub use model::{
    FingerprintChange, LicenseRecord, LicenseStatus, OFFLINE_MASTER_LICENSE_ID, SyncStatus,
    UpsertLicense,
};
