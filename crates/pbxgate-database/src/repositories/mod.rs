//! Repository implementations over the durable stores.

pub mod fingerprint;
pub mod license;
pub mod session;

pub use fingerprint::FingerprintChangeRepository;
pub use license::LicenseRepository;
pub use session::SessionRepository;
