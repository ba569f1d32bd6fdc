//! # pbxgate-cache
//!
//! The Atomic Session Cache: the authoritative store for admission
//! decisions. Provides key-value, set, and counter primitives mutated
//! only through atomic batches so no caller ever observes a
//! partially-applied admission.
//!
//! Two backends: Redis (multi-node, Lua scripts for atomicity) and
//! in-memory (single node, one mutex). The cache is volatile and fully
//! rebuildable from the durable stores.

pub mod client;
pub mod keys;
pub mod session;

pub use client::RedisClient;
pub use session::{AdmitOutcome, ReleaseOutcome, SessionCache, SessionEntry, connect};
