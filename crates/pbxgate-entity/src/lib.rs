//! # pbxgate-entity
//!
//! Domain entity models for PBXGate: cached licenses, feature grants,
//! and admitted sessions. All rows map through `sqlx::FromRow` and
//! serialize with serde.

pub mod license;
pub mod session;
