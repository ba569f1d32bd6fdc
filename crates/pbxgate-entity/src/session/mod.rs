//! Session entities: durable session rows and status.

pub mod model;

pub use model::{CreateSession, SessionRecord, SessionStatus, principal_id};
