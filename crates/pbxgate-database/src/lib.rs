//! # pbxgate-database
//!
//! PostgreSQL connection pooling, migrations, and the repositories for
//! the durable license and session stores.

pub mod connection;
pub mod migration;
pub mod repositories;
