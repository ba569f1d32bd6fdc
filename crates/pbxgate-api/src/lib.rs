//! # pbxgate-api
//!
//! Axum HTTP surface for the admission and license endpoints.

pub mod dto;
pub mod error;
pub mod extractors;
pub mod handlers;
pub mod router;
pub mod state;

pub use error::ApiError;
pub use router::build_router;
pub use state::AppState;
