//! Quillcheck API Library
//!
//! This crate contains the HTTP server components for Quillcheck billing.

pub mod config;
pub mod error;
pub mod routes;
pub mod state;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use state::AppState;
