//! Quillcheck Shared Types and Utilities
//!
//! This crate contains domain types and database utilities shared across the
//! Quillcheck platform.

pub mod db;
pub mod types;

pub use db::*;
pub use types::*;
