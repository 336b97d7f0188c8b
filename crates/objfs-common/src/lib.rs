//! objfs Common - Shared types and utilities
//!
//! This crate provides the error taxonomy, identifier and key types, and the
//! configuration structures shared by the storage engine and its front ends.

pub mod config;
pub mod error;
pub mod types;

pub use config::{CacheConfig, CachePolicy, Config, LayoutConfig};
pub use error::{Error, Result};
pub use types::*;
