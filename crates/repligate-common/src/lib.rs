//! Repligate Common - Shared types and utilities
//!
//! This crate provides the common types, error definitions and the YAML
//! configuration model used across all Repligate components.

pub mod config;
pub mod error;
pub mod types;

pub use config::ProxyConfig;
pub use error::{Error, Result};
pub use types::*;
