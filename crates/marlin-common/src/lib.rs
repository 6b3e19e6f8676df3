//! MarlinDB common types, errors, and configuration.
//!
//! This crate provides shared definitions used across all MarlinDB components.

pub mod config;
pub mod error;

pub use config::{ServerConfig, SnapshotConfig};
pub use error::{MarlinError, Result};
