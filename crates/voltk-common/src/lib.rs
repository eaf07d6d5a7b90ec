//! voltk Common - Shared types and utilities
//!
//! This crate provides the error type, configuration structures and
//! sector arithmetic shared by the I/O manager and the tools built on it.

pub mod config;
pub mod error;
pub mod types;

pub use config::{EngineKind, IoConfig, LoggingConfig};
pub use error::{Error, Result};
pub use types::*;
