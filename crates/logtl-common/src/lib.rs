//! logtl Common - Shared types and utilities
//!
//! This crate provides the address types, error definitions, configuration
//! and checksum helpers used by the translation layer and its tools.

pub mod checksum;
pub mod config;
pub mod error;
pub mod types;

pub use checksum::ChecksumCalculator;
pub use config::{Config, ControlConfig, EngineConfig, LoggingConfig};
pub use error::{Error, Result};
pub use types::*;
