//! Error types for logtl
//!
//! This module defines the error type shared by configuration loading and
//! the on-device record codecs.

use thiserror::Error;

/// Common result type for logtl operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for logtl
#[derive(Debug, Error)]
pub enum Error {
    #[error("checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    #[error("configuration error: {0}")]
    Configuration(String),
}

impl Error {
    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Check if this error came from the data itself rather than the caller
    #[must_use]
    pub const fn is_corruption(&self) -> bool {
        matches!(self, Self::ChecksumMismatch { .. })
    }
}
