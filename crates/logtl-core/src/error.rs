//! Translation layer error types

use thiserror::Error;

/// Translation layer error
#[derive(Error, Debug)]
pub enum BlockError {
    /// Range outside the logical window or the device, or zero length
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A fixed-capacity pool is exhausted; resubmit later
    #[error("Resource exhausted, try later: {0}")]
    TryLater(&'static str),

    /// The translator is shutting down
    #[error("Translator is shutting down")]
    ShutDown,

    /// Device I/O error, passed through from the backing device
    #[error("Device error: {0}")]
    Device(#[from] std::io::Error),

    /// Journal header error
    #[error("Journal error: {0}")]
    Journal(String),

    /// Control plane backend error
    #[error("Backend error: {0}")]
    Backend(String),

    /// Shared type or configuration error
    #[error(transparent)]
    Common(#[from] logtl_common::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl BlockError {
    /// Create an invalid argument error
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Check if the caller should simply resubmit
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::TryLater(_))
    }

    /// Check if this surfaces to the client as an I/O error status
    #[must_use]
    pub const fn is_io_error(&self) -> bool {
        matches!(self, Self::ShutDown | Self::Device(_))
    }
}

/// Result type for translation layer operations
pub type BlockResult<T> = Result<T, BlockError>;
