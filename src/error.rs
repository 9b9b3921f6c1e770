//! Error types for the block cache

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the block cache
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// Malformed configuration, unknown key or out-of-range value
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Capability unavailable in the current build profile
    #[error("Not supported: {0}")]
    NotSupported(String),

    /// Strict capacity limit prevented an insert
    #[error("Insert of {charge} bytes exceeds memory limit (capacity {capacity})")]
    MemoryLimitExceeded { charge: usize, capacity: usize },

    /// Owner id space is fully allocated
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Stored secondary cache payload failed validation
    #[error("Corruption: {0}")]
    Corruption(String),

    // =========================================================================
    // Compression Errors
    // =========================================================================
    /// Compression failed
    #[error("Compression with {algorithm} failed: {reason}")]
    CompressionFailed { algorithm: String, reason: String },

    /// Decompression failed
    #[error("Decompression with {algorithm} failed: {reason}")]
    DecompressionFailed { algorithm: String, reason: String },
}

impl Error {
    /// Shorthand for [`Error::InvalidArgument`]
    pub fn invalid(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    /// Shorthand for [`Error::NotSupported`]
    pub fn not_supported(msg: impl Into<String>) -> Self {
        Error::NotSupported(msg.into())
    }

    /// Shorthand for [`Error::Corruption`]
    pub fn corruption(msg: impl Into<String>) -> Self {
        Error::Corruption(msg.into())
    }
}
