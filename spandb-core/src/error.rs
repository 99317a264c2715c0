//! Error types for SpanDB

use thiserror::Error;
use uuid::Uuid;

/// Result type alias for SpanDB operations
pub type Result<T> = std::result::Result<T, SpanError>;

/// SpanDB error types
#[derive(Error, Debug)]
pub enum SpanError {
    /// IO operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Backend object does not exist
    #[error("Object does not exist: {0}")]
    DoesNotExist(String),

    /// Backend transport failure
    #[error("Backend error: {0}")]
    Backend(String),

    /// Data corruption detected
    #[error("Data corruption: {0}")]
    Corruption(String),

    /// Checksum mismatch
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    /// Invalid data format
    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    /// Compression/decompression error
    #[error("Compression error: {0}")]
    Compression(String),

    /// Encoding or decoding of a structure failed
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Malformed request parameter
    #[error("Validation error: {0}")]
    Validation(String),

    /// Configured limit exceeded
    #[error("Capacity exceeded: {0}")]
    Capacity(String),

    /// Too many blocks failed during a fan-out search
    #[error("Search failed on {} of {total} blocks", .failed_blocks.len())]
    PartialFailure { failed_blocks: Vec<Uuid>, total: usize },

    /// Operation cancelled
    #[error("Operation cancelled")]
    Cancelled,

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Compaction error
    #[error("Compaction error: {0}")]
    Compaction(String),

    /// WAL recovery error
    #[error("WAL recovery error: {0}")]
    WalRecovery(String),

    /// Metric registration failed
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SpanError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, SpanError::Io(_) | SpanError::Backend(_))
    }

    /// Check if error indicates corruption
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            SpanError::Corruption(_) | SpanError::ChecksumMismatch { .. } | SpanError::InvalidFormat(_)
        )
    }

    /// Check if a backend object was missing
    pub fn is_not_found(&self) -> bool {
        matches!(self, SpanError::DoesNotExist(_))
    }
}

impl From<bincode::Error> for SpanError {
    fn from(e: bincode::Error) -> Self {
        SpanError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for SpanError {
    fn from(e: serde_json::Error) -> Self {
        SpanError::Serialization(e.to_string())
    }
}
