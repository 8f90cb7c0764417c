//! Error types for HyperChunk

use thiserror::Error;

/// Result type alias for HyperChunk operations
pub type Result<T> = std::result::Result<T, HyperError>;

/// HyperChunk error types
#[derive(Error, Debug)]
pub enum HyperError {
    /// Malformed dimension spec, duplicate hypertable, bad replication factor
    #[error("Validation error: {0}")]
    Validation(String),

    /// Unknown hypertable, chunk, data node or tablespace
    #[error("Not found: {0}")]
    NotFound(String),

    /// Hypertable lock could not be granted
    #[error("Concurrency conflict: {0}")]
    ConcurrencyConflict(String),

    /// Replication factor cannot be satisfied by the node pool
    #[error("Placement error: replication factor {required} exceeds {available} available data nodes")]
    Placement { required: usize, available: usize },

    /// Two live chunks would cover the same point
    #[error("Partitioning violation: {0}")]
    PartitioningViolation(String),

    /// IO operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid data format
    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    /// Data corruption detected
    #[error("Data corruption: {0}")]
    Corruption(String),

    /// Checksum mismatch
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl HyperError {
    /// Check if the whole insert may be retried by the caller
    pub fn is_retryable(&self) -> bool {
        matches!(self, HyperError::ConcurrencyConflict(_))
    }

    /// Check if error indicates corruption
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            HyperError::Corruption(_)
                | HyperError::ChecksumMismatch { .. }
                | HyperError::PartitioningViolation(_)
        )
    }
}
