//! Operation error classification.
//!
//! The kind decides the recovery policy: transient failures are retried by
//! the surrounding poll loops where the operation is idempotent,
//! convergence and integrity failures terminate the operation, fatal
//! failures additionally end the worker.

use drover_metadata::MetadataError;
use drover_storage::StorageError;
use thiserror::Error;

/// An operation-level failure.
#[derive(Debug, Error)]
pub enum OpError {
    /// Network, timeout, contention. Safe to retry at the poll cadence.
    #[error("{0}")]
    Transient(String),

    /// A peer shard was lost or never acknowledged the operation.
    #[error("{0}")]
    Convergence(String),

    /// Inputs that can never succeed: missing metadata, unknown codec,
    /// uncovered oplog window. Never retried.
    #[error("{0}")]
    Integrity(String),

    /// The local node is unusable; fail the operation and exit the worker.
    #[error("{0}")]
    Fatal(String),

    /// The operation was cancelled by the operator or by shutdown.
    #[error("operation cancelled")]
    Cancelled,
}

impl OpError {
    pub fn transient(msg: impl std::fmt::Display) -> Self {
        OpError::Transient(msg.to_string())
    }

    pub fn convergence(msg: impl std::fmt::Display) -> Self {
        OpError::Convergence(msg.to_string())
    }

    pub fn integrity(msg: impl std::fmt::Display) -> Self {
        OpError::Integrity(msg.to_string())
    }

    pub fn fatal(msg: impl std::fmt::Display) -> Self {
        OpError::Fatal(msg.to_string())
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, OpError::Fatal(_))
    }
}

impl From<MetadataError> for OpError {
    fn from(e: MetadataError) -> Self {
        OpError::Transient(e.to_string())
    }
}

impl From<StorageError> for OpError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::UnknownCompression(kind) => {
                OpError::Integrity(format!("unknown compression: {kind}"))
            }
            other => OpError::Transient(other.to_string()),
        }
    }
}

impl From<std::io::Error> for OpError {
    fn from(e: std::io::Error) -> Self {
        OpError::Transient(format!("I/O error: {e}"))
    }
}

/// Result type for operation pipelines.
pub type OpResult<T> = std::result::Result<T, OpError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_compression_is_an_integrity_failure() {
        let err: OpError = StorageError::UnknownCompression("snappy".to_string()).into();
        match err {
            OpError::Integrity(msg) => assert_eq!(msg, "unknown compression: snappy"),
            other => panic!("expected Integrity, got {other:?}"),
        }
    }

    #[test]
    fn io_errors_are_transient() {
        let err: OpError = std::io::Error::other("boom").into();
        assert!(matches!(err, OpError::Transient(_)));
        assert!(!err.is_fatal());
    }
}
