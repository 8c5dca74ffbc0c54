//! Error types for the core domain.

use thiserror::Error;

/// Core domain error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("unknown compression: {0}")]
    UnknownCompression(String),

    #[error("invalid operation name: {0}")]
    InvalidOpName(String),
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;
