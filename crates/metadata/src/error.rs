//! Metadata store error types.

use thiserror::Error;

/// Errors from control-database operations.
#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("database error: {0}")]
    Mongo(#[from] mongodb::error::Error),

    #[error("encode document: {0}")]
    Serialize(#[from] bson::ser::Error),

    #[error("decode document: {0}")]
    Deserialize(#[from] bson::de::Error),

    #[error("document access: {0}")]
    Value(#[from] bson::document::ValueAccessError),

    #[error("{0} not found: {1}")]
    NotFound(&'static str, String),

    #[error("configuration error: {0}")]
    Config(String),
}

/// Result type for metadata operations.
pub type MetadataResult<T> = std::result::Result<T, MetadataError>;
