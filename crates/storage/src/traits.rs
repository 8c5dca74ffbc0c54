//! Storage trait definitions.

use crate::error::StorageResult;
use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use std::pin::Pin;

/// A boxed stream of bytes for streaming reads.
pub type ByteStream = Pin<Box<dyn Stream<Item = StorageResult<Bytes>> + Send>>;

/// A boxed stream of object names for lazy listings.
pub type KeyStream = Pin<Box<dyn Stream<Item = StorageResult<String>> + Send>>;

/// Metadata about a stored object.
#[derive(Clone, Copy, Debug)]
pub struct FileStat {
    /// Object size in bytes.
    pub size: u64,
}

/// Object storage abstraction for backup payloads.
///
/// Streams are not resumable: a failed upload means restart-from-zero of
/// the object, at the caller's discretion. Listings are lazy so very large
/// buckets never materialize in memory.
#[async_trait]
pub trait Storage: Send + Sync + 'static {
    /// Open an object for streaming reads.
    async fn source_reader(&self, name: &str) -> StorageResult<ByteStream>;

    /// Write a small object atomically.
    async fn save(&self, name: &str, data: Bytes) -> StorageResult<()>;

    /// Start a streaming upload.
    async fn save_stream(&self, name: &str) -> StorageResult<Box<dyn StreamingUpload>>;

    /// List object names under a prefix.
    async fn list(&self, prefix: &str) -> StorageResult<KeyStream>;

    /// Get an object's size without fetching content.
    async fn file_stat(&self, name: &str) -> StorageResult<FileStat>;

    /// Delete an object.
    async fn delete(&self, name: &str) -> StorageResult<()>;

    /// Static identifier of the backend type, for logging.
    fn backend_name(&self) -> &'static str;

    /// Verify the backend is reachable and writable.
    ///
    /// Called before an operation starts so misconfiguration surfaces
    /// before any metadata is written.
    async fn health_check(&self) -> StorageResult<()> {
        Ok(())
    }
}

/// Trait for streaming uploads.
#[async_trait]
pub trait StreamingUpload: Send {
    /// Write a chunk of data.
    async fn write(&mut self, data: Bytes) -> StorageResult<()>;

    /// Finish the upload and return the total bytes written.
    async fn finish(self: Box<Self>) -> StorageResult<u64>;

    /// Abort the upload, discarding data written so far where the backend
    /// allows it.
    async fn abort(self: Box<Self>) -> StorageResult<()>;
}
