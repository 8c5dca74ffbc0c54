//! Object storage abstraction and streaming codecs for drover.
//!
//! This crate provides:
//! - The `Storage` trait backups and restores stream through
//! - Backends: local filesystem and S3-compatible
//! - Compression codecs applied between the pipelines and the backend

pub mod backends;
pub mod compress;
pub mod error;
pub mod traits;

pub use backends::{filesystem::FilesystemStorage, s3::S3Storage};
pub use error::{StorageError, StorageResult};
pub use traits::{ByteStream, FileStat, KeyStream, Storage, StreamingUpload};

use drover_core::StorageConfig;
use std::sync::Arc;

/// Create a storage backend from a descriptor.
pub async fn from_config(config: &StorageConfig) -> StorageResult<Arc<dyn Storage>> {
    config.validate().map_err(StorageError::Config)?;

    match config {
        StorageConfig::Filesystem { path } => {
            let backend = FilesystemStorage::new(path).await?;
            Ok(Arc::new(backend))
        }
        StorageConfig::S3 {
            bucket,
            endpoint,
            region,
            prefix,
            access_key_id,
            secret_access_key,
            force_path_style,
        } => {
            let backend = S3Storage::new(
                bucket,
                endpoint.clone(),
                region.clone(),
                prefix.clone(),
                access_key_id.clone(),
                secret_access_key.clone(),
                *force_path_style,
            )
            .await?;
            Ok(Arc::new(backend))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[tokio::test]
    async fn from_config_filesystem_ok() {
        let temp = tempfile::tempdir().unwrap();
        let config = StorageConfig::Filesystem {
            path: temp.path().join("store"),
        };

        let store = from_config(&config).await.unwrap();
        store
            .save("b1.pbm.json", Bytes::from_static(b"{}"))
            .await
            .unwrap();
        assert_eq!(store.file_stat("b1.pbm.json").await.unwrap().size, 2);
    }

    #[tokio::test]
    async fn from_config_rejects_partial_credentials() {
        let config = StorageConfig::S3 {
            bucket: "bucket".to_string(),
            endpoint: None,
            region: None,
            prefix: None,
            access_key_id: Some("access".to_string()),
            secret_access_key: None,
            force_path_style: false,
        };

        match from_config(&config).await {
            Err(StorageError::Config(_)) => {}
            other => {
                let other = other.map(|_| ());
                panic!("expected config error, got {other:?}")
            }
        }
    }
}
