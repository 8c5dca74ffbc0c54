//! Local filesystem storage backend.

use crate::error::{StorageError, StorageResult};
use crate::traits::{ByteStream, FileStat, KeyStream, Storage, StreamingUpload};
use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::instrument;
use uuid::Uuid;

/// Chunk size for streaming reads (64 KiB).
const STREAM_CHUNK_SIZE: usize = 64 * 1024;

/// Filesystem object store rooted at an absolute path.
pub struct FilesystemStorage {
    root: PathBuf,
}

impl FilesystemStorage {
    /// Create a new filesystem backend, creating the root if needed.
    pub async fn new(root: impl AsRef<Path>) -> StorageResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    /// Resolve an object name to a path under the root.
    ///
    /// Object names are produced by this tool (backup name + replica set +
    /// suffix) but backup names are operator input, so names that would
    /// escape the root are rejected.
    fn object_path(&self, name: &str) -> StorageResult<PathBuf> {
        if name.is_empty() {
            return Err(StorageError::InvalidName("empty object name".to_string()));
        }
        let path = Path::new(name);
        if path.is_absolute()
            || path
                .components()
                .any(|c| !matches!(c, std::path::Component::Normal(_)))
        {
            return Err(StorageError::InvalidName(format!(
                "object name escapes storage root: {name}"
            )));
        }
        Ok(self.root.join(path))
    }

    fn temp_path(final_path: &Path) -> PathBuf {
        let temp_name = format!(".tmp.{}", Uuid::new_v4());
        final_path.with_file_name(
            final_path
                .file_name()
                .map(|n| format!("{}{}", n.to_string_lossy(), temp_name))
                .unwrap_or(temp_name),
        )
    }

    fn not_found(name: &str, e: std::io::Error) -> StorageError {
        if e.kind() == std::io::ErrorKind::NotFound {
            StorageError::NotFound(name.to_string())
        } else {
            StorageError::Io(e)
        }
    }
}

#[async_trait]
impl Storage for FilesystemStorage {
    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn source_reader(&self, name: &str) -> StorageResult<ByteStream> {
        use tokio::io::AsyncReadExt;

        let path = self.object_path(name)?;
        let file = fs::File::open(&path)
            .await
            .map_err(|e| Self::not_found(name, e))?;

        let stream = async_stream::try_stream! {
            let mut file = file;
            let mut buf = vec![0u8; STREAM_CHUNK_SIZE];
            loop {
                let n = file.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                yield Bytes::copy_from_slice(&buf[..n]);
            }
        };

        Ok(Box::pin(stream))
    }

    #[instrument(skip(self, data), fields(backend = "filesystem", size = data.len()))]
    async fn save(&self, name: &str, data: Bytes) -> StorageResult<()> {
        let path = self.object_path(name)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        // Write-to-tmp plus rename keeps partially written objects
        // invisible to readers.
        let temp_path = Self::temp_path(&path);
        {
            let mut file = fs::File::create(&temp_path).await?;
            file.write_all(&data).await?;
            file.sync_all().await?;
        }
        fs::rename(&temp_path, &path).await?;

        Ok(())
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn save_stream(&self, name: &str) -> StorageResult<Box<dyn StreamingUpload>> {
        let path = self.object_path(name)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let temp_path = Self::temp_path(&path);
        let file = fs::File::create(&temp_path).await?;

        Ok(Box::new(FilesystemUpload {
            file,
            temp_path,
            final_path: path,
            bytes_written: 0,
        }))
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn list(&self, prefix: &str) -> StorageResult<KeyStream> {
        let root = self.root.clone();
        let prefix = prefix.to_string();

        let stream = async_stream::try_stream! {
            let mut stack = vec![root.clone()];
            while let Some(dir) = stack.pop() {
                let mut entries = match fs::read_dir(&dir).await {
                    Ok(entries) => entries,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                    Err(e) => Err(StorageError::Io(e))?,
                };
                while let Some(entry) = entries.next_entry().await? {
                    let path = entry.path();
                    let file_type = entry.file_type().await?;
                    if file_type.is_dir() {
                        stack.push(path);
                    } else if file_type.is_file() {
                        if let Ok(rel) = path.strip_prefix(&root) {
                            let name = rel.to_string_lossy().to_string();
                            if name.starts_with(&prefix)
                                && !name.contains(".tmp.")
                            {
                                yield name;
                            }
                        }
                    }
                }
            }
        };

        Ok(Box::pin(stream))
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn file_stat(&self, name: &str) -> StorageResult<FileStat> {
        let path = self.object_path(name)?;
        let metadata = fs::metadata(&path)
            .await
            .map_err(|e| Self::not_found(name, e))?;
        Ok(FileStat { size: metadata.len() })
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn delete(&self, name: &str) -> StorageResult<()> {
        let path = self.object_path(name)?;
        fs::remove_file(&path)
            .await
            .map_err(|e| Self::not_found(name, e))
    }

    fn backend_name(&self) -> &'static str {
        "filesystem"
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn health_check(&self) -> StorageResult<()> {
        let metadata = fs::metadata(&self.root).await.map_err(|e| {
            StorageError::Io(std::io::Error::new(
                e.kind(),
                format!("storage root not accessible: {e}"),
            ))
        })?;

        if !metadata.is_dir() {
            return Err(StorageError::Config(format!(
                "storage root is not a directory: {}",
                self.root.display()
            )));
        }

        Ok(())
    }
}

/// Streaming upload for the filesystem backend.
struct FilesystemUpload {
    file: fs::File,
    temp_path: PathBuf,
    final_path: PathBuf,
    bytes_written: u64,
}

#[async_trait]
impl StreamingUpload for FilesystemUpload {
    async fn write(&mut self, data: Bytes) -> StorageResult<()> {
        self.file.write_all(&data).await?;
        self.bytes_written += data.len() as u64;
        Ok(())
    }

    async fn finish(mut self: Box<Self>) -> StorageResult<u64> {
        self.file.sync_all().await?;
        drop(self.file);
        fs::rename(&self.temp_path, &self.final_path).await?;
        Ok(self.bytes_written)
    }

    async fn abort(self: Box<Self>) -> StorageResult<()> {
        drop(self.file);
        let _ = fs::remove_file(&self.temp_path).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn object_names_cannot_escape_root() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FilesystemStorage::new(dir.path()).await.unwrap();

        assert!(storage.object_path("../escape").is_err());
        assert!(storage.object_path("/etc/passwd").is_err());
        assert!(storage.object_path("a/../../b").is_err());
        assert!(storage.object_path("").is_err());
        assert!(storage.object_path("b1_rs0.dump.gz").is_ok());
    }

    #[tokio::test]
    async fn aborted_upload_leaves_no_object() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FilesystemStorage::new(dir.path()).await.unwrap();

        let mut upload = storage.save_stream("b1_rs0.dump").await.unwrap();
        upload.write(Bytes::from_static(b"partial")).await.unwrap();
        upload.abort().await.unwrap();

        assert!(matches!(
            storage.file_stat("b1_rs0.dump").await,
            Err(StorageError::NotFound(_))
        ));
    }
}
