//! Byte plumbing between pipeline stages and storage.
//!
//! An upload is three stages: a producer writing into the codec encoder,
//! a bounded channel, and an uploader task feeding the backend's streaming
//! upload. The channel exerts backpressure end-to-end; a failed upload
//! surfaces to the producer as a broken pipe on its next write.

use crate::error::{OpError, OpResult};
use bytes::Bytes;
use drover_core::Compression;
use drover_storage::{compress, Storage, StorageError, StreamingUpload};
use futures::SinkExt;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::io::AsyncWriteExt;
use tokio_util::io::{CopyToBytes, SinkWriter, StreamReader};
use tokio_util::sync::PollSender;

/// In-flight chunks between the encoder and the uploader.
const CHANNEL_DEPTH: usize = 16;

/// A compressing writer whose output is streamed into storage by a
/// background task.
pub struct UploadPipe {
    writer: compress::Writer,
    task: JoinHandle<Result<Box<dyn StreamingUpload>, StorageError>>,
}

/// Open a streaming upload for `name` behind the codec for `compression`.
pub async fn open_upload(
    storage: &dyn Storage,
    name: &str,
    compression: Compression,
) -> OpResult<UploadPipe> {
    let upload = storage.save_stream(name).await?;

    let (tx, rx) = mpsc::channel::<Bytes>(CHANNEL_DEPTH);
    let task = tokio::spawn(drain(rx, upload));

    let sink = PollSender::new(tx)
        .sink_map_err(|_| std::io::Error::from(std::io::ErrorKind::BrokenPipe));
    let writer: compress::Writer = Box::new(SinkWriter::new(CopyToBytes::new(sink)));
    let writer = compress::encoder(compression, writer)?;

    Ok(UploadPipe { writer, task })
}

/// Move chunks from the channel into the upload. Returns the still-open
/// upload on clean channel close so the caller decides between finish and
/// abort.
async fn drain(
    mut rx: mpsc::Receiver<Bytes>,
    mut upload: Box<dyn StreamingUpload>,
) -> Result<Box<dyn StreamingUpload>, StorageError> {
    while let Some(chunk) = rx.recv().await {
        if let Err(e) = upload.write(chunk).await {
            let _ = upload.abort().await;
            return Err(e);
        }
    }
    Ok(upload)
}

impl UploadPipe {
    /// The producer-facing writer.
    pub fn writer(&mut self) -> &mut compress::Writer {
        &mut self.writer
    }

    /// Finalize the codec framing, close the channel and complete the
    /// upload. Returns the object size in bytes.
    pub async fn finish(self) -> OpResult<u64> {
        let Self { mut writer, task } = self;
        writer.shutdown().await?;
        drop(writer);

        let upload = task
            .await
            .map_err(|e| OpError::transient(format!("uploader task failed: {e}")))??;
        Ok(upload.finish().await?)
    }

    /// Abandon the upload, discarding what was written.
    pub async fn abort(self) {
        let Self { writer, task } = self;
        drop(writer);

        match task.await {
            Ok(Ok(upload)) => {
                if let Err(e) = upload.abort().await {
                    tracing::warn!(error = %e, "upload abort failed, partial object may remain");
                }
            }
            Ok(Err(_)) => {} // uploader already failed and aborted
            Err(e) => tracing::warn!(error = %e, "uploader task failed during abort"),
        }
    }
}

/// Open a decompressing reader over an object in storage.
pub async fn open_download(
    storage: &dyn Storage,
    name: &str,
    compression: Compression,
) -> OpResult<compress::Reader> {
    let stream = storage.source_reader(name).await?;
    let stream = stream.map(|res| res.map_err(std::io::Error::other));
    let reader: compress::Reader = Box::new(StreamReader::new(stream));
    Ok(compress::decoder(compression, reader)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use drover_storage::FilesystemStorage;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn upload_download_round_trip_through_codec() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FilesystemStorage::new(dir.path()).await.unwrap();

        let payload: Vec<u8> = (0u32..100_000).flat_map(|i| i.to_le_bytes()).collect();

        let mut pipe = open_upload(&storage, "b1_rs0.dump.gz", Compression::Gzip)
            .await
            .unwrap();
        pipe.writer().write_all(&payload).await.unwrap();
        let stored = pipe.finish().await.unwrap();
        assert!(stored > 0);
        // Compressed object on disk, not the raw payload.
        assert_eq!(
            storage.file_stat("b1_rs0.dump.gz").await.unwrap().size,
            stored
        );
        assert!(stored < payload.len() as u64);

        let mut reader = open_download(&storage, "b1_rs0.dump.gz", Compression::Gzip)
            .await
            .unwrap();
        let mut decoded = Vec::new();
        reader.read_to_end(&mut decoded).await.unwrap();
        assert_eq!(decoded, payload);
    }

    #[tokio::test]
    async fn aborted_pipe_leaves_no_object() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FilesystemStorage::new(dir.path()).await.unwrap();

        let mut pipe = open_upload(&storage, "b1_rs0.oplog", Compression::None)
            .await
            .unwrap();
        pipe.writer().write_all(b"half an oplog").await.unwrap();
        pipe.abort().await;

        assert!(storage.file_stat("b1_rs0.oplog").await.is_err());
    }

    #[tokio::test]
    async fn unsupported_codec_fails_before_download_starts() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FilesystemStorage::new(dir.path()).await.unwrap();
        storage
            .save("b1_rs0.dump.snappy", Bytes::from_static(b"\x00"))
            .await
            .unwrap();

        match open_download(&storage, "b1_rs0.dump.snappy", Compression::Snappy).await {
            Err(OpError::Integrity(msg)) => assert!(msg.contains("unknown compression")),
            other => {
                let other = other.map(|_| ());
                panic!("expected Integrity error, got {other:?}")
            }
        }
    }
}
