//! S3-compatible storage backend using the AWS SDK.

use crate::error::{StorageError, StorageResult};
use crate::traits::{ByteStream, FileStat, KeyStream, Storage, StreamingUpload};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::Client;
use bytes::Bytes;
use tokio_util::io::ReaderStream;
use tracing::instrument;

/// Initial multipart part size (8 MiB). S3 requires every part except the
/// last to be at least 5 MiB.
const INITIAL_PART_SIZE: usize = 8 * 1024 * 1024;

/// Hard S3 limit on the number of parts in one multipart upload.
const MAX_PARTS: i32 = 10_000;

/// S3-compatible object store.
pub struct S3Storage {
    client: Client,
    bucket: String,
    prefix: Option<String>,
}

impl std::fmt::Debug for S3Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Storage")
            .field("bucket", &self.bucket)
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

impl S3Storage {
    /// Create a new S3 backend.
    #[allow(clippy::too_many_arguments)]
    pub async fn new(
        bucket: &str,
        endpoint: Option<String>,
        region: Option<String>,
        prefix: Option<String>,
        access_key_id: Option<String>,
        secret_access_key: Option<String>,
        force_path_style: bool,
    ) -> StorageResult<Self> {
        let resolved_region = region.unwrap_or_else(|| "us-east-1".to_string());
        let base = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(resolved_region.clone()))
            .load()
            .await;

        let mut builder = aws_sdk_s3::config::Builder::from(&base);

        if let (Some(key_id), Some(secret)) = (access_key_id, secret_access_key) {
            let credentials =
                aws_sdk_s3::config::Credentials::new(key_id, secret, None, None, "drover-config");
            builder = builder.credentials_provider(credentials);
        }

        if let Some(endpoint) = endpoint {
            // Accept bare host:port endpoints for local object stores.
            let lower = endpoint.to_ascii_lowercase();
            let url = if lower.starts_with("http://") || lower.starts_with("https://") {
                endpoint
            } else {
                format!("http://{endpoint}")
            };
            builder = builder.endpoint_url(url);
        }

        if force_path_style {
            builder = builder.force_path_style(true);
        }

        Ok(Self {
            client: Client::from_conf(builder.build()),
            bucket: bucket.to_string(),
            prefix: prefix.map(|p| p.trim_end_matches('/').to_string()),
        })
    }

    /// Full object key under the configured prefix.
    fn full_key(&self, name: &str) -> String {
        match &self.prefix {
            Some(prefix) => format!("{prefix}/{name}"),
            None => name.to_string(),
        }
    }

    fn strip_prefix(&self, full_key: &str) -> String {
        match &self.prefix {
            Some(prefix) => {
                let with_slash = format!("{prefix}/");
                full_key
                    .strip_prefix(&with_slash)
                    .unwrap_or(full_key)
                    .to_string()
            }
            None => full_key.to_string(),
        }
    }

    /// Convert an SDK error to a storage error, mapping 404 to NotFound.
    fn map_sdk_error<E>(err: aws_sdk_s3::error::SdkError<E>, name: &str) -> StorageError
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        if let aws_sdk_s3::error::SdkError::ServiceError(ref service_err) = err {
            if service_err.raw().status().as_u16() == 404 {
                return StorageError::NotFound(name.to_string());
            }
        }
        StorageError::S3(Box::new(err))
    }
}

#[async_trait]
impl Storage for S3Storage {
    #[instrument(skip(self), fields(backend = "s3"))]
    async fn source_reader(&self, name: &str) -> StorageResult<ByteStream> {
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(self.full_key(name))
            .send()
            .await
            .map_err(|e| Self::map_sdk_error(e, name))?;

        use futures::StreamExt;
        let reader = ReaderStream::new(output.body.into_async_read());
        Ok(Box::pin(reader.map(|res| res.map_err(StorageError::Io))))
    }

    #[instrument(skip(self, data), fields(backend = "s3", size = data.len()))]
    async fn save(&self, name: &str, data: Bytes) -> StorageResult<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(self.full_key(name))
            .body(data.into())
            .send()
            .await
            .map_err(|e| Self::map_sdk_error(e, name))?;
        Ok(())
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn save_stream(&self, name: &str) -> StorageResult<Box<dyn StreamingUpload>> {
        let key = self.full_key(name);
        let create = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| Self::map_sdk_error(e, name))?;

        let upload_id = create
            .upload_id()
            .ok_or_else(|| StorageError::Config("S3 did not return an upload id".to_string()))?
            .to_string();

        Ok(Box::new(S3Upload {
            client: self.client.clone(),
            bucket: self.bucket.clone(),
            key,
            upload_id,
            parts: Vec::new(),
            part_number: 1,
            bytes_written: 0,
            buffer: Vec::with_capacity(INITIAL_PART_SIZE),
            part_size: INITIAL_PART_SIZE,
            next_scale_at: MAX_PARTS / 2,
        }))
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn list(&self, prefix: &str) -> StorageResult<KeyStream> {
        let full_prefix = self.full_key(prefix);
        let client = self.client.clone();
        let bucket = self.bucket.clone();
        let strip = self.prefix.clone();

        let stream = async_stream::try_stream! {
            let mut continuation_token: Option<String> = None;

            loop {
                let mut request = client
                    .list_objects_v2()
                    .bucket(&bucket)
                    .prefix(&full_prefix);
                if let Some(token) = continuation_token.take() {
                    request = request.continuation_token(token);
                }

                let output = request
                    .send()
                    .await
                    .map_err(|e| StorageError::S3(Box::new(e)))?;

                for obj in output.contents() {
                    if let Some(key) = obj.key() {
                        let name = match &strip {
                            Some(prefix) => {
                                let with_slash = format!("{prefix}/");
                                key.strip_prefix(&with_slash).unwrap_or(key).to_string()
                            }
                            None => key.to_string(),
                        };
                        yield name;
                    }
                }

                if output.is_truncated() == Some(true) {
                    continuation_token =
                        output.next_continuation_token().map(|s| s.to_string());
                } else {
                    break;
                }
            }
        };

        Ok(Box::pin(stream))
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn file_stat(&self, name: &str) -> StorageResult<FileStat> {
        let output = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(self.full_key(name))
            .send()
            .await
            .map_err(|e| Self::map_sdk_error(e, name))?;

        Ok(FileStat {
            size: output.content_length().unwrap_or(0) as u64,
        })
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn delete(&self, name: &str) -> StorageResult<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(self.full_key(name))
            .send()
            .await
            .map_err(|e| Self::map_sdk_error(e, name))?;
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "s3"
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn health_check(&self) -> StorageResult<()> {
        self.client
            .list_objects_v2()
            .bucket(&self.bucket)
            .max_keys(1)
            .send()
            .await
            .map_err(|e| StorageError::S3(Box::new(e)))?;
        Ok(())
    }
}

/// Streaming upload via S3 multipart.
///
/// Data is buffered until the current part size is reached. The part size
/// grows every time half of the remaining part budget is consumed, so the
/// upload never exceeds the 10 000-part limit regardless of object size.
struct S3Upload {
    client: Client,
    bucket: String,
    key: String,
    upload_id: String,
    parts: Vec<aws_sdk_s3::types::CompletedPart>,
    part_number: i32,
    bytes_written: u64,
    buffer: Vec<u8>,
    part_size: usize,
    next_scale_at: i32,
}

impl S3Upload {
    async fn upload_part(&mut self, data: Bytes) -> StorageResult<()> {
        let output = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(&self.key)
            .upload_id(&self.upload_id)
            .part_number(self.part_number)
            .body(data.into())
            .send()
            .await
            .map_err(|e| StorageError::S3(Box::new(e)))?;

        self.parts.push(
            aws_sdk_s3::types::CompletedPart::builder()
                .e_tag(output.e_tag().unwrap_or_default())
                .part_number(self.part_number)
                .build(),
        );
        self.part_number += 1;

        if self.part_number >= self.next_scale_at {
            let (size, next) = scale_part(self.part_size, self.next_scale_at);
            self.part_size = size;
            self.next_scale_at = next;
        }

        Ok(())
    }
}

/// Maximum S3 part size (5 GiB).
const MAX_PART_SIZE: usize = 5 * 1024 * 1024 * 1024;

/// Quadruple the part size and move the next scale point halfway through
/// the remaining part budget. Spans sum to the part budget while the
/// per-stage capacity doubles, which carries multi-terabyte objects well
/// past the size a dump can reach.
fn scale_part(part_size: usize, scale_at: i32) -> (usize, i32) {
    let next = scale_at + (MAX_PARTS - scale_at) / 2;
    let size = part_size.saturating_mul(4).min(MAX_PART_SIZE);
    (size, next.min(MAX_PARTS - 1))
}

#[async_trait]
impl StreamingUpload for S3Upload {
    async fn write(&mut self, data: Bytes) -> StorageResult<()> {
        self.bytes_written += data.len() as u64;
        self.buffer.extend_from_slice(&data);

        while self.buffer.len() >= self.part_size {
            let rest = self.buffer.split_off(self.part_size);
            let part = Bytes::from(std::mem::replace(&mut self.buffer, rest));
            self.upload_part(part).await?;
        }

        Ok(())
    }

    async fn finish(mut self: Box<Self>) -> StorageResult<u64> {
        // The final part may be smaller than the minimum; S3 allows that
        // for the last part only. An empty object still needs one part.
        if !self.buffer.is_empty() || self.parts.is_empty() {
            let part = Bytes::from(std::mem::take(&mut self.buffer));
            self.upload_part(part).await?;
        }

        let completed = aws_sdk_s3::types::CompletedMultipartUpload::builder()
            .set_parts(Some(self.parts.clone()))
            .build();

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(&self.key)
            .upload_id(&self.upload_id)
            .multipart_upload(completed)
            .send()
            .await
            .map_err(|e| StorageError::S3(Box::new(e)))?;

        Ok(self.bytes_written)
    }

    async fn abort(self: Box<Self>) -> StorageResult<()> {
        self.client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(&self.key)
            .upload_id(&self.upload_id)
            .send()
            .await
            .map_err(|e| StorageError::S3(Box::new(e)))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn part_size_scaling_stays_under_the_part_limit() {
        let mut part_size = INITIAL_PART_SIZE;
        let mut scale_at = MAX_PARTS / 2;
        let mut parts = 0i64;
        let mut capacity = 0u64;

        // Walk the schedule far past any realistic object size.
        for _ in 0..40 {
            let span = i64::from(scale_at) - parts;
            parts += span;
            capacity += span as u64 * part_size as u64;
            let (size, next) = scale_part(part_size, scale_at);
            part_size = size;
            scale_at = next;
            assert!(parts < i64::from(MAX_PARTS));
        }

        // Over two terabytes before the schedule flattens out.
        assert!(capacity > 2 << 40);
        assert!(part_size <= MAX_PART_SIZE);
    }
}
