//! Streaming compression codecs.
//!
//! A codec is a pair of factories: an encoder wrapping an `AsyncWrite` and
//! a decoder wrapping an `AsyncRead`. The kind in use is recorded in the
//! backup metadata; restore reads the same field and never auto-detects.
//!
//! Snappy and s2 streams are recognized in metadata but no codec exists for
//! them here; opening one fails with `UnknownCompression` so callers can
//! refuse the operation before anything destructive happens.

use crate::error::{StorageError, StorageResult};
use async_compression::tokio::bufread::{GzipDecoder, Lz4Decoder, ZstdDecoder};
use async_compression::tokio::write::{GzipEncoder, Lz4Encoder, ZstdEncoder};
use drover_core::Compression;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};

/// Boxed writer used across pipeline stages.
pub type Writer = Box<dyn AsyncWrite + Send + Unpin>;

/// Boxed reader used across pipeline stages.
pub type Reader = Box<dyn AsyncRead + Send + Unpin>;

/// Whether a codec implementation exists for `kind`.
pub fn supported(kind: Compression) -> bool {
    !matches!(kind, Compression::Snappy | Compression::S2)
}

/// Wrap `w` in a compressing writer for `kind`.
///
/// The caller must `shutdown()` the returned writer to finalize the
/// compressed framing before dropping it.
pub fn encoder(kind: Compression, w: Writer) -> StorageResult<Writer> {
    match kind {
        Compression::None => Ok(w),
        // Parallel gzip shares the gzip wire format; parallelism is an
        // encoder-side concern only.
        Compression::Gzip | Compression::Pgzip => Ok(Box::new(GzipEncoder::new(w))),
        Compression::Lz4 => Ok(Box::new(Lz4Encoder::new(w))),
        Compression::Zstd => Ok(Box::new(ZstdEncoder::new(w))),
        other => Err(StorageError::UnknownCompression(other.to_string())),
    }
}

/// Wrap `r` in a decompressing reader for `kind`.
pub fn decoder(kind: Compression, r: Reader) -> StorageResult<Reader> {
    let buf = BufReader::new(r);
    match kind {
        Compression::None => Ok(Box::new(buf)),
        Compression::Gzip | Compression::Pgzip => Ok(Box::new(GzipDecoder::new(buf))),
        Compression::Lz4 => Ok(Box::new(Lz4Decoder::new(buf))),
        Compression::Zstd => Ok(Box::new(ZstdDecoder::new(buf))),
        other => Err(StorageError::UnknownCompression(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn encode(kind: Compression, payload: &[u8]) -> Vec<u8> {
        let (tx, mut rx) = tokio::io::duplex(4 * 1024 * 1024);
        let mut w = encoder(kind, Box::new(tx)).unwrap();
        w.write_all(payload).await.unwrap();
        w.shutdown().await.unwrap();
        drop(w);

        let mut encoded = Vec::new();
        rx.read_to_end(&mut encoded).await.unwrap();
        encoded
    }

    async fn round_trip(kind: Compression) {
        let payload: Vec<u8> = b"the quick brown fox jumps over the lazy dog"
            .iter()
            .cycle()
            .take(64 * 1024)
            .copied()
            .collect();

        let encoded = encode(kind, &payload).await;

        let source: Reader = Box::new(std::io::Cursor::new(encoded));
        let mut r = decoder(kind, source).unwrap();
        let mut decoded = Vec::new();
        r.read_to_end(&mut decoded).await.unwrap();
        assert_eq!(decoded, payload);
    }

    #[tokio::test]
    async fn gzip_round_trip() {
        round_trip(Compression::Gzip).await;
    }

    #[tokio::test]
    async fn zstd_round_trip() {
        round_trip(Compression::Zstd).await;
    }

    #[tokio::test]
    async fn lz4_round_trip() {
        round_trip(Compression::Lz4).await;
    }

    #[tokio::test]
    async fn none_is_pass_through() {
        round_trip(Compression::None).await;
    }

    #[tokio::test]
    async fn pgzip_output_decodes_as_gzip() {
        let encoded = encode(Compression::Pgzip, b"shared wire format").await;

        let source: Reader = Box::new(std::io::Cursor::new(encoded));
        let mut r = decoder(Compression::Gzip, source).unwrap();
        let mut decoded = Vec::new();
        r.read_to_end(&mut decoded).await.unwrap();
        assert_eq!(decoded, b"shared wire format");
    }

    #[test]
    fn snappy_and_s2_are_unknown() {
        assert!(!supported(Compression::Snappy));
        assert!(!supported(Compression::S2));

        let sink: Writer = Box::new(std::io::Cursor::new(Vec::new()));
        match encoder(Compression::Snappy, sink) {
            Err(StorageError::UnknownCompression(kind)) => assert_eq!(kind, "snappy"),
            other => {
                let other = other.map(|_| ());
                panic!("expected UnknownCompression, got {other:?}")
            }
        }

        let source: Reader = Box::new(std::io::Cursor::new(Vec::new()));
        match decoder(Compression::S2, source) {
            Err(StorageError::UnknownCompression(kind)) => assert_eq!(kind, "s2"),
            other => {
                let other = other.map(|_| ());
                panic!("expected UnknownCompression, got {other:?}")
            }
        }
    }
}
