//! Oplog slicing and replay.
//!
//! The backup window is `[first_write_ts, last_write_ts]`: every operation
//! the dump could have partially captured falls inside it, so dump plus
//! slice equals the database state at the window's upper bound. Entries
//! are carried as raw bytes; only `ts`, `op` and `ns` are ever extracted.

use crate::dump::{ns_excluded, read_bson_doc};
use crate::error::{OpError, OpResult};
use bson::{doc, Document, RawDocumentBuf, Timestamp};
use drover_core::ts_cmp;
use futures::TryStreamExt;
use mongodb::options::CursorType;
use mongodb::{Client, Collection};
use std::cmp::Ordering;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

fn raw_ts(raw: &RawDocumentBuf) -> OpResult<Timestamp> {
    match raw.get("ts") {
        Ok(Some(bson::RawBsonRef::Timestamp(ts))) => Ok(ts),
        _ => Err(OpError::integrity("oplog entry without a ts field")),
    }
}

fn raw_op(raw: &RawDocumentBuf) -> &str {
    match raw.get("op") {
        Ok(Some(bson::RawBsonRef::String(op))) => op,
        _ => "",
    }
}

/// Write the oplog window `[start, end]` into `w`.
///
/// Tails the local oplog from `start` in cursor order. Noops are never
/// written, but their timestamps still count: the first entry of any kind
/// past `end` terminates the slice and is not written. A tail that ends
/// before crossing `end` means the window cannot be proven complete and
/// the backup is unusable.
pub async fn write_slice<W: AsyncWrite + Unpin>(
    client: &Client,
    w: &mut W,
    start: Timestamp,
    end: Timestamp,
) -> OpResult<u64> {
    let coll: Collection<RawDocumentBuf> = client.database("local").collection("oplog.rs");

    let mut cursor = coll
        .find(doc! { "ts": { "$gte": start } })
        .cursor_type(CursorType::Tailable)
        .await
        .map_err(|e| OpError::transient(format!("open oplog cursor: {e}")))?;

    let mut written = 0u64;
    while let Some(raw) = cursor
        .try_next()
        .await
        .map_err(|e| OpError::transient(format!("read oplog: {e}")))?
    {
        let ts = raw_ts(&raw)?;
        if ts_cmp(ts, end) == Ordering::Greater {
            // The terminator proves every operation up to `end` was seen.
            w.flush().await?;
            return Ok(written);
        }
        if raw_op(&raw) == "n" {
            continue;
        }

        let bytes = raw.as_bytes();
        w.write_all(bytes).await?;
        written += bytes.len() as u64;
    }

    Err(OpError::integrity("oplog window not covered"))
}

/// Replay a downloaded oplog slice against the node behind `client`.
///
/// Entries touching excluded namespaces are skipped. Collections were
/// recreated fresh by the dump phase, so UUIDs are not preserved.
pub async fn apply<R: AsyncRead + Unpin>(
    client: &Client,
    r: &mut R,
    exclude: &[String],
) -> OpResult<u64> {
    let admin = client.database("admin");
    let mut applied = 0u64;

    while let Some(bytes) = read_bson_doc(r).await? {
        let entry = Document::from_reader(&mut bytes.as_slice())
            .map_err(|e| OpError::integrity(format!("corrupt oplog entry: {e}")))?;

        if entry.get_str("op").unwrap_or("") == "n" {
            continue;
        }
        let ns = entry.get_str("ns").unwrap_or("");
        if ns.is_empty() || ns_excluded(ns, exclude) {
            continue;
        }

        let ns = ns.to_string();
        admin
            .run_command(doc! { "applyOps": [entry] })
            .await
            .map_err(|e| OpError::transient(format!("apply oplog entry on {ns}: {e}")))?;
        applied += 1;
    }

    Ok(applied)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(time: u32, inc: u32, op: &str, ns: &str) -> RawDocumentBuf {
        let doc = doc! {
            "ts": Timestamp { time, increment: inc },
            "op": op,
            "ns": ns,
            "o": { "msg": "x" },
        };
        RawDocumentBuf::from_bytes(bson::to_vec(&doc).unwrap()).unwrap()
    }

    #[test]
    fn extracts_ts_and_op_without_full_decode() {
        let raw = entry(7, 3, "i", "app.orders");
        let ts = raw_ts(&raw).unwrap();
        assert_eq!((ts.time, ts.increment), (7, 3));
        assert_eq!(raw_op(&raw), "i");
    }

    #[test]
    fn entry_without_ts_is_rejected() {
        let raw = RawDocumentBuf::from_bytes(bson::to_vec(&doc! { "op": "i" }).unwrap()).unwrap();
        assert!(matches!(raw_ts(&raw), Err(OpError::Integrity(_))));
    }

    #[tokio::test]
    async fn apply_skips_noops_and_excluded_namespaces() {
        // Exercise the stream-parsing half of apply with no server: every
        // entry in this slice is skippable, so apply returns without ever
        // issuing a command.
        let exclude = vec!["pbm.*".to_string(), "config.version".to_string()];

        let mut slice = Vec::new();
        slice.extend_from_slice(entry(1, 0, "n", "").as_bytes());
        slice.extend_from_slice(entry(2, 0, "i", "pbm.pbmBackups").as_bytes());
        slice.extend_from_slice(entry(3, 0, "u", "config.version").as_bytes());

        let client = mongodb::Client::with_options(
            mongodb::options::ClientOptions::builder()
                .hosts(vec![mongodb::options::ServerAddress::Tcp {
                    host: "localhost".to_string(),
                    port: Some(27017),
                }])
                .build(),
        )
        .unwrap();

        let mut r = std::io::Cursor::new(slice);
        let applied = apply(&client, &mut r, &exclude).await.unwrap();
        assert_eq!(applied, 0);
    }
}
