//! Streaming dump archive.
//!
//! The dump of a replica set is a single continuous byte stream: repeated
//! `[tag][bson document]` records, where tag 0x01 opens a collection
//! section (namespace header with creation options and index specs) and
//! tag 0x02 is one raw document of the current section. BSON documents are
//! length-prefixed, so records are self-delimiting. The storage layer
//! treats the stream as opaque bytes.

use crate::error::{OpError, OpResult};
use bson::{doc, Document, RawDocumentBuf};
use drover_core::CONTROL_DB;
use futures::TryStreamExt;
use mongodb::options::WriteConcern;
use mongodb::{Client, Collection};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Opens a collection section.
const NS_TAG: u8 = 0x01;
/// One document of the current section.
const DOC_TAG: u8 = 0x02;

/// Upper bound on a single archive record. BSON caps user documents at
/// 16 MiB; internal documents get some slack.
const MAX_DOC_SIZE: i32 = 48 * 1024 * 1024;

/// Documents per insert batch on the apply side.
const APPLY_BATCH_DOCS: usize = 500;
/// Bytes per insert batch on the apply side.
const APPLY_BATCH_BYTES: usize = 8 * 1024 * 1024;

/// Section header: where the following documents belong and how to
/// recreate their collection.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NsHeader {
    pub db: String,
    pub coll: String,
    #[serde(default)]
    pub options: Document,
    #[serde(default)]
    pub indexes: Vec<Document>,
}

/// Whether a collection belongs in the dump.
///
/// Everything user-visible is dumped. System collections are skipped
/// except `admin.system.users` and `admin.system.roles`, which restore
/// needs for the user/role splice.
pub(crate) fn should_dump(db: &str, coll: &str) -> bool {
    if coll.starts_with("system.") {
        return db == "admin" && (coll == "system.users" || coll == "system.roles");
    }
    true
}

/// Whether a namespace matches the exclusion list. Entries ending in `*`
/// are prefix patterns, everything else matches exactly.
pub(crate) fn ns_excluded(ns: &str, patterns: &[String]) -> bool {
    patterns.iter().any(|p| match p.strip_suffix('*') {
        Some(prefix) => ns.starts_with(prefix),
        None => ns == p,
    })
}

/// Map a source namespace through the rename table.
pub(crate) fn resolve_rename<'a>(ns: &'a str, renames: &'a [(String, String)]) -> &'a str {
    renames
        .iter()
        .find(|(from, _)| from == ns)
        .map(|(_, to)| to.as_str())
        .unwrap_or(ns)
}

async fn write_record<W: AsyncWrite + Unpin>(
    w: &mut W,
    tag: u8,
    doc: &[u8],
) -> OpResult<u64> {
    w.write_u8(tag).await?;
    w.write_all(doc).await?;
    Ok(1 + doc.len() as u64)
}

/// Read one length-prefixed BSON document. `None` on clean end of stream.
pub(crate) async fn read_bson_doc<R: AsyncRead + Unpin>(r: &mut R) -> OpResult<Option<Vec<u8>>> {
    let first = match r.read_u8().await {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let mut len_bytes = [first, 0, 0, 0];
    r.read_exact(&mut len_bytes[1..])
        .await
        .map_err(|e| OpError::integrity(format!("truncated document header: {e}")))?;
    let len = i32::from_le_bytes(len_bytes);
    if !(5..=MAX_DOC_SIZE).contains(&len) {
        return Err(OpError::integrity(format!("corrupt document length: {len}")));
    }

    let mut buf = vec![0u8; len as usize];
    buf[..4].copy_from_slice(&len_bytes);
    r.read_exact(&mut buf[4..])
        .await
        .map_err(|e| OpError::integrity(format!("truncated document body: {e}")))?;
    Ok(Some(buf))
}

/// Read one archive record. `None` on clean end of stream.
async fn read_record<R: AsyncRead + Unpin>(r: &mut R) -> OpResult<Option<(u8, Vec<u8>)>> {
    let tag = match r.read_u8().await {
        Ok(tag) => tag,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    match read_bson_doc(r).await? {
        Some(doc) => Ok(Some((tag, doc))),
        None => Err(OpError::integrity("archive ends inside a record")),
    }
}

fn command_error_code(e: &mongodb::error::Error) -> Option<i32> {
    match *e.kind {
        mongodb::error::ErrorKind::Command(ref ce) => Some(ce.code),
        _ => None,
    }
}

/// Stream a dump of every user database into `w`.
///
/// Walks every database except `local` and the control database; for each
/// surviving collection writes a namespace header (creation options and
/// index specs) followed by its raw documents in natural order.
pub async fn write_archive<W: AsyncWrite + Unpin>(client: &Client, w: &mut W) -> OpResult<u64> {
    let mut written = 0u64;

    let mut db_names = client
        .list_database_names()
        .await
        .map_err(|e| OpError::transient(format!("list databases: {e}")))?;
    db_names.sort();

    for db_name in db_names {
        if db_name == "local" || db_name == CONTROL_DB {
            continue;
        }
        let db = client.database(&db_name);

        let mut specs = db
            .run_cursor_command(doc! { "listCollections": 1 })
            .await
            .map_err(|e| OpError::transient(format!("list collections of {db_name}: {e}")))?;

        while let Some(spec) = specs
            .try_next()
            .await
            .map_err(|e| OpError::transient(format!("collection listing of {db_name}: {e}")))?
        {
            let coll_name = spec.get_str("name").unwrap_or_default().to_string();
            let coll_type = spec.get_str("type").unwrap_or("collection");
            if coll_type != "collection" || !should_dump(&db_name, &coll_name) {
                continue;
            }
            let options = spec
                .get_document("options")
                .cloned()
                .unwrap_or_default();

            let indexes = list_index_specs(&db, &coll_name).await?;
            let header = NsHeader {
                db: db_name.clone(),
                coll: coll_name.clone(),
                options,
                indexes,
            };
            let header_bytes = bson::to_vec(&header)
                .map_err(|e| OpError::integrity(format!("encode namespace header: {e}")))?;
            written += write_record(w, NS_TAG, &header_bytes).await?;

            let coll: Collection<RawDocumentBuf> = db.collection(&coll_name);
            let mut cursor = coll
                .find(doc! {})
                .await
                .map_err(|e| OpError::transient(format!("open cursor on {db_name}.{coll_name}: {e}")))?;
            while let Some(raw) = cursor
                .try_next()
                .await
                .map_err(|e| OpError::transient(format!("read {db_name}.{coll_name}: {e}")))?
            {
                written += write_record(w, DOC_TAG, raw.as_bytes()).await?;
            }
        }
    }

    w.flush().await?;
    Ok(written)
}

async fn list_index_specs(db: &mongodb::Database, coll: &str) -> OpResult<Vec<Document>> {
    let mut cursor = db
        .run_cursor_command(doc! { "listIndexes": coll })
        .await
        .map_err(|e| OpError::transient(format!("list indexes of {coll}: {e}")))?;

    let mut specs = Vec::new();
    while let Some(mut spec) = cursor
        .try_next()
        .await
        .map_err(|e| OpError::transient(format!("index listing of {coll}: {e}")))?
    {
        // The default _id index is recreated implicitly; the ns field is
        // rejected by modern createIndexes.
        if spec.get_str("name") == Ok("_id_") {
            continue;
        }
        spec.remove("ns");
        specs.push(spec);
    }
    Ok(specs)
}

/// Knobs for applying an archive.
#[derive(Clone, Debug, Default)]
pub struct ApplyOptions {
    /// Namespaces that are never touched.
    pub exclude: Vec<String>,
    /// Source namespace -> target namespace redirections.
    pub renames: Vec<(String, String)>,
}

/// Counters from an archive apply.
#[derive(Clone, Copy, Debug, Default)]
pub struct ApplyStats {
    pub collections: u64,
    pub documents: u64,
}

/// Apply an archive to the node behind `client`.
///
/// Each included collection is dropped, recreated with its recorded
/// options, bulk-loaded with validation bypassed, then its indexes are
/// rebuilt. Any insert error stops the apply.
pub async fn apply_archive<R: AsyncRead + Unpin>(
    client: &Client,
    r: &mut R,
    opts: &ApplyOptions,
) -> OpResult<ApplyStats> {
    let mut stats = ApplyStats::default();
    let mut section: Option<Section> = None;

    loop {
        match read_record(r).await? {
            None => break,
            Some((NS_TAG, bytes)) => {
                if let Some(section) = section.take() {
                    section.finish(client).await?;
                }

                let header: NsHeader = bson::from_slice(&bytes)
                    .map_err(|e| OpError::integrity(format!("corrupt namespace header: {e}")))?;
                let src_ns = format!("{}.{}", header.db, header.coll);
                if ns_excluded(&src_ns, &opts.exclude) {
                    continue;
                }

                let target = resolve_rename(&src_ns, &opts.renames).to_string();
                let (db, coll) = target
                    .split_once('.')
                    .ok_or_else(|| OpError::integrity(format!("bad namespace: {target}")))?;

                prepare_collection(client, db, coll, &header.options).await?;
                stats.collections += 1;
                section = Some(Section {
                    db: db.to_string(),
                    coll: coll.to_string(),
                    indexes: header.indexes,
                    batch: Vec::new(),
                    batch_bytes: 0,
                });
            }
            Some((DOC_TAG, bytes)) => {
                // Documents of an excluded section land here with no open
                // section and are skipped.
                if let Some(section) = &mut section {
                    section.push(bytes)?;
                    if section.batch.len() >= APPLY_BATCH_DOCS
                        || section.batch_bytes >= APPLY_BATCH_BYTES
                    {
                        stats.documents += section.flush(client).await?;
                    }
                }
            }
            Some((tag, _)) => {
                return Err(OpError::integrity(format!("corrupt archive: unknown tag {tag}")));
            }
        }
    }

    if let Some(mut section) = section.take() {
        stats.documents += section.flush(client).await?;
        section.finish(client).await?;
    }
    Ok(stats)
}

/// Drop the target collection and recreate it with the recorded options.
async fn prepare_collection(
    client: &Client,
    db: &str,
    coll: &str,
    options: &Document,
) -> OpResult<()> {
    let database = client.database(db);
    let target: Collection<Document> = database.collection(coll);
    if let Err(e) = target.drop().await {
        // NamespaceNotFound: nothing to drop.
        if command_error_code(&e) != Some(26) {
            return Err(OpError::transient(format!("drop {db}.{coll}: {e}")));
        }
    }

    let mut cmd = doc! { "create": coll };
    for (k, v) in options {
        if k != "uuid" {
            cmd.insert(k, v.clone());
        }
    }
    if let Err(e) = database.run_command(cmd).await {
        // NamespaceExists: a concurrent writer recreated it; inserts win.
        if command_error_code(&e) != Some(48) {
            return Err(OpError::transient(format!("create {db}.{coll}: {e}")));
        }
    }
    Ok(())
}

/// A collection section being applied.
struct Section {
    db: String,
    coll: String,
    indexes: Vec<Document>,
    batch: Vec<RawDocumentBuf>,
    batch_bytes: usize,
}

impl Section {
    fn push(&mut self, bytes: Vec<u8>) -> OpResult<()> {
        self.batch_bytes += bytes.len();
        let raw = RawDocumentBuf::from_bytes(bytes)
            .map_err(|e| OpError::integrity(format!("corrupt document in archive: {e}")))?;
        self.batch.push(raw);
        Ok(())
    }

    async fn flush(&mut self, client: &Client) -> OpResult<u64> {
        if self.batch.is_empty() {
            return Ok(0);
        }
        let docs = std::mem::take(&mut self.batch);
        let count = docs.len() as u64;
        self.batch_bytes = 0;

        let coll: Collection<RawDocumentBuf> = client
            .database(&self.db)
            .collection_with_options(
                &self.coll,
                mongodb::options::CollectionOptions::builder()
                    .write_concern(WriteConcern::majority())
                    .build(),
            );
        coll.insert_many(docs)
            .bypass_document_validation(true)
            .await
            .map_err(|e| {
                OpError::transient(format!("insert into {}.{}: {e}", self.db, self.coll))
            })?;
        Ok(count)
    }

    /// Flush stragglers and rebuild the section's indexes.
    async fn finish(mut self, client: &Client) -> OpResult<()> {
        self.flush(client).await?;

        if self.indexes.is_empty() {
            return Ok(());
        }
        client
            .database(&self.db)
            .run_command(doc! {
                "createIndexes": self.coll.as_str(),
                "indexes": self.indexes.clone(),
            })
            .await
            .map_err(|e| {
                OpError::transient(format!("create indexes on {}.{}: {e}", self.db, self.coll))
            })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    use crate::restore::restore_exclusions;

    #[test]
    fn system_collections_are_skipped_except_users_and_roles() {
        assert!(should_dump("app", "orders"));
        assert!(should_dump("admin", "system.users"));
        assert!(should_dump("admin", "system.roles"));
        assert!(!should_dump("admin", "system.version"));
        assert!(!should_dump("app", "system.profile"));
        assert!(!should_dump("config", "system.sessions"));
    }

    #[test]
    fn exclusion_patterns_match_prefix_and_exact() {
        let patterns = restore_exclusions();
        assert!(ns_excluded("pbm.pbmBackups", &patterns));
        assert!(ns_excluded("pbm.anything", &patterns));
        assert!(ns_excluded("config.version", &patterns));
        assert!(ns_excluded("config.cache.chunks", &patterns));
        assert!(!ns_excluded("config.databases", &patterns));
        assert!(!ns_excluded("app.orders", &patterns));
    }

    #[test]
    fn renames_redirect_users_and_roles() {
        let renames = vec![
            ("admin.system.users".to_string(), "pbm.pbmRUsers".to_string()),
            ("admin.system.roles".to_string(), "pbm.pbmRRoles".to_string()),
        ];
        assert_eq!(resolve_rename("admin.system.users", &renames), "pbm.pbmRUsers");
        assert_eq!(resolve_rename("admin.system.roles", &renames), "pbm.pbmRRoles");
        assert_eq!(resolve_rename("app.orders", &renames), "app.orders");
    }

    #[tokio::test]
    async fn records_round_trip_through_framing() {
        let header = NsHeader {
            db: "app".to_string(),
            coll: "orders".to_string(),
            options: doc! {},
            indexes: vec![doc! { "key": { "qty": 1 }, "name": "qty_1", "v": 2 }],
        };
        let doc1 = bson::to_vec(&doc! { "_id": 1, "qty": 5 }).unwrap();
        let doc2 = bson::to_vec(&doc! { "_id": 2, "qty": 7 }).unwrap();

        let mut buf = Cursor::new(Vec::new());
        write_record(&mut buf, NS_TAG, &bson::to_vec(&header).unwrap())
            .await
            .unwrap();
        write_record(&mut buf, DOC_TAG, &doc1).await.unwrap();
        write_record(&mut buf, DOC_TAG, &doc2).await.unwrap();

        let mut r = Cursor::new(buf.into_inner());
        let (tag, bytes) = read_record(&mut r).await.unwrap().unwrap();
        assert_eq!(tag, NS_TAG);
        let back: NsHeader = bson::from_slice(&bytes).unwrap();
        assert_eq!(back.db, "app");
        assert_eq!(back.indexes.len(), 1);

        let (tag, bytes) = read_record(&mut r).await.unwrap().unwrap();
        assert_eq!(tag, DOC_TAG);
        assert_eq!(bytes, doc1);

        let (tag, _) = read_record(&mut r).await.unwrap().unwrap();
        assert_eq!(tag, DOC_TAG);

        assert!(read_record(&mut r).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn truncated_record_is_an_integrity_error() {
        let doc = bson::to_vec(&doc! { "_id": 1, "payload": "x".repeat(64) }).unwrap();
        let mut buf = Cursor::new(Vec::new());
        write_record(&mut buf, DOC_TAG, &doc).await.unwrap();
        let mut bytes = buf.into_inner();
        bytes.truncate(bytes.len() - 10);

        let mut r = Cursor::new(bytes);
        match read_record(&mut r).await {
            Err(OpError::Integrity(msg)) => assert!(msg.contains("truncated")),
            other => panic!("expected Integrity, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn garbage_length_is_an_integrity_error() {
        let mut buf = vec![DOC_TAG];
        buf.extend_from_slice(&(-5i32).to_le_bytes());

        let mut r = Cursor::new(buf);
        match read_record(&mut r).await {
            Err(OpError::Integrity(msg)) => assert!(msg.contains("corrupt document length")),
            other => panic!("expected Integrity, got {other:?}"),
        }
    }
}
