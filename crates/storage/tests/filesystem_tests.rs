//! Filesystem backend behavior tests.

use bytes::Bytes;
use drover_storage::{FilesystemStorage, Storage, StorageError};
use futures::StreamExt;

async fn collect(mut stream: drover_storage::ByteStream) -> Vec<u8> {
    let mut out = Vec::new();
    while let Some(chunk) = stream.next().await {
        out.extend_from_slice(&chunk.unwrap());
    }
    out
}

#[tokio::test]
async fn save_and_read_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let storage = FilesystemStorage::new(dir.path()).await.unwrap();

    let data = Bytes::from_static(b"dump payload");
    storage.save("b1_rs0.dump", data.clone()).await.unwrap();

    let read = collect(storage.source_reader("b1_rs0.dump").await.unwrap()).await;
    assert_eq!(read, data);

    let stat = storage.file_stat("b1_rs0.dump").await.unwrap();
    assert_eq!(stat.size, data.len() as u64);
}

#[tokio::test]
async fn streaming_upload_is_invisible_until_finished() {
    let dir = tempfile::tempdir().unwrap();
    let storage = FilesystemStorage::new(dir.path()).await.unwrap();

    let mut upload = storage.save_stream("b1_rs0.oplog").await.unwrap();
    upload.write(Bytes::from_static(b"op")).await.unwrap();
    upload.write(Bytes::from_static(b"log")).await.unwrap();

    // Not visible while in flight.
    assert!(matches!(
        storage.file_stat("b1_rs0.oplog").await,
        Err(StorageError::NotFound(_))
    ));

    let written = upload.finish().await.unwrap();
    assert_eq!(written, 5);
    assert_eq!(storage.file_stat("b1_rs0.oplog").await.unwrap().size, 5);
}

#[tokio::test]
async fn list_filters_by_prefix_and_skips_temp_files() {
    let dir = tempfile::tempdir().unwrap();
    let storage = FilesystemStorage::new(dir.path()).await.unwrap();

    storage.save("b1_rs0.dump", Bytes::from_static(b"a")).await.unwrap();
    storage.save("b1_rs0.oplog", Bytes::from_static(b"b")).await.unwrap();
    storage.save("b2_rs0.dump", Bytes::from_static(b"c")).await.unwrap();

    // An in-flight upload leaves a temp file behind; listings skip it.
    let mut upload = storage.save_stream("b1_rs1.dump").await.unwrap();
    upload.write(Bytes::from_static(b"partial")).await.unwrap();

    let mut names = Vec::new();
    let mut stream = storage.list("b1_").await.unwrap();
    while let Some(name) = stream.next().await {
        names.push(name.unwrap());
    }
    names.sort();

    assert_eq!(names, vec!["b1_rs0.dump", "b1_rs0.oplog"]);

    upload.abort().await.unwrap();
}

#[tokio::test]
async fn delete_then_stat_reports_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let storage = FilesystemStorage::new(dir.path()).await.unwrap();

    storage.save("b1.pbm.json", Bytes::from_static(b"{}")).await.unwrap();
    storage.delete("b1.pbm.json").await.unwrap();

    assert!(matches!(
        storage.file_stat("b1.pbm.json").await,
        Err(StorageError::NotFound(_))
    ));
    assert!(matches!(
        storage.delete("b1.pbm.json").await,
        Err(StorageError::NotFound(_))
    ));
}
