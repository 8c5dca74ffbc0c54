//! Control-database handle.
//!
//! `ControlDb` wraps the cluster connection and exposes typed operations
//! over the control collections. The operation groups live in `repos/` as
//! separate impl blocks. All status-bearing collections are opened with
//! majority write and read concern so agents on different replica sets
//! observe each other's transitions consistently.

use crate::error::{MetadataError, MetadataResult};
use bson::{doc, Document, Timestamp};
use drover_core::{
    BACKUPS_COLL, CMD_COLL, CMD_COLL_SIZE, CONTROL_DB, LOCK_COLL, RESTORES_COLL,
};
use mongodb::options::{ClientOptions, CollectionOptions, ReadConcern, WriteConcern};
use mongodb::{Client, Collection, Database, IndexModel};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// A shard of the cluster, read from `config.shards`.
#[derive(Clone, Debug, Deserialize)]
pub struct Shard {
    #[serde(rename = "_id")]
    pub id: String,
    pub host: String,
}

/// Handle over the control database on the cluster connection.
#[derive(Clone)]
pub struct ControlDb {
    client: Client,
    db: Database,
}

impl ControlDb {
    /// Connect to the cluster through the given URI.
    pub async fn connect(uri: &str) -> MetadataResult<Self> {
        let mut opts = ClientOptions::parse(uri).await?;
        opts.app_name = Some("drover".to_string());
        let client = Client::with_options(opts)?;
        let db = client.database(CONTROL_DB);
        Ok(Self { client, db })
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// A control collection with majority write and read concern.
    pub(crate) fn coll<T>(&self, name: &str) -> Collection<T>
    where
        T: Serialize + DeserializeOwned + Send + Sync,
    {
        self.db.collection_with_options(
            name,
            CollectionOptions::builder()
                .write_concern(WriteConcern::majority())
                .read_concern(ReadConcern::majority())
                .build(),
        )
    }

    /// A control collection with default concerns, for log writes.
    pub(crate) fn coll_local<T>(&self, name: &str) -> Collection<T>
    where
        T: Serialize + DeserializeOwned + Send + Sync,
    {
        self.db.collection(name)
    }

    /// Create the capped command collection and the unique indexes, once
    /// per deployment. Safe to call on every agent start.
    pub async fn ensure_setup(&self) -> MetadataResult<()> {
        let existing = self.db.list_collection_names().await?;
        if !existing.iter().any(|c| c == CMD_COLL) {
            match self
                .db
                .create_collection(CMD_COLL)
                .capped(true)
                .size(CMD_COLL_SIZE)
                .await
            {
                Ok(()) => {}
                // Two agents racing the creation is expected.
                Err(e) if command_code(&e) == Some(48) => {}
                Err(e) => return Err(e.into()),
            }
        }

        let backups: Collection<Document> = self.db.collection(BACKUPS_COLL);
        backups
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "name": 1 })
                    .options(
                        mongodb::options::IndexOptions::builder()
                            .unique(true)
                            .build(),
                    )
                    .build(),
            )
            .await?;

        let restores: Collection<Document> = self.db.collection(RESTORES_COLL);
        restores
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "name": 1 })
                    .options(
                        mongodb::options::IndexOptions::builder()
                            .unique(true)
                            .build(),
                    )
                    .build(),
            )
            .await?;

        // One live lock per (kind, replica set); acquisition relies on this
        // index turning races into duplicate-key errors.
        let locks: Collection<Document> = self.db.collection(LOCK_COLL);
        locks
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "type": 1, "replset": 1 })
                    .options(
                        mongodb::options::IndexOptions::builder()
                            .unique(true)
                            .build(),
                    )
                    .build(),
            )
            .await?;

        Ok(())
    }

    /// Current cluster time.
    ///
    /// Read from the `$clusterTime` gossip on a cheap command. Standalone
    /// nodes have no cluster clock; wall-clock seconds stand in so lock
    /// heartbeats still advance.
    pub async fn cluster_time(&self) -> MetadataResult<Timestamp> {
        let res = self
            .client
            .database("admin")
            .run_command(doc! { "isMaster": 1 })
            .await?;
        Ok(extract_cluster_time(&res).unwrap_or(Timestamp {
            time: drover_core::unix_now() as u32,
            increment: 0,
        }))
    }

    /// Shards of the cluster; empty when the deployment is not sharded.
    pub async fn get_shards(&self) -> MetadataResult<Vec<Shard>> {
        use futures::TryStreamExt;
        let coll: Collection<Shard> = self.client.database("config").collection("shards");
        let shards: Vec<Shard> = coll.find(doc! {}).await?.try_collect().await?;
        Ok(shards)
    }
}

/// Pull the cluster time out of a command reply.
pub(crate) fn extract_cluster_time(res: &Document) -> Option<Timestamp> {
    if let Ok(ct) = res.get_document("$clusterTime") {
        if let Ok(ts) = ct.get_timestamp("clusterTime") {
            return Some(ts);
        }
    }
    res.get_timestamp("operationTime").ok()
}

/// Server error code of a command error, if that is what `e` is.
pub(crate) fn command_code(e: &mongodb::error::Error) -> Option<i32> {
    match *e.kind {
        mongodb::error::ErrorKind::Command(ref ce) => Some(ce.code),
        _ => None,
    }
}

/// Whether `e` is a duplicate-key write failure.
pub(crate) fn is_dup_key(e: &mongodb::error::Error) -> bool {
    match *e.kind {
        mongodb::error::ErrorKind::Write(mongodb::error::WriteFailure::WriteError(ref we)) => {
            we.code == 11000
        }
        mongodb::error::ErrorKind::Command(ref ce) => ce.code == 11000,
        _ => false,
    }
}

impl MetadataError {
    /// Not-found constructor used across repos.
    pub(crate) fn not_found(what: &'static str, name: impl Into<String>) -> Self {
        MetadataError::NotFound(what, name.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cluster_time_prefers_gossip() {
        let res = doc! {
            "ok": 1.0,
            "operationTime": Timestamp { time: 5, increment: 1 },
            "$clusterTime": {
                "clusterTime": Timestamp { time: 9, increment: 2 },
            },
        };
        let ts = extract_cluster_time(&res).unwrap();
        assert_eq!(ts.time, 9);
        assert_eq!(ts.increment, 2);
    }

    #[test]
    fn cluster_time_falls_back_to_operation_time() {
        let res = doc! {
            "ok": 1.0,
            "operationTime": Timestamp { time: 5, increment: 1 },
        };
        let ts = extract_cluster_time(&res).unwrap();
        assert_eq!(ts.time, 5);
    }

    #[test]
    fn cluster_time_absent_on_standalone() {
        let res = doc! { "ok": 1.0, "ismaster": true };
        assert!(extract_cluster_time(&res).is_none());
    }
}
