//! Operation lock repository.
//!
//! Acquisition is a single conditional upsert evaluated atomically by the
//! server, backed by the unique `(type, replset)` index:
//!
//! - no document for the pair: the upsert inserts one, success;
//! - a document with our `op_name`: the update refreshes it, success;
//! - a document with a stale heartbeat: the update replaces it, success;
//! - otherwise the upsert races the unique index and fails with a
//!   duplicate key, which maps to "held by someone else".

use crate::error::MetadataResult;
use crate::store::{is_dup_key, ControlDb};
use bson::{doc, Document, Timestamp};
use drover_core::{Lock, LockHeader, LOCK_COLL};
use mongodb::Collection;

impl ControlDb {
    fn locks(&self) -> Collection<Document> {
        self.coll(LOCK_COLL)
    }

    /// Try to take (or keep) the lock. Returns `false` when another live
    /// operation holds the `(kind, replset)` pair.
    pub async fn acquire_lock(&self, lock: &Lock, stale_frame_sec: u32) -> MetadataResult<bool> {
        // Everything at or before this cluster-time second is stale.
        let cutoff = Timestamp {
            time: lock.hb.time.saturating_sub(stale_frame_sec),
            increment: u32::MAX,
        };

        let filter = doc! {
            "type": bson::to_bson(&lock.header.kind)?,
            "replset": lock.header.replset.as_str(),
            "$or": [
                { "op_name": lock.header.op_name.as_str() },
                { "hb": { "$lte": cutoff } },
            ],
        };
        let update = doc! { "$set": bson::to_document(lock)? };

        match self.locks().update_one(filter, update).upsert(true).await {
            Ok(_) => Ok(true),
            Err(e) if is_dup_key(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Refresh the heartbeat of a lock we hold. The filter matches the
    /// holder's hostname as well as the operation, so an agent whose stale
    /// lock was taken over (even by a retry of the same operation) sees
    /// `false` and must abandon the operation.
    pub async fn refresh_lock(
        &self,
        header: &LockHeader,
        hostname: &str,
        hb: Timestamp,
    ) -> MetadataResult<bool> {
        let res = self
            .locks()
            .update_one(
                doc! {
                    "type": bson::to_bson(&header.kind)?,
                    "replset": header.replset.as_str(),
                    "op_name": header.op_name.as_str(),
                    "hostname": hostname,
                },
                doc! { "$set": { "hb": hb } },
            )
            .await?;
        Ok(res.matched_count > 0)
    }

    /// Read a lock record, if present.
    pub async fn get_lock_data(&self, header: &LockHeader) -> MetadataResult<Option<Lock>> {
        let found = self
            .locks()
            .find_one(doc! {
                "type": bson::to_bson(&header.kind)?,
                "replset": header.replset.as_str(),
                "op_name": header.op_name.as_str(),
            })
            .await?;
        match found {
            Some(doc) => Ok(Some(bson::from_document(doc)?)),
            None => Ok(None),
        }
    }

    /// Best-effort release; only removes the lock if we still own it.
    pub async fn release_lock(&self, header: &LockHeader, hostname: &str) -> MetadataResult<()> {
        self.locks()
            .delete_one(doc! {
                "type": bson::to_bson(&header.kind)?,
                "replset": header.replset.as_str(),
                "op_name": header.op_name.as_str(),
                "hostname": hostname,
            })
            .await?;
        Ok(())
    }
}
