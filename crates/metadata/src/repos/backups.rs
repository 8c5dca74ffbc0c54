//! Backup metadata repository.

use crate::error::{MetadataError, MetadataResult};
use crate::store::ControlDb;
use bson::{doc, Document, Timestamp};
use drover_core::{unix_now, BackupMeta, BackupReplset, Condition, Status, BACKUPS_COLL};
use futures::TryStreamExt;
use mongodb::Collection;

impl ControlDb {
    fn backups(&self) -> Collection<BackupMeta> {
        self.coll(BACKUPS_COLL)
    }

    /// Insert the cluster-scope backup document. Fails on duplicate names;
    /// the unique index keeps operation names unique for the lifetime of
    /// the metadata.
    pub async fn set_backup_meta(&self, meta: &BackupMeta) -> MetadataResult<()> {
        self.backups().insert_one(meta).await?;
        Ok(())
    }

    pub async fn get_backup_meta(&self, name: &str) -> MetadataResult<Option<BackupMeta>> {
        Ok(self.backups().find_one(doc! { "name": name }).await?)
    }

    /// All backups, oldest first.
    pub async fn list_backups(&self) -> MetadataResult<Vec<BackupMeta>> {
        let cursor = self
            .backups()
            .find(doc! {})
            .sort(doc! { "start_ts": 1 })
            .await?;
        Ok(cursor.try_collect().await?)
    }

    /// Append a replica set's entry to the backup document.
    pub async fn add_backup_rs_meta(
        &self,
        name: &str,
        rs: &BackupReplset,
    ) -> MetadataResult<()> {
        let res = self
            .backups()
            .update_one(
                doc! { "name": name },
                doc! { "$push": { "replsets": bson::to_bson(rs)? } },
            )
            .await?;
        if res.matched_count == 0 {
            return Err(MetadataError::not_found("backup", name));
        }
        Ok(())
    }

    /// Cluster-scope status transition, with the audit condition appended.
    pub async fn change_backup_state(
        &self,
        name: &str,
        status: Status,
        error: Option<&str>,
    ) -> MetadataResult<()> {
        let now = unix_now();
        let mut set = doc! {
            "status": bson::to_bson(&status)?,
            "last_transition_ts": now,
        };
        if let Some(error) = error {
            set.insert("error", error);
        }
        let condition = Condition::new(now, status, error.map(str::to_string));

        let res = self
            .backups()
            .update_one(
                doc! { "name": name },
                doc! {
                    "$set": set,
                    "$push": { "conditions": bson::to_bson(&condition)? },
                },
            )
            .await?;
        if res.matched_count == 0 {
            return Err(MetadataError::not_found("backup", name));
        }
        Ok(())
    }

    /// Replica-set-scope status transition; touches only this set's entry.
    pub async fn change_backup_rs_state(
        &self,
        name: &str,
        rs: &str,
        status: Status,
        error: Option<&str>,
    ) -> MetadataResult<()> {
        let now = unix_now();
        let mut set = doc! {
            "replsets.$.status": bson::to_bson(&status)?,
            "replsets.$.last_transition_ts": now,
        };
        if let Some(error) = error {
            set.insert("replsets.$.error", error);
        }
        let condition = Condition::new(now, status, error.map(str::to_string));

        let res = self
            .backups()
            .update_one(
                doc! { "name": name, "replsets.name": rs },
                doc! {
                    "$set": set,
                    "$push": { "replsets.$.conditions": bson::to_bson(&condition)? },
                },
            )
            .await?;
        if res.matched_count == 0 {
            return Err(MetadataError::not_found("backup replset", format!("{name}/{rs}")));
        }
        Ok(())
    }

    /// Remove a backup's metadata record.
    pub async fn delete_backup_meta(&self, name: &str) -> MetadataResult<()> {
        let res = self.backups().delete_one(doc! { "name": name }).await?;
        if res.deleted_count == 0 {
            return Err(MetadataError::not_found("backup", name));
        }
        Ok(())
    }

    /// Refresh the coordinator heartbeat.
    pub async fn backup_hb(&self, name: &str, ts: Timestamp) -> MetadataResult<()> {
        let coll: Collection<Document> = self.coll(BACKUPS_COLL);
        coll.update_one(doc! { "name": name }, doc! { "$set": { "hb": ts } })
            .await?;
        Ok(())
    }

    /// Record the lower bound of the oplog window for a replica set.
    pub async fn set_backup_rs_first_write(
        &self,
        name: &str,
        rs: &str,
        ts: Timestamp,
    ) -> MetadataResult<()> {
        self.set_backup_rs_field(name, rs, "first_write_ts", ts).await
    }

    /// Record the upper bound of the oplog window for a replica set.
    pub async fn set_backup_rs_last_write(
        &self,
        name: &str,
        rs: &str,
        ts: Timestamp,
    ) -> MetadataResult<()> {
        self.set_backup_rs_field(name, rs, "last_write_ts", ts).await
    }

    async fn set_backup_rs_field(
        &self,
        name: &str,
        rs: &str,
        field: &str,
        ts: Timestamp,
    ) -> MetadataResult<()> {
        let coll: Collection<Document> = self.coll(BACKUPS_COLL);
        let mut set = Document::new();
        set.insert(format!("replsets.$.{field}"), ts);
        let res = coll
            .update_one(
                doc! { "name": name, "replsets.name": rs },
                doc! { "$set": set },
            )
            .await?;
        if res.matched_count == 0 {
            return Err(MetadataError::not_found("backup replset", format!("{name}/{rs}")));
        }
        Ok(())
    }
}
