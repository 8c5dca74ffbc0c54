//! Restore metadata repository; mirrors the backup repository.

use crate::error::{MetadataError, MetadataResult};
use crate::store::ControlDb;
use bson::{doc, Document, Timestamp};
use drover_core::{unix_now, Condition, RestoreMeta, RestoreReplset, Status, RESTORES_COLL};
use futures::TryStreamExt;
use mongodb::Collection;

impl ControlDb {
    fn restores(&self) -> Collection<RestoreMeta> {
        self.coll(RESTORES_COLL)
    }

    pub async fn set_restore_meta(&self, meta: &RestoreMeta) -> MetadataResult<()> {
        self.restores().insert_one(meta).await?;
        Ok(())
    }

    pub async fn get_restore_meta(&self, name: &str) -> MetadataResult<Option<RestoreMeta>> {
        Ok(self.restores().find_one(doc! { "name": name }).await?)
    }

    pub async fn list_restores(&self) -> MetadataResult<Vec<RestoreMeta>> {
        let cursor = self
            .restores()
            .find(doc! {})
            .sort(doc! { "start_ts": 1 })
            .await?;
        Ok(cursor.try_collect().await?)
    }

    pub async fn add_restore_rs_meta(
        &self,
        name: &str,
        rs: &RestoreReplset,
    ) -> MetadataResult<()> {
        let res = self
            .restores()
            .update_one(
                doc! { "name": name },
                doc! { "$push": { "replsets": bson::to_bson(rs)? } },
            )
            .await?;
        if res.matched_count == 0 {
            return Err(MetadataError::not_found("restore", name));
        }
        Ok(())
    }

    pub async fn change_restore_state(
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
            .restores()
            .update_one(
                doc! { "name": name },
                doc! {
                    "$set": set,
                    "$push": { "conditions": bson::to_bson(&condition)? },
                },
            )
            .await?;
        if res.matched_count == 0 {
            return Err(MetadataError::not_found("restore", name));
        }
        Ok(())
    }

    pub async fn change_restore_rs_state(
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
            .restores()
            .update_one(
                doc! { "name": name, "replsets.name": rs },
                doc! {
                    "$set": set,
                    "$push": { "replsets.$.conditions": bson::to_bson(&condition)? },
                },
            )
            .await?;
        if res.matched_count == 0 {
            return Err(MetadataError::not_found(
                "restore replset",
                format!("{name}/{rs}"),
            ));
        }
        Ok(())
    }

    pub async fn restore_hb(&self, name: &str, ts: Timestamp) -> MetadataResult<()> {
        let coll: Collection<Document> = self.coll(RESTORES_COLL);
        coll.update_one(doc! { "name": name }, doc! { "$set": { "hb": ts } })
            .await?;
        Ok(())
    }
}
