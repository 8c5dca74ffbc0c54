//! Cluster configuration repository: a singleton document.

use crate::error::MetadataResult;
use crate::store::ControlDb;
use bson::{doc, Document};
use drover_core::{StoreConfig, CONFIG_COLL};
use mongodb::Collection;

impl ControlDb {
    fn config(&self) -> Collection<Document> {
        self.coll(CONFIG_COLL)
    }

    /// The current storage descriptor and default compression, if set.
    pub async fn get_store_config(&self) -> MetadataResult<Option<StoreConfig>> {
        match self.config().find_one(doc! {}).await? {
            Some(mut doc) => {
                doc.remove("_id");
                Ok(Some(bson::from_document(doc)?))
            }
            None => Ok(None),
        }
    }

    /// Replace the cluster configuration.
    pub async fn set_store_config(&self, cfg: &StoreConfig) -> MetadataResult<()> {
        let doc = bson::to_document(cfg)?;
        self.config()
            .replace_one(doc! {}, doc)
            .upsert(true)
            .await?;
        Ok(())
    }
}
