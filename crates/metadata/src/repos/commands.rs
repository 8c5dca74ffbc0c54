//! Command stream: ingress for operator-issued requests.
//!
//! Commands live in a capped collection, so they are insertion-ordered and
//! bounded. Agents tail the collection with an awaitable cursor starting
//! after the greatest `_id` present at agent start, ignoring history.

use crate::error::{MetadataError, MetadataResult};
use crate::store::ControlDb;
use bson::oid::ObjectId;
use bson::{doc, Document};
use drover_core::{unix_now, Cmd, CMD_COLL};
use futures::StreamExt;
use mongodb::options::CursorType;
use mongodb::Collection;
use std::time::Duration;

/// How long to wait before re-opening a dead tailable cursor.
const REOPEN_DELAY: Duration = Duration::from_secs(1);

/// A command together with its stream position.
#[derive(Clone, Debug)]
pub struct CmdEnvelope {
    /// Command identity; also serves as the operation id.
    pub id: ObjectId,
    pub cmd: Cmd,
    pub created_ts: i64,
}

impl ControlDb {
    fn commands(&self) -> Collection<Document> {
        self.coll(CMD_COLL)
    }

    /// Publish a command to every agent. Returns the command id.
    pub async fn send_cmd(&self, cmd: &Cmd) -> MetadataResult<ObjectId> {
        let mut doc = bson::to_document(cmd)?;
        doc.insert("created_ts", unix_now());
        let res = self.commands().insert_one(doc).await?;
        res.inserted_id
            .as_object_id()
            .ok_or_else(|| MetadataError::Config("command id is not an ObjectId".to_string()))
    }

    /// Open the command stream positioned after the newest existing
    /// command.
    pub async fn cmd_stream(&self) -> MetadataResult<CmdStream> {
        let last = self
            .commands()
            .find_one(doc! {})
            .sort(doc! { "_id": -1 })
            .await?
            .and_then(|d| d.get_object_id("_id").ok());

        Ok(CmdStream {
            coll: self.coll_local(CMD_COLL),
            last,
        })
    }
}

/// Tailable consumer over the capped command collection.
pub struct CmdStream {
    coll: Collection<Document>,
    last: Option<ObjectId>,
}

impl CmdStream {
    /// Next command, in insertion order, waiting as long as it takes.
    ///
    /// Driver-level cursor death is transparent: the cursor is re-opened
    /// from the last observed `_id`. Unrecognized command documents are
    /// logged and skipped so an older agent survives newer commands.
    pub async fn next(&mut self) -> CmdEnvelope {
        loop {
            let filter = match self.last {
                Some(id) => doc! { "_id": { "$gt": id } },
                None => doc! {},
            };

            let cursor = self
                .coll
                .find(filter)
                .cursor_type(CursorType::TailableAwait)
                .max_await_time(Duration::from_secs(10))
                .await;

            let mut cursor = match cursor {
                Ok(cursor) => cursor,
                Err(e) => {
                    tracing::warn!(error = %e, "command cursor open failed");
                    tokio::time::sleep(REOPEN_DELAY).await;
                    continue;
                }
            };

            loop {
                match cursor.next().await {
                    Some(Ok(doc)) => {
                        let id = match doc.get_object_id("_id") {
                            Ok(id) => id,
                            Err(_) => continue,
                        };
                        self.last = Some(id);
                        let created_ts = doc.get_i64("created_ts").unwrap_or_default();

                        match bson::from_document::<Cmd>(doc) {
                            Ok(cmd) => return CmdEnvelope { id, cmd, created_ts },
                            Err(e) => {
                                tracing::warn!(id = %id, error = %e, "skipping unrecognized command");
                            }
                        }
                    }
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "command cursor failed, re-opening");
                        tokio::time::sleep(REOPEN_DELAY).await;
                        break;
                    }
                    // Tailable-await cursors only end when the cursor dies.
                    None => {
                        tokio::time::sleep(REOPEN_DELAY).await;
                        break;
                    }
                }
            }
        }
    }
}
