//! Agent event log, readable by operators through the CLI.

use crate::error::MetadataResult;
use crate::store::ControlDb;
use bson::doc;
use drover_core::{unix_now, LOG_COLL};
use futures::TryStreamExt;
use mongodb::Collection;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warn,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Info => f.write_str("info"),
            Severity::Warn => f.write_str("warn"),
            Severity::Error => f.write_str("error"),
        }
    }
}

/// One operational event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogEntry {
    pub ts: i64,
    pub severity: Severity,
    /// Short machine-readable event name, e.g. "backup.started".
    pub event: String,
    pub op_name: String,
    pub replset: String,
    pub msg: String,
}

impl LogEntry {
    pub fn new(
        severity: Severity,
        event: impl Into<String>,
        op_name: impl Into<String>,
        replset: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self {
            ts: unix_now(),
            severity,
            event: event.into(),
            op_name: op_name.into(),
            replset: replset.into(),
            msg: msg.into(),
        }
    }
}

impl ControlDb {
    fn log(&self) -> Collection<LogEntry> {
        // Log writes skip majority concern; losing one on failover is fine.
        self.coll_local(LOG_COLL)
    }

    pub async fn append_log(&self, entry: &LogEntry) -> MetadataResult<()> {
        self.log().insert_one(entry).await?;
        Ok(())
    }

    /// Most recent log entries, newest first.
    pub async fn recent_logs(&self, limit: i64) -> MetadataResult<Vec<LogEntry>> {
        let cursor = self
            .log()
            .find(doc! {})
            .sort(doc! { "ts": -1, "_id": -1 })
            .limit(limit)
            .await?;
        Ok(cursor.try_collect().await?)
    }
}
