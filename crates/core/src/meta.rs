//! Backup and restore metadata documents.
//!
//! One document per operation, keyed by the operator-supplied name. The
//! cluster-scope fields (`status`, `error`, `hb`) are written by the
//! coordinating replica set only; each participating replica set mutates
//! its own entry in `replsets`.

use crate::config::{Compression, StorageConfig};
use crate::status::Status;
use crate::META_FILE_SUFFIX;
use bson::Timestamp;
use serde::{Deserialize, Serialize};

/// Append-only audit record of a status transition.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    /// Unix seconds of the transition.
    pub ts: i64,
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Condition {
    pub fn new(ts: i64, status: Status, error: Option<String>) -> Self {
        Self { ts, status, error }
    }
}

/// Cluster-scope backup metadata.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BackupMeta {
    /// Operator-supplied unique backup name.
    pub name: String,
    /// Identity of the command that started the operation.
    pub opid: String,
    pub compression: Compression,
    /// Snapshot of the storage descriptor at the moment the backup began.
    /// Restores read objects through this snapshot, not the live config.
    pub store: StorageConfig,
    /// Replica-set name of the cluster coordinator.
    pub leader: String,
    /// Unix seconds the operation started.
    pub start_ts: i64,
    /// Coordinator heartbeat, in cluster time. Waiters treat the operation
    /// as stuck once this falls behind by more than the stale frame.
    pub hb: Timestamp,
    pub last_transition_ts: i64,
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub replsets: Vec<BackupReplset>,
}

impl BackupMeta {
    /// Find the entry for a replica set, if it has joined the operation.
    pub fn replset(&self, name: &str) -> Option<&BackupReplset> {
        self.replsets.iter().find(|rs| rs.name == name)
    }
}

/// Per-replica-set backup progress.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BackupReplset {
    pub name: String,
    /// Object name of the dump stream in storage.
    pub dump_name: String,
    /// Object name of the oplog slice in storage.
    pub oplog_name: String,
    pub start_ts: i64,
    /// Cluster time at dump start; lower bound of the oplog window.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_write_ts: Option<Timestamp>,
    /// Majority op-time at dump end; upper bound of the oplog window.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_write_ts: Option<Timestamp>,
    pub last_transition_ts: i64,
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl BackupReplset {
    /// Fresh per-replica-set entry with object names derived from the
    /// backup name and compression kind.
    pub fn new(backup: &str, rs: &str, compression: Compression, now: i64) -> Self {
        Self {
            name: rs.to_string(),
            dump_name: dump_object_name(backup, rs, compression),
            oplog_name: oplog_object_name(backup, rs, compression),
            start_ts: now,
            first_write_ts: None,
            last_write_ts: None,
            last_transition_ts: now,
            status: Status::Running,
            error: None,
            conditions: vec![Condition::new(now, Status::Running, None)],
        }
    }
}

/// Cluster-scope restore metadata; mirrors [`BackupMeta`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RestoreMeta {
    /// Operator-supplied unique restore name.
    pub name: String,
    /// Name of the backup being restored.
    pub backup: String,
    pub opid: String,
    pub leader: String,
    pub start_ts: i64,
    pub hb: Timestamp,
    pub last_transition_ts: i64,
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub replsets: Vec<RestoreReplset>,
}

impl RestoreMeta {
    pub fn replset(&self, name: &str) -> Option<&RestoreReplset> {
        self.replsets.iter().find(|rs| rs.name == name)
    }
}

/// Per-replica-set restore progress.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RestoreReplset {
    pub name: String,
    pub start_ts: i64,
    pub last_transition_ts: i64,
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl RestoreReplset {
    pub fn new(rs: &str, now: i64) -> Self {
        Self {
            name: rs.to_string(),
            start_ts: now,
            last_transition_ts: now,
            status: Status::Running,
            error: None,
            conditions: vec![Condition::new(now, Status::Running, None)],
        }
    }
}

/// Storage object name of a replica set's dump stream.
pub fn dump_object_name(backup: &str, rs: &str, compression: Compression) -> String {
    format!("{backup}_{rs}.dump{}", compression.suffix())
}

/// Storage object name of a replica set's oplog slice.
pub fn oplog_object_name(backup: &str, rs: &str, compression: Compression) -> String {
    format!("{backup}_{rs}.oplog{}", compression.suffix())
}

/// Storage object name of the JSON metadata copy written at Done time.
pub fn meta_object_name(backup: &str) -> String {
    format!("{backup}{META_FILE_SUFFIX}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_names_carry_codec_suffix() {
        assert_eq!(
            dump_object_name("2026-08-02T10:00:00Z", "rs0", Compression::Gzip),
            "2026-08-02T10:00:00Z_rs0.dump.gz"
        );
        assert_eq!(
            oplog_object_name("b1", "shard2", Compression::None),
            "b1_shard2.oplog"
        );
        assert_eq!(meta_object_name("b1"), "b1.pbm.json");
    }

    #[test]
    fn backup_meta_round_trips_through_json() {
        let meta = BackupMeta {
            name: "b1".to_string(),
            opid: "665f1f77bcf86cd799439011".to_string(),
            compression: Compression::Zstd,
            store: StorageConfig::Filesystem {
                path: "/var/backups".into(),
            },
            leader: "rs0".to_string(),
            start_ts: 1_754_000_000,
            hb: Timestamp { time: 1_754_000_000, increment: 3 },
            last_transition_ts: 1_754_000_010,
            status: Status::Done,
            error: None,
            conditions: vec![Condition::new(1_754_000_000, Status::Starting, None)],
            replsets: vec![BackupReplset::new("b1", "rs0", Compression::Zstd, 1_754_000_001)],
        };

        let json = serde_json::to_string(&meta).unwrap();
        let back: BackupMeta = serde_json::from_str(&json).unwrap();
        assert_eq!(back.name, "b1");
        assert_eq!(back.status, Status::Done);
        assert_eq!(back.hb.increment, 3);
        assert_eq!(back.replsets[0].dump_name, "b1_rs0.dump.zst");
        assert!(back.replset("rs0").is_some());
        assert!(back.replset("rs1").is_none());
    }
}
