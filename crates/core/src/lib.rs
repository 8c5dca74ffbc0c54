//! Core domain types shared across the drover workspace.
//!
//! This crate defines the canonical data model used by the agent, the CLI
//! and the metadata store:
//! - Operation status state machine and transition audit records
//! - Backup and restore metadata documents
//! - Operation locks
//! - Commands carried by the capped command collection
//! - Storage, compression and tunables configuration

pub mod command;
pub mod config;
pub mod error;
pub mod lock;
pub mod meta;
pub mod status;

pub use command::{BackupCmd, CancelCmd, Cmd, RestoreCmd};
pub use config::{AgentConfig, Compression, StorageConfig, StoreConfig, Tunables};
pub use error::{Error, Result};
pub use lock::{Lock, LockHeader, LockKind};
pub use meta::{BackupMeta, BackupReplset, Condition, RestoreMeta, RestoreReplset};
pub use status::Status;

use bson::Timestamp;

/// Name of the control database. All coordination state lives here, so it
/// participates in the same replication and majority-read guarantees as the
/// data it protects.
pub const CONTROL_DB: &str = "pbm";

/// Backup metadata collection.
pub const BACKUPS_COLL: &str = "pbmBackups";
/// Restore metadata collection.
pub const RESTORES_COLL: &str = "pbmRestores";
/// Operation lock collection.
pub const LOCK_COLL: &str = "pbmLock";
/// Capped command collection, the sole ingress for operator requests.
pub const CMD_COLL: &str = "pbmCmd";
/// Agent event log collection.
pub const LOG_COLL: &str = "pbmLog";
/// Singleton configuration collection.
pub const CONFIG_COLL: &str = "pbmConfig";

/// Size of the capped command collection in bytes.
pub const CMD_COLL_SIZE: u64 = 1 << 20;

/// Suffix of the JSON metadata object written next to the backup data.
pub const META_FILE_SUFFIX: &str = ".pbm.json";

/// Temporary collection the dump's `admin.system.users` is redirected into
/// until oplog replay has finished.
pub const TMP_USERS_COLL: &str = "pbmRUsers";
/// Temporary collection for `admin.system.roles`, see [`TMP_USERS_COLL`].
pub const TMP_ROLES_COLL: &str = "pbmRRoles";

/// Ordering for BSON timestamps. `bson::Timestamp` itself does not implement
/// `Ord`; cluster-time comparisons order by seconds first, increment second.
pub fn ts_cmp(a: Timestamp, b: Timestamp) -> std::cmp::Ordering {
    (a.time, a.increment).cmp(&(b.time, b.increment))
}

/// Validate an operator-supplied operation name.
///
/// Names become storage object names, so anything that could escape a
/// prefix or a directory is rejected up front.
pub fn validate_op_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidOpName("name is empty".to_string()));
    }
    if name.contains('/') || name.contains('\\') || name.contains("..") {
        return Err(Error::InvalidOpName(format!(
            "name must not contain path separators: {name}"
        )));
    }
    Ok(())
}

/// Current wall-clock time as unix seconds.
pub fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cmp::Ordering;

    #[test]
    fn ts_cmp_orders_by_seconds_then_increment() {
        let a = Timestamp { time: 10, increment: 5 };
        let b = Timestamp { time: 10, increment: 6 };
        let c = Timestamp { time: 11, increment: 0 };

        assert_eq!(ts_cmp(a, b), Ordering::Less);
        assert_eq!(ts_cmp(b, c), Ordering::Less);
        assert_eq!(ts_cmp(c, a), Ordering::Greater);
        assert_eq!(ts_cmp(a, a), Ordering::Equal);
    }

    #[test]
    fn op_names_reject_path_separators() {
        assert!(validate_op_name("2026-08-02T10:00:00Z").is_ok());
        assert!(validate_op_name("nightly-7").is_ok());
        assert!(validate_op_name("").is_err());
        assert!(validate_op_name("a/b").is_err());
        assert!(validate_op_name("a\\b").is_err());
        assert!(validate_op_name("..sneaky").is_err());
    }
}
