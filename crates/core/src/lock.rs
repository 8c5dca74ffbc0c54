//! Cluster-wide operation locks.
//!
//! A lock protects an `(operation kind, replica set)` pair from two
//! concurrent coordinators. At most one lock per pair is live at any time;
//! a lock is live while its heartbeat is inside the stale frame. A crashed
//! or partitioned holder stops refreshing and the lock becomes eligible
//! for takeover.

use bson::Timestamp;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of operation a lock protects.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockKind {
    Backup,
    Restore,
}

impl fmt::Display for LockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockKind::Backup => f.write_str("backup"),
            LockKind::Restore => f.write_str("restore"),
        }
    }
}

/// Identity of a lock: which operation, of which kind, on which replica set.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LockHeader {
    #[serde(rename = "type")]
    pub kind: LockKind,
    pub op_name: String,
    pub replset: String,
}

/// A lock record as stored in the lock collection.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Lock {
    #[serde(flatten)]
    pub header: LockHeader,
    /// Host that holds the lock, for diagnostics.
    pub hostname: String,
    /// Wall-clock seconds of the holder's cluster time, refreshed on the
    /// heartbeat cadence.
    pub hb: Timestamp,
}

impl Lock {
    /// Whether the heartbeat has fallen out of the stale frame at cluster
    /// time `now`.
    pub fn is_stale(&self, now: Timestamp, stale_frame_sec: u32) -> bool {
        self.hb.time.saturating_add(stale_frame_sec) <= now.time
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lock(hb_time: u32) -> Lock {
        Lock {
            header: LockHeader {
                kind: LockKind::Backup,
                op_name: "b1".to_string(),
                replset: "rs0".to_string(),
            },
            hostname: "node-1:27017".to_string(),
            hb: Timestamp { time: hb_time, increment: 1 },
        }
    }

    #[test]
    fn fresh_lock_is_live() {
        let now = Timestamp { time: 100, increment: 0 };
        assert!(!lock(95).is_stale(now, 30));
    }

    #[test]
    fn lock_goes_stale_exactly_at_frame_boundary() {
        let now = Timestamp { time: 100, increment: 0 };
        assert!(lock(70).is_stale(now, 30));
        assert!(!lock(71).is_stale(now, 30));
    }

    #[test]
    fn lock_serializes_with_flattened_header() {
        let doc = bson::to_document(&lock(10)).unwrap();
        assert_eq!(doc.get_str("type").unwrap(), "backup");
        assert_eq!(doc.get_str("op_name").unwrap(), "b1");
        assert_eq!(doc.get_str("replset").unwrap(), "rs0");
        let back: Lock = bson::from_document(doc).unwrap();
        assert_eq!(back.header.kind, LockKind::Backup);
    }
}
