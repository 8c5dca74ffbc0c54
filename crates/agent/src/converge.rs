//! Status reconciliation.
//!
//! Two layers run during every operation. `wait_for_status` is the
//! shard-side observer: every participating agent polls the cluster meta
//! until the coordinator has advanced it to the target status.
//! `converge_cluster` is the coordinator side: it classifies every shard's
//! progress, detects lost shards through their lock heartbeats, and writes
//! the cluster-scope status once all shards have reached the target.

use crate::error::{OpError, OpResult};
use bson::Timestamp;
use drover_core::{Lock, LockHeader, LockKind, Status};
use drover_metadata::ControlDb;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Consecutive transient poll failures tolerated before giving up.
const MAX_POLL_FAILURES: u32 = 30;

/// Cluster-scope view of an operation, shared between backups and
/// restores.
#[derive(Clone, Debug)]
pub(crate) struct OpView {
    pub status: Status,
    pub error: Option<String>,
    pub hb: Timestamp,
    pub leader: String,
    pub replsets: Vec<RsView>,
}

/// One replica set's progress.
#[derive(Clone, Debug)]
pub(crate) struct RsView {
    pub name: String,
    pub status: Status,
    pub error: Option<String>,
}

pub(crate) async fn op_view(
    db: &ControlDb,
    kind: LockKind,
    name: &str,
) -> OpResult<Option<OpView>> {
    match kind {
        LockKind::Backup => Ok(db.get_backup_meta(name).await?.map(|m| OpView {
            status: m.status,
            error: m.error,
            hb: m.hb,
            leader: m.leader,
            replsets: m
                .replsets
                .into_iter()
                .map(|rs| RsView {
                    name: rs.name,
                    status: rs.status,
                    error: rs.error,
                })
                .collect(),
        })),
        LockKind::Restore => Ok(db.get_restore_meta(name).await?.map(|m| OpView {
            status: m.status,
            error: m.error,
            hb: m.hb,
            leader: m.leader,
            replsets: m
                .replsets
                .into_iter()
                .map(|rs| RsView {
                    name: rs.name,
                    status: rs.status,
                    error: rs.error,
                })
                .collect(),
        })),
    }
}

pub(crate) async fn change_state(
    db: &ControlDb,
    kind: LockKind,
    name: &str,
    status: Status,
    error: Option<&str>,
) -> OpResult<()> {
    match kind {
        LockKind::Backup => db.change_backup_state(name, status, error).await?,
        LockKind::Restore => db.change_restore_state(name, status, error).await?,
    }
    Ok(())
}

pub(crate) async fn change_rs_state(
    db: &ControlDb,
    kind: LockKind,
    name: &str,
    rs: &str,
    status: Status,
    error: Option<&str>,
) -> OpResult<()> {
    match kind {
        LockKind::Backup => db.change_backup_rs_state(name, rs, status, error).await?,
        LockKind::Restore => db.change_restore_rs_state(name, rs, status, error).await?,
    }
    Ok(())
}

/// Position of a status on the happy path, for at-or-beyond comparisons.
fn seq_idx(status: Status) -> Option<usize> {
    Status::SEQUENCE.iter().position(|s| *s == status)
}

/// Whether `status` is at or beyond `target` on the happy path.
pub(crate) fn reached(status: Status, target: Status) -> bool {
    match (seq_idx(status), seq_idx(target)) {
        (Some(s), Some(t)) => s >= t,
        _ => false,
    }
}

/// Classification of one shard during a convergence poll.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum ShardProgress {
    Reached,
    Pending,
    /// The shard recorded a terminal failure; carries its error text.
    Failed(String),
    /// The shard's liveness signal is gone.
    Lost(String),
}

/// Classify a shard against the target status.
///
/// A shard with no meta entry has not joined yet: it stays pending without
/// liveness checks, bounded by the action-start budget on the first hop.
/// A joined-but-pending shard must hold a live lock, except on the Done
/// hop where locks are already released during teardown; there only a
/// present-and-stale lock marks the shard lost.
pub(crate) fn shard_progress(
    shard: &str,
    entry: Option<&RsView>,
    lock: Option<&Lock>,
    target: Status,
    now: Timestamp,
    stale_frame_sec: u32,
) -> ShardProgress {
    let Some(entry) = entry else {
        return ShardProgress::Pending;
    };

    match entry.status {
        Status::Error => ShardProgress::Failed(
            entry
                .error
                .clone()
                .unwrap_or_else(|| "unknown error".to_string()),
        ),
        Status::Cancelled => ShardProgress::Failed(format!("cancelled on shard {shard}")),
        status if reached(status, target) => ShardProgress::Reached,
        _ => match lock {
            Some(lock) if lock.is_stale(now, stale_frame_sec) => ShardProgress::Lost(format!(
                "lost shard {shard}, last beat ts: {}",
                lock.hb.time
            )),
            Some(_) => ShardProgress::Pending,
            None if target != Status::Done => {
                ShardProgress::Lost(format!("lost shard {shard}, no active lock"))
            }
            None => ShardProgress::Pending,
        },
    }
}

/// Coordinator-side convergence on `target` across `shards`.
///
/// Polls at the configured cadence. `timeout` is set only on the
/// Starting -> Running hop to detect shards that never acknowledged the
/// command; every later hop waits on progress and relies on the liveness
/// checks instead of a wall-clock budget. On a failed or lost shard the
/// cluster status is set to Error with that shard's message before the
/// error is returned.
pub async fn converge_cluster(
    db: &ControlDb,
    kind: LockKind,
    name: &str,
    shards: &[String],
    target: Status,
    timeout: Option<Duration>,
    poll: Duration,
    stale_frame_sec: u32,
    cancel: &CancellationToken,
) -> OpResult<()> {
    let deadline = timeout.map(|t| tokio::time::Instant::now() + t);
    let mut tick = tokio::time::interval(poll);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut failures = 0u32;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Err(OpError::Cancelled),
            _ = tick.tick() => {}
        }

        if let Some(deadline) = deadline {
            if tokio::time::Instant::now() >= deadline {
                return Err(OpError::convergence(format!(
                    "couldn't get response from all shards: waiting for {target} timed out"
                )));
            }
        }

        match converged(db, kind, name, shards, target, stale_frame_sec).await {
            Ok(true) => return Ok(()),
            Ok(false) => failures = 0,
            Err(OpError::Transient(msg)) if failures < MAX_POLL_FAILURES => {
                failures += 1;
                tracing::warn!(op = name, error = %msg, "convergence poll failed, retrying");
            }
            Err(e) => {
                // Mirror the failure into the cluster status so observers
                // stop waiting, then stop polling.
                let msg = e.to_string();
                if !matches!(e, OpError::Cancelled) {
                    if let Err(we) = change_state(db, kind, name, Status::Error, Some(&msg)).await
                    {
                        tracing::warn!(op = name, error = %we, "failed to record cluster error");
                    }
                }
                return Err(e);
            }
        }
    }
}

/// One convergence poll. `Ok(true)` once every shard reached the target
/// and the cluster status was advanced.
async fn converged(
    db: &ControlDb,
    kind: LockKind,
    name: &str,
    shards: &[String],
    target: Status,
    stale_frame_sec: u32,
) -> OpResult<bool> {
    let view = op_view(db, kind, name)
        .await?
        .ok_or_else(|| OpError::integrity(format!("no metadata for operation {name}")))?;
    let now = db.cluster_time().await?;

    let mut remaining = shards.len();
    for shard in shards {
        let entry = view.replsets.iter().find(|rs| rs.name == *shard);
        let lock = match entry {
            Some(_) => {
                db.get_lock_data(&LockHeader {
                    kind,
                    op_name: name.to_string(),
                    replset: shard.clone(),
                })
                .await?
            }
            None => None,
        };

        match shard_progress(shard, entry, lock.as_ref(), target, now, stale_frame_sec) {
            ShardProgress::Reached => remaining -= 1,
            ShardProgress::Pending => {}
            ShardProgress::Failed(msg) => {
                return Err(OpError::convergence(format!(
                    "{kind} on shard {shard} failed: {msg}"
                )));
            }
            ShardProgress::Lost(msg) => return Err(OpError::convergence(msg)),
        }
    }

    if remaining == 0 {
        change_state(db, kind, name, target, None).await?;
        return Ok(true);
    }
    Ok(false)
}

/// Shard-side wait until the coordinator advances the cluster status to
/// `target`.
///
/// Fails when the cluster records an error (always carrying the recorded
/// error text) and when the coordinator's meta heartbeat goes stale.
pub async fn wait_for_status(
    db: &ControlDb,
    kind: LockKind,
    name: &str,
    target: Status,
    poll: Duration,
    stale_frame_sec: u32,
    cancel: &CancellationToken,
) -> OpResult<()> {
    let mut tick = tokio::time::interval(poll);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut failures = 0u32;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Err(OpError::Cancelled),
            _ = tick.tick() => {}
        }

        let view = match op_view(db, kind, name).await {
            Ok(Some(view)) => view,
            // The leader's meta insert may not have landed yet.
            Ok(None) => {
                failures += 1;
                if failures > MAX_POLL_FAILURES {
                    return Err(OpError::integrity(format!(
                        "no metadata for operation {name}"
                    )));
                }
                continue;
            }
            Err(e) => {
                failures += 1;
                if failures > MAX_POLL_FAILURES {
                    return Err(e);
                }
                tracing::warn!(op = name, error = %e, "status poll failed, retrying");
                continue;
            }
        };
        failures = 0;

        match view.status {
            Status::Error => {
                return Err(OpError::convergence(format!(
                    "operation failed: {}",
                    view.error.unwrap_or_else(|| "unknown error".to_string())
                )));
            }
            Status::Cancelled => return Err(OpError::Cancelled),
            status if reached(status, target) => return Ok(()),
            _ => {}
        }

        // Coordinator liveness: the meta heartbeat is refreshed by the
        // leader for the whole run.
        let now = db.cluster_time().await.unwrap_or(view.hb);
        if view.hb.time.saturating_add(stale_frame_sec) < now.time {
            return Err(OpError::convergence(format!(
                "lost shard {}, last beat ts: {}",
                view.leader, view.hb.time
            )));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drover_core::LockHeader;

    fn rs(name: &str, status: Status, error: Option<&str>) -> RsView {
        RsView {
            name: name.to_string(),
            status,
            error: error.map(str::to_string),
        }
    }

    fn lock(hb_time: u32) -> Lock {
        Lock {
            header: LockHeader {
                kind: LockKind::Backup,
                op_name: "b1".to_string(),
                replset: "rs0".to_string(),
            },
            hostname: "node-1".to_string(),
            hb: Timestamp { time: hb_time, increment: 0 },
        }
    }

    const NOW: Timestamp = Timestamp { time: 100, increment: 0 };
    const STALE: u32 = 30;

    #[test]
    fn unjoined_shard_is_pending_without_liveness_checks() {
        let p = shard_progress("rs1", None, None, Status::Running, NOW, STALE);
        assert_eq!(p, ShardProgress::Pending);
    }

    #[test]
    fn shard_at_or_beyond_target_is_reached() {
        let entry = rs("rs0", Status::Running, None);
        assert_eq!(
            shard_progress("rs0", Some(&entry), Some(&lock(99)), Status::Running, NOW, STALE),
            ShardProgress::Reached
        );

        let ahead = rs("rs0", Status::DumpDone, None);
        assert_eq!(
            shard_progress("rs0", Some(&ahead), Some(&lock(99)), Status::Running, NOW, STALE),
            ShardProgress::Reached
        );
    }

    #[test]
    fn failed_shard_carries_its_error() {
        let entry = rs("rs0", Status::Error, Some("disk full"));
        match shard_progress("rs0", Some(&entry), None, Status::Running, NOW, STALE) {
            ShardProgress::Failed(msg) => assert_eq!(msg, "disk full"),
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    #[test]
    fn pending_shard_with_stale_lock_is_lost() {
        let entry = rs("rs2", Status::Starting, None);
        match shard_progress("rs2", Some(&entry), Some(&lock(60)), Status::Running, NOW, STALE) {
            ShardProgress::Lost(msg) => {
                assert_eq!(msg, "lost shard rs2, last beat ts: 60");
            }
            other => panic!("expected Lost, got {other:?}"),
        }
    }

    #[test]
    fn pending_shard_with_live_lock_keeps_waiting() {
        let entry = rs("rs2", Status::Starting, None);
        assert_eq!(
            shard_progress("rs2", Some(&entry), Some(&lock(95)), Status::Running, NOW, STALE),
            ShardProgress::Pending
        );
    }

    #[test]
    fn joined_shard_without_lock_is_lost_before_done() {
        let entry = rs("rs2", Status::Running, None);
        match shard_progress("rs2", Some(&entry), None, Status::DumpDone, NOW, STALE) {
            ShardProgress::Lost(msg) => assert!(msg.contains("no active lock")),
            other => panic!("expected Lost, got {other:?}"),
        }
    }

    #[test]
    fn missing_lock_on_done_hop_is_normal_teardown() {
        let entry = rs("rs2", Status::DumpDone, None);
        assert_eq!(
            shard_progress("rs2", Some(&entry), None, Status::Done, NOW, STALE),
            ShardProgress::Pending
        );
    }

    #[test]
    fn stale_lock_on_done_hop_is_still_lost() {
        let entry = rs("rs2", Status::DumpDone, None);
        match shard_progress("rs2", Some(&entry), Some(&lock(10)), Status::Done, NOW, STALE) {
            ShardProgress::Lost(msg) => assert!(msg.contains("last beat ts: 10")),
            other => panic!("expected Lost, got {other:?}"),
        }
    }

    #[test]
    fn reached_comparison_is_monotone() {
        assert!(reached(Status::Done, Status::Done));
        assert!(reached(Status::Done, Status::Starting));
        assert!(!reached(Status::Starting, Status::Running));
        assert!(!reached(Status::Error, Status::Running));
        assert!(!reached(Status::Cancelled, Status::Starting));
    }
}
