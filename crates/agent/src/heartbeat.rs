//! Lock acquisition and heartbeat refresh.

use crate::error::OpResult;
use bson::Timestamp;
use drover_core::{Lock, LockHeader, LockKind, Tunables};
use drover_metadata::ControlDb;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A held operation lock.
///
/// The guard owns the refresh task that keeps the lock alive on the
/// heartbeat cadence. When a refresh discovers the lock was taken over
/// (stale takeover by another agent), the operation's cancellation token
/// fires and the task stops; the holder must abandon the operation.
pub struct LockGuard {
    db: ControlDb,
    header: LockHeader,
    hostname: String,
    task: JoinHandle<()>,
}

/// Try to acquire the `(kind, replset)` lock for `op_name`.
///
/// Returns `None` when another live operation holds the pair; the caller
/// discards the command.
pub async fn acquire_lock(
    db: &ControlDb,
    kind: LockKind,
    op_name: &str,
    replset: &str,
    tunables: &Tunables,
    cancel: &CancellationToken,
) -> OpResult<Option<LockGuard>> {
    let header = LockHeader {
        kind,
        op_name: op_name.to_string(),
        replset: replset.to_string(),
    };
    let hostname = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_string());

    let hb = db.cluster_time().await?;
    let lock = Lock {
        header: header.clone(),
        hostname: hostname.clone(),
        hb,
    };

    if !db.acquire_lock(&lock, tunables.stale_frame_sec).await? {
        return Ok(None);
    }

    let task = tokio::spawn(refresh_loop(
        db.clone(),
        header.clone(),
        hostname.clone(),
        tunables.heartbeat(),
        cancel.clone(),
    ));

    Ok(Some(LockGuard {
        db: db.clone(),
        header,
        hostname,
        task,
    }))
}

async fn refresh_loop(
    db: ControlDb,
    header: LockHeader,
    hostname: String,
    period: std::time::Duration,
    cancel: CancellationToken,
) {
    let mut tick = tokio::time::interval(period);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tick.tick() => {}
        }

        let ts = match db.cluster_time().await {
            Ok(ts) => ts,
            Err(e) => {
                tracing::warn!(error = %e, op = %header.op_name, "lock heartbeat: no cluster time");
                continue;
            }
        };

        match db.refresh_lock(&header, &hostname, ts).await {
            Ok(true) => {}
            Ok(false) => {
                // Someone took the lock over while we were frozen or
                // partitioned. The operation must stop touching shared
                // state immediately.
                tracing::warn!(
                    op = %header.op_name,
                    replset = %header.replset,
                    "lock was taken over, abandoning operation"
                );
                cancel.cancel();
                return;
            }
            Err(e) => {
                tracing::warn!(error = %e, op = %header.op_name, "lock heartbeat refresh failed");
            }
        }
    }
}

impl LockGuard {
    /// Stop the heartbeat and delete the lock. Deletion is best-effort;
    /// a leftover lock goes stale within the stale frame.
    pub async fn release(self) {
        self.task.abort();
        if let Err(e) = self.db.release_lock(&self.header, &self.hostname).await {
            tracing::warn!(
                error = %e,
                op = %self.header.op_name,
                "lock release failed, lock will expire via stale frame"
            );
        }
    }
}

/// Keep the cluster-scope meta heartbeat fresh while the coordinator runs.
///
/// Waiters on other replica sets treat a stale meta heartbeat as a lost
/// coordinator.
pub fn spawn_meta_heartbeat(
    db: ControlDb,
    kind: LockKind,
    op_name: String,
    period: std::time::Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(period);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tick.tick() => {}
            }

            let ts: Timestamp = match db.cluster_time().await {
                Ok(ts) => ts,
                Err(e) => {
                    tracing::warn!(error = %e, op = %op_name, "meta heartbeat: no cluster time");
                    continue;
                }
            };

            let res = match kind {
                LockKind::Backup => db.backup_hb(&op_name, ts).await,
                LockKind::Restore => db.restore_hb(&op_name, ts).await,
            };
            if let Err(e) = res {
                tracing::warn!(error = %e, op = %op_name, "meta heartbeat refresh failed");
            }
        }
    })
}
