//! Agent loop: command consumption, arbitration and worker dispatch.

use crate::converge;
use crate::error::OpError;
use crate::heartbeat;
use crate::{backup, restore, AgentState};
use drover_core::{BackupCmd, Cmd, LockKind, RestoreCmd, Status};
use drover_metadata::{CmdEnvelope, LogEntry, Severity};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Cancellation tokens of the operations currently running on this agent.
/// Entries live exactly as long as their worker.
type OpRegistry = Arc<Mutex<HashMap<String, CancellationToken>>>;

/// The per-node agent.
pub struct Agent {
    st: Arc<AgentState>,
    shutdown: CancellationToken,
    ops: OpRegistry,
}

impl Agent {
    pub fn new(st: AgentState, shutdown: CancellationToken) -> Self {
        Self {
            st: Arc::new(st),
            shutdown,
            ops: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Consume the command stream until shutdown. One worker is spawned
    /// per backup/restore command; cancel commands are routed to the
    /// matching worker's token.
    pub async fn run(&self) -> anyhow::Result<()> {
        let mut cmds = self.st.db.cmd_stream().await?;
        tracing::info!("agent started, listening for commands");

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    tracing::info!("agent shutting down");
                    return Ok(());
                }
                env = cmds.next() => self.dispatch(env).await,
            }
        }
    }

    async fn dispatch(&self, env: CmdEnvelope) {
        let opid = env.id.to_hex();
        tracing::debug!(opid = %opid, cmd = ?env.cmd, "command received");

        match env.cmd {
            Cmd::Backup(cmd) => self.spawn_worker(LockKind::Backup, Op::Backup(cmd), opid),
            Cmd::Restore(cmd) => self.spawn_worker(LockKind::Restore, Op::Restore(cmd), opid),
            Cmd::Cancel(cmd) => {
                let token = self.ops.lock().await.get(&cmd.name).cloned();
                match token {
                    Some(token) => {
                        tracing::info!(op = %cmd.name, "cancelling operation");
                        token.cancel();
                    }
                    None => {
                        tracing::debug!(op = %cmd.name, "no such operation running here");
                    }
                }
            }
        }
    }

    fn spawn_worker(&self, kind: LockKind, op: Op, opid: String) {
        let st = self.st.clone();
        let ops = self.ops.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            worker(st, ops, shutdown, kind, op, opid).await;
        });
    }
}

enum Op {
    Backup(BackupCmd),
    Restore(RestoreCmd),
}

impl Op {
    fn name(&self) -> &str {
        match self {
            Op::Backup(c) => &c.name,
            Op::Restore(c) => &c.name,
        }
    }
}

/// One worker per received command.
///
/// Secondaries do no work: their primary drives the replica set's state
/// and they merely observe. On the primary, the worker checks terminal
/// metadata (idempotence against command re-delivery), takes the lock
/// (arbitration against concurrent operations) and runs the pipeline. The
/// worker always writes a terminal state with the error's display form
/// before releasing the lock.
async fn worker(
    st: Arc<AgentState>,
    ops: OpRegistry,
    shutdown: CancellationToken,
    kind: LockKind,
    op: Op,
    opid: String,
) {
    let name = op.name().to_string();

    let info = match st.node.info().await {
        Ok(info) => info,
        Err(e) => {
            tracing::error!(op = %name, error = %e, "cannot probe the local node");
            return;
        }
    };
    if !info.is_primary {
        tracing::debug!(op = %name, "not the replica-set primary, observing only");
        return;
    }

    // Re-delivered command for a finished operation: never start a second
    // independent run.
    let existing = match kind {
        LockKind::Backup => st
            .db
            .get_backup_meta(&name)
            .await
            .ok()
            .flatten()
            .map(|m| m.status),
        LockKind::Restore => st
            .db
            .get_restore_meta(&name)
            .await
            .ok()
            .flatten()
            .map(|m| m.status),
    };
    if let Some(status) = existing {
        if status.is_terminal() {
            tracing::warn!(op = %name, %status, "operation already finished, ignoring command");
            let _ = st
                .db
                .append_log(&LogEntry::new(
                    Severity::Warn,
                    "cmd.ignored",
                    &name,
                    &info.set_name,
                    format!("{kind} {name} already exists with status: {status}"),
                ))
                .await;
            return;
        }
    }

    let shards = match st.db.get_shards().await {
        Ok(shards) => shards,
        Err(e) => {
            tracing::warn!(op = %name, error = %e, "cannot list shards, assuming unsharded");
            Vec::new()
        }
    };
    // The coordinator is the primary of the config-server replica set, or
    // of the sole replica set in an unsharded deployment.
    let leader = info.config_svr || shards.is_empty();
    let mut shard_names = vec![info.set_name.clone()];
    for shard in &shards {
        if !shard_names.contains(&shard.id) {
            shard_names.push(shard.id.clone());
        }
    }

    let cancel = shutdown.child_token();
    ops.lock().await.insert(name.clone(), cancel.clone());

    let guard = match heartbeat::acquire_lock(
        &st.db,
        kind,
        &name,
        &info.set_name,
        &st.tunables,
        &cancel,
    )
    .await
    {
        Ok(Some(guard)) => guard,
        Ok(None) => {
            tracing::debug!(op = %name, "another operation holds the lock, discarding command");
            ops.lock().await.remove(&name);
            return;
        }
        Err(e) => {
            tracing::warn!(op = %name, error = %e, "lock acquisition failed");
            ops.lock().await.remove(&name);
            return;
        }
    };

    tracing::info!(op = %name, kind = %kind, leader, replset = %info.set_name, "worker started");
    let result = match &op {
        Op::Backup(cmd) => {
            backup::run(&st, &info, &shard_names, leader, cmd, &opid, &cancel).await
        }
        Op::Restore(cmd) => {
            restore::run(&st, &info, &shard_names, leader, cmd, &opid, &cancel).await
        }
    };

    match result {
        Ok(()) => {
            tracing::info!(op = %name, kind = %kind, "operation finished");
        }
        Err(OpError::Cancelled) => {
            // Operator cancel ends in Cancelled; a dying process ends in
            // Error so the outcome is never mistaken for a clean stop.
            let (status, msg) = if shutdown.is_cancelled() {
                (Status::Error, "agent shutdown")
            } else {
                (Status::Cancelled, "cancelled by operator")
            };
            tracing::warn!(op = %name, %status, "operation did not finish: {msg}");
            mark_failed(&st, kind, &name, &info.set_name, status, msg).await;
        }
        Err(e) => {
            tracing::error!(op = %name, kind = %kind, error = %e, "operation failed");
            mark_failed(&st, kind, &name, &info.set_name, Status::Error, &e.to_string()).await;
            if e.is_fatal() {
                tracing::error!(op = %name, "fatal failure, worker exiting");
            }
        }
    }

    guard.release().await;
    ops.lock().await.remove(&name);
}

/// Record a terminal failure at both scopes, best-effort. The replica-set
/// entry may not exist yet when the failure hit early; that is fine, the
/// cluster-scope record is what observers react to.
async fn mark_failed(
    st: &AgentState,
    kind: LockKind,
    name: &str,
    rs: &str,
    status: Status,
    msg: &str,
) {
    if let Err(e) = converge::change_state(&st.db, kind, name, status, Some(msg)).await {
        tracing::debug!(op = %name, error = %e, "cluster state write skipped");
    }
    if let Err(e) = converge::change_rs_state(&st.db, kind, name, rs, status, Some(msg)).await {
        tracing::debug!(op = %name, error = %e, "replica-set state write skipped");
    }
    let _ = st
        .db
        .append_log(&LogEntry::new(
            Severity::Error,
            match kind {
                LockKind::Backup => "backup.failed",
                LockKind::Restore => "restore.failed",
            },
            name,
            rs,
            msg,
        ))
        .await;
}
