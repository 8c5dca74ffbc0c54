//! Backup pipeline.
//!
//! Runs on the elected primary of every participating replica set, after
//! the worker has acquired the backup lock. The replica set's contribution
//! is two objects: a dump of every user database and an oplog slice
//! covering the dump window. The two-phase window (`first_write_ts` at
//! dump start, `last_write_ts` at dump end) makes dump plus slice
//! equivalent to the database state at the window's upper bound without
//! freezing writes.

use crate::converge;
use crate::error::{OpError, OpResult};
use crate::heartbeat;
use crate::pipeline;
use crate::{dump, oplog, AgentState};
use drover_core::meta::meta_object_name;
use drover_core::{
    unix_now, BackupCmd, BackupMeta, BackupReplset, Condition, LockKind, Status,
};
use drover_metadata::{LogEntry, NodeInfo, Severity};
use tokio_util::sync::CancellationToken;

/// Run a backup on this replica set. `shards` is the convergence set; it
/// is only read on the coordinator (`leader`).
pub async fn run(
    st: &AgentState,
    info: &NodeInfo,
    shards: &[String],
    leader: bool,
    cmd: &BackupCmd,
    opid: &str,
    cancel: &CancellationToken,
) -> OpResult<()> {
    let mut hb_task = None;

    if leader {
        ensure_meta(st, info, cmd, opid).await?;
        hb_task = Some(heartbeat::spawn_meta_heartbeat(
            st.db.clone(),
            LockKind::Backup,
            cmd.name.clone(),
            st.tunables.heartbeat(),
            cancel.clone(),
        ));
    }

    let result = phases(st, info, shards, leader, &cmd.name, cancel).await;

    if let Some(task) = hb_task {
        task.abort();
    }
    result
}

/// Create the cluster-scope meta, or attach to it when the command was
/// re-delivered. A terminal record under the same name is a hard error:
/// operation names are unique for the lifetime of the metadata.
async fn ensure_meta(
    st: &AgentState,
    info: &NodeInfo,
    cmd: &BackupCmd,
    opid: &str,
) -> OpResult<()> {
    match st.db.get_backup_meta(&cmd.name).await? {
        Some(meta) if meta.status.is_terminal() => Err(OpError::integrity(format!(
            "backup {} already exists with status: {}",
            cmd.name, meta.status
        ))),
        Some(_) => Ok(()), // already running, attach
        None => {
            let cfg = st
                .db
                .get_store_config()
                .await?
                .ok_or_else(|| OpError::integrity("storage is not configured"))?;
            let now = unix_now();
            let meta = BackupMeta {
                name: cmd.name.clone(),
                opid: opid.to_string(),
                compression: cmd.compression.unwrap_or(cfg.compression),
                store: cfg.storage,
                leader: info.set_name.clone(),
                start_ts: now,
                hb: st.db.cluster_time().await?,
                last_transition_ts: now,
                status: Status::Starting,
                error: None,
                conditions: vec![Condition::new(now, Status::Starting, None)],
                replsets: Vec::new(),
            };
            st.db.set_backup_meta(&meta).await?;
            Ok(())
        }
    }
}

async fn phases(
    st: &AgentState,
    info: &NodeInfo,
    shards: &[String],
    leader: bool,
    name: &str,
    cancel: &CancellationToken,
) -> OpResult<()> {
    let db = &st.db;
    let t = &st.tunables;
    let rs = info.set_name.as_str();

    converge::wait_for_status(
        db,
        LockKind::Backup,
        name,
        Status::Starting,
        t.poll(),
        t.stale_frame_sec,
        cancel,
    )
    .await?;

    let meta = db
        .get_backup_meta(name)
        .await?
        .ok_or_else(|| OpError::integrity(format!("no metadata for backup {name}")))?;

    // Every shard reads the storage snapshot from the meta, never the live
    // config, so a mid-backup config change cannot split the cluster.
    let storage = drover_storage::from_config(&meta.store).await?;
    storage
        .health_check()
        .await
        .map_err(|e| OpError::transient(format!("blob store unreachable: {e}")))?;

    let rs_meta = BackupReplset::new(name, rs, meta.compression, unix_now());
    let dump_name = rs_meta.dump_name.clone();
    let oplog_name = rs_meta.oplog_name.clone();
    db.add_backup_rs_meta(name, &rs_meta).await?;
    let _ = db
        .append_log(&LogEntry::new(
            Severity::Info,
            "backup.started",
            name,
            rs,
            format!("dump -> {dump_name}"),
        ))
        .await;

    if leader {
        converge::converge_cluster(
            db,
            LockKind::Backup,
            name,
            shards,
            Status::Running,
            Some(t.wait_action_start()),
            t.poll(),
            t.stale_frame_sec,
            cancel,
        )
        .await?;
    } else {
        converge::wait_for_status(
            db,
            LockKind::Backup,
            name,
            Status::Running,
            t.poll(),
            t.stale_frame_sec,
            cancel,
        )
        .await?;
    }

    // Lower bound of the oplog window, before the first dump read.
    let first_write = db.cluster_time().await?;
    db.set_backup_rs_first_write(name, rs, first_write).await?;

    let dump_bytes = {
        let mut pipe =
            pipeline::open_upload(storage.as_ref(), &dump_name, meta.compression).await?;
        let res = tokio::select! {
            _ = cancel.cancelled() => Err(OpError::Cancelled),
            r = dump::write_archive(st.node.client(), pipe.writer()) => r,
        };
        match res {
            Ok(_) => pipe.finish().await?,
            Err(e) => {
                pipe.abort().await;
                return Err(e);
            }
        }
    };
    tracing::info!(backup = name, replset = rs, bytes = dump_bytes, "dump uploaded");

    // Upper bound: everything the dump could have seen is at or before
    // the last majority-committed write.
    let last_write = st
        .node
        .info()
        .await?
        .last_write_majority
        .ok_or_else(|| OpError::transient("node reports no majority op-time"))?;
    db.set_backup_rs_last_write(name, rs, last_write).await?;

    converge::change_rs_state(db, LockKind::Backup, name, rs, Status::DumpDone, None).await?;
    if leader {
        converge::converge_cluster(
            db,
            LockKind::Backup,
            name,
            shards,
            Status::DumpDone,
            None,
            t.poll(),
            t.stale_frame_sec,
            cancel,
        )
        .await?;
    } else {
        converge::wait_for_status(
            db,
            LockKind::Backup,
            name,
            Status::DumpDone,
            t.poll(),
            t.stale_frame_sec,
            cancel,
        )
        .await?;
    }

    let oplog_bytes = {
        let mut pipe =
            pipeline::open_upload(storage.as_ref(), &oplog_name, meta.compression).await?;
        let res = tokio::select! {
            _ = cancel.cancelled() => Err(OpError::Cancelled),
            r = oplog::write_slice(st.node.client(), pipe.writer(), first_write, last_write) => r,
        };
        match res {
            Ok(_) => pipe.finish().await?,
            Err(e) => {
                pipe.abort().await;
                return Err(e);
            }
        }
    };
    tracing::info!(backup = name, replset = rs, bytes = oplog_bytes, "oplog slice uploaded");

    converge::change_rs_state(db, LockKind::Backup, name, rs, Status::Done, None).await?;
    if leader {
        converge::converge_cluster(
            db,
            LockKind::Backup,
            name,
            shards,
            Status::Done,
            None,
            t.poll(),
            t.stale_frame_sec,
            cancel,
        )
        .await?;

        // JSON copy of the final meta next to the data, so a restore can
        // find the backup without a control database.
        if let Some(final_meta) = db.get_backup_meta(name).await? {
            let bytes = serde_json::to_vec_pretty(&final_meta)
                .map_err(|e| OpError::integrity(format!("encode backup metadata: {e}")))?;
            storage.save(&meta_object_name(name), bytes.into()).await?;
        }
    }

    let _ = db
        .append_log(&LogEntry::new(
            Severity::Info,
            "backup.done",
            name,
            rs,
            format!("dump {dump_bytes} bytes, oplog {oplog_bytes} bytes"),
        ))
        .await;
    Ok(())
}
