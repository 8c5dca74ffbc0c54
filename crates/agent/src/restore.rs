//! Restore pipeline.
//!
//! The reverse of the backup pipeline, plus the user/role splice. Runs
//! against a direct connection so replica-set routing never sends a read
//! elsewhere mid-restore. The dump redirects `admin.system.users` and
//! `admin.system.roles` into temporary collections; the splice installs
//! them only after the oplog replay, keeping the session's own credential
//! usable throughout.

use crate::converge;
use crate::dump::{self, ApplyOptions};
use crate::error::{OpError, OpResult};
use crate::heartbeat;
use crate::pipeline;
use crate::{oplog, AgentState};
use bson::{doc, Document};
use drover_core::meta::meta_object_name;
use drover_core::{
    unix_now, BackupMeta, Condition, LockKind, RestoreCmd, RestoreMeta, RestoreReplset, Status,
    CONTROL_DB, TMP_ROLES_COLL, TMP_USERS_COLL,
};
use drover_metadata::{AuthInfo, LogEntry, NodeInfo, Severity};
use drover_storage::compress;
use futures::TryStreamExt;
use mongodb::{Client, Collection};
use tokio_util::sync::CancellationToken;

/// Namespaces neither restored from the dump nor applied from the oplog.
pub fn restore_exclusions() -> Vec<String> {
    vec![
        format!("{CONTROL_DB}.*"),
        "config.version".to_string(),
        "config.mongos".to_string(),
        "config.lockpings".to_string(),
        "config.locks".to_string(),
        "config.system.sessions".to_string(),
        "config.cache.*".to_string(),
    ]
}

/// Users and roles are parked in the control database until the oplog
/// replay has finished.
fn rename_table() -> Vec<(String, String)> {
    vec![
        (
            "admin.system.users".to_string(),
            format!("{CONTROL_DB}.{TMP_USERS_COLL}"),
        ),
        (
            "admin.system.roles".to_string(),
            format!("{CONTROL_DB}.{TMP_ROLES_COLL}"),
        ),
    ]
}

/// Run a restore on this replica set.
pub async fn run(
    st: &AgentState,
    info: &NodeInfo,
    shards: &[String],
    leader: bool,
    cmd: &RestoreCmd,
    opid: &str,
    cancel: &CancellationToken,
) -> OpResult<()> {
    // Everything here is read-only validation; it must fail before any
    // collection in the target is touched.
    let bcp = resolve_backup_meta(st, &cmd.backup).await?;
    if bcp.status != Status::Done {
        return Err(OpError::integrity(format!(
            "backup wasn't successful: status: {}, error: {}",
            bcp.status,
            bcp.error.clone().unwrap_or_default()
        )));
    }
    if !compress::supported(bcp.compression) {
        return Err(OpError::integrity(format!(
            "unknown compression: {}",
            bcp.compression
        )));
    }
    let rs_backup = bcp
        .replset(&info.set_name)
        .ok_or_else(|| {
            OpError::integrity(format!(
                "metadata for replset {} is not found",
                info.set_name
            ))
        })?
        .clone();

    // The data objects come through the storage snapshot recorded in the
    // backup meta, not the live cluster config. Both objects must exist
    // and be non-empty before anything in the target is touched.
    let storage = drover_storage::from_config(&bcp.store).await?;
    storage
        .health_check()
        .await
        .map_err(|e| OpError::transient(format!("blob store unreachable: {e}")))?;
    for object in [&rs_backup.dump_name, &rs_backup.oplog_name] {
        let stat = storage
            .file_stat(object)
            .await
            .map_err(|e| OpError::integrity(format!("backup object {object}: {e}")))?;
        if stat.size == 0 {
            return Err(OpError::integrity(format!("backup object {object} is empty")));
        }
    }

    let mut hb_task = None;
    if leader {
        ensure_meta(st, info, cmd, opid).await?;
        hb_task = Some(heartbeat::spawn_meta_heartbeat(
            st.db.clone(),
            LockKind::Restore,
            cmd.name.clone(),
            st.tunables.heartbeat(),
            cancel.clone(),
        ));
    }

    let result = phases(
        st,
        info,
        shards,
        leader,
        cmd,
        &bcp,
        storage.as_ref(),
        &rs_backup.dump_name,
        cancel,
    )
    .await;

    if let Some(task) = hb_task {
        task.abort();
    }
    result
}

/// Resolve the source backup: the control database first, the JSON copy
/// in storage as a fallback (restores into an empty cluster).
async fn resolve_backup_meta(st: &AgentState, backup: &str) -> OpResult<BackupMeta> {
    if let Some(meta) = st.db.get_backup_meta(backup).await? {
        return Ok(meta);
    }

    let cfg = st
        .db
        .get_store_config()
        .await?
        .ok_or_else(|| OpError::integrity(format!("backup {backup} not found")))?;
    let storage = drover_storage::from_config(&cfg.storage).await?;

    let mut reader = storage.source_reader(&meta_object_name(backup)).await.map_err(|e| {
        OpError::integrity(format!("backup {backup} not found: {e}"))
    })?;
    let mut bytes = Vec::new();
    while let Some(chunk) = reader.try_next().await.map_err(OpError::from)? {
        bytes.extend_from_slice(&chunk);
    }
    serde_json::from_slice(&bytes)
        .map_err(|e| OpError::integrity(format!("decode metadata of backup {backup}: {e}")))
}

async fn ensure_meta(
    st: &AgentState,
    info: &NodeInfo,
    cmd: &RestoreCmd,
    opid: &str,
) -> OpResult<()> {
    match st.db.get_restore_meta(&cmd.name).await? {
        Some(meta) if meta.status.is_terminal() => Err(OpError::integrity(format!(
            "restore {} already exists with status: {}",
            cmd.name, meta.status
        ))),
        Some(_) => Ok(()),
        None => {
            let now = unix_now();
            let meta = RestoreMeta {
                name: cmd.name.clone(),
                backup: cmd.backup.clone(),
                opid: opid.to_string(),
                leader: info.set_name.clone(),
                start_ts: now,
                hb: st.db.cluster_time().await?,
                last_transition_ts: now,
                status: Status::Starting,
                error: None,
                conditions: vec![Condition::new(now, Status::Starting, None)],
                replsets: Vec::new(),
            };
            st.db.set_restore_meta(&meta).await?;
            Ok(())
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn phases(
    st: &AgentState,
    info: &NodeInfo,
    shards: &[String],
    leader: bool,
    cmd: &RestoreCmd,
    bcp: &BackupMeta,
    storage: &dyn drover_storage::Storage,
    dump_name: &str,
    cancel: &CancellationToken,
) -> OpResult<()> {
    let db = &st.db;
    let t = &st.tunables;
    let rs = info.set_name.as_str();
    let name = cmd.name.as_str();

    converge::wait_for_status(
        db,
        LockKind::Restore,
        name,
        Status::Starting,
        t.poll(),
        t.stale_frame_sec,
        cancel,
    )
    .await?;

    let rs_meta = RestoreReplset::new(rs, unix_now());
    db.add_restore_rs_meta(name, &rs_meta).await?;
    let _ = db
        .append_log(&LogEntry::new(
            Severity::Info,
            "restore.started",
            name,
            rs,
            format!("from backup {}", cmd.backup),
        ))
        .await;

    if leader {
        converge::converge_cluster(
            db,
            LockKind::Restore,
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
            LockKind::Restore,
            name,
            Status::Running,
            t.poll(),
            t.stale_frame_sec,
            cancel,
        )
        .await?;
    }

    // The decoder opens before anything is dropped; an unreadable stream
    // leaves the target untouched.
    let mut reader =
        pipeline::open_download(storage, dump_name, bcp.compression).await?;
    let opts = ApplyOptions {
        exclude: restore_exclusions(),
        renames: rename_table(),
    };
    let stats = tokio::select! {
        _ = cancel.cancelled() => return Err(OpError::Cancelled),
        r = dump::apply_archive(st.node.client(), &mut reader, &opts) => r?,
    };
    tracing::info!(
        restore = name,
        replset = rs,
        collections = stats.collections,
        documents = stats.documents,
        "dump applied"
    );

    converge::change_rs_state(db, LockKind::Restore, name, rs, Status::DumpDone, None).await?;
    if leader {
        converge::converge_cluster(
            db,
            LockKind::Restore,
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
            LockKind::Restore,
            name,
            Status::DumpDone,
            t.poll(),
            t.stale_frame_sec,
            cancel,
        )
        .await?;
    }

    let oplog_object = bcp
        .replset(rs)
        .map(|b| b.oplog_name.clone())
        .ok_or_else(|| OpError::integrity(format!("metadata for replset {rs} is not found")))?;
    let mut reader =
        pipeline::open_download(storage, &oplog_object, bcp.compression).await?;
    let exclusions = restore_exclusions();
    let applied = tokio::select! {
        _ = cancel.cancelled() => return Err(OpError::Cancelled),
        r = oplog::apply(st.node.client(), &mut reader, &exclusions) => r?,
    };
    tracing::info!(restore = name, replset = rs, entries = applied, "oplog replayed");

    // Install the dumped users and roles, keeping this session's own
    // credential so the connection stays authorized.
    let auth = st.node.current_user().await?;
    swap_users(st.node.client(), &auth).await?;
    tracing::info!(restore = name, replset = rs, "users and roles restored");

    converge::change_rs_state(db, LockKind::Restore, name, rs, Status::Done, None).await?;
    if leader {
        converge::converge_cluster(
            db,
            LockKind::Restore,
            name,
            shards,
            Status::Done,
            None,
            t.poll(),
            t.stale_frame_sec,
            cancel,
        )
        .await?;
    }

    let _ = db
        .append_log(&LogEntry::new(
            Severity::Info,
            "restore.done",
            name,
            rs,
            format!("{} collections, {} documents", stats.collections, stats.documents),
        ))
        .await;
    Ok(())
}

/// Replace `admin.system.roles` and `admin.system.users` with the dumped
/// copies, except the documents backing the current session's identity.
async fn swap_users(client: &Client, exclude: &AuthInfo) -> OpResult<()> {
    let control = client.database(CONTROL_DB);
    let admin = client.database("admin");

    let keep_roles: Vec<String> = exclude
        .user_roles
        .iter()
        .map(|r| format!("{}.{}", r.db, r.role))
        .collect();

    let tmp_roles: Collection<Document> = control.collection(TMP_ROLES_COLL);
    let roles_target: Collection<Document> = admin.collection("system.roles");

    let mut cursor = tmp_roles
        .find(doc! { "_id": { "$nin": keep_roles.clone() } })
        .await
        .map_err(|e| OpError::transient(format!("read dumped roles: {e}")))?;
    roles_target
        .delete_many(doc! { "_id": { "$nin": keep_roles } })
        .await
        .map_err(|e| OpError::transient(format!("clear current roles: {e}")))?;
    while let Some(role) = cursor
        .try_next()
        .await
        .map_err(|e| OpError::transient(format!("read dumped roles: {e}")))?
    {
        roles_target
            .insert_one(role)
            .await
            .map_err(|e| OpError::transient(format!("install role: {e}")))?;
    }

    let keep_user = exclude
        .users
        .first()
        .map(|u| format!("{}.{}", u.db, u.user))
        .unwrap_or_default();

    let tmp_users: Collection<Document> = control.collection(TMP_USERS_COLL);
    let users_target: Collection<Document> = admin.collection("system.users");

    let mut cursor = tmp_users
        .find(doc! { "_id": { "$ne": keep_user.as_str() } })
        .await
        .map_err(|e| OpError::transient(format!("read dumped users: {e}")))?;
    users_target
        .delete_many(doc! { "_id": { "$ne": keep_user } })
        .await
        .map_err(|e| OpError::transient(format!("clear current users: {e}")))?;
    while let Some(user) = cursor
        .try_next()
        .await
        .map_err(|e| OpError::transient(format!("read dumped users: {e}")))?
    {
        users_target
            .insert_one(user)
            .await
            .map_err(|e| OpError::transient(format!("install user: {e}")))?;
    }

    tmp_roles
        .drop()
        .await
        .map_err(|e| OpError::transient(format!("drop {TMP_ROLES_COLL}: {e}")))?;
    tmp_users
        .drop()
        .await
        .map_err(|e| OpError::transient(format!("drop {TMP_USERS_COLL}: {e}")))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exclusions_cover_the_control_database() {
        let patterns = restore_exclusions();
        assert!(patterns.contains(&"pbm.*".to_string()));
        assert!(patterns.contains(&"config.system.sessions".to_string()));
    }

    #[test]
    fn renames_park_credentials_in_the_control_database() {
        let renames = rename_table();
        assert_eq!(
            renames[0],
            ("admin.system.users".to_string(), "pbm.pbmRUsers".to_string())
        );
        assert_eq!(
            renames[1],
            ("admin.system.roles".to_string(), "pbm.pbmRRoles".to_string())
        );
    }
}
