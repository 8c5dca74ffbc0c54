//! Operator CLI for the drover backup coordinator.
//!
//! Commands are published into the capped command collection; agents pick
//! them up from there. Status is read back from the operation metadata.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use drover_core::{
    BackupCmd, CancelCmd, Cmd, Compression, RestoreCmd, Status, StoreConfig,
};
use drover_metadata::ControlDb;
use figment::providers::{Format, Toml};
use figment::Figment;
use std::path::PathBuf;
use std::time::Duration;

/// Operation failed.
const EXIT_OP_FAILED: i32 = 1;
/// Could not attach to the database.
const EXIT_NO_NODE: i32 = 2;
/// Blob store unreachable.
const EXIT_NO_STORE: i32 = 3;

/// Operator CLI for the drover backup coordinator.
#[derive(Parser)]
#[command(name = "droverctl")]
#[command(version, about)]
struct Cli {
    /// Connection string of the cluster (any member or mongos)
    #[arg(long, env = "DROVER_MONGODB_URI", global = true)]
    mongodb_uri: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a backup
    Backup {
        /// Backup name; defaults to the current UTC timestamp
        #[arg(long)]
        name: Option<String>,
        /// Compression override for this backup
        #[arg(long)]
        compression: Option<Compression>,
        /// Block until the backup finishes
        #[arg(long, default_value_t = false)]
        wait: bool,
    },
    /// Restore a finished backup
    Restore {
        /// Name of the backup to restore
        backup: String,
        /// Restore name; defaults to the current UTC timestamp
        #[arg(long)]
        name: Option<String>,
        /// Block until the restore finishes
        #[arg(long, default_value_t = false)]
        wait: bool,
    },
    /// Cancel a running operation
    Cancel {
        /// Operation name
        name: String,
    },
    /// Delete a finished backup and its objects in storage
    Delete {
        /// Backup name
        name: String,
    },
    /// Show an operation's metadata
    Status {
        /// Operation name
        name: String,
    },
    /// List backups and restores
    List,
    /// Show recent agent events
    Logs {
        /// Number of entries
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
    /// Manage cluster configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Show the current configuration
    Show,
    /// Load configuration from a TOML file
    Set {
        /// Path to the configuration file
        file: PathBuf,
    },
}

fn default_op_name() -> String {
    // ISO-8601 with second precision keeps names sortable and unique
    // enough for operator-issued commands.
    let now = bson::DateTime::now();
    now.try_to_rfc3339_string()
        .map(|s| match s.split_once('.') {
            Some((secs, _)) => format!("{secs}Z"),
            None => s,
        })
        .unwrap_or_else(|_| format!("op-{}", now.timestamp_millis()))
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .init();

    let cli = Cli::parse();
    std::process::exit(match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            EXIT_OP_FAILED
        }
    });
}

async fn run(cli: Cli) -> Result<i32> {
    let uri = match cli.mongodb_uri {
        Some(uri) => uri,
        None => {
            eprintln!("error: no connection string; pass --mongodb-uri or set DROVER_MONGODB_URI");
            return Ok(EXIT_NO_NODE);
        }
    };
    let db = match ControlDb::connect(&uri).await {
        Ok(db) => db,
        Err(e) => {
            eprintln!("error: cannot connect to the database: {e}");
            return Ok(EXIT_NO_NODE);
        }
    };

    match cli.command {
        Commands::Backup {
            name,
            compression,
            wait,
        } => {
            let name = name.unwrap_or_else(default_op_name);
            drover_core::validate_op_name(&name)?;
            if let Some(meta) = db.get_backup_meta(&name).await? {
                bail!("backup {} already exists with status: {}", name, meta.status);
            }
            db.send_cmd(&Cmd::Backup(BackupCmd {
                name: name.clone(),
                compression,
            }))
            .await?;
            println!("backup '{name}' started");
            if wait {
                return wait_backup(&db, &name).await;
            }
            Ok(0)
        }
        Commands::Restore { backup, name, wait } => {
            let name = name.unwrap_or_else(default_op_name);
            drover_core::validate_op_name(&name)?;
            if let Some(meta) = db.get_restore_meta(&name).await? {
                bail!("restore {} already exists with status: {}", name, meta.status);
            }
            db.send_cmd(&Cmd::Restore(RestoreCmd {
                name: name.clone(),
                backup,
            }))
            .await?;
            println!("restore '{name}' started");
            if wait {
                return wait_restore(&db, &name).await;
            }
            Ok(0)
        }
        Commands::Cancel { name } => {
            db.send_cmd(&Cmd::Cancel(CancelCmd { name: name.clone() }))
                .await?;
            println!("cancel of '{name}' requested");
            Ok(0)
        }
        Commands::Delete { name } => delete(&db, &name).await,
        Commands::Status { name } => status(&db, &name).await,
        Commands::List => list(&db).await,
        Commands::Logs { limit } => logs(&db, limit).await,
        Commands::Config { command } => config(&db, command).await,
    }
}

async fn wait_backup(db: &ControlDb, name: &str) -> Result<i32> {
    let mut last = None;
    loop {
        if let Some(meta) = db.get_backup_meta(name).await? {
            if last != Some(meta.status) {
                println!("  {}", meta.status);
                last = Some(meta.status);
            }
            if meta.status.is_terminal() {
                if meta.status != Status::Done {
                    eprintln!(
                        "backup '{}' ended with {}: {}",
                        name,
                        meta.status,
                        meta.error.unwrap_or_default()
                    );
                    return Ok(EXIT_OP_FAILED);
                }
                return Ok(0);
            }
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}

async fn wait_restore(db: &ControlDb, name: &str) -> Result<i32> {
    let mut last = None;
    loop {
        if let Some(meta) = db.get_restore_meta(name).await? {
            if last != Some(meta.status) {
                println!("  {}", meta.status);
                last = Some(meta.status);
            }
            if meta.status.is_terminal() {
                if meta.status != Status::Done {
                    eprintln!(
                        "restore '{}' ended with {}: {}",
                        name,
                        meta.status,
                        meta.error.unwrap_or_default()
                    );
                    return Ok(EXIT_OP_FAILED);
                }
                return Ok(0);
            }
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}

/// Delete a terminal backup: every object under its name prefix in
/// storage, then the metadata record.
async fn delete(db: &ControlDb, name: &str) -> Result<i32> {
    use futures::StreamExt;

    let Some(meta) = db.get_backup_meta(name).await? else {
        eprintln!("no backup named '{name}'");
        return Ok(EXIT_OP_FAILED);
    };
    if !meta.status.is_terminal() {
        bail!(
            "backup '{}' is still running (status: {}); cancel it first",
            name,
            meta.status
        );
    }

    let storage = match drover_storage::from_config(&meta.store).await {
        Ok(storage) => storage,
        Err(e) => {
            eprintln!("error: blob store unreachable: {e}");
            return Ok(EXIT_NO_STORE);
        }
    };

    let mut objects = storage.list(&format!("{name}_")).await?;
    let mut deleted = 0usize;
    while let Some(object) = objects.next().await {
        let object = object?;
        storage.delete(&object).await?;
        deleted += 1;
    }
    match storage.delete(&drover_core::meta::meta_object_name(name)).await {
        Ok(()) => deleted += 1,
        Err(drover_storage::StorageError::NotFound(_)) => {}
        Err(e) => return Err(e.into()),
    }

    db.delete_backup_meta(name).await?;
    println!("backup '{name}' deleted ({deleted} objects)");
    Ok(0)
}

async fn status(db: &ControlDb, name: &str) -> Result<i32> {
    if let Some(meta) = db.get_backup_meta(name).await? {
        println!("{}", serde_json::to_string_pretty(&meta)?);
        return Ok(0);
    }
    if let Some(meta) = db.get_restore_meta(name).await? {
        println!("{}", serde_json::to_string_pretty(&meta)?);
        return Ok(0);
    }
    eprintln!("no operation named '{name}'");
    Ok(EXIT_OP_FAILED)
}

async fn list(db: &ControlDb) -> Result<i32> {
    let backups = db.list_backups().await?;
    if !backups.is_empty() {
        println!("backups:");
        for meta in backups {
            match meta.error {
                Some(error) => println!("  {}  {}  ({})", meta.name, meta.status, error),
                None => println!("  {}  {}", meta.name, meta.status),
            }
        }
    }

    let restores = db.list_restores().await?;
    if !restores.is_empty() {
        println!("restores:");
        for meta in restores {
            match meta.error {
                Some(error) => println!(
                    "  {}  (from {})  {}  ({})",
                    meta.name, meta.backup, meta.status, error
                ),
                None => println!("  {}  (from {})  {}", meta.name, meta.backup, meta.status),
            }
        }
    }
    Ok(0)
}

async fn logs(db: &ControlDb, limit: i64) -> Result<i32> {
    for entry in db.recent_logs(limit).await?.into_iter().rev() {
        println!(
            "{}  [{}]  {}  {}/{}  {}",
            entry.ts, entry.severity, entry.event, entry.op_name, entry.replset, entry.msg
        );
    }
    Ok(0)
}

async fn config(db: &ControlDb, command: ConfigCommands) -> Result<i32> {
    match command {
        ConfigCommands::Show => match db.get_store_config().await? {
            Some(cfg) => {
                println!("{}", serde_json::to_string_pretty(&cfg)?);
                Ok(0)
            }
            None => {
                eprintln!("storage is not configured");
                Ok(EXIT_OP_FAILED)
            }
        },
        ConfigCommands::Set { file } => {
            let cfg: StoreConfig = Figment::new()
                .merge(Toml::file(&file))
                .extract()
                .with_context(|| format!("failed to parse {}", file.display()))?;

            // Reject a descriptor nobody can write to before committing it.
            let healthy = match drover_storage::from_config(&cfg.storage).await {
                Ok(storage) => storage.health_check().await,
                Err(e) => Err(e),
            };
            if let Err(e) = healthy {
                eprintln!("error: blob store unreachable: {e}");
                return Ok(EXIT_NO_STORE);
            }

            db.set_store_config(&cfg).await?;
            println!("configuration updated");
            Ok(0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_names_are_sortable_timestamps() {
        let name = default_op_name();
        // 2026-08-02T10:00:00Z
        assert_eq!(name.len(), 20);
        assert!(name.ends_with('Z'));
        assert_eq!(&name[4..5], "-");
        assert_eq!(&name[10..11], "T");
    }
}
