//! Operator commands carried by the capped command collection.

use crate::config::Compression;
use serde::{Deserialize, Serialize};

/// A command as inserted by the CLI and consumed by every agent.
///
/// The capped collection is insertion-ordered and bounded; commands are
/// never updated in place. Delivery is at-least-once per agent, so
/// execution must stay idempotent (the lock protocol and the terminal-meta
/// check take care of that).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "lowercase")]
pub enum Cmd {
    Backup(BackupCmd),
    Restore(RestoreCmd),
    Cancel(CancelCmd),
}

impl Cmd {
    /// Name of the operation the command refers to.
    pub fn op_name(&self) -> &str {
        match self {
            Cmd::Backup(c) => &c.name,
            Cmd::Restore(c) => &c.name,
            Cmd::Cancel(c) => &c.name,
        }
    }
}

/// Start a backup.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BackupCmd {
    /// Unique backup name.
    pub name: String,
    /// Override of the configured default compression.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compression: Option<Compression>,
}

/// Restore a finished backup.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RestoreCmd {
    /// Unique restore name.
    pub name: String,
    /// Name of the source backup.
    pub backup: String,
}

/// Cancel a running operation by name.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CancelCmd {
    pub name: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_tag_by_kind() {
        let cmd = Cmd::Backup(BackupCmd {
            name: "b1".to_string(),
            compression: Some(Compression::Lz4),
        });
        let doc = bson::to_document(&cmd).unwrap();
        assert_eq!(doc.get_str("cmd").unwrap(), "backup");
        assert_eq!(doc.get_str("name").unwrap(), "b1");

        let back: Cmd = bson::from_document(doc).unwrap();
        assert_eq!(back, cmd);
        assert_eq!(back.op_name(), "b1");
    }

    #[test]
    fn cancel_deserializes_from_plain_doc() {
        let doc = bson::doc! { "cmd": "cancel", "name": "b2" };
        let cmd: Cmd = bson::from_document(doc).unwrap();
        assert_eq!(cmd, Cmd::Cancel(CancelCmd { name: "b2".to_string() }));
    }
}
