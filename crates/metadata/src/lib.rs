//! Control-database access layer for drover.
//!
//! This crate provides:
//! - `ControlDb`: typed CRUD over the control collections (backups,
//!   restores, locks, commands, config, log) on the cluster connection
//! - `CmdStream`: the tailable command consumer
//! - `NodeProbe`: role and replication introspection of the local node
//!   over a direct connection

pub mod error;
pub mod node;
pub mod repos;
pub mod store;

pub use error::{MetadataError, MetadataResult};
pub use node::{AuthInfo, AuthRole, AuthUser, NodeInfo, NodeProbe};
pub use repos::{CmdEnvelope, CmdStream, LogEntry, Severity};
pub use store::{ControlDb, Shard};
