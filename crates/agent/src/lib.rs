//! Backup/restore agent for a replicated, optionally sharded MongoDB
//! deployment.
//!
//! One agent runs alongside every database node. Agents consume operator
//! commands from the capped command stream, elect a per-replica-set
//! coordinator through the lock collection, stream dump and oplog data
//! to or from object storage, and converge on a cluster-wide status via
//! metadata records stored in the database itself.

pub mod agent;
pub mod backup;
pub mod converge;
pub mod dump;
pub mod error;
pub mod heartbeat;
pub mod oplog;
pub mod pipeline;
pub mod restore;

pub use agent::Agent;
pub use error::{OpError, OpResult};

use drover_core::Tunables;
use drover_metadata::{ControlDb, NodeProbe};

/// Handles threaded through the agent loop and every worker; replaces any
/// process-global state.
pub struct AgentState {
    /// Cluster connection to the control database.
    pub db: ControlDb,
    /// Direct connection to the local node.
    pub node: NodeProbe,
    pub tunables: Tunables,
}
