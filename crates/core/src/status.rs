//! Operation status state machine.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Status of a backup or restore, at replica-set and at cluster scope.
///
/// The happy path is monotone: Starting -> Running -> DumpDone -> Done.
/// Error and Cancelled are terminal and reachable from any non-terminal
/// state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Status {
    Starting,
    Running,
    DumpDone,
    Done,
    Cancelled,
    Error,
}

impl Status {
    /// Whether no further transitions are allowed out of this status.
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Done | Status::Cancelled | Status::Error)
    }

    /// The cluster coordinator drives every shard through these statuses,
    /// in order.
    pub const SEQUENCE: [Status; 4] =
        [Status::Starting, Status::Running, Status::DumpDone, Status::Done];
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::Starting => "starting",
            Status::Running => "running",
            Status::DumpDone => "dumpDone",
            Status::Done => "done",
            Status::Cancelled => "cancelled",
            Status::Error => "error",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(Status::Done.is_terminal());
        assert!(Status::Cancelled.is_terminal());
        assert!(Status::Error.is_terminal());
        assert!(!Status::Starting.is_terminal());
        assert!(!Status::Running.is_terminal());
        assert!(!Status::DumpDone.is_terminal());
    }

    #[test]
    fn sequence_ends_in_done() {
        assert_eq!(Status::SEQUENCE.first(), Some(&Status::Starting));
        assert_eq!(Status::SEQUENCE.last(), Some(&Status::Done));
        assert!(Status::SEQUENCE[..3].iter().all(|s| !s.is_terminal()));
    }

    #[test]
    fn serializes_as_camel_case() {
        let s = serde_json::to_string(&Status::DumpDone).unwrap();
        assert_eq!(s, "\"dumpDone\"");
        let back: Status = serde_json::from_str("\"cancelled\"").unwrap();
        assert_eq!(back, Status::Cancelled);
    }
}
