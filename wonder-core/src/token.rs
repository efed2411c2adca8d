//! Token: the unit of execution positioned at a node (spec §3 Token
//! entity). Grounded on the teacher's `Fiber`/`ProcessInstance` pairing,
//! collapsed into one record since the coordinator has no bytecode program
//! counter to track — a token's "position" is just its node id.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::DefId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TokenStatus {
    Pending,
    Dispatched,
    Executing,
    WaitingForSiblings,
    WaitingForSubworkflow,
    Completed,
    Failed,
    TimedOut,
    Cancelled,
}

impl TokenStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TokenStatus::Completed
                | TokenStatus::Failed
                | TokenStatus::TimedOut
                | TokenStatus::Cancelled
        )
    }

    pub fn is_successful_terminal(&self) -> bool {
        matches!(self, TokenStatus::Completed)
    }

    /// Statuses a token may hold on its way into `to` (spec §4.4 status
    /// transition table). Used by `TokenManager::update_status` as the
    /// `from` guard set for conditional transitions.
    pub fn allowed_predecessors(to: TokenStatus) -> &'static [TokenStatus] {
        use TokenStatus::*;
        match to {
            Dispatched => &[Pending],
            Executing => &[Dispatched],
            Completed | Failed | TimedOut => &[Executing, WaitingForSiblings],
            WaitingForSiblings => &[Pending, Dispatched, Executing],
            WaitingForSubworkflow => &[Pending, Dispatched, Executing],
            Cancelled => &[Pending, Dispatched, Executing, WaitingForSiblings, WaitingForSubworkflow],
            Pending => &[],
        }
    }
}

/// A token's ancestry-encoding path id: `root[.nodeId.branchIndex]*` (spec
/// invariant 3). Siblings share everything but the final `.branchIndex`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathId(pub String);

impl PathId {
    pub fn root() -> PathId {
        PathId("root".to_string())
    }

    /// Append one fan-out segment. `branch_index` is omitted for
    /// singleton spawns (spec §4.5.1 step 6).
    pub fn child(&self, node_id: &DefId, branch_index: Option<u32>) -> PathId {
        match branch_index {
            Some(i) => PathId(format!("{}.{}.{}", self.0, node_id, i)),
            None => PathId(format!("{}.{}", self.0, node_id)),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Token {
    pub id: Uuid,
    pub run_id: Uuid,
    pub node_id: DefId,
    pub path_id: PathId,
    pub parent_token_id: Option<Uuid>,
    pub sibling_group: Option<String>,
    pub branch_index: u32,
    pub branch_total: u32,
    pub iteration_counts: BTreeMap<String, u32>,
    pub status: TokenStatus,
    pub arrived_at: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Sibling counts by status class, as read by the synchronization planner
/// (spec §4.4 `getSiblingCounts`).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SiblingCounts {
    pub total: u32,
    pub completed: u32,
    pub failed: u32,
    pub terminal: u32,
    pub waiting: u32,
    pub in_flight: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_id_encodes_ancestry() {
        let root = PathId::root();
        let child = root.child(&DefId::from("fanout"), Some(2));
        assert_eq!(child.0, "root.fanout.2");
        let singleton = root.child(&DefId::from("linear"), None);
        assert_eq!(singleton.0, "root.linear");
    }

    #[test]
    fn terminal_classification() {
        assert!(TokenStatus::Completed.is_terminal());
        assert!(TokenStatus::Cancelled.is_terminal());
        assert!(!TokenStatus::Executing.is_terminal());
    }
}
