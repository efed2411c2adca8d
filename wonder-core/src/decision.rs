//! Decisions: the declarative values planners return (spec §3, §4.5). No
//! planner touches the store directly; dispatch (`dispatch.rs`) is the only
//! place a `Decision` is interpreted as a side effect.

use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::error::FailureCause;
use crate::token::TokenStatus;
use crate::types::{DefId, MergeDescriptor};

#[derive(Clone, Debug)]
pub struct NewTokenSpec {
    pub node_id: DefId,
    pub path_id: crate::token::PathId,
    pub parent_token_id: Option<Uuid>,
    pub sibling_group: Option<String>,
    pub branch_index: u32,
    pub branch_total: u32,
    pub iteration_counts: std::collections::BTreeMap<String, u32>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContextSection {
    Input,
    State,
    Output,
}

#[derive(Clone, Debug)]
pub enum Decision {
    CreateToken(NewTokenSpec),
    BatchCreateTokens(Vec<NewTokenSpec>),
    UpdateTokenStatus {
        token_id: Uuid,
        from: Vec<TokenStatus>,
        to: TokenStatus,
    },
    MarkWaiting { token_id: Uuid },
    MarkForDispatch { token_id: Uuid },
    SetContext {
        section: ContextSection,
        path: String,
        value: JsonValue,
    },
    ApplyOutputMapping {
        token_id: Uuid,
        mapping: std::collections::BTreeMap<String, String>,
        task_output: JsonValue,
    },
    InitBranchTable { token_id: Uuid },
    ApplyBranchOutput { token_id: Uuid, output: JsonValue },
    MergeBranches {
        sibling_group: String,
        token_ids: Vec<Uuid>,
        descriptor: MergeDescriptor,
    },
    DropBranchTables { token_ids: Vec<Uuid> },
    TryActivateFanIn { sibling_group: String, activator_token_id: Uuid },
    ActivateFanIn {
        sibling_group: String,
        continuation: NewTokenSpec,
    },
    CancelTokens { token_ids: Vec<Uuid> },
    CompleteWorkflow,
    FailWorkflow { cause: FailureCause },
}

/// The return shape of every pure planner: a decision batch plus the trace
/// events to emit alongside it, in the order the planner wants them
/// observed (sequence numbers are assigned by dispatch, not here).
#[derive(Clone, Debug, Default)]
pub struct PlanOutput {
    pub decisions: Vec<Decision>,
    pub workflow_events: Vec<crate::trace::WorkflowEventKind>,
}

impl PlanOutput {
    pub fn merge(mut self, other: PlanOutput) -> PlanOutput {
        self.decisions.extend(other.decisions);
        self.workflow_events.extend(other.workflow_events);
        self
    }

    pub fn push(&mut self, decision: Decision) {
        self.decisions.push(decision);
    }

    pub fn push_event(&mut self, event: crate::trace::WorkflowEventKind) {
        self.workflow_events.push(event);
    }
}
