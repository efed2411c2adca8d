//! The trace/event emitter (spec §4.7): an immediate, structured
//! observability channel distinct from `tracing`-style logging. Grounded on
//! the teacher's `events::RuntimeEvent` (an append-only, sequence-numbered
//! enum) but split into two channels sharing one sequence space, per spec:
//! `WorkflowEvent` (business milestones) and `TraceEvent` (operation
//! detail).

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::FailureCause;
use crate::types::DefId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventCategory {
    Decision,
    Operation,
    Dispatch,
    Sql,
}

/// Business-level milestones, emitted for decisions with an observable
/// outcome (spec §4.7).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum WorkflowEventKind {
    TokenCreated { token_id: Uuid, node_id: DefId },
    TokenDispatched { token_id: Uuid },
    TokenCompleted { token_id: Uuid },
    TokenFailed { token_id: Uuid, reason: String },
    TokenCancelled { token_id: Uuid },
    TokenTimedOut { token_id: Uuid },
    FanInActivated { sibling_group: String, winner_token_id: Uuid },
    FanInTimedOut { sibling_group: String },
    BranchMerged { sibling_group: String, target_path: String },
    WorkflowCompleted,
    WorkflowFailed { cause: FailureCause },
}

/// Operation-detail records, additionally emitted for instrumented
/// operations (spec §4.7); `duration_ms` is populated by the caller after
/// timing the operation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TraceEvent {
    pub sequence: u64,
    pub category: EventCategory,
    pub run_id: Uuid,
    pub token_id: Option<Uuid>,
    pub node_id: Option<DefId>,
    pub duration_ms: Option<u64>,
    pub payload: TraceEventPayload,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum TraceEventPayload {
    Workflow(WorkflowEventKind),
    Operation { name: String, detail: serde_json::Value },
    Sql { statement: String },
}

impl TraceEvent {
    pub fn workflow(sequence: u64, run_id: Uuid, kind: WorkflowEventKind) -> TraceEvent {
        TraceEvent {
            sequence,
            category: EventCategory::Decision,
            run_id,
            token_id: None,
            node_id: None,
            duration_ms: None,
            payload: TraceEventPayload::Workflow(kind),
        }
    }
}

// Sequence numbers (spec invariant 8: unique, strictly positive, monotonic
// per run) come from `RunStore::next_sequence`, not an in-process counter —
// a counter seeded at zero on every `Coordinator::new` would reset to zero
// on every restart of an existing run, the one case invariant 8 most needs
// to hold. See `Coordinator::emit_event`.
