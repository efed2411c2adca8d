//! The Coordinator (spec §2): a single-writer actor over one run's token
//! graph. Ties together the context manager, branch store, token manager,
//! pure planners, and dispatch into the "flow of control for one completed
//! task" loop — mirroring the teacher's `BpmnLiteEngine`, which plays the
//! same orchestrating role over a `Fiber`/bytecode program instead of a
//! token graph.
//!
//! Every public method here corresponds to one inbound event (spec §6
//! "to run controller"): `start`, a task completion or failure callback,
//! `cancel`, `resume`, and a synchronization timeout tick. Each call runs
//! to completion before the next is accepted — the single-threaded,
//! cooperative scheduling model (spec §5) — so no two events interleave
//! their effects on this run's tables.

use std::sync::Arc;

use serde_json::{Map as JsonMap, Value as JsonValue};
use uuid::Uuid;

use crate::branch::BranchStore;
use crate::context::ContextManager;
use crate::decision::{Decision, PlanOutput};
use crate::definitions::DefinitionCache;
use crate::dispatch::{DispatchOutcome, Dispatcher};
use crate::error::{CoordinatorError, FailureCause};
use crate::eventsink::{EventEnvelope, EventSinkClient};
use crate::executor::{DispatchRequest, ExecutorClient, ExecutorError};
use crate::planning::{lifecycle, routing, sync as sync_planner};
use crate::store::RunStore;
use crate::token::{Token, TokenStatus};
use crate::tokens_mgr::TokenManager;
use crate::trace::{TraceEvent, WorkflowEventKind};
use crate::types::{DefId, Node, WorkflowDef};

pub struct Coordinator {
    pub run_id: Uuid,
    workspace_id: String,
    project_id: String,
    def: Arc<WorkflowDef>,
    definitions: Arc<DefinitionCache>,
    executor: Arc<dyn ExecutorClient>,
    event_sink: Arc<dyn EventSinkClient>,
    dispatcher: Dispatcher,
}

impl Coordinator {
    pub fn new(
        run_id: Uuid,
        workspace_id: String,
        project_id: String,
        store: Arc<dyn RunStore>,
        def: Arc<WorkflowDef>,
        definitions: Arc<DefinitionCache>,
        executor: Arc<dyn ExecutorClient>,
        event_sink: Arc<dyn EventSinkClient>,
    ) -> Coordinator {
        let context = ContextManager::new(
            run_id,
            store.clone(),
            def.input_schema.clone(),
            def.context_schema.clone(),
            def.output_schema.clone(),
        );
        let dispatcher = Dispatcher {
            run_id,
            context,
            branches: BranchStore::new(store.clone()),
            tokens: TokenManager::new(store),
            def: def.clone(),
            definitions: definitions.clone(),
        };
        Coordinator {
            run_id,
            workspace_id,
            project_id,
            def,
            definitions,
            executor,
            event_sink,
            dispatcher,
        }
    }

    /// `start` (spec §6): initializes context from `input`, creates the
    /// initial token, and dispatches it.
    pub async fn start(&self, input: JsonValue, now: i64) -> Result<(), CoordinatorError> {
        self.dispatcher.context.initialize(input).await?;
        let spec = crate::decision::NewTokenSpec {
            node_id: self.def.initial_node.clone(),
            path_id: crate::token::PathId::root(),
            parent_token_id: None,
            sibling_group: None,
            branch_index: 0,
            branch_total: 1,
            iteration_counts: Default::default(),
        };
        let outcome = self.run_decisions(vec![Decision::CreateToken(spec)], now).await?;
        let created = outcome
            .workflow_events
            .iter()
            .find_map(|e| match e {
                WorkflowEventKind::TokenCreated { token_id, .. } => Some(*token_id),
                _ => None,
            })
            .ok_or_else(|| CoordinatorError::Internal("initial token was not created".to_string()))?;
        self.run_decisions(vec![Decision::MarkForDispatch { token_id: created }], now).await?;
        Ok(())
    }

    /// Executor callback with a successful result (spec §6).
    pub async fn on_task_completed(&self, token_id: Uuid, output: JsonValue, now: i64) -> Result<(), CoordinatorError> {
        let token = self.require_token(token_id).await?;
        let node = self.require_node(&token.node_id)?;

        let completion_decision = if token.sibling_group.is_some() {
            Decision::ApplyBranchOutput { token_id, output }
        } else {
            Decision::ApplyOutputMapping { token_id, mapping: node.output_mapping.clone(), task_output: output }
        };
        self.run_decisions(vec![completion_decision], now).await?;

        let completed = self.require_token(token_id).await?;
        if let Some(sibling_group) = completed.sibling_group.clone() {
            self.advance_sync(&completed, &sibling_group, false, now).await?;
        } else {
            self.advance_routing(&completed, now).await?;
        }
        self.check_lifecycle(now).await
    }

    /// Executor callback with a failed result (spec §6 / §7). A task
    /// failure on a token with no declared error route fails the run once
    /// no other tokens remain in flight (spec §4.5.4).
    pub async fn on_task_failed(&self, token_id: Uuid, error: ExecutorError, now: i64) -> Result<(), CoordinatorError> {
        let from = TokenStatus::allowed_predecessors(TokenStatus::Failed).to_vec();
        let won = self.dispatcher.tokens.update_status(token_id, &from, TokenStatus::Failed).await?;
        if won {
            self.emit_event(WorkflowEventKind::TokenFailed { token_id, reason: error.message }, now).await?;
        }
        self.check_lifecycle(now).await
    }

    /// Resume a token suspended at a human-gate-style node (spec §6):
    /// mechanically identical to a task completion callback.
    pub async fn resume(&self, token_id: Uuid, output: JsonValue, now: i64) -> Result<(), CoordinatorError> {
        self.on_task_completed(token_id, output, now).await
    }

    /// Explicit run cancellation (spec §5): cancels every non-terminal
    /// token and fails the run with cause `Cancelled`.
    pub async fn cancel(&self, now: i64) -> Result<(), CoordinatorError> {
        let active = self.dispatcher.tokens.active_tokens(self.run_id).await?;
        let token_ids: Vec<Uuid> = active.iter().map(|t| t.id).collect();
        if !token_ids.is_empty() {
            self.run_decisions(vec![Decision::CancelTokens { token_ids }], now).await?;
        }
        self.emit_event(WorkflowEventKind::WorkflowFailed { cause: FailureCause::Cancelled }, now).await
    }

    /// Synchronization timeout tick (spec §4.5.3, §5): re-evaluates one
    /// sibling group's sync condition with `timed_out = true`.
    pub async fn on_sync_timeout(&self, sibling_group: &str, now: i64) -> Result<(), CoordinatorError> {
        let siblings = self.dispatcher.tokens.tokens_by_sibling_group(self.run_id, sibling_group).await?;
        let Some(representative) = siblings.first().cloned() else {
            return Ok(());
        };
        self.advance_sync(&representative, sibling_group, true, now).await?;
        self.check_lifecycle(now).await
    }

    // ── internal control flow ──

    async fn advance_routing(&self, completed: &Token, now: i64) -> Result<(), CoordinatorError> {
        let snapshot = self.dispatcher.context.get_snapshot().await?;
        let plan = routing::route(completed, &self.def, &snapshot)?;
        if plan.output.decisions.is_empty() {
            return Ok(());
        }

        let outcome = self.run_plan(plan.output, now).await?;
        let created_ids: Vec<Uuid> = outcome
            .workflow_events
            .iter()
            .filter_map(|e| match e {
                WorkflowEventKind::TokenCreated { token_id, .. } => Some(*token_id),
                _ => None,
            })
            .collect();

        // Every freshly created token is immediately runnable: a fan-out
        // branch token first gets a branch table to write its output into,
        // then every created token (branch or linear) gets dispatched.
        for token_id in &created_ids {
            let token = self.require_token(*token_id).await?;
            if token.sibling_group.is_some() {
                self.run_decisions(vec![Decision::InitBranchTable { token_id: *token_id }], now).await?;
            }
            self.run_decisions(vec![Decision::MarkForDispatch { token_id: *token_id }], now).await?;
        }
        Ok(())
    }

    async fn advance_sync(&self, representative: &Token, sibling_group: &str, timed_out: bool, now: i64) -> Result<(), CoordinatorError> {
        let siblings = self.dispatcher.tokens.tokens_by_sibling_group(self.run_id, sibling_group).await?;
        let Some(node) = self.find_sync_origin(&siblings) else {
            return Ok(());
        };
        let Some(sync_descriptor) = node.synchronization.as_ref() else {
            return Ok(());
        };

        let counts = self.dispatcher.tokens.sibling_counts(self.run_id, sibling_group).await?;
        let non_terminal: Vec<Uuid> = siblings.iter().filter(|t| !t.status.is_terminal()).map(|t| t.id).collect();

        let check = sync_planner::SyncCheck {
            sibling_group,
            activator_token_id: representative.id,
            descriptor: sync_descriptor,
            counts,
            non_terminal_sibling_ids: non_terminal,
            timed_out,
        };
        let plan = sync_planner::evaluate(&check);
        if plan.decisions.is_empty() {
            return Ok(());
        }

        // `evaluate` re-derives the same decision from scratch on every
        // sibling completion once its condition is met (spec §4.5.3), so
        // "did the strategy condition fire" and "is this the call that
        // gets to create the continuation" are different questions. The
        // latter is answered by the store's first-insert-wins guard, not
        // by which event name the planner happened to attach — resolve it
        // directly rather than trusting `FanInActivated`/`FanInTimedOut`.
        let wants_activation = plan.decisions.iter().any(|d| matches!(d, Decision::TryActivateFanIn { .. }));
        let won = if wants_activation {
            self.dispatcher.tokens.try_activate_fan_in(self.run_id, sibling_group, representative.id).await?
        } else {
            false
        };

        let mut decisions = plan.decisions;
        decisions.retain(|d| !matches!(d, Decision::TryActivateFanIn { .. }));
        let workflow_events = plan
            .workflow_events
            .into_iter()
            .filter(|e| won || !matches!(e, WorkflowEventKind::FanInActivated { .. } | WorkflowEventKind::FanInTimedOut { .. }))
            .collect();
        self.run_plan(PlanOutput { decisions, workflow_events }, now).await?;
        if !won {
            return Ok(());
        }

        let completed_siblings: Vec<Uuid> =
            siblings.iter().filter(|t| t.status == TokenStatus::Completed).map(|t| t.id).collect();
        if let Some(merge) = &sync_descriptor.merge {
            self.run_decisions(
                vec![Decision::MergeBranches {
                    sibling_group: sibling_group.to_string(),
                    token_ids: completed_siblings.clone(),
                    descriptor: merge.clone(),
                }],
                now,
            )
            .await?;
        }
        // Drop every sibling's branch table, not just the ones that happened
        // to be `Completed` at the instant fan-in activated — an `any`/
        // `m_of_n` winner or an `all` straggler still `Executing` at
        // activation time owns a table too, and it never completes again to
        // trigger a second drop once `try_activate_fan_in` has already been
        // won.
        let all_sibling_ids: Vec<Uuid> = siblings.iter().map(|t| t.id).collect();
        self.run_decisions(vec![Decision::DropBranchTables { token_ids: all_sibling_ids }], now).await?;

        let continuation_spec = crate::decision::NewTokenSpec {
            node_id: node.to_node.clone(),
            path_id: representative.path_id.clone(),
            parent_token_id: Some(representative.id),
            sibling_group: None,
            branch_index: 0,
            branch_total: 1,
            iteration_counts: representative.iteration_counts.clone(),
        };
        let continuation_outcome = self
            .run_decisions(
                vec![Decision::ActivateFanIn { sibling_group: sibling_group.to_string(), continuation: continuation_spec }],
                now,
            )
            .await?;
        let continuation_id = continuation_outcome.workflow_events.iter().find_map(|e| match e {
            WorkflowEventKind::TokenCreated { token_id, .. } => Some(*token_id),
            _ => None,
        });
        if let Some(id) = continuation_id {
            self.run_decisions(vec![Decision::MarkForDispatch { token_id: id }], now).await?;
        }
        Ok(())
    }

    /// The transition whose synchronization descriptor owns this sibling
    /// group, found by locating the transition that declared it — its
    /// `to_node` is the continuation's target (spec §4.5.3).
    fn find_sync_origin(&self, siblings: &[Token]) -> Option<&crate::types::Transition> {
        let sibling_group = siblings.first()?.sibling_group.clone()?;
        self.def
            .transitions
            .iter()
            .find(|t| t.sibling_group.as_deref() == Some(sibling_group.as_str()))
    }

    async fn check_lifecycle(&self, now: i64) -> Result<(), CoordinatorError> {
        let all = self.dispatcher.tokens.all_tokens(self.run_id).await?;
        let plan = lifecycle::evaluate(&all);
        if plan.decisions.is_empty() {
            return Ok(());
        }
        self.run_plan(plan, now).await?;
        Ok(())
    }

    /// Apply a planner's output: run its decisions through dispatch, then
    /// emit the planner's own semantic events (fan-in activation, timeout,
    /// completion, failure) alongside whatever events dispatch itself
    /// produced, and finally fire any deferred executor dispatches.
    async fn run_plan(&self, plan: PlanOutput, now: i64) -> Result<DispatchOutcome, CoordinatorError> {
        let outcome = self.dispatcher.apply(plan.decisions, now).await?;
        for event in plan.workflow_events {
            self.emit_event(event, now).await?;
        }
        self.emit_dispatch_outcome(&outcome, now).await?;
        Ok(outcome)
    }

    /// Apply a decision batch with no planner of its own (internal
    /// bookkeeping: token creation/dispatch, branch table lifecycle, merges)
    /// and emit whatever events dispatch produced for it.
    async fn run_decisions(&self, decisions: Vec<Decision>, now: i64) -> Result<DispatchOutcome, CoordinatorError> {
        let outcome = self.dispatcher.apply(decisions, now).await?;
        self.emit_dispatch_outcome(&outcome, now).await?;
        Ok(outcome)
    }

    async fn emit_dispatch_outcome(&self, outcome: &DispatchOutcome, now: i64) -> Result<(), CoordinatorError> {
        for event in &outcome.workflow_events {
            self.emit_event(event.clone(), now).await?;
        }
        for token_id in &outcome.pending_dispatch {
            self.dispatch_to_executor(*token_id).await?;
        }
        Ok(())
    }

    async fn dispatch_to_executor(&self, token_id: Uuid) -> Result<(), CoordinatorError> {
        let token = self.require_token(token_id).await?;
        let node = self.require_node(&token.node_id)?;
        let task = self.definitions.task(&node.task_id, node.task_version).await?;
        let snapshot = self.dispatcher.context.get_snapshot().await?;
        let input = build_task_input(node, &snapshot);
        self.executor
            .dispatch(DispatchRequest {
                run_id: self.run_id,
                token_id,
                task_id: task.id.clone(),
                task_version: task.version,
                input,
                correlation: format!("{}:{}", self.run_id, token_id),
            })
            .await
    }

    async fn emit_event(&self, kind: WorkflowEventKind, now: i64) -> Result<(), CoordinatorError> {
        let seq = self.dispatcher.tokens.next_sequence(self.run_id).await?;
        let event = TraceEvent::workflow(seq, self.run_id, kind);
        self.event_sink
            .write(EventEnvelope {
                id: Uuid::new_v4(),
                run_id: self.run_id,
                workspace_id: self.workspace_id.clone(),
                project_id: self.project_id.clone(),
                timestamp_ms: now,
                event,
            })
            .await
    }

    async fn require_token(&self, token_id: Uuid) -> Result<Token, CoordinatorError> {
        self.dispatcher
            .tokens
            .get(token_id)
            .await?
            .ok_or_else(|| CoordinatorError::Internal(format!("token {token_id} not found")))
    }

    fn require_node(&self, node_id: &DefId) -> Result<&Node, CoordinatorError> {
        self.def
            .node(node_id)
            .ok_or_else(|| CoordinatorError::Definition(format!("unknown node {node_id}")))
    }
}

/// Apply a node's `input_mapping` (context path -> task input key) against
/// a snapshot to build the task input object (spec §6 dispatch request).
fn build_task_input(node: &Node, snapshot: &crate::context::ContextSnapshot) -> JsonValue {
    let mut input = JsonMap::new();
    for (context_path, task_key) in &node.input_mapping {
        let value = snapshot.get(context_path).cloned().unwrap_or(JsonValue::Null);
        set_dotted(&mut input, task_key, value);
    }
    JsonValue::Object(input)
}

fn set_dotted(map: &mut JsonMap<String, JsonValue>, path: &str, value: JsonValue) {
    let mut segments = path.split('.').peekable();
    let mut current = map;
    while let Some(seg) = segments.next() {
        if segments.peek().is_none() {
            current.insert(seg.to_string(), value);
            return;
        }
        let entry = current.entry(seg.to_string()).or_insert_with(|| JsonValue::Object(JsonMap::new()));
        current = match entry {
            JsonValue::Object(inner) => inner,
            _ => return,
        };
    }
}
