//! Dispatch (spec §4.6): the only place a `Decision` becomes a side
//! effect. Applies one event's decision batch against the owning
//! components, in order, and reports what happened so the coordinator can
//! drive deferred executor RPCs and emit trace events after the batch
//! lands. `RunStore::execute_batch`'s transactional guarantee is what
//! makes "apply this whole batch or none of it" true at the storage layer;
//! this struct is the non-transactional glue above it that decides what to
//! write to the store.

use std::sync::Arc;

use uuid::Uuid;

use crate::branch::BranchStore;
use crate::context::ContextManager;
use crate::decision::Decision;
use crate::definitions::DefinitionCache;
use crate::error::{CoordinatorError, FailureCause};
use crate::schema::ir::SchemaNode;
use crate::token::Token;
use crate::tokens_mgr::TokenManager;
use crate::trace::WorkflowEventKind;
use crate::types::WorkflowDef;

/// What a decision batch produced, for the coordinator to act on after
/// dispatch returns: tokens needing an executor RPC, and a terminal
/// outcome if the batch ended the run.
#[derive(Default)]
pub struct DispatchOutcome {
    pub workflow_events: Vec<WorkflowEventKind>,
    pub pending_dispatch: Vec<Uuid>,
    pub completed: bool,
    pub failed: Option<FailureCause>,
}

pub struct Dispatcher {
    pub run_id: Uuid,
    pub context: ContextManager,
    pub branches: BranchStore,
    pub tokens: TokenManager,
    pub def: Arc<WorkflowDef>,
    pub definitions: Arc<DefinitionCache>,
}

impl Dispatcher {
    pub async fn apply(&self, decisions: Vec<Decision>, now: i64) -> Result<DispatchOutcome, CoordinatorError> {
        let mut outcome = DispatchOutcome::default();
        for decision in decisions {
            self.apply_one(decision, now, &mut outcome).await?;
        }
        Ok(outcome)
    }

    async fn apply_one(&self, decision: Decision, now: i64, outcome: &mut DispatchOutcome) -> Result<(), CoordinatorError> {
        match decision {
            Decision::CreateToken(spec) => {
                let token = self.tokens.create(self.run_id, spec, now).await?;
                outcome.workflow_events.push(WorkflowEventKind::TokenCreated { token_id: token.id, node_id: token.node_id });
            }
            Decision::BatchCreateTokens(specs) => {
                let created = self.tokens.create_batch(self.run_id, specs, now).await?;
                for token in created {
                    outcome.workflow_events.push(WorkflowEventKind::TokenCreated { token_id: token.id, node_id: token.node_id });
                }
            }
            Decision::UpdateTokenStatus { token_id, from, to } => {
                self.tokens.update_status(token_id, &from, to).await?;
            }
            Decision::MarkWaiting { token_id } => {
                self.tokens.mark_waiting(token_id).await?;
            }
            Decision::MarkForDispatch { token_id } => {
                if self.tokens.mark_dispatched(token_id).await? {
                    outcome.workflow_events.push(WorkflowEventKind::TokenDispatched { token_id });
                    outcome.pending_dispatch.push(token_id);
                }
            }
            Decision::SetContext { section, path, value } => {
                let prefix = match section {
                    crate::decision::ContextSection::Input => "input",
                    crate::decision::ContextSection::State => "state",
                    crate::decision::ContextSection::Output => "output",
                };
                self.context.set_field(&format!("{prefix}.{path}"), value).await?;
            }
            Decision::ApplyOutputMapping { token_id, mapping, task_output } => {
                self.context.apply_output_mapping(&mapping, &task_output).await?;
                self.tokens.complete(token_id).await?;
                outcome.workflow_events.push(WorkflowEventKind::TokenCompleted { token_id });
            }
            Decision::InitBranchTable { token_id } => {
                let schema = self.task_output_schema_for(token_id).await?;
                self.branches.initialize_branch_table(token_id, &schema).await?;
            }
            Decision::ApplyBranchOutput { token_id, output } => {
                let schema = self.task_output_schema_for(token_id).await?;
                self.branches.apply_branch_output(token_id, &schema, &output).await?;
                self.tokens.complete(token_id).await?;
                outcome.workflow_events.push(WorkflowEventKind::TokenCompleted { token_id });
            }
            Decision::MergeBranches { sibling_group, token_ids, descriptor } => {
                let Some(&representative) = token_ids.first() else {
                    return Ok(());
                };
                let schema = self.task_output_schema_for(representative).await?;
                let indexed = self.branch_indices(&token_ids).await?;
                let outputs = self.branches.get_branch_outputs(&indexed, &schema).await?;
                let merged = self.branches.merge(outputs, &descriptor);
                self.context.set_field(&descriptor.target, merged).await?;
                outcome.workflow_events.push(WorkflowEventKind::BranchMerged { sibling_group, target_path: descriptor.target.clone() });
            }
            Decision::DropBranchTables { token_ids } => {
                if let Some(&representative) = token_ids.first() {
                    let schema = self.task_output_schema_for(representative).await?;
                    self.branches.drop_branch_tables(&token_ids, &schema).await?;
                }
            }
            Decision::TryActivateFanIn { sibling_group, activator_token_id } => {
                self.tokens.try_activate_fan_in(self.run_id, &sibling_group, activator_token_id).await?;
            }
            Decision::ActivateFanIn { continuation, .. } => {
                let token = self.tokens.create(self.run_id, continuation, now).await?;
                outcome.workflow_events.push(WorkflowEventKind::TokenCreated { token_id: token.id, node_id: token.node_id });
            }
            Decision::CancelTokens { token_ids } => {
                for token_id in token_ids {
                    if self.tokens.cancel(token_id).await? {
                        outcome.workflow_events.push(WorkflowEventKind::TokenCancelled { token_id });
                    }
                }
            }
            Decision::CompleteWorkflow => {
                outcome.completed = true;
            }
            Decision::FailWorkflow { cause } => {
                outcome.failed = Some(cause);
            }
        }
        Ok(())
    }

    async fn task_output_schema_for(&self, token_id: Uuid) -> Result<SchemaNode, CoordinatorError> {
        let token = self.token_or_err(token_id).await?;
        let node = self.def.node(&token.node_id).ok_or_else(|| {
            CoordinatorError::Definition(format!("token {token_id} references unknown node {}", token.node_id))
        })?;
        let task = self.definitions.task(&node.task_id, node.task_version).await?;
        Ok(task.output_schema.clone())
    }

    async fn token_or_err(&self, token_id: Uuid) -> Result<Token, CoordinatorError> {
        self.tokens
            .get(token_id)
            .await?
            .ok_or_else(|| CoordinatorError::Internal(format!("token {token_id} not found")))
    }

    async fn branch_indices(&self, token_ids: &[Uuid]) -> Result<Vec<(Uuid, u32)>, CoordinatorError> {
        let mut out = Vec::with_capacity(token_ids.len());
        for &id in token_ids {
            let token = self.token_or_err(id).await?;
            out.push((id, token.branch_index));
        }
        Ok(out)
    }
}
