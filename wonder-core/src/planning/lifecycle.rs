//! Completion/lifecycle planner (spec §4.5.4): decides whether a run is
//! done once no token remains non-terminal.

use crate::decision::{Decision, PlanOutput};
use crate::error::FailureCause;
use crate::token::{Token, TokenStatus};
use crate::trace::WorkflowEventKind;

/// Evaluate run completion given every token in the run. Returns `None` if
/// the run still has non-terminal tokens (caller should not invoke this
/// planner in that case; kept as a safety check rather than a precondition
/// panic, consistent with the planning layer never panicking on a
/// malformed-but-plausible call).
pub fn evaluate(all_tokens: &[Token]) -> PlanOutput {
    let mut output = PlanOutput::default();
    if all_tokens.iter().any(|t| !t.status.is_terminal()) {
        return output;
    }

    if let Some(failed) = all_tokens.iter().find(|t| t.status == TokenStatus::Failed) {
        let cause = FailureCause::UnroutedTokenFailure { token_id: failed.id };
        output.push(Decision::FailWorkflow { cause: cause.clone() });
        output.push_event(WorkflowEventKind::WorkflowFailed { cause });
        return output;
    }

    output.push(Decision::CompleteWorkflow);
    output.push_event(WorkflowEventKind::WorkflowCompleted);
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::PathId;
    use crate::types::DefId;
    use uuid::Uuid;

    fn token(status: TokenStatus) -> Token {
        Token {
            id: Uuid::new_v4(),
            run_id: Uuid::new_v4(),
            node_id: DefId::from("n"),
            path_id: PathId::root(),
            parent_token_id: None,
            sibling_group: None,
            branch_index: 0,
            branch_total: 1,
            iteration_counts: Default::default(),
            status,
            arrived_at: 0,
            created_at: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn still_running_tokens_produce_no_decision() {
        let tokens = vec![token(TokenStatus::Completed), token(TokenStatus::Executing)];
        assert!(evaluate(&tokens).decisions.is_empty());
    }

    #[test]
    fn all_completed_emits_complete_workflow() {
        let tokens = vec![token(TokenStatus::Completed), token(TokenStatus::Completed)];
        let out = evaluate(&tokens);
        assert!(matches!(out.decisions[0], Decision::CompleteWorkflow));
    }

    #[test]
    fn any_failed_emits_fail_workflow() {
        let tokens = vec![token(TokenStatus::Completed), token(TokenStatus::Failed)];
        let out = evaluate(&tokens);
        assert!(matches!(out.decisions[0], Decision::FailWorkflow { .. }));
    }
}
