//! Synchronization (fan-in) planner (spec §4.5.3). Called after a token is
//! created into a synchronized sibling group, and again after each sibling
//! terminates or a timeout tick fires for that group.

use uuid::Uuid;

use crate::decision::{Decision, PlanOutput};
use crate::error::FailureCause;
use crate::token::{SiblingCounts, TokenStatus};
use crate::trace::WorkflowEventKind;
use crate::types::{OnTimeout, SyncDescriptor, SyncStrategy};

/// Whether the sync condition is met yet, independent of timeout.
fn condition_met(strategy: &SyncStrategy, counts: &SiblingCounts) -> bool {
    match strategy {
        SyncStrategy::Any => counts.completed >= 1,
        SyncStrategy::All => counts.terminal >= counts.total,
        SyncStrategy::MOfN(m) => counts.completed >= *m,
    }
}

/// `now_ms` / `earliest_arrived_at_ms` let the caller drive timeout
/// detection without this function doing its own clock reads, keeping it
/// pure per spec §4.5's "no I/O" planning layer contract.
pub struct SyncCheck<'a> {
    pub sibling_group: &'a str,
    pub activator_token_id: Uuid,
    pub descriptor: &'a SyncDescriptor,
    pub counts: SiblingCounts,
    pub non_terminal_sibling_ids: Vec<Uuid>,
    pub timed_out: bool,
}

/// Decide whether this sibling-group event should attempt fan-in
/// activation now. Returns `None` if neither the strategy condition nor a
/// timeout has been reached — the caller keeps waiting.
pub fn evaluate(check: &SyncCheck) -> PlanOutput {
    let mut output = PlanOutput::default();
    let met = condition_met(&check.descriptor.strategy, &check.counts);

    if !met && !check.timed_out {
        return output;
    }

    if !met && check.timed_out {
        match check.descriptor.on_timeout {
            OnTimeout::Fail => {
                let cause = FailureCause::SynchronizationTimeout {
                    sibling_group: check.sibling_group.to_string(),
                };
                output.push(Decision::FailWorkflow { cause: cause.clone() });
                output.push_event(WorkflowEventKind::WorkflowFailed { cause });
                return output;
            }
            OnTimeout::ProceedWithAvailable => {
                // Fall through: activate with whatever completed so far.
            }
        }
    }

    output.push(Decision::TryActivateFanIn {
        sibling_group: check.sibling_group.to_string(),
        activator_token_id: check.activator_token_id,
    });

    if !check.timed_out {
        output.push_event(WorkflowEventKind::FanInActivated {
            sibling_group: check.sibling_group.to_string(),
            winner_token_id: check.activator_token_id,
        });
    } else {
        output.push_event(WorkflowEventKind::FanInTimedOut { sibling_group: check.sibling_group.to_string() });
    }

    // `all` cancels any stray non-terminal siblings defensively; `any` and
    // `m_of_n` explicitly leave the rest running (spec §4.5.3).
    if matches!(check.descriptor.strategy, SyncStrategy::All) && !check.non_terminal_sibling_ids.is_empty() {
        output.push(Decision::CancelTokens { token_ids: check.non_terminal_sibling_ids.clone() });
    }

    output
}

/// Tokens whose output counts toward a merge: `completed` only, regardless
/// of strategy (spec §4.5.3: "using only completed siblings").
pub fn mergeable_statuses() -> &'static [TokenStatus] {
    &[TokenStatus::Completed]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counts(total: u32, completed: u32, terminal: u32) -> SiblingCounts {
        SiblingCounts { total, completed, terminal, failed: 0, waiting: total - terminal, in_flight: total - terminal }
    }

    fn descriptor(strategy: SyncStrategy, on_timeout: OnTimeout) -> SyncDescriptor {
        SyncDescriptor { strategy, sibling_group: "G".to_string(), timeout_ms: Some(1000), on_timeout, merge: None }
    }

    #[test]
    fn any_activates_on_first_completion() {
        let d = descriptor(SyncStrategy::Any, OnTimeout::Fail);
        let check = SyncCheck {
            sibling_group: "G",
            activator_token_id: Uuid::new_v4(),
            descriptor: &d,
            counts: counts(3, 1, 1),
            non_terminal_sibling_ids: vec![],
            timed_out: false,
        };
        let out = evaluate(&check);
        assert!(matches!(out.decisions[0], Decision::TryActivateFanIn { .. }));
        assert!(!out.decisions.iter().any(|d| matches!(d, Decision::CancelTokens { .. })));
    }

    #[test]
    fn all_requires_full_termination_and_cancels_stragglers() {
        let d = descriptor(SyncStrategy::All, OnTimeout::Fail);
        let not_yet = SyncCheck {
            sibling_group: "G",
            activator_token_id: Uuid::new_v4(),
            descriptor: &d,
            counts: counts(3, 2, 2),
            non_terminal_sibling_ids: vec![Uuid::new_v4()],
            timed_out: false,
        };
        assert!(evaluate(&not_yet).decisions.is_empty());

        let straggler = Uuid::new_v4();
        let complete = SyncCheck {
            sibling_group: "G",
            activator_token_id: Uuid::new_v4(),
            descriptor: &d,
            counts: counts(3, 3, 3),
            non_terminal_sibling_ids: vec![straggler],
            timed_out: false,
        };
        let out = evaluate(&complete);
        assert!(out.decisions.iter().any(|d| matches!(d, Decision::CancelTokens { token_ids } if token_ids == &vec![straggler])));
    }

    #[test]
    fn m_of_n_activates_without_cancelling_remaining() {
        let d = descriptor(SyncStrategy::MOfN(2), OnTimeout::Fail);
        let check = SyncCheck {
            sibling_group: "G",
            activator_token_id: Uuid::new_v4(),
            descriptor: &d,
            counts: counts(5, 2, 2),
            non_terminal_sibling_ids: vec![Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4()],
            timed_out: false,
        };
        let out = evaluate(&check);
        assert!(out.decisions.iter().any(|d| matches!(d, Decision::TryActivateFanIn { .. })));
        assert!(!out.decisions.iter().any(|d| matches!(d, Decision::CancelTokens { .. })));
    }

    #[test]
    fn timeout_with_fail_emits_fail_workflow() {
        let d = descriptor(SyncStrategy::All, OnTimeout::Fail);
        let check = SyncCheck {
            sibling_group: "G",
            activator_token_id: Uuid::new_v4(),
            descriptor: &d,
            counts: counts(3, 1, 1),
            non_terminal_sibling_ids: vec![],
            timed_out: true,
        };
        let out = evaluate(&check);
        assert!(matches!(out.decisions[0], Decision::FailWorkflow { .. }));
    }

    #[test]
    fn timeout_with_proceed_with_available_activates_partial() {
        let d = descriptor(SyncStrategy::All, OnTimeout::ProceedWithAvailable);
        let check = SyncCheck {
            sibling_group: "G",
            activator_token_id: Uuid::new_v4(),
            descriptor: &d,
            counts: counts(3, 1, 1),
            non_terminal_sibling_ids: vec![],
            timed_out: true,
        };
        let out = evaluate(&check);
        assert!(matches!(out.decisions[0], Decision::TryActivateFanIn { .. }));
    }
}
