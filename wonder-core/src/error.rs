//! Error taxonomy (spec §7). `CoordinatorError` is what crosses a component
//! boundary; internal plumbing (SQL text assembly, path parsing) stays on
//! `anyhow::Result` and is folded into `Internal` at the boundary, the same
//! split the teacher draws between `anyhow` in `vm.rs`/`engine.rs` and the
//! structured `ErrorClass` enum at the job/executor boundary.

use thiserror::Error;

#[derive(Clone, Debug, Error)]
pub enum CoordinatorError {
    #[error("validation failed at {path}: {reason}")]
    Validation { path: String, reason: String },

    #[error("condition evaluation failed: {0}")]
    ConditionEvaluation(String),

    #[error("synchronization timeout for sibling group {sibling_group}")]
    SynchronizationTimeout { sibling_group: String },

    #[error("definition error: {0}")]
    Definition(String),

    #[error("loop limit exceeded on transition {transition_id} (max {max_iterations})")]
    LoopLimitExceeded {
        transition_id: String,
        max_iterations: u32,
    },

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<anyhow::Error> for CoordinatorError {
    fn from(e: anyhow::Error) -> Self {
        CoordinatorError::Internal(e.to_string())
    }
}

/// The cause attached to `workflow.failed` (spec §7 "user-visible
/// behavior"). Distinct from `CoordinatorError` because a `Cancelled` run
/// is not an error condition at all — it is a deliberate terminal outcome.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum FailureCause {
    Validation { path: String, reason: String },
    SynchronizationTimeout { sibling_group: String },
    LoopLimitExceeded { transition_id: String },
    Definition(String),
    Internal(String),
    Cancelled,
    /// No route in the graph handles a token's failure and the run has no
    /// other non-terminal tokens left.
    UnroutedTokenFailure { token_id: uuid::Uuid },
}

impl From<CoordinatorError> for FailureCause {
    fn from(e: CoordinatorError) -> Self {
        match e {
            CoordinatorError::Validation { path, reason } => {
                FailureCause::Validation { path, reason }
            }
            CoordinatorError::ConditionEvaluation(msg) => FailureCause::Internal(msg),
            CoordinatorError::SynchronizationTimeout { sibling_group } => {
                FailureCause::SynchronizationTimeout { sibling_group }
            }
            CoordinatorError::Definition(msg) => FailureCause::Definition(msg),
            CoordinatorError::LoopLimitExceeded { transition_id, .. } => {
                FailureCause::LoopLimitExceeded { transition_id }
            }
            CoordinatorError::Internal(msg) => FailureCause::Internal(msg),
        }
    }
}
