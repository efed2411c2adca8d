//! Executor client (spec §6): coordinator-initiated dispatch RPC with a
//! callback-delivered result. The coordinator never blocks waiting for a
//! callback (spec §5 "suspension points") — `dispatch` only enqueues the
//! request; the result arrives later as an ordinary event re-serialized
//! through the same pipeline as any other.

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::error::CoordinatorError;
use crate::types::DefId;

#[derive(Clone, Debug)]
pub struct DispatchRequest {
    pub run_id: Uuid,
    pub token_id: Uuid,
    pub task_id: DefId,
    pub task_version: u32,
    pub input: JsonValue,
    pub correlation: String,
}

#[derive(Clone, Debug)]
pub struct ExecutorError {
    pub kind: String,
    pub message: String,
    pub retryable: bool,
}

#[derive(Clone, Debug)]
pub enum ExecutorResult {
    Success { output: JsonValue },
    Failure(ExecutorError),
}

#[derive(Clone, Debug)]
pub struct ExecutorCallback {
    pub run_id: Uuid,
    pub token_id: Uuid,
    pub result: ExecutorResult,
}

#[async_trait]
pub trait ExecutorClient: Send + Sync {
    /// Fire-and-forget from the coordinator's perspective: the call
    /// returns once the executor has accepted the request, not once the
    /// task has run. The coordinator is the sole authority on retries —
    /// `retryable` on a later `ExecutorResult::Failure` is advice only.
    async fn dispatch(&self, request: DispatchRequest) -> Result<(), CoordinatorError>;
}
