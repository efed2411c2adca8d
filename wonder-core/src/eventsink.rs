//! Event sink client (spec §6, write-only): immediate, unbatched delivery
//! of every trace/workflow event. The sink owns persistence and
//! deduplication by id; the coordinator never retries a write it cannot
//! confirm, since a duplicate delivery is the sink's problem to absorb.

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::CoordinatorError;
use crate::trace::TraceEvent;

#[derive(Clone, Debug)]
pub struct EventEnvelope {
    pub id: Uuid,
    pub run_id: Uuid,
    pub workspace_id: String,
    pub project_id: String,
    pub timestamp_ms: i64,
    pub event: TraceEvent,
}

#[async_trait]
pub trait EventSinkClient: Send + Sync {
    async fn write(&self, envelope: EventEnvelope) -> Result<(), CoordinatorError>;
}

/// No-op sink for tests and embedded use without an observability backend.
pub struct NullEventSink;

#[async_trait]
impl EventSinkClient for NullEventSink {
    async fn write(&self, _envelope: EventEnvelope) -> Result<(), CoordinatorError> {
        Ok(())
    }
}
