//! Tonic-client implementations of the coordinator's three outbound
//! collaborator traits (spec §6): `ResourcesClient`, `ExecutorClient`,
//! `EventSinkClient`. Each wraps a generated gRPC client for its service
//! and translates between wire messages and `wonder_core` types. Tonic
//! clients are cheap to `Clone` (an `Arc`-backed channel handle), so each
//! call clones before borrowing mutably rather than holding a lock across
//! an await.

use async_trait::async_trait;
use tonic::transport::Channel;

use wonder_core::definitions::ResourcesClient;
use wonder_core::error::CoordinatorError;
use wonder_core::eventsink::{EventEnvelope, EventSinkClient};
use wonder_core::executor::{DispatchRequest, ExecutorClient};
use wonder_core::schema::SchemaNode;
use wonder_core::types::{DefId, Node, Task, Transition, WorkflowDef};

use crate::grpc::proto;

fn rpc_err(e: tonic::Status) -> CoordinatorError {
    CoordinatorError::Internal(format!("rpc failed: {e}"))
}

fn parse_schema(raw: &str) -> Result<SchemaNode, CoordinatorError> {
    let doc: serde_json::Value = serde_json::from_str(raw)
        .map_err(|e| CoordinatorError::Definition(format!("malformed schema JSON: {e}")))?;
    SchemaNode::from_json(&doc).map_err(CoordinatorError::Definition)
}

fn parse_required<T: serde::de::DeserializeOwned>(raw: &str, what: &str) -> Result<T, CoordinatorError> {
    serde_json::from_str(raw).map_err(|e| CoordinatorError::Definition(format!("malformed {what} JSON: {e}")))
}

fn parse_optional<T: serde::de::DeserializeOwned>(raw: &str, what: &str) -> Result<Option<T>, CoordinatorError> {
    if raw.is_empty() {
        return Ok(None);
    }
    serde_json::from_str(raw)
        .map(Some)
        .map_err(|e| CoordinatorError::Definition(format!("malformed {what} JSON: {e}")))
}

fn node_from_proto(p: proto::NodeProto) -> Node {
    Node {
        id: DefId(p.id),
        task_id: DefId(p.task_id),
        task_version: p.task_version,
        input_mapping: p.input_mapping.into_iter().collect(),
        output_mapping: p.output_mapping.into_iter().collect(),
    }
}

fn transition_from_proto(p: proto::TransitionProto) -> Result<Transition, CoordinatorError> {
    Ok(Transition {
        id: DefId(p.id),
        from_node: DefId(p.from_node),
        to_node: DefId(p.to_node),
        priority: p.priority,
        condition: parse_optional(&p.condition_json, "condition")?,
        spawn: parse_required(&p.spawn_json, "spawn")?,
        sibling_group: if p.sibling_group.is_empty() { None } else { Some(p.sibling_group) },
        synchronization: parse_optional(&p.synchronization_json, "synchronization")?,
        loop_guard: parse_optional(&p.loop_guard_json, "loop_guard")?,
    })
}

pub struct GrpcResourcesClient {
    client: proto::resources_client::ResourcesClient<Channel>,
}

impl GrpcResourcesClient {
    pub fn new(channel: Channel) -> GrpcResourcesClient {
        GrpcResourcesClient { client: proto::resources_client::ResourcesClient::new(channel) }
    }
}

#[async_trait]
impl ResourcesClient for GrpcResourcesClient {
    async fn get_workflow_def(&self, id: &DefId, version: u32) -> Result<WorkflowDef, CoordinatorError> {
        let req = proto::GetWorkflowDefRequest { id: id.0.clone(), version };
        let resp = self.client.clone().get_workflow_def(req).await.map_err(rpc_err)?.into_inner();

        let mut transitions = Vec::with_capacity(resp.transitions.len());
        for t in resp.transitions {
            transitions.push(transition_from_proto(t)?);
        }

        Ok(WorkflowDef {
            id: DefId(resp.id),
            version: resp.version,
            input_schema: parse_schema(&resp.input_schema_json)?,
            context_schema: parse_schema(&resp.context_schema_json)?,
            output_schema: parse_schema(&resp.output_schema_json)?,
            initial_node: DefId(resp.initial_node),
            nodes: resp.nodes.into_iter().map(node_from_proto).collect(),
            transitions,
        })
    }

    async fn get_task(&self, id: &DefId, version: u32) -> Result<Task, CoordinatorError> {
        let req = proto::GetTaskRequest { id: id.0.clone(), version };
        let resp = self.client.clone().get_task(req).await.map_err(rpc_err)?.into_inner();
        Ok(Task {
            id: DefId(resp.id),
            version: resp.version,
            input_schema: parse_schema(&resp.input_schema_json)?,
            output_schema: parse_schema(&resp.output_schema_json)?,
        })
    }
}

pub struct GrpcExecutorClient {
    client: proto::executor_client::ExecutorClient<Channel>,
}

impl GrpcExecutorClient {
    pub fn new(channel: Channel) -> GrpcExecutorClient {
        GrpcExecutorClient { client: proto::executor_client::ExecutorClient::new(channel) }
    }
}

#[async_trait]
impl ExecutorClient for GrpcExecutorClient {
    async fn dispatch(&self, request: DispatchRequest) -> Result<(), CoordinatorError> {
        let msg = proto::DispatchMsg {
            run_id: request.run_id.to_string(),
            token_id: request.token_id.to_string(),
            task_id: request.task_id.0,
            task_version: request.task_version,
            input_json: request.input.to_string(),
            correlation: request.correlation,
        };
        self.client.clone().dispatch(msg).await.map_err(rpc_err)?;
        Ok(())
    }
}

pub struct GrpcEventSinkClient {
    client: proto::event_sink_client::EventSinkClient<Channel>,
}

impl GrpcEventSinkClient {
    pub fn new(channel: Channel) -> GrpcEventSinkClient {
        GrpcEventSinkClient { client: proto::event_sink_client::EventSinkClient::new(channel) }
    }
}

#[async_trait]
impl EventSinkClient for GrpcEventSinkClient {
    async fn write(&self, envelope: EventEnvelope) -> Result<(), CoordinatorError> {
        let event_json = serde_json::to_string(&envelope.event)
            .map_err(|e| CoordinatorError::Internal(format!("failed to encode trace event: {e}")))?;
        let msg = proto::WriteEventRequest {
            id: envelope.id.to_string(),
            run_id: envelope.run_id.to_string(),
            workspace_id: envelope.workspace_id,
            project_id: envelope.project_id,
            timestamp_ms: envelope.timestamp_ms,
            event_json,
        };
        self.client.clone().write(msg).await.map_err(rpc_err)?;
        Ok(())
    }
}
