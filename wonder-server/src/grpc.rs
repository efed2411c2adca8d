//! gRPC facade over the coordinator (spec §6 "external interfaces"): one
//! inbound service (`RunController`) serving `start`/`cancel`/`resume` and
//! the executor's completion callback, backed by a registry of one
//! `Coordinator` per live run — mirroring the teacher's single
//! `BpmnLiteEngine` facade, widened to the "one store per run" model §2
//! and §6 describe instead of the teacher's one-engine-many-instances
//! model.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tonic::{Request, Response, Status};
use uuid::Uuid;

use wonder_core::coordinator::Coordinator;
use wonder_core::definitions::DefinitionCache;
use wonder_core::executor::{ExecutorClient, ExecutorError};
use wonder_core::eventsink::EventSinkClient;
use wonder_core::store::RunStore;
use wonder_core::types::DefId;

#[allow(clippy::enum_variant_names)]
pub mod proto {
    tonic::include_proto!("wonder.v1");
}

use proto::run_controller_server::RunController;
use proto::*;

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[allow(clippy::result_large_err)]
fn parse_uuid(s: &str) -> Result<Uuid, Status> {
    Uuid::parse_str(s).map_err(|e| Status::invalid_argument(format!("invalid run/token id: {e}")))
}

#[allow(clippy::result_large_err)]
fn parse_json(s: &str) -> Result<serde_json::Value, Status> {
    if s.is_empty() {
        return Ok(serde_json::Value::Object(Default::default()));
    }
    serde_json::from_str(s).map_err(|e| Status::invalid_argument(format!("malformed JSON payload: {e}")))
}

fn coordinator_err(e: wonder_core::error::CoordinatorError) -> Status {
    Status::internal(format!("{e}"))
}

/// Constructs a fresh per-run `RunStore` (spec §10.5/§2: one relational
/// store per run, not a shared cluster-wide database). An in-memory store
/// by default; a SQLite file under `store_dir` when the `sqlite` feature
/// is enabled and a directory is configured.
pub trait StoreFactory: Send + Sync {
    fn create(&self, run_id: Uuid) -> Arc<dyn RunStore>;
}

pub struct MemoryStoreFactory;

impl StoreFactory for MemoryStoreFactory {
    fn create(&self, _run_id: Uuid) -> Arc<dyn RunStore> {
        Arc::new(wonder_core::store_memory::MemoryStore::new())
    }
}

/// Owns every run's `Coordinator` for the lifetime of the process. Runs
/// are looked up by id on every inbound RPC after `start` creates them;
/// nothing here is persisted across a process restart, matching the
/// teacher's in-process `BpmnLiteEngine` registry (there backed by its own
/// store, here by one store per run instead).
pub struct RunRegistry {
    definitions: Arc<DefinitionCache>,
    executor: Arc<dyn ExecutorClient>,
    event_sink: Arc<dyn EventSinkClient>,
    store_factory: Arc<dyn StoreFactory>,
    runs: Mutex<HashMap<Uuid, Arc<Coordinator>>>,
}

impl RunRegistry {
    pub fn new(
        definitions: Arc<DefinitionCache>,
        executor: Arc<dyn ExecutorClient>,
        event_sink: Arc<dyn EventSinkClient>,
        store_factory: Arc<dyn StoreFactory>,
    ) -> RunRegistry {
        RunRegistry { definitions, executor, event_sink, store_factory, runs: Mutex::new(HashMap::new()) }
    }

    async fn get(&self, run_id: Uuid) -> Result<Arc<Coordinator>, Status> {
        self.runs
            .lock()
            .await
            .get(&run_id)
            .cloned()
            .ok_or_else(|| Status::not_found(format!("no run {run_id}")))
    }
}

pub struct RunControllerService {
    pub registry: Arc<RunRegistry>,
}

#[tonic::async_trait]
impl RunController for RunControllerService {
    async fn start(&self, request: Request<StartRequest>) -> Result<Response<StartResponse>, Status> {
        let req = request.into_inner();
        let run_id = parse_uuid(&req.run_id)?;
        let input = parse_json(&req.input_json)?;

        let def_id = DefId(req.workflow_def_id.clone());
        let def = self
            .registry
            .definitions
            .workflow_def(&def_id, req.version)
            .await
            .map_err(coordinator_err)?;

        let store = self.registry.store_factory.create(run_id);
        let coordinator = Arc::new(Coordinator::new(
            run_id,
            req.workspace_id,
            req.project_id,
            store,
            def,
            self.registry.definitions.clone(),
            self.registry.executor.clone(),
            self.registry.event_sink.clone(),
        ));

        coordinator.start(input, now_ms()).await.map_err(coordinator_err)?;
        self.registry.runs.lock().await.insert(run_id, coordinator);
        Ok(Response::new(StartResponse {}))
    }

    async fn cancel(&self, request: Request<CancelRequest>) -> Result<Response<CancelResponse>, Status> {
        let req = request.into_inner();
        let run_id = parse_uuid(&req.run_id)?;
        let coordinator = self.registry.get(run_id).await?;
        coordinator.cancel(now_ms()).await.map_err(coordinator_err)?;
        Ok(Response::new(CancelResponse {}))
    }

    async fn resume(&self, request: Request<ResumeRequest>) -> Result<Response<ResumeResponse>, Status> {
        let req = request.into_inner();
        let run_id = parse_uuid(&req.run_id)?;
        let token_id = parse_uuid(&req.token_id)?;
        let output = parse_json(&req.output_json)?;
        let coordinator = self.registry.get(run_id).await?;
        coordinator.resume(token_id, output, now_ms()).await.map_err(coordinator_err)?;
        Ok(Response::new(ResumeResponse {}))
    }

    async fn complete_task(&self, request: Request<CompleteTaskRequest>) -> Result<Response<CompleteTaskResponse>, Status> {
        let req = request.into_inner();
        let run_id = parse_uuid(&req.run_id)?;
        let token_id = parse_uuid(&req.token_id)?;
        let output = parse_json(&req.output_json)?;
        let coordinator = self.registry.get(run_id).await?;
        coordinator.on_task_completed(token_id, output, now_ms()).await.map_err(coordinator_err)?;
        Ok(Response::new(CompleteTaskResponse {}))
    }

    async fn fail_task(&self, request: Request<FailTaskRequest>) -> Result<Response<FailTaskResponse>, Status> {
        let req = request.into_inner();
        let run_id = parse_uuid(&req.run_id)?;
        let token_id = parse_uuid(&req.token_id)?;
        let coordinator = self.registry.get(run_id).await?;
        let error = ExecutorError { kind: req.kind, message: req.message, retryable: req.retryable };
        coordinator.on_task_failed(token_id, error, now_ms()).await.map_err(coordinator_err)?;
        Ok(Response::new(FailTaskResponse {}))
    }
}
