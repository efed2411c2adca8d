//! Resources client (spec §6, load-only): fetches immutable, versioned
//! workflow and task definitions, cached for the run's lifetime. Grounded
//! on the teacher's `compiler` module boundary — the coordinator never
//! mutates a definition, only resolves and caches it.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::CoordinatorError;
use crate::types::{DefId, Task, WorkflowDef};

#[async_trait]
pub trait ResourcesClient: Send + Sync {
    async fn get_workflow_def(&self, id: &DefId, version: u32) -> Result<WorkflowDef, CoordinatorError>;
    async fn get_task(&self, id: &DefId, version: u32) -> Result<Task, CoordinatorError>;
}

/// Read-through cache over a `ResourcesClient`, shared safely across runs
/// (spec §5: "definition cache is read-only and shared safely across
/// runs"). One instance is held by the process, not per-run.
pub struct DefinitionCache {
    client: Arc<dyn ResourcesClient>,
    workflows: RwLock<HashMap<(DefId, u32), Arc<WorkflowDef>>>,
    tasks: RwLock<HashMap<(DefId, u32), Arc<Task>>>,
}

impl DefinitionCache {
    pub fn new(client: Arc<dyn ResourcesClient>) -> DefinitionCache {
        DefinitionCache {
            client,
            workflows: RwLock::new(HashMap::new()),
            tasks: RwLock::new(HashMap::new()),
        }
    }

    pub async fn workflow_def(&self, id: &DefId, version: u32) -> Result<Arc<WorkflowDef>, CoordinatorError> {
        let key = (id.clone(), version);
        if let Some(def) = self.workflows.read().await.get(&key) {
            return Ok(def.clone());
        }
        let def = self.client.get_workflow_def(id, version).await?;
        check_reachable_from_initial(&def)?;
        let def = Arc::new(def);
        self.workflows.write().await.insert(key, def.clone());
        Ok(def)
    }

    pub async fn task(&self, id: &DefId, version: u32) -> Result<Arc<Task>, CoordinatorError> {
        let key = (id.clone(), version);
        if let Some(task) = self.tasks.read().await.get(&key) {
            return Ok(task.clone());
        }
        let task = Arc::new(self.client.get_task(id, version).await?);
        self.tasks.write().await.insert(key, task.clone());
        Ok(task)
    }
}

/// Reject a definition with nodes `graph()` can't reach from
/// `initial_node` — a workflow that can never run them is a definition
/// error, not something the planner should discover by silently never
/// routing there. Checked once per cache miss rather than per dispatch.
fn check_reachable_from_initial(def: &WorkflowDef) -> Result<(), CoordinatorError> {
    if def.nodes.is_empty() {
        return Ok(());
    }
    let graph = def.graph();
    let Some(initial_idx) = graph.node_indices().find(|&i| graph[i] == def.initial_node) else {
        return Err(CoordinatorError::Definition(format!(
            "initial node {} is not declared in the workflow's node list",
            def.initial_node
        )));
    };

    let mut reachable = std::collections::HashSet::new();
    let mut bfs = petgraph::visit::Bfs::new(&graph, initial_idx);
    while let Some(i) = bfs.next(&graph) {
        reachable.insert(i);
    }

    let unreachable: Vec<String> =
        graph.node_indices().filter(|i| !reachable.contains(i)).map(|i| graph[i].0.clone()).collect();
    if unreachable.is_empty() {
        Ok(())
    } else {
        Err(CoordinatorError::Definition(format!(
            "nodes unreachable from initial node {}: {}",
            def.initial_node,
            unreachable.join(", ")
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::SchemaNode;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingClient {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ResourcesClient for CountingClient {
        async fn get_workflow_def(&self, id: &DefId, version: u32) -> Result<WorkflowDef, CoordinatorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(WorkflowDef {
                id: id.clone(),
                version,
                input_schema: SchemaNode::Boolean,
                context_schema: SchemaNode::Boolean,
                output_schema: SchemaNode::Boolean,
                initial_node: DefId::from("start"),
                nodes: vec![],
                transitions: vec![],
            })
        }

        async fn get_task(&self, id: &DefId, version: u32) -> Result<Task, CoordinatorError> {
            Ok(Task { id: id.clone(), version, input_schema: SchemaNode::Boolean, output_schema: SchemaNode::Boolean })
        }
    }

    #[tokio::test]
    async fn second_lookup_hits_cache() {
        let client = Arc::new(CountingClient { calls: AtomicUsize::new(0) });
        let cache = DefinitionCache::new(client.clone());
        let id = DefId::from("wf");
        cache.workflow_def(&id, 1).await.unwrap();
        cache.workflow_def(&id, 1).await.unwrap();
        assert_eq!(client.calls.load(Ordering::SeqCst), 1);
    }

    struct DisconnectedClient;

    #[async_trait]
    impl ResourcesClient for DisconnectedClient {
        async fn get_workflow_def(&self, id: &DefId, version: u32) -> Result<WorkflowDef, CoordinatorError> {
            Ok(WorkflowDef {
                id: id.clone(),
                version,
                input_schema: SchemaNode::Boolean,
                context_schema: SchemaNode::Boolean,
                output_schema: SchemaNode::Boolean,
                initial_node: DefId::from("start"),
                nodes: vec![
                    crate::types::Node {
                        id: DefId::from("start"),
                        task_id: DefId::from("t"),
                        task_version: 1,
                        input_mapping: Default::default(),
                        output_mapping: Default::default(),
                    },
                    crate::types::Node {
                        id: DefId::from("orphan"),
                        task_id: DefId::from("t"),
                        task_version: 1,
                        input_mapping: Default::default(),
                        output_mapping: Default::default(),
                    },
                ],
                transitions: vec![],
            })
        }

        async fn get_task(&self, id: &DefId, version: u32) -> Result<Task, CoordinatorError> {
            Ok(Task { id: id.clone(), version, input_schema: SchemaNode::Boolean, output_schema: SchemaNode::Boolean })
        }
    }

    #[tokio::test]
    async fn workflow_def_rejects_nodes_unreachable_from_the_initial_node() {
        let cache = DefinitionCache::new(Arc::new(DisconnectedClient));
        let err = cache.workflow_def(&DefId::from("wf"), 1).await.unwrap_err();
        assert!(matches!(err, CoordinatorError::Definition(msg) if msg.contains("orphan")));
    }
}
