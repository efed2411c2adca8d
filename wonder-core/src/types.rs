//! Immutable definition types: WorkflowDef, Node, Transition, Task and the
//! descriptors that parameterize synchronization and merging.
//!
//! These mirror the BPMN IR in the teacher (`compiler::ir`) but describe a
//! declarative token graph rather than a bytecode program: there is no
//! lowering step, the graph itself is what the planner walks.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::schema::ir::SchemaNode;

/// Opaque, versioned identifier for a definition entity.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DefId(pub String);

impl std::fmt::Display for DefId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for DefId {
    fn from(s: &str) -> Self {
        DefId(s.to_string())
    }
}

/// Task (immutable, versioned). The coordinator only consumes the output
/// schema (branch tables, output validation) and the input schema (for
/// executor dispatch construction); the step list is an executor concern.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Task {
    pub id: DefId,
    pub version: u32,
    pub input_schema: SchemaNode,
    pub output_schema: SchemaNode,
}

/// A node references a task and carries mapping instructions. No branching
/// logic lives on the node; branching is entirely a property of outgoing
/// transitions.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Node {
    pub id: DefId,
    pub task_id: DefId,
    pub task_version: u32,
    /// Dotted context path -> task input key.
    pub input_mapping: BTreeMap<String, String>,
    /// Task output path -> dotted context path. Applied only to tokens whose
    /// arrival transition has no sibling group (linear tokens); fan-out
    /// tokens write to their branch table instead (see `MergeDescriptor`).
    pub output_mapping: BTreeMap<String, String>,
}

/// How many tokens a transition spawns.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum SpawnSpec {
    /// Exactly one token, no sibling group semantics implied by spawning
    /// alone (a sibling group is still possible if declared explicitly).
    Singleton,
    /// A fixed fan-out width, known at definition time.
    Static(u32),
    /// Fan-out width taken from the length of an array at a dotted context
    /// path, resolved against the snapshot at routing time.
    Foreach { path: String, item_var: String },
}

/// Fan-in strategy.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum SyncStrategy {
    Any,
    All,
    MOfN(u32),
}

/// What happens when a synchronization's timeout elapses before its
/// strategy condition is met.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum OnTimeout {
    ProceedWithAvailable,
    Fail,
}

impl Default for OnTimeout {
    fn default() -> Self {
        OnTimeout::Fail
    }
}

/// Where a merge reads its source value from. Only `_branch.output[.sub]`
/// is recognized; see spec §9 open question re: `*` in earlier drafts.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MergeSource {
    /// `None` means the merge reads the whole branch output; `Some(sub)`
    /// means it projects `sub` out of the branch output first.
    pub subpath: Option<String>,
}

impl MergeSource {
    pub fn parse(raw: &str) -> Option<MergeSource> {
        const PREFIX: &str = "_branch.output";
        if raw == PREFIX {
            return Some(MergeSource { subpath: None });
        }
        raw.strip_prefix("_branch.output.")
            .map(|rest| MergeSource {
                subpath: Some(rest.to_string()),
            })
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum MergeStrategy {
    Append,
    Collect,
    MergeObject,
    KeyedByBranch,
    LastWins,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MergeDescriptor {
    pub source: MergeSource,
    /// Dotted context path the merged value is written to.
    pub target: String,
    pub strategy: MergeStrategy,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyncDescriptor {
    pub strategy: SyncStrategy,
    pub sibling_group: String,
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub on_timeout: OnTimeout,
    pub merge: Option<MergeDescriptor>,
}

/// A loop guard attached to a transition. The coordinator tracks per-edge
/// iteration counts on the token and fails the run when the limit is hit
/// rather than doing static back-edge detection (see spec §9).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LoopDescriptor {
    pub max_iterations: u32,
}

/// Structured, data-only condition (spec §4.5.2). Never code; evaluated
/// purely against a context snapshot.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Condition {
    Comparison {
        left: Operand,
        op: CompareOp,
        right: Operand,
    },
    Exists {
        field: String,
    },
    InSet {
        field: String,
        values: Vec<JsonValue>,
    },
    ArrayLength {
        field: String,
        op: CompareOp,
        value: i64,
    },
    And(Vec<Condition>),
    Or(Vec<Condition>),
    Not(Box<Condition>),
    /// Escape hatch for an expression-language condition. The coordinator
    /// core does not implement an expression engine; `reads` declares the
    /// context paths the expression depends on so planning can still reason
    /// about purity, and evaluation is delegated to an injected evaluator.
    Expression { expr: String, reads: Vec<String> },
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum Operand {
    Field(String),
    Literal(JsonValue),
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Transition {
    pub id: DefId,
    pub from_node: DefId,
    pub to_node: DefId,
    /// Lower value = higher priority.
    pub priority: i32,
    pub condition: Option<Condition>,
    pub spawn: SpawnSpec,
    pub sibling_group: Option<String>,
    pub synchronization: Option<SyncDescriptor>,
    pub loop_guard: Option<LoopDescriptor>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkflowDef {
    pub id: DefId,
    pub version: u32,
    pub input_schema: SchemaNode,
    pub context_schema: SchemaNode,
    pub output_schema: SchemaNode,
    pub initial_node: DefId,
    pub nodes: Vec<Node>,
    pub transitions: Vec<Transition>,
}

impl WorkflowDef {
    pub fn node(&self, id: &DefId) -> Option<&Node> {
        self.nodes.iter().find(|n| &n.id == id)
    }

    /// Outgoing transitions for a node, grouped into ascending-priority
    /// tiers (tier 0 = highest priority). Transitions within a tier keep
    /// definition order, which is also the tie-break order (spec §4.5.1).
    pub fn outgoing_tiers(&self, node: &DefId) -> Vec<Vec<&Transition>> {
        let mut by_priority: BTreeMap<i32, Vec<&Transition>> = BTreeMap::new();
        for t in &self.transitions {
            if &t.from_node == node {
                by_priority.entry(t.priority).or_default().push(t);
            }
        }
        by_priority.into_values().collect()
    }

    /// Build a `petgraph` view of the definition graph. Used by
    /// `DefinitionCache` to reject unreachable nodes on load; not on the
    /// routing hot path, which walks `outgoing_tiers` directly against a
    /// single node.
    pub fn graph(&self) -> petgraph::graph::DiGraph<DefId, DefId> {
        let mut g = petgraph::graph::DiGraph::new();
        let mut idx = BTreeMap::new();
        for n in &self.nodes {
            idx.insert(n.id.clone(), g.add_node(n.id.clone()));
        }
        for t in &self.transitions {
            if let (Some(&from), Some(&to)) = (idx.get(&t.from_node), idx.get(&t.to_node)) {
                g.add_edge(from, to, t.id.clone());
            }
        }
        g
    }
}
