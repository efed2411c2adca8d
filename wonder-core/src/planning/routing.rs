//! Routing planner (spec §4.5.1): decides which transitions fire out of a
//! just-completed token's node and how many tokens each spawns.

use serde_json::Value as JsonValue;

use crate::context::ContextSnapshot;
use crate::decision::{Decision, NewTokenSpec, PlanOutput};
use crate::error::{CoordinatorError, FailureCause};
use crate::planning::condition;
use crate::token::Token;
use crate::trace::WorkflowEventKind;
use crate::types::{DefId, SpawnSpec, Transition, WorkflowDef};

/// One transition's resolved spawn: the tokens it would create plus the
/// trace/event pair describing the selection.
#[derive(Debug)]
pub struct RoutingPlan {
    pub output: PlanOutput,
    /// Newly spawned tokens, grouped by the transition that produced them —
    /// needed by the caller to know which spawns share a sibling group for
    /// the synchronization planner to follow up on.
    pub spawned_by_transition: Vec<(DefId, Vec<NewTokenSpec>)>,
}

/// Route a completed token: evaluate `outgoing_tiers` in priority order,
/// select the first tier with at least one match, and emit `CREATE_TOKEN`
/// decisions for every spawn of every matched transition in that tier.
pub fn route(
    completed: &Token,
    def: &WorkflowDef,
    snapshot: &ContextSnapshot,
) -> Result<RoutingPlan, CoordinatorError> {
    let tiers = def.outgoing_tiers(&completed.node_id);
    let mut output = PlanOutput::default();
    let mut spawned_by_transition = Vec::new();

    for tier in tiers {
        let matches: Vec<&Transition> = tier
            .into_iter()
            .filter(|t| match &t.condition {
                None => true,
                Some(cond) => condition::evaluate(cond, snapshot),
            })
            .collect();
        if matches.is_empty() {
            continue;
        }
        for transition in matches {
            if let Some(guard) = &transition.loop_guard {
                let count = completed.iteration_counts.get(&transition.id.0).copied().unwrap_or(0);
                if count >= guard.max_iterations {
                    output.push(Decision::FailWorkflow {
                        cause: FailureCause::LoopLimitExceeded { transition_id: transition.id.0.clone() },
                    });
                    output.push_event(WorkflowEventKind::WorkflowFailed {
                        cause: FailureCause::LoopLimitExceeded { transition_id: transition.id.0.clone() },
                    });
                    return Ok(RoutingPlan { output, spawned_by_transition });
                }
            }
            let specs = spawn_specs(completed, transition, snapshot)?;
            if specs.len() > 1 {
                output.push(Decision::BatchCreateTokens(specs.clone()));
            } else if let Some(spec) = specs.first() {
                output.push(Decision::CreateToken(spec.clone()));
            }
            spawned_by_transition.push((transition.id.clone(), specs));
        }
        break;
    }
    Ok(RoutingPlan { output, spawned_by_transition })
}

fn spawn_specs(
    completed: &Token,
    transition: &Transition,
    snapshot: &ContextSnapshot,
) -> Result<Vec<NewTokenSpec>, CoordinatorError> {
    let spawn_count = match &transition.spawn {
        SpawnSpec::Singleton => 1,
        SpawnSpec::Static(n) => *n,
        SpawnSpec::Foreach { path, .. } => match snapshot.get(path) {
            Some(JsonValue::Array(items)) => items.len() as u32,
            _ => {
                return Err(CoordinatorError::Definition(format!(
                    "foreach spawn path \"{path}\" did not resolve to an array"
                )))
            }
        },
    };

    let mut iteration_counts = completed.iteration_counts.clone();
    if transition.loop_guard.is_some() {
        *iteration_counts.entry(transition.id.0.clone()).or_insert(0) += 1;
    }

    let mut specs = Vec::with_capacity(spawn_count as usize);
    for i in 0..spawn_count {
        let branch_index = if spawn_count > 1 { Some(i) } else { None };
        let path_id = completed.path_id.child(&transition.from_node, branch_index);
        specs.push(NewTokenSpec {
            node_id: transition.to_node.clone(),
            path_id,
            parent_token_id: Some(completed.id),
            sibling_group: transition.sibling_group.clone(),
            branch_index: i,
            branch_total: spawn_count,
            iteration_counts: iteration_counts.clone(),
        });
    }
    Ok(specs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::PathId;
    use crate::types::{CompareOp, Condition, Operand};
    use serde_json::json;
    use uuid::Uuid;

    fn token() -> Token {
        Token {
            id: Uuid::new_v4(),
            run_id: Uuid::new_v4(),
            node_id: DefId::from("a"),
            path_id: PathId::root(),
            parent_token_id: None,
            sibling_group: None,
            branch_index: 0,
            branch_total: 1,
            iteration_counts: Default::default(),
            status: crate::token::TokenStatus::Completed,
            arrived_at: 0,
            created_at: 0,
            updated_at: 0,
        }
    }

    fn def_with(transitions: Vec<Transition>) -> WorkflowDef {
        WorkflowDef {
            id: DefId::from("wf"),
            version: 1,
            input_schema: crate::schema::SchemaNode::Boolean,
            context_schema: crate::schema::SchemaNode::Boolean,
            output_schema: crate::schema::SchemaNode::Boolean,
            initial_node: DefId::from("a"),
            nodes: vec![],
            transitions,
        }
    }

    fn snapshot() -> ContextSnapshot {
        ContextSnapshot { input: json!({}), state: json!({"flag": true}), output: json!({}) }
    }

    #[test]
    fn first_matching_tier_wins_and_lower_tiers_are_ignored() {
        let t_high = Transition {
            id: DefId::from("t1"),
            from_node: DefId::from("a"),
            to_node: DefId::from("b"),
            priority: 0,
            condition: Some(Condition::Comparison { left: Operand::Field("state.flag".to_string()), op: CompareOp::Eq, right: Operand::Literal(json!(true)) }),
            spawn: SpawnSpec::Singleton,
            sibling_group: None,
            synchronization: None,
            loop_guard: None,
        };
        let t_low = Transition {
            id: DefId::from("t2"),
            from_node: DefId::from("a"),
            to_node: DefId::from("c"),
            priority: 1,
            condition: None,
            spawn: SpawnSpec::Singleton,
            sibling_group: None,
            synchronization: None,
            loop_guard: None,
        };
        let plan = route(&token(), &def_with(vec![t_high, t_low]), &snapshot()).unwrap();
        assert_eq!(plan.output.decisions.len(), 1);
        assert!(matches!(&plan.output.decisions[0], Decision::CreateToken(spec) if spec.node_id == DefId::from("b")));
    }

    #[test]
    fn static_fan_out_spawns_branch_indexed_tokens() {
        let t = Transition {
            id: DefId::from("t1"),
            from_node: DefId::from("a"),
            to_node: DefId::from("b"),
            priority: 0,
            condition: None,
            spawn: SpawnSpec::Static(3),
            sibling_group: Some("G".to_string()),
            synchronization: None,
            loop_guard: None,
        };
        let plan = route(&token(), &def_with(vec![t]), &snapshot()).unwrap();
        let Decision::BatchCreateTokens(specs) = &plan.output.decisions[0] else {
            panic!("expected batch create");
        };
        assert_eq!(specs.len(), 3);
        assert_eq!(specs[2].branch_index, 2);
        assert_eq!(specs[2].path_id.0, "root.a.2");
        assert!(specs.iter().all(|s| s.sibling_group.as_deref() == Some("G")));
    }

    #[test]
    fn singleton_spawn_still_carries_its_declared_sibling_group() {
        // A transition can declare a sibling group with spawn count 1 (spec
        // §8 boundary behavior: sync activates on the first and only
        // completion) — the group must not be nulled out just because there
        // is nothing to fan out.
        let t = Transition {
            id: DefId::from("t1"),
            from_node: DefId::from("a"),
            to_node: DefId::from("b"),
            priority: 0,
            condition: None,
            spawn: SpawnSpec::Singleton,
            sibling_group: Some("G".to_string()),
            synchronization: None,
            loop_guard: None,
        };
        let plan = route(&token(), &def_with(vec![t]), &snapshot()).unwrap();
        let Decision::CreateToken(spec) = &plan.output.decisions[0] else {
            panic!("expected single create");
        };
        assert_eq!(spec.sibling_group.as_deref(), Some("G"));
    }

    #[test]
    fn foreach_spawn_count_follows_array_length() {
        let t = Transition {
            id: DefId::from("t1"),
            from_node: DefId::from("a"),
            to_node: DefId::from("b"),
            priority: 0,
            condition: None,
            spawn: SpawnSpec::Foreach { path: "state.flag".to_string(), item_var: "item".to_string() },
            sibling_group: None,
            synchronization: None,
            loop_guard: None,
        };
        let err = route(&token(), &def_with(vec![t]), &snapshot()).unwrap_err();
        assert!(matches!(err, CoordinatorError::Definition(_)));
    }

    #[test]
    fn no_matching_tier_produces_no_decisions() {
        let t = Transition {
            id: DefId::from("t1"),
            from_node: DefId::from("a"),
            to_node: DefId::from("b"),
            priority: 0,
            condition: Some(Condition::Exists { field: "state.nope".to_string() }),
            spawn: SpawnSpec::Singleton,
            sibling_group: None,
            synchronization: None,
            loop_guard: None,
        };
        let plan = route(&token(), &def_with(vec![t]), &snapshot()).unwrap();
        assert!(plan.output.decisions.is_empty());
    }
}
