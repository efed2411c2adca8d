//! Structured condition evaluation (spec §4.5.2). Conditions are data, not
//! code; evaluation never touches the store and never fails — an absent
//! field just makes the condition false rather than erroring, so routing
//! can always make progress.

use serde_json::Value as JsonValue;

use crate::context::ContextSnapshot;
use crate::types::{CompareOp, Condition, Operand};

/// An optional expression evaluator for `Condition::Expression` (spec
/// §4.5.2's escape hatch). The coordinator core ships no expression
/// language of its own; callers that declare expression conditions must
/// supply one. Without an evaluator, expressions evaluate to `false`
/// rather than panicking, consistent with "missing fields are absent, not
/// errors".
pub trait ExpressionEvaluator {
    fn evaluate(&self, expr: &str, reads: &[String], snapshot: &ContextSnapshot) -> bool;
}

pub fn evaluate(condition: &Condition, snapshot: &ContextSnapshot) -> bool {
    evaluate_with(condition, snapshot, None)
}

pub fn evaluate_with(
    condition: &Condition,
    snapshot: &ContextSnapshot,
    expression_evaluator: Option<&dyn ExpressionEvaluator>,
) -> bool {
    match condition {
        Condition::Comparison { left, op, right } => {
            let (Some(l), Some(r)) = (resolve(left, snapshot), resolve(right, snapshot)) else {
                return false;
            };
            compare(&l, *op, &r)
        }
        Condition::Exists { field } => snapshot.get(field).is_some(),
        Condition::InSet { field, values } => match snapshot.get(field) {
            Some(v) => values.iter().any(|candidate| candidate == v),
            None => false,
        },
        Condition::ArrayLength { field, op, value } => match snapshot.get(field) {
            Some(JsonValue::Array(items)) => compare_i64(items.len() as i64, *op, *value),
            _ => false,
        },
        Condition::And(conditions) => conditions.iter().all(|c| evaluate_with(c, snapshot, expression_evaluator)),
        Condition::Or(conditions) => conditions.iter().any(|c| evaluate_with(c, snapshot, expression_evaluator)),
        Condition::Not(inner) => !evaluate_with(inner, snapshot, expression_evaluator),
        Condition::Expression { expr, reads } => expression_evaluator
            .map(|e| e.evaluate(expr, reads, snapshot))
            .unwrap_or(false),
    }
}

fn resolve(operand: &Operand, snapshot: &ContextSnapshot) -> Option<JsonValue> {
    match operand {
        Operand::Field(path) => snapshot.get(path).cloned(),
        Operand::Literal(v) => Some(v.clone()),
    }
}

fn compare(left: &JsonValue, op: CompareOp, right: &JsonValue) -> bool {
    if op == CompareOp::Eq {
        return left == right;
    }
    if op == CompareOp::Ne {
        return left != right;
    }
    match (left.as_f64(), right.as_f64()) {
        (Some(l), Some(r)) => compare_f64(l, op, r),
        _ => match (left.as_str(), right.as_str()) {
            (Some(l), Some(r)) => compare_str(l, op, r),
            _ => false,
        },
    }
}

fn compare_f64(l: f64, op: CompareOp, r: f64) -> bool {
    match op {
        CompareOp::Eq => l == r,
        CompareOp::Ne => l != r,
        CompareOp::Lt => l < r,
        CompareOp::Le => l <= r,
        CompareOp::Gt => l > r,
        CompareOp::Ge => l >= r,
    }
}

fn compare_str(l: &str, op: CompareOp, r: &str) -> bool {
    match op {
        CompareOp::Eq => l == r,
        CompareOp::Ne => l != r,
        CompareOp::Lt => l < r,
        CompareOp::Le => l <= r,
        CompareOp::Gt => l > r,
        CompareOp::Ge => l >= r,
    }
}

fn compare_i64(l: i64, op: CompareOp, r: i64) -> bool {
    match op {
        CompareOp::Eq => l == r,
        CompareOp::Ne => l != r,
        CompareOp::Lt => l < r,
        CompareOp::Le => l <= r,
        CompareOp::Gt => l > r,
        CompareOp::Ge => l >= r,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn snapshot() -> ContextSnapshot {
        ContextSnapshot {
            input: json!({}),
            state: json!({"score": 7, "tags": ["a", "b"], "status": "open"}),
            output: json!({}),
        }
    }

    #[test]
    fn comparison_with_absent_field_is_false() {
        let cond = Condition::Comparison {
            left: Operand::Field("state.missing".to_string()),
            op: CompareOp::Eq,
            right: Operand::Literal(json!(1)),
        };
        assert!(!evaluate(&cond, &snapshot()));
    }

    #[test]
    fn numeric_comparison_matches() {
        let cond = Condition::Comparison {
            left: Operand::Field("state.score".to_string()),
            op: CompareOp::Gt,
            right: Operand::Literal(json!(5)),
        };
        assert!(evaluate(&cond, &snapshot()));
    }

    #[test]
    fn exists_is_false_for_absent_field() {
        let cond = Condition::Exists { field: "state.nope".to_string() };
        assert!(!evaluate(&cond, &snapshot()));
    }

    #[test]
    fn in_set_checks_membership() {
        let cond = Condition::InSet { field: "state.status".to_string(), values: vec![json!("open"), json!("closed")] };
        assert!(evaluate(&cond, &snapshot()));
    }

    #[test]
    fn array_length_compares_count() {
        let cond = Condition::ArrayLength { field: "state.tags".to_string(), op: CompareOp::Eq, value: 2 };
        assert!(evaluate(&cond, &snapshot()));
    }

    #[test]
    fn and_or_not_compose() {
        let a = Condition::Exists { field: "state.score".to_string() };
        let b = Condition::Exists { field: "state.nope".to_string() };
        assert!(evaluate(&Condition::And(vec![a.clone()]), &snapshot()));
        assert!(!evaluate(&Condition::And(vec![a.clone(), b.clone()]), &snapshot()));
        assert!(evaluate(&Condition::Or(vec![a.clone(), b.clone()]), &snapshot()));
        assert!(evaluate(&Condition::Not(Box::new(b)), &snapshot()));
    }

    #[test]
    fn expression_without_evaluator_is_false() {
        let cond = Condition::Expression { expr: "state.score > 5".to_string(), reads: vec!["state.score".to_string()] };
        assert!(!evaluate(&cond, &snapshot()));
    }
}
