//! Value validation against a `SchemaNode`. Type coercion is never
//! performed (spec §4.1): a value either already matches the schema's type
//! or validation fails with the offending path.

use serde_json::Value as JsonValue;

use super::ir::SchemaNode;
use crate::error::CoordinatorError;

/// Validate `value` against `node`, reporting failures at `path` (the
/// dotted path of `node` within its root, for error messages — not used
/// for further resolution).
pub fn validate_value(
    node: &SchemaNode,
    value: &JsonValue,
    path: &str,
) -> Result<(), CoordinatorError> {
    match (node, value) {
        (SchemaNode::Boolean, JsonValue::Bool(_)) => Ok(()),
        (SchemaNode::Integer, JsonValue::Number(n)) if n.is_i64() || n.is_u64() => Ok(()),
        (SchemaNode::Number, JsonValue::Number(_)) => Ok(()),
        (SchemaNode::String { enum_values }, JsonValue::String(s)) => {
            if let Some(allowed) = enum_values {
                if !allowed.iter().any(|v| v == s) {
                    return Err(CoordinatorError::Validation {
                        path: path.to_string(),
                        reason: format!("\"{s}\" is not one of {allowed:?}"),
                    });
                }
            }
            Ok(())
        }
        (SchemaNode::Array { items }, JsonValue::Array(values)) => {
            for (i, v) in values.iter().enumerate() {
                validate_value(items, v, &format!("{path}.{i}"))?;
            }
            Ok(())
        }
        (SchemaNode::Object { properties, required }, JsonValue::Object(map)) => {
            for key in required {
                if !map.contains_key(key) {
                    return Err(CoordinatorError::Validation {
                        path: format!("{path}.{key}"),
                        reason: "required field is missing".to_string(),
                    });
                }
            }
            for (key, v) in map {
                let Some(prop_schema) = properties.get(key) else {
                    return Err(CoordinatorError::Validation {
                        path: format!("{path}.{key}"),
                        reason: "field is not declared in schema".to_string(),
                    });
                };
                let sub_path = if path.is_empty() {
                    key.clone()
                } else {
                    format!("{path}.{key}")
                };
                validate_value(prop_schema, v, &sub_path)?;
            }
            Ok(())
        }
        (SchemaNode::Object { .. }, JsonValue::Null)
        | (SchemaNode::Array { .. }, JsonValue::Null) => Ok(()),
        _ => Err(CoordinatorError::Validation {
            path: path.to_string(),
            reason: format!("value does not match schema type: {value}"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> SchemaNode {
        SchemaNode::from_json(&json!({
            "type": "object",
            "required": ["name"],
            "properties": {
                "name": {"type": "string"},
                "status": {"type": "string", "enum": ["open", "closed"]},
                "tags": {"type": "array", "items": {"type": "integer"}}
            }
        }))
        .unwrap()
    }

    #[test]
    fn accepts_valid_document() {
        let v = json!({"name": "x", "status": "open", "tags": [1, 2]});
        assert!(validate_value(&schema(), &v, "").is_ok());
    }

    #[test]
    fn rejects_missing_required_field() {
        let v = json!({"status": "open"});
        let err = validate_value(&schema(), &v, "").unwrap_err();
        assert!(matches!(err, CoordinatorError::Validation { path, .. } if path == "name"));
    }

    #[test]
    fn rejects_enum_violation() {
        let v = json!({"name": "x", "status": "pending"});
        let err = validate_value(&schema(), &v, "").unwrap_err();
        assert!(matches!(err, CoordinatorError::Validation { path, .. } if path == "status"));
    }

    #[test]
    fn rejects_wrong_array_item_type() {
        let v = json!({"name": "x", "tags": ["not-an-int"]});
        let err = validate_value(&schema(), &v, "").unwrap_err();
        assert!(matches!(err, CoordinatorError::Validation { path, .. } if path == "tags.0"));
    }

    #[test]
    fn no_type_coercion() {
        let v = json!({"name": 42});
        assert!(validate_value(&schema(), &v, "").is_err());
    }
}
