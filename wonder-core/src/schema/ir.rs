//! The schema intermediate representation: a minimal JSONSchema subset
//! sufficient to drive both DDL generation and value validation from a
//! single source of truth, per spec §4.1.
//!
//! A generic JSONSchema validator crate cannot also drive table layout (it
//! has no notion of "this nested object becomes a column-prefixed group,
//! this array becomes a child table"), so the two concerns share this one
//! hand-rolled tree instead of reaching for an external validator.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// A parsed schema node. `Object` and `Array` recurse; everything else is a
/// column-mappable scalar (spec §4.1 mapping rules).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum SchemaNode {
    Object {
        properties: BTreeMap<String, SchemaNode>,
        required: Vec<String>,
    },
    Array {
        items: Box<SchemaNode>,
    },
    String {
        #[serde(default)]
        enum_values: Option<Vec<String>>,
    },
    Integer,
    Number,
    Boolean,
}

impl SchemaNode {
    pub fn is_scalar(&self) -> bool {
        !matches!(self, SchemaNode::Object { .. } | SchemaNode::Array { .. })
    }

    /// Parse a JSONSchema document (the subset this component understands)
    /// into a `SchemaNode`. Unknown keywords are ignored rather than
    /// rejected — the coordinator only needs the shape, not full draft
    /// compliance.
    pub fn from_json(doc: &JsonValue) -> Result<SchemaNode, String> {
        let ty = doc
            .get("type")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| "schema node missing \"type\"".to_string())?;

        match ty {
            "object" => {
                let required: Vec<String> = doc
                    .get("required")
                    .and_then(JsonValue::as_array)
                    .map(|a| {
                        a.iter()
                            .filter_map(|v| v.as_str().map(str::to_string))
                            .collect()
                    })
                    .unwrap_or_default();
                let mut properties = BTreeMap::new();
                if let Some(props) = doc.get("properties").and_then(JsonValue::as_object) {
                    for (k, v) in props {
                        properties.insert(k.clone(), SchemaNode::from_json(v)?);
                    }
                }
                Ok(SchemaNode::Object {
                    properties,
                    required,
                })
            }
            "array" => {
                let items = doc
                    .get("items")
                    .ok_or_else(|| "array schema missing \"items\"".to_string())?;
                Ok(SchemaNode::Array {
                    items: Box::new(SchemaNode::from_json(items)?),
                })
            }
            "string" => {
                let enum_values = doc.get("enum").and_then(JsonValue::as_array).map(|a| {
                    a.iter()
                        .filter_map(|v| v.as_str().map(str::to_string))
                        .collect()
                });
                Ok(SchemaNode::String { enum_values })
            }
            "integer" => Ok(SchemaNode::Integer),
            "number" => Ok(SchemaNode::Number),
            "boolean" => Ok(SchemaNode::Boolean),
            other => Err(format!("unsupported schema type \"{other}\"")),
        }
    }

    /// Walk a dotted path (`metadata.timestamp`, `items.0.sku`) down the
    /// schema tree. Numeric segments index into `Array` item schemas
    /// (all array elements share one schema, so any numeral works).
    pub fn resolve<'a>(&'a self, path: &[&str]) -> Option<&'a SchemaNode> {
        match path.split_first() {
            None => Some(self),
            Some((head, rest)) => match self {
                SchemaNode::Object { properties, .. } => {
                    properties.get(*head).and_then(|p| p.resolve(rest))
                }
                SchemaNode::Array { items } => {
                    if head.parse::<usize>().is_ok() {
                        items.resolve(rest)
                    } else {
                        None
                    }
                }
                _ => None,
            },
        }
    }
}

pub fn split_path(path: &str) -> Vec<&str> {
    if path.is_empty() {
        Vec::new()
    } else {
        path.split('.').collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_nested_object_and_resolves_path() {
        let doc = json!({
            "type": "object",
            "required": ["name"],
            "properties": {
                "name": {"type": "string"},
                "metadata": {
                    "type": "object",
                    "properties": {
                        "timestamp": {"type": "integer"}
                    }
                },
                "tags": {"type": "array", "items": {"type": "string"}}
            }
        });
        let schema = SchemaNode::from_json(&doc).unwrap();
        assert!(matches!(
            schema.resolve(&["metadata", "timestamp"]),
            Some(SchemaNode::Integer)
        ));
        assert!(matches!(
            schema.resolve(&["tags", "0"]),
            Some(SchemaNode::String { .. })
        ));
        assert!(schema.resolve(&["missing"]).is_none());
    }

    #[test]
    fn rejects_unknown_type() {
        let doc = json!({"type": "wat"});
        assert!(SchemaNode::from_json(&doc).is_err());
    }
}
