//! Dotted-path resolution against a `SchemaNode`, producing the table/column
//! (or child-table) location the DML layer reads or writes. Table and
//! column names here must agree exactly with `ddl::generate_tables`'s
//! naming, since both derive from the same flatten-prefix algorithm.

use super::ir::SchemaNode;
use crate::error::CoordinatorError;

#[derive(Clone, Debug)]
pub enum Located {
    /// A single scalar column.
    Scalar {
        table: String,
        column: String,
        node: SchemaNode,
    },
    /// An array: `table` is the child table itself, one row per element.
    Array { table: String, item_node: SchemaNode },
    /// An object (possibly the whole section): `table` holds its flattened
    /// scalar columns under `prefix`-prefixed names; nested arrays are
    /// reached via further resolution.
    Object {
        table: String,
        prefix: String,
        node: SchemaNode,
    },
}

pub fn resolve(schema: &SchemaNode, root_table: &str, path: &str) -> Result<Located, CoordinatorError> {
    let segments = super::ir::split_path(path);
    resolve_segments(schema, root_table, "", &segments)
}

fn resolve_segments(
    node: &SchemaNode,
    table: &str,
    prefix: &str,
    segments: &[&str],
) -> Result<Located, CoordinatorError> {
    if segments.is_empty() {
        return Ok(Located::Object {
            table: table.to_string(),
            prefix: prefix.to_string(),
            node: node.clone(),
        });
    }

    let SchemaNode::Object { properties, .. } = node else {
        return Err(CoordinatorError::Internal(format!(
            "cannot descend into non-object schema at table {table}, prefix {prefix}"
        )));
    };

    let (head, rest) = segments.split_first().expect("checked non-empty above");
    let prop = properties.get(*head).ok_or_else(|| CoordinatorError::Validation {
        path: join_prefix(prefix, head),
        reason: "field is not declared in schema".to_string(),
    })?;
    let new_prefix = join_prefix(prefix, head);

    match prop {
        SchemaNode::Object { .. } => resolve_segments(prop, table, &new_prefix, rest),
        SchemaNode::Array { items } => {
            let child_table = format!("{table}_{new_prefix}");
            if rest.is_empty() {
                Ok(Located::Array {
                    table: child_table,
                    item_node: (**items).clone(),
                })
            } else {
                resolve_segments(items, &child_table, "", rest)
            }
        }
        scalar => {
            if rest.is_empty() {
                Ok(Located::Scalar {
                    table: table.to_string(),
                    column: new_prefix,
                    node: scalar.clone(),
                })
            } else {
                Err(CoordinatorError::Internal(format!(
                    "cannot descend past scalar field \"{new_prefix}\""
                )))
            }
        }
    }
}

fn join_prefix(prefix: &str, head: &str) -> String {
    if prefix.is_empty() {
        head.to_string()
    } else {
        format!("{prefix}_{head}")
    }
}

/// Flattened scalar leaves of an object schema, for reconstructing a full
/// object from the columns of the one table its scalars live in. Does not
/// recurse into arrays (those are separate child tables — see
/// `array_fields`). Each entry is `(logical_key_path, column_name, node)`:
/// `logical_key_path` is the original nested JSON keys (for rebuilding the
/// value shape), `column_name` is the flattened, `_`-joined column the
/// value actually lives under (matching `ddl::generate_tables`).
pub fn scalar_leaves(node: &SchemaNode) -> Vec<(Vec<String>, String, SchemaNode)> {
    fn walk(
        node: &SchemaNode,
        logical: &[String],
        column_prefix: &str,
        out: &mut Vec<(Vec<String>, String, SchemaNode)>,
    ) {
        let SchemaNode::Object { properties, .. } = node else {
            return;
        };
        for (key, prop) in properties {
            let mut new_logical = logical.to_vec();
            new_logical.push(key.clone());
            let new_column_prefix = join_prefix(column_prefix, key);
            match prop {
                SchemaNode::Object { .. } => walk(prop, &new_logical, &new_column_prefix, out),
                SchemaNode::Array { .. } => {}
                scalar => out.push((new_logical, new_column_prefix, scalar.clone())),
            }
        }
    }
    let mut out = Vec::new();
    walk(node, &[], "", &mut out);
    out
}

/// Direct- and nested-object-level array fields of an object schema:
/// `(logical_key_path, child_table_column_suffix, item_node)`. The actual
/// child table name is `{owner_table}_{child_table_column_suffix}`.
pub fn array_fields(node: &SchemaNode) -> Vec<(Vec<String>, String, SchemaNode)> {
    fn walk(
        node: &SchemaNode,
        logical: &[String],
        column_prefix: &str,
        out: &mut Vec<(Vec<String>, String, SchemaNode)>,
    ) {
        let SchemaNode::Object { properties, .. } = node else {
            return;
        };
        for (key, prop) in properties {
            let mut new_logical = logical.to_vec();
            new_logical.push(key.clone());
            let new_column_prefix = join_prefix(column_prefix, key);
            match prop {
                SchemaNode::Object { .. } => walk(prop, &new_logical, &new_column_prefix, out),
                SchemaNode::Array { items } => {
                    out.push((new_logical, new_column_prefix, (**items).clone()))
                }
                _ => {}
            }
        }
    }
    let mut out = Vec::new();
    walk(node, &[], "", &mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> SchemaNode {
        SchemaNode::from_json(&json!({
            "type": "object",
            "properties": {
                "x": {"type": "integer"},
                "metadata": {
                    "type": "object",
                    "properties": {
                        "tags": {"type": "array", "items": {"type": "string"}},
                        "timestamp": {"type": "integer"}
                    }
                }
            }
        }))
        .unwrap()
    }

    #[test]
    fn resolves_top_level_scalar() {
        let loc = resolve(&schema(), "context_state", "x").unwrap();
        assert!(matches!(loc, Located::Scalar { table, column, .. } if table == "context_state" && column == "x"));
    }

    #[test]
    fn resolves_nested_scalar_with_flattened_column() {
        let loc = resolve(&schema(), "context_state", "metadata.timestamp").unwrap();
        assert!(
            matches!(loc, Located::Scalar { table, column, .. } if table == "context_state" && column == "metadata_timestamp")
        );
    }

    #[test]
    fn resolves_array_to_child_table_matching_ddl_naming() {
        let loc = resolve(&schema(), "context_state", "metadata.tags").unwrap();
        assert!(
            matches!(loc, Located::Array { table, .. } if table == "context_state_metadata_tags")
        );
    }

    #[test]
    fn unknown_field_is_validation_error() {
        let err = resolve(&schema(), "context_state", "nope").unwrap_err();
        assert!(matches!(err, CoordinatorError::Validation { .. }));
    }
}
