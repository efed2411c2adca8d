//! CREATE TABLE generation from a `SchemaNode`, per spec §4.1 mapping rules:
//! one table per object, `_`-flattened columns for nested objects, a child
//! table (with a `parent_rowid` foreign key) per array.

use super::ir::SchemaNode;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SqlType {
    Text,
    Integer,
    Real,
}

impl SqlType {
    pub fn as_sql(&self) -> &'static str {
        match self {
            SqlType::Text => "TEXT",
            SqlType::Integer => "INTEGER",
            SqlType::Real => "REAL",
        }
    }
}

#[derive(Clone, Debug)]
pub struct ColumnDef {
    pub name: String,
    pub sql_type: SqlType,
    pub not_null: bool,
    /// `CHECK (col IN (...))` values for string enums.
    pub check_in: Option<Vec<String>>,
}

#[derive(Clone, Debug)]
pub enum ParentLink {
    /// This table is a child table: rows reference a parent table's rowid.
    ChildOf { parent_table: String },
}

/// One generated table: the root table for an object schema, or a child
/// table for an array found somewhere under it.
#[derive(Clone, Debug)]
pub struct TableDef {
    pub name: String,
    pub columns: Vec<ColumnDef>,
    pub parent: Option<ParentLink>,
}

impl TableDef {
    pub fn create_sql(&self) -> String {
        let mut cols: Vec<String> = vec!["rowid_pk INTEGER PRIMARY KEY AUTOINCREMENT".to_string()];
        if let Some(ParentLink::ChildOf { .. }) = &self.parent {
            cols.push("parent_rowid INTEGER NOT NULL".to_string());
            cols.push("item_index INTEGER NOT NULL".to_string());
        }
        for c in &self.columns {
            let mut def = format!("{} {}", c.name, c.sql_type.as_sql());
            if c.not_null {
                def.push_str(" NOT NULL");
            }
            if let Some(values) = &c.check_in {
                let quoted: Vec<String> = values.iter().map(|v| format!("'{v}'")).collect();
                def.push_str(&format!(" CHECK ({} IN ({}))", c.name, quoted.join(", ")));
            }
            cols.push(def);
        }
        let fk = match &self.parent {
            Some(ParentLink::ChildOf { parent_table }) => format!(
                ", FOREIGN KEY (parent_rowid) REFERENCES {parent_table}(rowid_pk) ON DELETE CASCADE"
            ),
            None => String::new(),
        };
        format!(
            "CREATE TABLE IF NOT EXISTS {} ({}{})",
            self.name,
            cols.join(", "),
            fk
        )
    }
}

fn sql_type_for_scalar(node: &SchemaNode) -> SqlType {
    match node {
        SchemaNode::String { .. } => SqlType::Text,
        SchemaNode::Integer => SqlType::Integer,
        SchemaNode::Number => SqlType::Real,
        SchemaNode::Boolean => SqlType::Integer,
        SchemaNode::Object { .. } | SchemaNode::Array { .. } => {
            unreachable!("sql_type_for_scalar called on a non-scalar node")
        }
    }
}

/// Generate every table needed to store values conforming to `schema`
/// rooted at `root_table`. `schema` must be an `Object` (the spec requires
/// a section's schema to describe an object).
pub fn generate_tables(schema: &SchemaNode, root_table: &str) -> Vec<TableDef> {
    let mut tables = Vec::new();
    let root_columns = flatten_object(schema, root_table, "", &mut tables);
    tables.insert(
        0,
        TableDef {
            name: root_table.to_string(),
            columns: root_columns,
            parent: None,
        },
    );
    tables
}

/// Flattens an object's scalar and nested-object properties into columns on
/// the table currently being built (`owner_table`), recursing into arrays
/// as new child tables appended to `out`. Returns the columns for the
/// *current* table only.
fn flatten_object(
    node: &SchemaNode,
    owner_table: &str,
    prefix: &str,
    out: &mut Vec<TableDef>,
) -> Vec<ColumnDef> {
    let SchemaNode::Object {
        properties,
        required,
    } = node
    else {
        panic!("flatten_object called on a non-object schema node");
    };

    let mut columns = Vec::new();
    for (key, prop) in properties {
        let col_prefix = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}_{key}")
        };
        let is_required = required.contains(key);
        match prop {
            SchemaNode::Object { .. } => {
                columns.extend(flatten_object(prop, owner_table, &col_prefix, out));
            }
            SchemaNode::Array { items } => {
                let child_table_name = format!("{owner_table}_{col_prefix}");
                let child_columns = match items.as_ref() {
                    SchemaNode::Object { .. } => {
                        flatten_object(items, &child_table_name, "", out)
                    }
                    scalar => vec![ColumnDef {
                        name: "value".to_string(),
                        sql_type: sql_type_for_scalar(scalar),
                        not_null: false,
                        check_in: None,
                    }],
                };
                out.push(TableDef {
                    name: child_table_name,
                    columns: child_columns,
                    parent: Some(ParentLink::ChildOf {
                        parent_table: owner_table.to_string(),
                    }),
                });
            }
            scalar => {
                let check_in = match scalar {
                    SchemaNode::String {
                        enum_values: Some(values),
                    } => Some(values.clone()),
                    _ => None,
                };
                columns.push(ColumnDef {
                    name: col_prefix,
                    sql_type: sql_type_for_scalar(scalar),
                    not_null: is_required,
                    check_in,
                });
            }
        }
    }
    columns
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn flattens_nested_object_columns() {
        let schema = SchemaNode::from_json(&json!({
            "type": "object",
            "properties": {
                "value": {"type": "integer"},
                "metadata": {
                    "type": "object",
                    "properties": {"timestamp": {"type": "integer"}}
                }
            }
        }))
        .unwrap();
        let tables = generate_tables(&schema, "context_input");
        assert_eq!(tables.len(), 1);
        let names: Vec<&str> = tables[0].columns.iter().map(|c| c.name.as_str()).collect();
        assert!(names.contains(&"value"));
        assert!(names.contains(&"metadata_timestamp"));
    }

    #[test]
    fn array_of_scalars_becomes_child_table_with_fk() {
        let schema = SchemaNode::from_json(&json!({
            "type": "object",
            "properties": {"tags": {"type": "array", "items": {"type": "string"}}}
        }))
        .unwrap();
        let tables = generate_tables(&schema, "context_state");
        assert_eq!(tables.len(), 2);
        let child = &tables[1];
        assert_eq!(child.name, "context_state_tags");
        assert!(matches!(child.parent, Some(ParentLink::ChildOf { .. })));
        assert!(child.create_sql().contains("FOREIGN KEY"));
    }

    #[test]
    fn array_of_objects_recurses() {
        let schema = SchemaNode::from_json(&json!({
            "type": "object",
            "properties": {
                "items": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "sku": {"type": "string"},
                            "nested_tags": {"type": "array", "items": {"type": "integer"}}
                        }
                    }
                }
            }
        }))
        .unwrap();
        let tables = generate_tables(&schema, "context_output");
        // root + items + items.nested_tags
        assert_eq!(tables.len(), 3);
        assert_eq!(tables[1].name, "context_output_items");
        assert_eq!(tables[2].name, "context_output_items_nested_tags");
    }

    #[test]
    fn enum_becomes_check_constraint() {
        let schema = SchemaNode::from_json(&json!({
            "type": "object",
            "properties": {"status": {"type": "string", "enum": ["a", "b"]}}
        }))
        .unwrap();
        let tables = generate_tables(&schema, "t");
        let sql = tables[0].create_sql();
        assert!(sql.contains("CHECK (status IN ('a', 'b'))"));
    }
}
