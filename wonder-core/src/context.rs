//! Context manager (spec §4.2): owns the three generated context tables
//! for one run (`input`, `state`, `output`) and exposes typed, path-based
//! access plus read-only snapshots for pure planning functions.

use std::sync::Arc;

use serde_json::{Map as JsonMap, Value as JsonValue};
use uuid::Uuid;

use crate::decision::ContextSection;
use crate::error::CoordinatorError;
use crate::schema::{ddl, dml, ir::SchemaNode, path};
use crate::store::RunStore;

/// A deep, read-only copy of the three context sections — what planners
/// hold. Capturing one is a moment-in-time SELECT set (spec §4.1): cheap,
/// immutable, never a live handle back into the store.
#[derive(Clone, Debug, Default)]
pub struct ContextSnapshot {
    pub input: JsonValue,
    pub state: JsonValue,
    pub output: JsonValue,
}

impl ContextSnapshot {
    /// Resolve a fully-qualified path (`input.x`, `state.a.b`, `output.y`)
    /// against the snapshot. Missing fields evaluate to `None`, never an
    /// error (spec §4.5.2: conditions treat absent fields as absent, not
    /// as failures).
    pub fn get(&self, path: &str) -> Option<&JsonValue> {
        let (section, rest) = split_section(path).ok()?;
        let root = match section {
            ContextSection::Input => &self.input,
            ContextSection::State => &self.state,
            ContextSection::Output => &self.output,
        };
        if rest.is_empty() {
            return Some(root);
        }
        rest.split('.').try_fold(root, |acc, seg| match acc {
            JsonValue::Object(map) => map.get(seg),
            JsonValue::Array(items) => seg.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        })
    }
}

fn split_section(path: &str) -> Result<(ContextSection, &str), CoordinatorError> {
    let (head, rest) = path.split_once('.').unwrap_or((path, ""));
    let section = match head {
        "input" => ContextSection::Input,
        "state" => ContextSection::State,
        "output" => ContextSection::Output,
        other => {
            return Err(CoordinatorError::Validation {
                path: path.to_string(),
                reason: format!("unknown context section \"{other}\""),
            })
        }
    };
    Ok((section, rest))
}

pub struct ContextManager {
    run_id: Uuid,
    store: Arc<dyn RunStore>,
    input_schema: SchemaNode,
    state_schema: SchemaNode,
    output_schema: SchemaNode,
}

fn table_for(section: ContextSection) -> &'static str {
    match section {
        ContextSection::Input => "ctx_input",
        ContextSection::State => "ctx_state",
        ContextSection::Output => "ctx_output",
    }
}

impl ContextManager {
    pub fn new(
        run_id: Uuid,
        store: Arc<dyn RunStore>,
        input_schema: SchemaNode,
        state_schema: SchemaNode,
        output_schema: SchemaNode,
    ) -> ContextManager {
        ContextManager {
            run_id,
            store,
            input_schema,
            state_schema,
            output_schema,
        }
    }

    fn schema_for(&self, section: ContextSection) -> &SchemaNode {
        match section {
            ContextSection::Input => &self.input_schema,
            ContextSection::State => &self.state_schema,
            ContextSection::Output => &self.output_schema,
        }
    }

    /// Create the generated tables for all three sections and populate
    /// `input` (spec §4.2 `initialize`). `state`/`output` start empty.
    pub async fn initialize(&self, input: JsonValue) -> Result<(), CoordinatorError> {
        crate::schema::validate::validate_value(&self.input_schema, &input, "input")?;

        let mut statements = Vec::new();
        for (section, schema) in [
            (ContextSection::Input, &self.input_schema),
            (ContextSection::State, &self.state_schema),
            (ContextSection::Output, &self.output_schema),
        ] {
            for table in ddl::generate_tables(schema, table_for(section)) {
                statements.push(table.create_sql());
            }
        }
        self.store.execute_statements(&statements).await?;

        for section in [ContextSection::Input, ContextSection::State, ContextSection::Output] {
            self.store
                .execute_write(&dml::upsert_root_row(table_for(section)), vec![])
                .await?;
        }

        self.write_object(ContextSection::Input, &self.input_schema.clone(), "", &input)
            .await
    }

    pub async fn get(&self, full_path: &str) -> Result<JsonValue, CoordinatorError> {
        let (section, rest) = split_section(full_path)?;
        self.read_located(section, rest).await
    }

    pub async fn get_section(&self, section: ContextSection) -> Result<JsonValue, CoordinatorError> {
        self.read_located(section, "").await
    }

    pub async fn get_snapshot(&self) -> Result<ContextSnapshot, CoordinatorError> {
        Ok(ContextSnapshot {
            input: self.get_section(ContextSection::Input).await?,
            state: self.get_section(ContextSection::State).await?,
            output: self.get_section(ContextSection::Output).await?,
        })
    }

    /// Set a single field at a fully-qualified context path, validating
    /// against the owning section's schema first.
    pub async fn set_field(&self, full_path: &str, value: JsonValue) -> Result<(), CoordinatorError> {
        let (section, rest) = split_section(full_path)?;
        let schema = self.schema_for(section).clone();
        let located = path::resolve(&schema, table_for(section), rest)?;
        match located {
            path::Located::Scalar { table, column, node } => {
                crate::schema::validate::validate_value(&node, &value, full_path)?;
                self.store
                    .execute_write(
                        &dml::update_scalar_column(&table, &column),
                        vec![dml::scalar_to_bindable(&value)],
                    )
                    .await?;
                Ok(())
            }
            path::Located::Array { item_node, .. } => {
                let array_schema = SchemaNode::Array {
                    items: Box::new(item_node),
                };
                crate::schema::validate::validate_value(&array_schema, &value, full_path)?;
                self.write_object(section, &schema, rest, &value).await
            }
            path::Located::Object { node, .. } => {
                crate::schema::validate::validate_value(&node, &value, full_path)?;
                self.write_object(section, &schema, rest, &value).await
            }
        }
    }

    pub async fn replace_section(&self, section: ContextSection, data: JsonValue) -> Result<(), CoordinatorError> {
        let schema = self.schema_for(section).clone();
        crate::schema::validate::validate_value(&schema, &data, &format!("{section:?}"))?;
        self.write_object(section, &schema, "", &data).await
    }

    /// `applyOutputMapping` (spec §4.2): for each `contextPath -> taskPath`
    /// entry, read `taskOutput` at `taskPath` and write it to `contextPath`.
    pub async fn apply_output_mapping(
        &self,
        mapping: &std::collections::BTreeMap<String, String>,
        task_output: &JsonValue,
    ) -> Result<(), CoordinatorError> {
        for (context_path, task_path) in mapping {
            let value = get_dotted(task_output, task_path).cloned().unwrap_or(JsonValue::Null);
            self.set_field(context_path, value).await?;
        }
        Ok(())
    }

    // ── internal read/write machinery ──

    async fn read_located(&self, section: ContextSection, rest: &str) -> Result<JsonValue, CoordinatorError> {
        let schema = self.schema_for(section).clone();
        let table = table_for(section);
        let located = path::resolve(&schema, table, rest)?;
        match located {
            path::Located::Scalar { table, column, node } => {
                let rows = self
                    .store
                    .query_rows(&dml::select_scalar_column(&table, &column), vec![])
                    .await?;
                let raw = rows.into_iter().next().and_then(|mut r| r.pop()).unwrap_or(JsonValue::Null);
                Ok(coerce_from_storage(&node, raw))
            }
            path::Located::Array { table, item_node } => {
                self.read_array(&table, dml::ROOT_ROW_ID, &item_node).await
            }
            path::Located::Object { table, node, .. } => {
                self.read_object(&table, dml::ROOT_ROW_ID, &node).await
            }
        }
    }

    fn read_object<'a>(
        &'a self,
        table: &'a str,
        rowid: i64,
        node: &'a SchemaNode,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<JsonValue, CoordinatorError>> + Send + 'a>> {
        Box::pin(async move {
            let leaves = path::scalar_leaves(node);
            let mut out = JsonMap::new();
            if !leaves.is_empty() {
                let columns: Vec<String> = leaves.iter().map(|(_, col, _)| col.clone()).collect();
                let sql = if rowid == dml::ROOT_ROW_ID {
                    dml::select_scalar_columns(table, &columns)
                } else {
                    // Child-table row: same column projection, scoped by
                    // its own rowid rather than the singleton root row.
                    format!(
                        "SELECT {} FROM {table} WHERE rowid_pk = {rowid}",
                        columns.join(", ")
                    )
                };
                let rows = self.store.query_rows(&sql, vec![]).await?;
                if let Some(row) = rows.into_iter().next() {
                    for ((logical, _, leaf_node), raw) in leaves.iter().zip(row.into_iter()) {
                        set_nested(&mut out, logical, coerce_from_storage(leaf_node, raw));
                    }
                }
            }
            for (logical, column_suffix, item_node) in path::array_fields(node) {
                let child_table = format!("{table}_{column_suffix}");
                let value = self.read_array(&child_table, rowid, &item_node).await?;
                set_nested(&mut out, &logical, value);
            }
            Ok(JsonValue::Object(out))
        })
    }

    fn read_array<'a>(
        &'a self,
        child_table: &'a str,
        parent_rowid: i64,
        item_node: &'a SchemaNode,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<JsonValue, CoordinatorError>> + Send + 'a>> {
        Box::pin(async move {
            if item_node.is_scalar() {
                let sql = dml::select_child_rows(child_table, parent_rowid, &["value".to_string()]);
                let rows = self.store.query_rows(&sql, vec![]).await?;
                let values = rows
                    .into_iter()
                    .map(|r| coerce_from_storage(item_node, r[1].clone()))
                    .collect();
                Ok(JsonValue::Array(values))
            } else {
                let leaves = path::scalar_leaves(item_node);
                let columns: Vec<String> = leaves.iter().map(|(_, col, _)| col.clone()).collect();
                let sql = dml::select_child_rows(child_table, parent_rowid, &columns);
                let rows = self.store.query_rows(&sql, vec![]).await?;
                let mut out = Vec::with_capacity(rows.len());
                for row in rows {
                    let child_rowid = row[0].as_i64().unwrap_or(0);
                    let mut obj = JsonMap::new();
                    for ((logical, _, leaf_node), raw) in leaves.iter().zip(row.into_iter().skip(1)) {
                        set_nested(&mut obj, logical, coerce_from_storage(leaf_node, raw));
                    }
                    for (logical, column_suffix, nested_item_node) in path::array_fields(item_node) {
                        let grandchild_table = format!("{child_table}_{column_suffix}");
                        let value = self
                            .read_array(&grandchild_table, child_rowid, &nested_item_node)
                            .await?;
                        set_nested(&mut obj, &logical, value);
                    }
                    out.push(JsonValue::Object(obj));
                }
                Ok(JsonValue::Array(out))
            }
        })
    }

    /// Write `value` at `rest` within `section`, atomically replacing any
    /// array child tables it touches (spec §4.1: "array assignments replace
    /// the child table contents for that path atomically").
    async fn write_object(
        &self,
        section: ContextSection,
        schema: &SchemaNode,
        rest: &str,
        value: &JsonValue,
    ) -> Result<(), CoordinatorError> {
        let table = table_for(section);
        let located = path::resolve(schema, table, rest)?;
        match located {
            path::Located::Scalar { table, column, node } => {
                crate::schema::validate::validate_value(&node, value, rest)?;
                self.store
                    .execute_write(&dml::update_scalar_column(&table, &column), vec![dml::scalar_to_bindable(value)])
                    .await?;
            }
            path::Located::Object { table, node, .. } => {
                self.write_object_fields(&table, dml::ROOT_ROW_ID, &node, value).await?;
            }
            path::Located::Array { table, item_node } => {
                self.write_array(&table, dml::ROOT_ROW_ID, &item_node, value).await?;
            }
        }
        Ok(())
    }

    fn write_object_fields<'a>(
        &'a self,
        table: &'a str,
        rowid: i64,
        node: &'a SchemaNode,
        value: &'a JsonValue,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), CoordinatorError>> + Send + 'a>> {
        Box::pin(async move {
            let JsonValue::Object(map) = value else {
                return Err(CoordinatorError::Validation {
                    path: table.to_string(),
                    reason: "expected a JSON object".to_string(),
                });
            };
            for (logical, column, leaf_node) in path::scalar_leaves(node) {
                if let Some(v) = get_nested(map, &logical) {
                    crate::schema::validate::validate_value(&leaf_node, v, &column)?;
                    let sql = if rowid == dml::ROOT_ROW_ID {
                        dml::update_scalar_column(table, &column)
                    } else {
                        format!("UPDATE {table} SET {column} = ? WHERE rowid_pk = {rowid}")
                    };
                    self.store.execute_write(&sql, vec![dml::scalar_to_bindable(v)]).await?;
                }
            }
            for (logical, column_suffix, item_node) in path::array_fields(node) {
                let child_table = format!("{table}_{column_suffix}");
                let array_value = get_nested(map, &logical).cloned().unwrap_or(JsonValue::Array(vec![]));
                self.write_array(&child_table, rowid, &item_node, &array_value).await?;
            }
            Ok(())
        })
    }

    fn write_array<'a>(
        &'a self,
        child_table: &'a str,
        parent_rowid: i64,
        item_node: &'a SchemaNode,
        value: &'a JsonValue,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), CoordinatorError>> + Send + 'a>> {
        Box::pin(async move {
            let JsonValue::Array(items) = value else {
                return Err(CoordinatorError::Validation {
                    path: child_table.to_string(),
                    reason: "expected a JSON array".to_string(),
                });
            };
            self.store
                .execute_write(&dml::delete_child_rows(child_table, parent_rowid), vec![])
                .await?;

            if item_node.is_scalar() {
                let (sql, _) = dml::insert_child_row(child_table, &["value".to_string()]);
                for (idx, item) in items.iter().enumerate() {
                    crate::schema::validate::validate_value(item_node, item, &format!("{child_table}.{idx}"))?;
                    self.store
                        .execute_write(
                            &sql,
                            vec![
                                JsonValue::from(parent_rowid),
                                JsonValue::from(idx as i64),
                                dml::scalar_to_bindable(item),
                            ],
                        )
                        .await?;
                }
            } else {
                let leaves = path::scalar_leaves(item_node);
                let columns: Vec<String> = leaves.iter().map(|(_, col, _)| col.clone()).collect();
                let (sql, _) = dml::insert_child_row(child_table, &columns);
                for (idx, item) in items.iter().enumerate() {
                    crate::schema::validate::validate_value(item_node, item, &format!("{child_table}.{idx}"))?;
                    let JsonValue::Object(map) = item else {
                        return Err(CoordinatorError::Validation {
                            path: format!("{child_table}.{idx}"),
                            reason: "expected a JSON object".to_string(),
                        });
                    };
                    let mut params = vec![JsonValue::from(parent_rowid), JsonValue::from(idx as i64)];
                    for (logical, _, _) in &leaves {
                        params.push(dml::scalar_to_bindable(
                            &get_nested(map, logical).cloned().unwrap_or(JsonValue::Null),
                        ));
                    }
                    let new_rowid = self.store.execute_write(&sql, params).await?;
                    for (logical, column_suffix, nested_item_node) in path::array_fields(item_node) {
                        let grandchild_table = format!("{child_table}_{column_suffix}");
                        let nested_value = get_nested(map, &logical).cloned().unwrap_or(JsonValue::Array(vec![]));
                        self.write_array(&grandchild_table, new_rowid, &nested_item_node, &nested_value)
                            .await?;
                    }
                }
            }
            Ok(())
        })
    }
}

fn coerce_from_storage(node: &SchemaNode, raw: JsonValue) -> JsonValue {
    match (node, &raw) {
        (SchemaNode::Boolean, JsonValue::Number(n)) => {
            JsonValue::Bool(n.as_i64().map(|v| v != 0).unwrap_or(false))
        }
        _ => raw,
    }
}

fn set_nested(map: &mut JsonMap<String, JsonValue>, path: &[String], value: JsonValue) {
    match path.split_first() {
        None => {}
        Some((head, rest)) if rest.is_empty() => {
            map.insert(head.clone(), value);
        }
        Some((head, rest)) => {
            let entry = map
                .entry(head.clone())
                .or_insert_with(|| JsonValue::Object(JsonMap::new()));
            if let JsonValue::Object(inner) = entry {
                set_nested(inner, rest, value);
            }
        }
    }
}

fn get_nested<'a>(map: &'a JsonMap<String, JsonValue>, path: &[String]) -> Option<&'a JsonValue> {
    match path.split_first() {
        None => None,
        Some((head, rest)) if rest.is_empty() => map.get(head),
        Some((head, rest)) => match map.get(head) {
            Some(JsonValue::Object(inner)) => get_nested(inner, rest),
            _ => None,
        },
    }
}

fn get_dotted<'a>(value: &'a JsonValue, path: &str) -> Option<&'a JsonValue> {
    path.split('.').try_fold(value, |acc, seg| match acc {
        JsonValue::Object(map) => map.get(seg),
        JsonValue::Array(items) => seg.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store_memory::MemoryStore;
    use serde_json::json;

    fn schema(doc: JsonValue) -> SchemaNode {
        SchemaNode::from_json(&doc).unwrap()
    }

    fn manager() -> ContextManager {
        let store: Arc<dyn RunStore> = Arc::new(MemoryStore::new());
        ContextManager::new(
            Uuid::new_v4(),
            store,
            schema(json!({"type": "object", "properties": {"value": {"type": "integer"}}})),
            schema(json!({
                "type": "object",
                "properties": {
                    "x": {"type": "integer"},
                    "results": {"type": "array", "items": {"type": "object", "properties": {"v": {"type": "integer"}}}}
                }
            })),
            schema(json!({"type": "object", "properties": {"result": {"type": "integer"}}})),
        )
    }

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let ctx = manager();
        ctx.initialize(json!({"value": 42})).await.unwrap();
        assert_eq!(ctx.get("input.value").await.unwrap(), json!(42));
        ctx.set_field("state.x", json!(84)).await.unwrap();
        assert_eq!(ctx.get("state.x").await.unwrap(), json!(84));
    }

    #[tokio::test]
    async fn array_of_objects_round_trips_in_order() {
        let ctx = manager();
        ctx.initialize(json!({"value": 1})).await.unwrap();
        ctx.set_field(
            "state.results",
            json!([{"v": 0}, {"v": 1}, {"v": 2}]),
        )
        .await
        .unwrap();
        assert_eq!(
            ctx.get("state.results").await.unwrap(),
            json!([{"v": 0}, {"v": 1}, {"v": 2}])
        );
    }

    #[tokio::test]
    async fn apply_output_mapping_copies_task_output_into_context() {
        let ctx = manager();
        ctx.initialize(json!({"value": 1})).await.unwrap();
        let mut mapping = std::collections::BTreeMap::new();
        mapping.insert("state.x".to_string(), "doubled".to_string());
        ctx.apply_output_mapping(&mapping, &json!({"doubled": 84})).await.unwrap();
        assert_eq!(ctx.get("state.x").await.unwrap(), json!(84));
    }

    #[tokio::test]
    async fn snapshot_get_handles_missing_fields_as_absent() {
        let ctx = manager();
        ctx.initialize(json!({"value": 1})).await.unwrap();
        let snap = ctx.get_snapshot().await.unwrap();
        assert!(snap.get("state.nonexistent").is_none());
    }
}
