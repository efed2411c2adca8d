//! Branch store (spec §4.3): one generated table set per token, holding
//! that branch's task output until its sibling group synchronizes. Tables
//! are created on fan-out and dropped once the merge into context lands.

use std::sync::Arc;

use serde_json::{Map as JsonMap, Value as JsonValue};
use uuid::Uuid;

use crate::error::CoordinatorError;
use crate::schema::{ddl, dml, ir::SchemaNode, path};
use crate::store::RunStore;
use crate::types::{MergeDescriptor, MergeSource, MergeStrategy};

/// A safe, deterministic per-token table name. Hyphens in a UUID's
/// canonical form aren't valid in an unquoted SQL identifier.
pub fn branch_table_name(token_id: Uuid) -> String {
    format!("branch_output_{}", token_id.simple())
}

pub struct BranchOutput {
    pub token_id: Uuid,
    pub branch_index: u32,
    pub output: JsonValue,
}

pub struct BranchStore {
    store: Arc<dyn RunStore>,
}

impl BranchStore {
    pub fn new(store: Arc<dyn RunStore>) -> BranchStore {
        BranchStore { store }
    }

    pub async fn initialize_branch_table(
        &self,
        token_id: Uuid,
        output_schema: &SchemaNode,
    ) -> Result<(), CoordinatorError> {
        let table = branch_table_name(token_id);
        let mut statements = Vec::new();
        for table_def in ddl::generate_tables(output_schema, &table) {
            statements.push(table_def.create_sql());
        }
        self.store.execute_statements(&statements).await?;
        self.store.execute_write(&dml::upsert_root_row(&table), vec![]).await?;
        Ok(())
    }

    pub async fn apply_branch_output(
        &self,
        token_id: Uuid,
        output_schema: &SchemaNode,
        output: &JsonValue,
    ) -> Result<(), CoordinatorError> {
        crate::schema::validate::validate_value(output_schema, output, "output")?;
        let table = branch_table_name(token_id);
        self.write_object(&table, output_schema, output).await
    }

    /// Reconstruct each named token's output from its branch table. Tokens
    /// that never produced a table (not yet completed, or never spawned)
    /// are simply absent from the result — callers filter by status
    /// upstream (spec §4.3: "returns entries only for completed tokens
    /// present").
    pub async fn get_branch_outputs(
        &self,
        token_branch_indices: &[(Uuid, u32)],
        output_schema: &SchemaNode,
    ) -> Result<Vec<BranchOutput>, CoordinatorError> {
        let mut out = Vec::new();
        for &(token_id, branch_index) in token_branch_indices {
            let table = branch_table_name(token_id);
            match self.read_object(&table, output_schema).await {
                Ok(output) => out.push(BranchOutput {
                    token_id,
                    branch_index,
                    output,
                }),
                Err(CoordinatorError::Internal(_)) => continue,
                Err(other) => return Err(other),
            }
        }
        Ok(out)
    }

    /// Merge sibling outputs per `descriptor` (spec §4.3 `mergeBranches`)
    /// and return the merged value — callers write it to context via
    /// `ContextManager::set_field`.
    pub fn merge(&self, mut outputs: Vec<BranchOutput>, descriptor: &MergeDescriptor) -> JsonValue {
        outputs.sort_by_key(|o| o.branch_index);
        let projected: Vec<JsonValue> = outputs
            .iter()
            .map(|o| project_source(&o.output, &descriptor.source))
            .collect();

        match descriptor.strategy {
            MergeStrategy::Append => {
                let all_arrays = !projected.is_empty() && projected.iter().all(|v| v.is_array());
                if all_arrays {
                    let mut flat = Vec::new();
                    for v in projected {
                        if let JsonValue::Array(items) = v {
                            flat.extend(items);
                        }
                    }
                    JsonValue::Array(flat)
                } else {
                    JsonValue::Array(projected)
                }
            }
            MergeStrategy::Collect => JsonValue::Array(projected),
            MergeStrategy::MergeObject => {
                let mut merged = JsonMap::new();
                for v in projected {
                    if let JsonValue::Object(map) = v {
                        for (k, v) in map {
                            merged.insert(k, v);
                        }
                    }
                }
                JsonValue::Object(merged)
            }
            MergeStrategy::KeyedByBranch => {
                let mut keyed = JsonMap::new();
                for (o, v) in outputs.iter().zip(projected) {
                    keyed.insert(o.branch_index.to_string(), v);
                }
                JsonValue::Object(keyed)
            }
            MergeStrategy::LastWins => projected.into_iter().last().unwrap_or(JsonValue::Null),
        }
    }

    pub async fn drop_branch_tables(
        &self,
        token_ids: &[Uuid],
        output_schema: &SchemaNode,
    ) -> Result<(), CoordinatorError> {
        let mut statements = Vec::new();
        for &token_id in token_ids {
            let table = branch_table_name(token_id);
            for table_def in ddl::generate_tables(output_schema, &table) {
                statements.push(dml::drop_table(&table_def.name));
            }
        }
        self.store.execute_statements(&statements).await
    }

    // ── internal read/write, same flatten-matching algorithm as ContextManager ──

    fn read_object<'a>(
        &'a self,
        table: &'a str,
        node: &'a SchemaNode,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<JsonValue, CoordinatorError>> + Send + 'a>> {
        Box::pin(async move {
            let leaves = path::scalar_leaves(node);
            let mut out = JsonMap::new();
            if !leaves.is_empty() {
                let columns: Vec<String> = leaves.iter().map(|(_, col, _)| col.clone()).collect();
                let rows = self
                    .store
                    .query_rows(&dml::select_scalar_columns(table, &columns), vec![])
                    .await?;
                let Some(row) = rows.into_iter().next() else {
                    return Err(CoordinatorError::Internal(format!("branch table {table} has no root row")));
                };
                for ((logical, _, leaf_node), raw) in leaves.iter().zip(row.into_iter()) {
                    set_nested(&mut out, logical, coerce_from_storage(leaf_node, raw));
                }
            }
            for (logical, column_suffix, item_node) in path::array_fields(node) {
                let child_table = format!("{table}_{column_suffix}");
                let value = self.read_array(&child_table, dml::ROOT_ROW_ID, &item_node).await?;
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
                let rows = self
                    .store
                    .query_rows(
                        &dml::select_child_rows(child_table, parent_rowid, &["value".to_string()]),
                        vec![],
                    )
                    .await?;
                Ok(JsonValue::Array(
                    rows.into_iter().map(|r| coerce_from_storage(item_node, r[1].clone())).collect(),
                ))
            } else {
                let leaves = path::scalar_leaves(item_node);
                let columns: Vec<String> = leaves.iter().map(|(_, col, _)| col.clone()).collect();
                let rows = self
                    .store
                    .query_rows(&dml::select_child_rows(child_table, parent_rowid, &columns), vec![])
                    .await?;
                let mut out = Vec::with_capacity(rows.len());
                for row in rows {
                    let child_rowid = row[0].as_i64().unwrap_or(0);
                    let mut obj = JsonMap::new();
                    for ((logical, _, leaf_node), raw) in leaves.iter().zip(row.into_iter().skip(1)) {
                        set_nested(&mut obj, logical, coerce_from_storage(leaf_node, raw));
                    }
                    for (logical, column_suffix, nested_item_node) in path::array_fields(item_node) {
                        let grandchild_table = format!("{child_table}_{column_suffix}");
                        let value = self.read_array(&grandchild_table, child_rowid, &nested_item_node).await?;
                        set_nested(&mut obj, &logical, value);
                    }
                    out.push(JsonValue::Object(obj));
                }
                Ok(JsonValue::Array(out))
            }
        })
    }

    fn write_object<'a>(
        &'a self,
        table: &'a str,
        node: &'a SchemaNode,
        value: &'a JsonValue,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), CoordinatorError>> + Send + 'a>> {
        Box::pin(async move {
            let JsonValue::Object(map) = value else {
                return Err(CoordinatorError::Internal(format!("expected object for {table}")));
            };
            for (logical, column, _) in path::scalar_leaves(node) {
                if let Some(v) = get_nested(map, &logical) {
                    self.store
                        .execute_write(&dml::update_scalar_column(table, &column), vec![dml::scalar_to_bindable(v)])
                        .await?;
                }
            }
            for (logical, column_suffix, item_node) in path::array_fields(node) {
                let child_table = format!("{table}_{column_suffix}");
                let array_value = get_nested(map, &logical).cloned().unwrap_or(JsonValue::Array(vec![]));
                self.write_array(&child_table, dml::ROOT_ROW_ID, &item_node, &array_value).await?;
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
                return Err(CoordinatorError::Internal(format!("expected array for {child_table}")));
            };
            self.store.execute_write(&dml::delete_child_rows(child_table, parent_rowid), vec![]).await?;
            if item_node.is_scalar() {
                let (sql, _) = dml::insert_child_row(child_table, &["value".to_string()]);
                for (idx, item) in items.iter().enumerate() {
                    self.store
                        .execute_write(
                            &sql,
                            vec![JsonValue::from(parent_rowid), JsonValue::from(idx as i64), dml::scalar_to_bindable(item)],
                        )
                        .await?;
                }
            } else {
                let leaves = path::scalar_leaves(item_node);
                let columns: Vec<String> = leaves.iter().map(|(_, col, _)| col.clone()).collect();
                let (sql, _) = dml::insert_child_row(child_table, &columns);
                for (idx, item) in items.iter().enumerate() {
                    let JsonValue::Object(map) = item else {
                        return Err(CoordinatorError::Internal(format!("expected object item in {child_table}")));
                    };
                    let mut params = vec![JsonValue::from(parent_rowid), JsonValue::from(idx as i64)];
                    for (logical, _, _) in &leaves {
                        params.push(dml::scalar_to_bindable(&get_nested(map, logical).cloned().unwrap_or(JsonValue::Null)));
                    }
                    let new_rowid = self.store.execute_write(&sql, params).await?;
                    for (logical, column_suffix, nested_item_node) in path::array_fields(item_node) {
                        let grandchild_table = format!("{child_table}_{column_suffix}");
                        let nested_value = get_nested(map, &logical).cloned().unwrap_or(JsonValue::Array(vec![]));
                        self.write_array(&grandchild_table, new_rowid, &nested_item_node, &nested_value).await?;
                    }
                }
            }
            Ok(())
        })
    }
}

fn project_source(output: &JsonValue, source: &MergeSource) -> JsonValue {
    match &source.subpath {
        None => output.clone(),
        Some(sub) => sub
            .split('.')
            .try_fold(output, |acc, seg| match acc {
                JsonValue::Object(map) => map.get(seg),
                JsonValue::Array(items) => seg.parse::<usize>().ok().and_then(|i| items.get(i)),
                _ => None,
            })
            .cloned()
            .unwrap_or(JsonValue::Null),
    }
}

fn coerce_from_storage(node: &SchemaNode, raw: JsonValue) -> JsonValue {
    match (node, &raw) {
        (SchemaNode::Boolean, JsonValue::Number(n)) => JsonValue::Bool(n.as_i64().map(|v| v != 0).unwrap_or(false)),
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
            let entry = map.entry(head.clone()).or_insert_with(|| JsonValue::Object(JsonMap::new()));
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store_memory::MemoryStore;
    use serde_json::json;

    fn schema() -> SchemaNode {
        SchemaNode::from_json(&json!({"type": "object", "properties": {"choice": {"type": "string"}}})).unwrap()
    }

    #[tokio::test]
    async fn branch_output_round_trips() {
        let store: Arc<dyn RunStore> = Arc::new(MemoryStore::new());
        let branches = BranchStore::new(store);
        let token = Uuid::new_v4();
        branches.initialize_branch_table(token, &schema()).await.unwrap();
        branches.apply_branch_output(token, &schema(), &json!({"choice": "a"})).await.unwrap();
        let out = branches.get_branch_outputs(&[(token, 0)], &schema()).await.unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].output, json!({"choice": "a"}));
    }

    #[tokio::test]
    async fn absent_tokens_are_silently_skipped() {
        let store: Arc<dyn RunStore> = Arc::new(MemoryStore::new());
        let branches = BranchStore::new(store);
        let out = branches.get_branch_outputs(&[(Uuid::new_v4(), 0)], &schema()).await.unwrap();
        assert!(out.is_empty());
    }

    fn outputs(vals: &[JsonValue]) -> Vec<BranchOutput> {
        vals.iter()
            .enumerate()
            .map(|(i, v)| BranchOutput { token_id: Uuid::new_v4(), branch_index: i as u32, output: v.clone() })
            .collect()
    }

    fn descriptor(strategy: MergeStrategy) -> MergeDescriptor {
        MergeDescriptor {
            source: MergeSource::parse("_branch.output").unwrap(),
            target: "state.results".to_string(),
            strategy,
        }
    }

    #[test]
    fn append_flattens_homogeneous_array_outputs() {
        let store: Arc<dyn RunStore> = Arc::new(MemoryStore::new());
        let branches = BranchStore::new(store);
        let outs = outputs(&[json!([1, 2]), json!([3, 4])]);
        let merged = branches.merge(outs, &descriptor(MergeStrategy::Append));
        assert_eq!(merged, json!([1, 2, 3, 4]));
    }

    #[test]
    fn append_does_not_flatten_heterogeneous_outputs() {
        let store: Arc<dyn RunStore> = Arc::new(MemoryStore::new());
        let branches = BranchStore::new(store);
        let outs = outputs(&[json!([1, 2]), json!(3)]);
        let merged = branches.merge(outs, &descriptor(MergeStrategy::Append));
        assert_eq!(merged, json!([[1, 2], 3]));
    }

    #[test]
    fn collect_never_flattens() {
        let store: Arc<dyn RunStore> = Arc::new(MemoryStore::new());
        let branches = BranchStore::new(store);
        let outs = outputs(&[json!([1, 2]), json!([3, 4])]);
        let merged = branches.merge(outs, &descriptor(MergeStrategy::Collect));
        assert_eq!(merged, json!([[1, 2], [3, 4]]));
    }

    #[test]
    fn keyed_by_branch_indexes_by_branch_number() {
        let store: Arc<dyn RunStore> = Arc::new(MemoryStore::new());
        let branches = BranchStore::new(store);
        let outs = outputs(&[json!("a"), json!("b")]);
        let merged = branches.merge(outs, &descriptor(MergeStrategy::KeyedByBranch));
        assert_eq!(merged, json!({"0": "a", "1": "b"}));
    }

    #[test]
    fn last_wins_picks_highest_branch_index() {
        let store: Arc<dyn RunStore> = Arc::new(MemoryStore::new());
        let branches = BranchStore::new(store);
        let outs = outputs(&[json!("a"), json!("b"), json!("c")]);
        let merged = branches.merge(outs, &descriptor(MergeStrategy::LastWins));
        assert_eq!(merged, json!("c"));
    }
}
