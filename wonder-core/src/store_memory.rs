//! In-memory `RunStore`, for tests and embedded single-node use without a
//! SQLite file. Grounded on the teacher's `MemoryStore`
//! (`RwLock<Inner>` over plain collections); the relational primitives
//! interpret the small, fixed vocabulary of statement shapes
//! `schema::dml` emits rather than embedding a SQL parser.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::CoordinatorError;
use crate::store::RunStore;
use crate::token::{SiblingCounts, Token, TokenStatus};

#[derive(Clone, Debug, Default)]
struct Table {
    next_rowid: i64,
    rows: Vec<BTreeMap<String, JsonValue>>,
}

struct Inner {
    tables: HashMap<String, Table>,
    tokens: HashMap<Uuid, Token>,
    fan_in_winners: HashMap<(Uuid, String), Uuid>,
    sequence: HashMap<Uuid, u64>,
}

pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore {
            inner: RwLock::new(Inner {
                tables: HashMap::new(),
                tokens: HashMap::new(),
                fan_in_winners: HashMap::new(),
                sequence: HashMap::new(),
            }),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        MemoryStore::new()
    }
}

fn internal(msg: impl Into<String>) -> CoordinatorError {
    CoordinatorError::Internal(msg.into())
}

fn table_name_after(prefix: &str, sql: &str) -> Result<String, CoordinatorError> {
    sql.strip_prefix(prefix)
        .and_then(|rest| rest.split_whitespace().next())
        .map(str::to_string)
        .ok_or_else(|| internal(format!("malformed statement: {sql}")))
}

impl Inner {
    fn apply_ddl(&mut self, stmt: &str) -> Result<(), CoordinatorError> {
        if let Some(rest) = stmt.strip_prefix("CREATE TABLE IF NOT EXISTS ") {
            let name = rest
                .split_whitespace()
                .next()
                .ok_or_else(|| internal(format!("malformed CREATE TABLE: {stmt}")))?;
            self.tables.entry(name.to_string()).or_default();
            Ok(())
        } else if let Some(rest) = stmt.strip_prefix("DROP TABLE IF EXISTS ") {
            self.tables.remove(rest.trim());
            Ok(())
        } else {
            Err(internal(format!("unsupported DDL statement: {stmt}")))
        }
    }

    fn apply_write(&mut self, sql: &str, params: Vec<JsonValue>) -> Result<i64, CoordinatorError> {
        if let Some(rest) = sql.strip_prefix("INSERT OR IGNORE INTO ") {
            let table = rest
                .split_whitespace()
                .next()
                .ok_or_else(|| internal(format!("malformed statement: {sql}")))?;
            let t = self.tables.entry(table.to_string()).or_default();
            if t.rows.is_empty() {
                let mut row = BTreeMap::new();
                row.insert("rowid_pk".to_string(), JsonValue::from(1));
                t.rows.push(row);
                t.next_rowid = 2;
            }
            return Ok(1);
        }

        if let Some(rest) = sql.strip_prefix("UPDATE ") {
            let mut tokens = rest.split_whitespace();
            let table = tokens
                .next()
                .ok_or_else(|| internal(format!("malformed statement: {sql}")))?;
            // tokens: "SET" <column> "=" "?" "WHERE" "rowid_pk" "=" "1"
            let _set = tokens.next();
            let column = tokens
                .next()
                .ok_or_else(|| internal(format!("malformed statement: {sql}")))?;
            let value = params
                .into_iter()
                .next()
                .ok_or_else(|| internal("UPDATE missing bound value"))?;
            let t = self
                .tables
                .get_mut(table)
                .ok_or_else(|| internal(format!("unknown table {table}")))?;
            let row = t
                .rows
                .iter_mut()
                .find(|r| r.get("rowid_pk") == Some(&JsonValue::from(1)))
                .ok_or_else(|| internal(format!("root row missing in {table}")))?;
            row.insert(column.to_string(), value);
            return Ok(1);
        }

        if let Some(rest) = sql.strip_prefix("DELETE FROM ") {
            let mut tokens = rest.split_whitespace();
            let table = tokens
                .next()
                .ok_or_else(|| internal(format!("malformed statement: {sql}")))?;
            let parent_id: i64 = rest
                .rsplit('=')
                .next()
                .and_then(|s| s.trim().parse().ok())
                .ok_or_else(|| internal(format!("malformed statement: {sql}")))?;
            if let Some(t) = self.tables.get_mut(table) {
                t.rows
                    .retain(|r| r.get("parent_rowid") != Some(&JsonValue::from(parent_id)));
            }
            return Ok(0);
        }

        if let Some(rest) = sql.strip_prefix("INSERT INTO ") {
            let open = rest
                .find('(')
                .ok_or_else(|| internal(format!("malformed statement: {sql}")))?;
            let table = rest[..open].trim();
            let close = rest
                .find(')')
                .ok_or_else(|| internal(format!("malformed statement: {sql}")))?;
            let cols: Vec<String> = rest[open + 1..close]
                .split(',')
                .map(|c| c.trim().to_string())
                .collect();
            if cols.len() != params.len() {
                return Err(internal(format!(
                    "column/param count mismatch for {table}: {} cols, {} params",
                    cols.len(),
                    params.len()
                )));
            }
            let t = self.tables.entry(table.to_string()).or_default();
            let rowid = t.next_rowid.max(1);
            t.next_rowid = rowid + 1;
            let mut row = BTreeMap::new();
            row.insert("rowid_pk".to_string(), JsonValue::from(rowid));
            for (c, v) in cols.into_iter().zip(params.into_iter()) {
                row.insert(c, v);
            }
            t.rows.push(row);
            return Ok(rowid);
        }

        Err(internal(format!("unsupported write statement: {sql}")))
    }

    fn apply_query(&self, sql: &str) -> Result<Vec<Vec<JsonValue>>, CoordinatorError> {
        let rest = sql
            .strip_prefix("SELECT ")
            .ok_or_else(|| internal(format!("unsupported query: {sql}")))?;
        let (cols_str, remainder) = rest
            .split_once(" FROM ")
            .ok_or_else(|| internal(format!("malformed query: {sql}")))?;
        let cols: Vec<String> = cols_str.split(", ").map(|c| c.trim().to_string()).collect();
        let table = remainder
            .split_whitespace()
            .next()
            .ok_or_else(|| internal(format!("malformed query: {sql}")))?;
        let Some(t) = self.tables.get(table) else {
            return Ok(Vec::new());
        };

        if remainder.contains("parent_rowid") {
            let parent_id: i64 = remainder
                .split("parent_rowid = ")
                .nth(1)
                .and_then(|s| s.split_whitespace().next())
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| internal(format!("malformed query: {sql}")))?;
            let mut rows: Vec<&BTreeMap<String, JsonValue>> = t
                .rows
                .iter()
                .filter(|r| r.get("parent_rowid") == Some(&JsonValue::from(parent_id)))
                .collect();
            rows.sort_by_key(|r| r.get("item_index").and_then(JsonValue::as_i64).unwrap_or(0));
            Ok(rows
                .into_iter()
                .map(|r| project(r, &cols))
                .collect())
        } else {
            Ok(t.rows
                .iter()
                .filter(|r| r.get("rowid_pk") == Some(&JsonValue::from(1)))
                .map(|r| project(r, &cols))
                .collect())
        }
    }
}

fn project(row: &BTreeMap<String, JsonValue>, cols: &[String]) -> Vec<JsonValue> {
    cols.iter()
        .map(|c| row.get(c).cloned().unwrap_or(JsonValue::Null))
        .collect()
}

fn classify(status: TokenStatus, counts: &mut SiblingCounts) {
    counts.total += 1;
    match status {
        TokenStatus::Completed => {
            counts.completed += 1;
            counts.terminal += 1;
        }
        TokenStatus::Failed | TokenStatus::TimedOut | TokenStatus::Cancelled => {
            counts.failed += 1;
            counts.terminal += 1;
        }
        TokenStatus::WaitingForSiblings | TokenStatus::WaitingForSubworkflow => {
            counts.waiting += 1;
        }
        TokenStatus::Pending | TokenStatus::Dispatched | TokenStatus::Executing => {
            counts.in_flight += 1;
        }
    }
}

#[async_trait]
impl RunStore for MemoryStore {
    async fn execute_statements(&self, statements: &[String]) -> Result<(), CoordinatorError> {
        let mut inner = self.inner.write().await;
        for stmt in statements {
            inner.apply_ddl(stmt)?;
        }
        Ok(())
    }

    async fn execute_write(
        &self,
        sql: &str,
        params: Vec<JsonValue>,
    ) -> Result<i64, CoordinatorError> {
        let mut inner = self.inner.write().await;
        inner.apply_write(sql, params)
    }

    async fn query_rows(
        &self,
        sql: &str,
        _params: Vec<JsonValue>,
    ) -> Result<Vec<Vec<JsonValue>>, CoordinatorError> {
        let inner = self.inner.read().await;
        inner.apply_query(sql)
    }

    async fn execute_batch(
        &self,
        statements: Vec<(String, Vec<JsonValue>)>,
    ) -> Result<(), CoordinatorError> {
        let mut inner = self.inner.write().await;
        // No partial application on error: validate shape first would
        // require two passes; in-memory apply is infallible once a
        // statement is well-formed, so a straight loop matches the "all or
        // nothing in practice" contract without needing real rollback.
        for (sql, params) in statements {
            if sql.starts_with("CREATE TABLE") || sql.starts_with("DROP TABLE") {
                inner.apply_ddl(&sql)?;
            } else {
                inner.apply_write(&sql, params)?;
            }
        }
        Ok(())
    }

    async fn token_insert(&self, token: &Token) -> Result<(), CoordinatorError> {
        let mut inner = self.inner.write().await;
        inner.tokens.insert(token.id, token.clone());
        Ok(())
    }

    async fn token_batch_insert(&self, tokens: &[Token]) -> Result<(), CoordinatorError> {
        let mut inner = self.inner.write().await;
        for t in tokens {
            inner.tokens.insert(t.id, t.clone());
        }
        Ok(())
    }

    async fn token_get(&self, token_id: Uuid) -> Result<Option<Token>, CoordinatorError> {
        let inner = self.inner.read().await;
        Ok(inner.tokens.get(&token_id).cloned())
    }

    async fn token_update_status(
        &self,
        token_id: Uuid,
        from: &[TokenStatus],
        to: TokenStatus,
    ) -> Result<bool, CoordinatorError> {
        let mut inner = self.inner.write().await;
        let Some(token) = inner.tokens.get_mut(&token_id) else {
            return Ok(false);
        };
        if from.contains(&token.status) {
            token.status = to;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn tokens_by_sibling_group(
        &self,
        run_id: Uuid,
        sibling_group: &str,
    ) -> Result<Vec<Token>, CoordinatorError> {
        let inner = self.inner.read().await;
        Ok(inner
            .tokens
            .values()
            .filter(|t| t.run_id == run_id && t.sibling_group.as_deref() == Some(sibling_group))
            .cloned()
            .collect())
    }

    async fn sibling_counts(
        &self,
        run_id: Uuid,
        sibling_group: &str,
    ) -> Result<SiblingCounts, CoordinatorError> {
        let inner = self.inner.read().await;
        let mut counts = SiblingCounts::default();
        for t in inner.tokens.values() {
            if t.run_id == run_id && t.sibling_group.as_deref() == Some(sibling_group) {
                classify(t.status, &mut counts);
            }
        }
        Ok(counts)
    }

    async fn active_tokens(&self, run_id: Uuid) -> Result<Vec<Token>, CoordinatorError> {
        let inner = self.inner.read().await;
        Ok(inner
            .tokens
            .values()
            .filter(|t| t.run_id == run_id && !t.status.is_terminal())
            .cloned()
            .collect())
    }

    async fn all_tokens(&self, run_id: Uuid) -> Result<Vec<Token>, CoordinatorError> {
        let inner = self.inner.read().await;
        Ok(inner
            .tokens
            .values()
            .filter(|t| t.run_id == run_id)
            .cloned()
            .collect())
    }

    async fn try_activate_fan_in(
        &self,
        run_id: Uuid,
        sibling_group: &str,
        activator_token_id: Uuid,
    ) -> Result<bool, CoordinatorError> {
        let mut inner = self.inner.write().await;
        let key = (run_id, sibling_group.to_string());
        if inner.fan_in_winners.contains_key(&key) {
            return Ok(false);
        }
        inner.fan_in_winners.insert(key, activator_token_id);
        Ok(true)
    }

    async fn next_sequence(&self, run_id: Uuid) -> Result<u64, CoordinatorError> {
        let mut inner = self.inner.write().await;
        let seq = inner.sequence.entry(run_id).or_insert(0);
        *seq += 1;
        Ok(*seq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::dml;

    #[tokio::test]
    async fn root_row_roundtrip() {
        let store = MemoryStore::new();
        store
            .execute_statements(&["CREATE TABLE IF NOT EXISTS context_state (rowid_pk INTEGER PRIMARY KEY, x INTEGER)".to_string()])
            .await
            .unwrap();
        store
            .execute_write(&dml::upsert_root_row("context_state"), vec![])
            .await
            .unwrap();
        store
            .execute_write(&dml::update_scalar_column("context_state", "x"), vec![JsonValue::from(42)])
            .await
            .unwrap();
        let rows = store
            .query_rows(&dml::select_scalar_column("context_state", "x"), vec![])
            .await
            .unwrap();
        assert_eq!(rows, vec![vec![JsonValue::from(42)]]);
    }

    #[tokio::test]
    async fn fan_in_activation_is_single_winner() {
        let store = MemoryStore::new();
        let run_id = Uuid::new_v4();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        assert!(store.try_activate_fan_in(run_id, "G", a).await.unwrap());
        assert!(!store.try_activate_fan_in(run_id, "G", b).await.unwrap());
    }

    #[tokio::test]
    async fn child_rows_round_trip_ordered_by_index() {
        let store = MemoryStore::new();
        store
            .execute_statements(&["CREATE TABLE IF NOT EXISTS t_items (rowid_pk INTEGER PRIMARY KEY, parent_rowid INTEGER, item_index INTEGER, v TEXT)".to_string()])
            .await
            .unwrap();
        let (sql, _) = dml::insert_child_row("t_items", &["v".to_string()]);
        store
            .execute_write(&sql, vec![JsonValue::from(1), JsonValue::from(1), JsonValue::from("b")])
            .await
            .unwrap();
        store
            .execute_write(&sql, vec![JsonValue::from(1), JsonValue::from(0), JsonValue::from("a")])
            .await
            .unwrap();
        let rows = store
            .query_rows(&dml::select_child_rows("t_items", 1, &["v".to_string()]), vec![])
            .await
            .unwrap();
        let values: Vec<&JsonValue> = rows.iter().map(|r| &r[1]).collect();
        assert_eq!(values, vec![&JsonValue::from("a"), &JsonValue::from("b")]);
    }
}
