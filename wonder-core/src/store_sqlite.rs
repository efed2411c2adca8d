//! SQLite-backed `RunStore`, via `sqlx::SqlitePool`. Grounded on the
//! teacher's `PostgresProcessStore` (`store_postgres.rs`): raw `sqlx::query`
//! text, no query builder, `Row::get` by column name on the way back out.
//! Unlike `MemoryStore`, this backend hands SQL straight to a real engine,
//! so `execute_statements`/`execute_batch` get a genuine transaction
//! instead of a best-effort loop.

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use sqlx::{Row, SqlitePool, Transaction};
use uuid::Uuid;

use crate::error::CoordinatorError;
use crate::store::RunStore;
use crate::token::{SiblingCounts, Token, TokenStatus};

fn internal(err: impl std::fmt::Display) -> CoordinatorError {
    CoordinatorError::Internal(err.to_string())
}

fn status_to_text(status: TokenStatus) -> &'static str {
    match status {
        TokenStatus::Pending => "pending",
        TokenStatus::Dispatched => "dispatched",
        TokenStatus::Executing => "executing",
        TokenStatus::WaitingForSiblings => "waiting_for_siblings",
        TokenStatus::WaitingForSubworkflow => "waiting_for_subworkflow",
        TokenStatus::Completed => "completed",
        TokenStatus::Failed => "failed",
        TokenStatus::TimedOut => "timed_out",
        TokenStatus::Cancelled => "cancelled",
    }
}

fn status_from_text(text: &str) -> Result<TokenStatus, CoordinatorError> {
    Ok(match text {
        "pending" => TokenStatus::Pending,
        "dispatched" => TokenStatus::Dispatched,
        "executing" => TokenStatus::Executing,
        "waiting_for_siblings" => TokenStatus::WaitingForSiblings,
        "waiting_for_subworkflow" => TokenStatus::WaitingForSubworkflow,
        "completed" => TokenStatus::Completed,
        "failed" => TokenStatus::Failed,
        "timed_out" => TokenStatus::TimedOut,
        "cancelled" => TokenStatus::Cancelled,
        other => return Err(internal(format!("unknown token status in store: {other}"))),
    })
}

fn row_to_token(row: &sqlx::sqlite::SqliteRow) -> Result<Token, CoordinatorError> {
    let iteration_counts_json: String = row.get("iteration_counts");
    let status_text: String = row.get("status");
    let parent_token_id: Option<String> = row.get("parent_token_id");
    let sibling_group: Option<String> = row.get("sibling_group");
    Ok(Token {
        id: parse_uuid(row.get("id"))?,
        run_id: parse_uuid(row.get("run_id"))?,
        node_id: crate::types::DefId::from(row.get::<String, _>("node_id").as_str()),
        path_id: crate::token::PathId(row.get("path_id")),
        parent_token_id: parent_token_id.map(|s| parse_uuid(s)).transpose()?,
        sibling_group,
        branch_index: row.get::<i64, _>("branch_index") as u32,
        branch_total: row.get::<i64, _>("branch_total") as u32,
        iteration_counts: serde_json::from_str(&iteration_counts_json).map_err(internal)?,
        status: status_from_text(&status_text)?,
        arrived_at: row.get("arrived_at"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn parse_uuid(text: String) -> Result<Uuid, CoordinatorError> {
    Uuid::parse_str(&text).map_err(internal)
}

/// Bind one JSON-boxed cell onto a query, matching the primitive forms
/// `schema::dml::scalar_to_bindable` produces (text, integer, real, or
/// null — booleans already coerced to 0/1 by the caller).
fn bind_json<'q>(
    query: sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
    value: &'q JsonValue,
) -> sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
    match value {
        JsonValue::Null => query.bind(None::<String>),
        JsonValue::Bool(b) => query.bind(if *b { 1i64 } else { 0i64 }),
        JsonValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                query.bind(i)
            } else {
                query.bind(n.as_f64())
            }
        }
        JsonValue::String(s) => query.bind(s.as_str()),
        other => query.bind(other.to_string()),
    }
}

fn column_to_json(row: &sqlx::sqlite::SqliteRow, index: usize) -> JsonValue {
    use sqlx::ValueRef;
    let raw = match row.try_get_raw(index) {
        Ok(v) => v,
        Err(_) => return JsonValue::Null,
    };
    if raw.is_null() {
        return JsonValue::Null;
    }
    if let Ok(v) = row.try_get::<i64, _>(index) {
        return JsonValue::from(v);
    }
    if let Ok(v) = row.try_get::<f64, _>(index) {
        return JsonValue::from(v);
    }
    if let Ok(v) = row.try_get::<String, _>(index) {
        return JsonValue::from(v);
    }
    JsonValue::Null
}

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> SqliteStore {
        SqliteStore { pool }
    }

    /// Create the fixed-shape tables (tokens, fan-in activation guard,
    /// trace sequence counters) this backend owns directly, as opposed to
    /// the schema-driven context/branch tables `execute_statements` creates
    /// on the caller's behalf. Run once at process start, before any run's
    /// first event.
    pub async fn migrate(&self) -> Result<(), CoordinatorError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tokens (
                id TEXT PRIMARY KEY,
                run_id TEXT NOT NULL,
                node_id TEXT NOT NULL,
                path_id TEXT NOT NULL,
                parent_token_id TEXT,
                sibling_group TEXT,
                branch_index INTEGER NOT NULL,
                branch_total INTEGER NOT NULL,
                iteration_counts TEXT NOT NULL,
                status TEXT NOT NULL,
                arrived_at INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(internal)?;

        sqlx::query("CREATE INDEX IF NOT EXISTS tokens_run_id_idx ON tokens (run_id)")
            .execute(&self.pool)
            .await
            .map_err(internal)?;
        sqlx::query("CREATE INDEX IF NOT EXISTS tokens_sibling_group_idx ON tokens (run_id, sibling_group)")
            .execute(&self.pool)
            .await
            .map_err(internal)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS fan_in_activations (
                run_id TEXT NOT NULL,
                sibling_group TEXT NOT NULL,
                activator_token_id TEXT NOT NULL,
                PRIMARY KEY (run_id, sibling_group)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(internal)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS run_sequences (
                run_id TEXT PRIMARY KEY,
                next_seq INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(internal)?;

        Ok(())
    }

    async fn insert_token(tx: &mut Transaction<'_, sqlx::Sqlite>, token: &Token) -> Result<(), CoordinatorError> {
        let iteration_counts = serde_json::to_string(&token.iteration_counts).map_err(internal)?;
        sqlx::query(
            r#"
            INSERT INTO tokens (
                id, run_id, node_id, path_id, parent_token_id, sibling_group,
                branch_index, branch_total, iteration_counts, status,
                arrived_at, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(token.id.to_string())
        .bind(token.run_id.to_string())
        .bind(token.node_id.to_string())
        .bind(&token.path_id.0)
        .bind(token.parent_token_id.map(|id| id.to_string()))
        .bind(token.sibling_group.clone())
        .bind(token.branch_index as i64)
        .bind(token.branch_total as i64)
        .bind(iteration_counts)
        .bind(status_to_text(token.status))
        .bind(token.arrived_at)
        .bind(token.created_at)
        .bind(token.updated_at)
        .execute(&mut **tx)
        .await
        .map_err(internal)?;
        Ok(())
    }
}

#[async_trait]
impl RunStore for SqliteStore {
    async fn execute_statements(&self, statements: &[String]) -> Result<(), CoordinatorError> {
        let mut tx = self.pool.begin().await.map_err(internal)?;
        for stmt in statements {
            sqlx::query(stmt).execute(&mut *tx).await.map_err(internal)?;
        }
        tx.commit().await.map_err(internal)?;
        Ok(())
    }

    async fn execute_write(&self, sql: &str, params: Vec<JsonValue>) -> Result<i64, CoordinatorError> {
        let mut query = sqlx::query(sql);
        for param in &params {
            query = bind_json(query, param);
        }
        let result = query.execute(&self.pool).await.map_err(internal)?;
        Ok(result.last_insert_rowid())
    }

    async fn query_rows(&self, sql: &str, params: Vec<JsonValue>) -> Result<Vec<Vec<JsonValue>>, CoordinatorError> {
        let mut query = sqlx::query(sql);
        for param in &params {
            query = bind_json(query, param);
        }
        let rows = query.fetch_all(&self.pool).await.map_err(internal)?;
        Ok(rows
            .iter()
            .map(|row| (0..row.len()).map(|i| column_to_json(row, i)).collect())
            .collect())
    }

    async fn execute_batch(&self, statements: Vec<(String, Vec<JsonValue>)>) -> Result<(), CoordinatorError> {
        let mut tx = self.pool.begin().await.map_err(internal)?;
        for (sql, params) in statements {
            let mut query = sqlx::query(&sql);
            for param in &params {
                query = bind_json(query, param);
            }
            query.execute(&mut *tx).await.map_err(internal)?;
        }
        tx.commit().await.map_err(internal)?;
        Ok(())
    }

    async fn token_insert(&self, token: &Token) -> Result<(), CoordinatorError> {
        let mut tx = self.pool.begin().await.map_err(internal)?;
        Self::insert_token(&mut tx, token).await?;
        tx.commit().await.map_err(internal)?;
        Ok(())
    }

    async fn token_batch_insert(&self, tokens: &[Token]) -> Result<(), CoordinatorError> {
        let mut tx = self.pool.begin().await.map_err(internal)?;
        for token in tokens {
            Self::insert_token(&mut tx, token).await?;
        }
        tx.commit().await.map_err(internal)?;
        Ok(())
    }

    async fn token_get(&self, token_id: Uuid) -> Result<Option<Token>, CoordinatorError> {
        let row = sqlx::query("SELECT * FROM tokens WHERE id = ?")
            .bind(token_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(internal)?;
        row.as_ref().map(row_to_token).transpose()
    }

    async fn token_update_status(&self, token_id: Uuid, from: &[TokenStatus], to: TokenStatus) -> Result<bool, CoordinatorError> {
        let placeholders: Vec<&str> = from.iter().map(|_| "?").collect();
        let sql = format!("UPDATE tokens SET status = ? WHERE id = ? AND status IN ({})", placeholders.join(", "));
        let mut query = sqlx::query(&sql).bind(status_to_text(to)).bind(token_id.to_string());
        for status in from {
            query = query.bind(status_to_text(*status));
        }
        let result = query.execute(&self.pool).await.map_err(internal)?;
        Ok(result.rows_affected() > 0)
    }

    async fn tokens_by_sibling_group(&self, run_id: Uuid, sibling_group: &str) -> Result<Vec<Token>, CoordinatorError> {
        let rows = sqlx::query("SELECT * FROM tokens WHERE run_id = ? AND sibling_group = ?")
            .bind(run_id.to_string())
            .bind(sibling_group)
            .fetch_all(&self.pool)
            .await
            .map_err(internal)?;
        rows.iter().map(row_to_token).collect()
    }

    async fn sibling_counts(&self, run_id: Uuid, sibling_group: &str) -> Result<SiblingCounts, CoordinatorError> {
        let rows = sqlx::query("SELECT status FROM tokens WHERE run_id = ? AND sibling_group = ?")
            .bind(run_id.to_string())
            .bind(sibling_group)
            .fetch_all(&self.pool)
            .await
            .map_err(internal)?;
        let mut counts = SiblingCounts::default();
        for row in rows {
            let status_text: String = row.get("status");
            let status = status_from_text(&status_text)?;
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
        Ok(counts)
    }

    async fn active_tokens(&self, run_id: Uuid) -> Result<Vec<Token>, CoordinatorError> {
        let rows = sqlx::query(
            "SELECT * FROM tokens WHERE run_id = ? AND status NOT IN ('completed', 'failed', 'timed_out', 'cancelled')",
        )
        .bind(run_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(internal)?;
        rows.iter().map(row_to_token).collect()
    }

    async fn all_tokens(&self, run_id: Uuid) -> Result<Vec<Token>, CoordinatorError> {
        let rows = sqlx::query("SELECT * FROM tokens WHERE run_id = ?")
            .bind(run_id.to_string())
            .fetch_all(&self.pool)
            .await
            .map_err(internal)?;
        rows.iter().map(row_to_token).collect()
    }

    async fn try_activate_fan_in(&self, run_id: Uuid, sibling_group: &str, activator_token_id: Uuid) -> Result<bool, CoordinatorError> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO fan_in_activations (run_id, sibling_group, activator_token_id) VALUES (?, ?, ?)",
        )
        .bind(run_id.to_string())
        .bind(sibling_group)
        .bind(activator_token_id.to_string())
        .execute(&self.pool)
        .await
        .map_err(internal)?;
        Ok(result.rows_affected() > 0)
    }

    async fn next_sequence(&self, run_id: Uuid) -> Result<u64, CoordinatorError> {
        let mut tx = self.pool.begin().await.map_err(internal)?;
        sqlx::query("INSERT OR IGNORE INTO run_sequences (run_id, next_seq) VALUES (?, 1)")
            .bind(run_id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(internal)?;
        let row = sqlx::query("SELECT next_seq FROM run_sequences WHERE run_id = ?")
            .bind(run_id.to_string())
            .fetch_one(&mut *tx)
            .await
            .map_err(internal)?;
        let seq: i64 = row.get("next_seq");
        sqlx::query("UPDATE run_sequences SET next_seq = ? WHERE run_id = ?")
            .bind(seq + 1)
            .bind(run_id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(internal)?;
        tx.commit().await.map_err(internal)?;
        Ok(seq as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::dml;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn setup() -> SqliteStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("open in-memory sqlite");
        let store = SqliteStore::new(pool);
        store.migrate().await.unwrap();
        store
    }

    fn sample_token(run_id: Uuid) -> Token {
        Token {
            id: Uuid::new_v4(),
            run_id,
            node_id: crate::types::DefId::from("start"),
            path_id: crate::token::PathId::root(),
            parent_token_id: None,
            sibling_group: None,
            branch_index: 0,
            branch_total: 1,
            iteration_counts: Default::default(),
            status: TokenStatus::Pending,
            arrived_at: 1000,
            created_at: 1000,
            updated_at: 1000,
        }
    }

    #[tokio::test]
    async fn token_round_trips_through_sqlite() {
        let store = setup().await;
        let run_id = Uuid::new_v4();
        let token = sample_token(run_id);
        store.token_insert(&token).await.unwrap();

        let loaded = store.token_get(token.id).await.unwrap().unwrap();
        assert_eq!(loaded.id, token.id);
        assert_eq!(loaded.status, TokenStatus::Pending);

        let moved = store
            .token_update_status(token.id, &[TokenStatus::Pending], TokenStatus::Dispatched)
            .await
            .unwrap();
        assert!(moved);
        let reloaded = store.token_get(token.id).await.unwrap().unwrap();
        assert_eq!(reloaded.status, TokenStatus::Dispatched);

        let rejected = store
            .token_update_status(token.id, &[TokenStatus::Pending], TokenStatus::Executing)
            .await
            .unwrap();
        assert!(!rejected);
    }

    #[tokio::test]
    async fn fan_in_activation_is_single_winner() {
        let store = setup().await;
        let run_id = Uuid::new_v4();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        assert!(store.try_activate_fan_in(run_id, "G", a).await.unwrap());
        assert!(!store.try_activate_fan_in(run_id, "G", b).await.unwrap());
    }

    #[tokio::test]
    async fn sequence_numbers_are_monotonic_per_run() {
        let store = setup().await;
        let run_id = Uuid::new_v4();
        assert_eq!(store.next_sequence(run_id).await.unwrap(), 1);
        assert_eq!(store.next_sequence(run_id).await.unwrap(), 2);
        assert_eq!(store.next_sequence(run_id).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn schema_driven_root_row_round_trips() {
        let store = setup().await;
        store
            .execute_statements(&["CREATE TABLE IF NOT EXISTS context_state (rowid_pk INTEGER PRIMARY KEY, x INTEGER)".to_string()])
            .await
            .unwrap();
        store.execute_write(&dml::upsert_root_row("context_state"), vec![]).await.unwrap();
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
    async fn sibling_counts_classify_by_status() {
        let store = setup().await;
        let run_id = Uuid::new_v4();
        let mut a = sample_token(run_id);
        a.sibling_group = Some("G".to_string());
        a.status = TokenStatus::Completed;
        let mut b = sample_token(run_id);
        b.sibling_group = Some("G".to_string());
        b.status = TokenStatus::Executing;
        store.token_batch_insert(&[a, b]).await.unwrap();

        let counts = store.sibling_counts(run_id, "G").await.unwrap();
        assert_eq!(counts.total, 2);
        assert_eq!(counts.completed, 1);
        assert_eq!(counts.in_flight, 1);
    }
}
