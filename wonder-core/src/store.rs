//! `RunStore`: the persistence contract for one run, analogous to the
//! teacher's `ProcessStore` trait (`store.rs`) — the VM/engine there speaks
//! only through the trait, never touching a backend directly, which is why
//! `MemoryStore` and `PostgresProcessStore` are interchangeable. Wonder's
//! split is: a small set of schema-driven relational primitives (used by
//! `ContextManager`/`BranchStore`, whose table layout is generated at run
//! start and therefore can't be a set of named, compile-time-typed
//! methods) plus a fixed, concern-specific surface for tokens and fan-in
//! activation (spec §6's `tokens`/`fan_in_activations` tables never change
//! shape, so they get real methods, the same way `ProcessStore` has
//! `save_instance` rather than a generic row setter).

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::error::CoordinatorError;
use crate::token::{SiblingCounts, Token, TokenStatus};

#[async_trait]
pub trait RunStore: Send + Sync {
    // ── Schema-driven relational primitives ──

    /// Execute DDL/DROP statements. Must be transactional as a batch: all
    /// apply or none do.
    async fn execute_statements(&self, statements: &[String]) -> Result<(), CoordinatorError>;

    /// Execute one parameterized write, returning `last_insert_rowid`
    /// (meaningless, but harmless, for UPDATE/DELETE).
    async fn execute_write(
        &self,
        sql: &str,
        params: Vec<JsonValue>,
    ) -> Result<i64, CoordinatorError>;

    /// Execute one parameterized SELECT, returning rows of JSON-boxed
    /// cells in column order.
    async fn query_rows(
        &self,
        sql: &str,
        params: Vec<JsonValue>,
    ) -> Result<Vec<Vec<JsonValue>>, CoordinatorError>;

    /// Apply a batch of writes as a single transaction (spec §4.6
    /// dispatch atomicity: "on failure mid-batch, the entire batch rolls
    /// back").
    async fn execute_batch(&self, statements: Vec<(String, Vec<JsonValue>)>) -> Result<(), CoordinatorError>;

    // ── Tokens ──

    async fn token_insert(&self, token: &Token) -> Result<(), CoordinatorError>;
    async fn token_batch_insert(&self, tokens: &[Token]) -> Result<(), CoordinatorError>;
    async fn token_get(&self, token_id: Uuid) -> Result<Option<Token>, CoordinatorError>;

    /// Conditional status transition: succeeds (returns `true`) only if the
    /// token's current status is in `from`. Used both for ordinary
    /// lifecycle transitions and as the cancellation guard (spec §4.4).
    async fn token_update_status(
        &self,
        token_id: Uuid,
        from: &[TokenStatus],
        to: TokenStatus,
    ) -> Result<bool, CoordinatorError>;

    async fn tokens_by_sibling_group(
        &self,
        run_id: Uuid,
        sibling_group: &str,
    ) -> Result<Vec<Token>, CoordinatorError>;

    async fn sibling_counts(
        &self,
        run_id: Uuid,
        sibling_group: &str,
    ) -> Result<SiblingCounts, CoordinatorError>;

    async fn active_tokens(&self, run_id: Uuid) -> Result<Vec<Token>, CoordinatorError>;
    async fn all_tokens(&self, run_id: Uuid) -> Result<Vec<Token>, CoordinatorError>;

    /// First-insert-wins activation guard (spec §4.4 `tryActivateFanIn`):
    /// backed by a `fan_in_activations(sibling_group PRIMARY KEY, ...)`
    /// table. Returns `true` iff this call was the winner.
    async fn try_activate_fan_in(
        &self,
        run_id: Uuid,
        sibling_group: &str,
        activator_token_id: Uuid,
    ) -> Result<bool, CoordinatorError>;

    // ── Trace sequencing ──

    /// Next sequence number for this run (spec invariant 8: unique,
    /// strictly positive, monotonic).
    async fn next_sequence(&self, run_id: Uuid) -> Result<u64, CoordinatorError>;
}
