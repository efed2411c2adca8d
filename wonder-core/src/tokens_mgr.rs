//! Token manager (spec §4.4): the only component that mutates token rows.
//! All status changes go through `update_status`'s conditional guard, so a
//! token can never leave a terminal state and two racing callers can never
//! both win the same transition.

use std::sync::Arc;

use uuid::Uuid;

use crate::decision::NewTokenSpec;
use crate::error::{CoordinatorError, FailureCause};
use crate::store::RunStore;
use crate::token::{SiblingCounts, Token, TokenStatus};

pub struct TokenManager {
    store: Arc<dyn RunStore>,
}

impl TokenManager {
    pub fn new(store: Arc<dyn RunStore>) -> TokenManager {
        TokenManager { store }
    }

    pub async fn create(&self, run_id: Uuid, spec: NewTokenSpec, now: i64) -> Result<Token, CoordinatorError> {
        let token = Token {
            id: Uuid::new_v4(),
            run_id,
            node_id: spec.node_id,
            path_id: spec.path_id,
            parent_token_id: spec.parent_token_id,
            sibling_group: spec.sibling_group,
            branch_index: spec.branch_index,
            branch_total: spec.branch_total,
            iteration_counts: spec.iteration_counts,
            status: TokenStatus::Pending,
            arrived_at: now,
            created_at: now,
            updated_at: now,
        };
        self.store.token_insert(&token).await?;
        Ok(token)
    }

    pub async fn create_batch(
        &self,
        run_id: Uuid,
        specs: Vec<NewTokenSpec>,
        now: i64,
    ) -> Result<Vec<Token>, CoordinatorError> {
        let tokens: Vec<Token> = specs
            .into_iter()
            .map(|spec| Token {
                id: Uuid::new_v4(),
                run_id,
                node_id: spec.node_id,
                path_id: spec.path_id,
                parent_token_id: spec.parent_token_id,
                sibling_group: spec.sibling_group,
                branch_index: spec.branch_index,
                branch_total: spec.branch_total,
                iteration_counts: spec.iteration_counts,
                status: TokenStatus::Pending,
                arrived_at: now,
                created_at: now,
                updated_at: now,
            })
            .collect();
        self.store.token_batch_insert(&tokens).await?;
        Ok(tokens)
    }

    pub async fn get(&self, token_id: Uuid) -> Result<Option<Token>, CoordinatorError> {
        self.store.token_get(token_id).await
    }

    /// Conditional status transition (spec §4.4 table). Returns whether
    /// this call won the transition; a `false` result always means the
    /// token was already somewhere else and the caller should drop its
    /// decision rather than retry.
    pub async fn update_status(
        &self,
        token_id: Uuid,
        from: &[TokenStatus],
        to: TokenStatus,
    ) -> Result<bool, CoordinatorError> {
        self.store.token_update_status(token_id, from, to).await
    }

    pub async fn mark_waiting(&self, token_id: Uuid) -> Result<bool, CoordinatorError> {
        self.update_status(token_id, TokenStatus::allowed_predecessors(TokenStatus::WaitingForSiblings), TokenStatus::WaitingForSiblings).await
    }

    pub async fn mark_dispatched(&self, token_id: Uuid) -> Result<bool, CoordinatorError> {
        self.update_status(token_id, TokenStatus::allowed_predecessors(TokenStatus::Dispatched), TokenStatus::Dispatched).await
    }

    pub async fn mark_executing(&self, token_id: Uuid) -> Result<bool, CoordinatorError> {
        self.update_status(token_id, TokenStatus::allowed_predecessors(TokenStatus::Executing), TokenStatus::Executing).await
    }

    pub async fn complete(&self, token_id: Uuid) -> Result<bool, CoordinatorError> {
        self.update_status(token_id, TokenStatus::allowed_predecessors(TokenStatus::Completed), TokenStatus::Completed).await
    }

    pub async fn fail(&self, token_id: Uuid, _reason: FailureCause) -> Result<bool, CoordinatorError> {
        self.update_status(token_id, TokenStatus::allowed_predecessors(TokenStatus::Failed), TokenStatus::Failed).await
    }

    pub async fn time_out(&self, token_id: Uuid) -> Result<bool, CoordinatorError> {
        self.update_status(token_id, TokenStatus::allowed_predecessors(TokenStatus::TimedOut), TokenStatus::TimedOut).await
    }

    pub async fn cancel(&self, token_id: Uuid) -> Result<bool, CoordinatorError> {
        self.update_status(token_id, TokenStatus::allowed_predecessors(TokenStatus::Cancelled), TokenStatus::Cancelled).await
    }

    pub async fn sibling_counts(&self, run_id: Uuid, sibling_group: &str) -> Result<SiblingCounts, CoordinatorError> {
        self.store.sibling_counts(run_id, sibling_group).await
    }

    pub async fn tokens_by_sibling_group(&self, run_id: Uuid, sibling_group: &str) -> Result<Vec<Token>, CoordinatorError> {
        self.store.tokens_by_sibling_group(run_id, sibling_group).await
    }

    pub async fn active_tokens(&self, run_id: Uuid) -> Result<Vec<Token>, CoordinatorError> {
        self.store.active_tokens(run_id).await
    }

    pub async fn all_tokens(&self, run_id: Uuid) -> Result<Vec<Token>, CoordinatorError> {
        self.store.all_tokens(run_id).await
    }

    /// First-insert-wins fan-in activation guard (spec §4.4
    /// `tryActivateFanIn`). Exactly one caller across any number of
    /// concurrent racers receives `true`.
    pub async fn try_activate_fan_in(&self, run_id: Uuid, sibling_group: &str, activator_token_id: Uuid) -> Result<bool, CoordinatorError> {
        self.store.try_activate_fan_in(run_id, sibling_group, activator_token_id).await
    }

    /// Next trace sequence number for this run (spec invariant 8), durable
    /// across coordinator restarts since it is allocated by the store, not
    /// an in-process counter.
    pub async fn next_sequence(&self, run_id: Uuid) -> Result<u64, CoordinatorError> {
        self.store.next_sequence(run_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store_memory::MemoryStore;
    use crate::token::PathId;
    use crate::types::DefId;

    fn spec() -> NewTokenSpec {
        NewTokenSpec {
            node_id: DefId::from("n1"),
            path_id: PathId::root(),
            parent_token_id: None,
            sibling_group: None,
            branch_index: 0,
            branch_total: 1,
            iteration_counts: Default::default(),
        }
    }

    #[tokio::test]
    async fn lifecycle_transitions_follow_allowed_predecessors() {
        let store: Arc<dyn RunStore> = Arc::new(MemoryStore::new());
        let mgr = TokenManager::new(store);
        let run_id = Uuid::new_v4();
        let token = mgr.create(run_id, spec(), 0).await.unwrap();

        assert!(mgr.mark_dispatched(token.id).await.unwrap());
        assert!(mgr.mark_executing(token.id).await.unwrap());
        assert!(mgr.complete(token.id).await.unwrap());
        // terminal -> anything is rejected.
        assert!(!mgr.cancel(token.id).await.unwrap());
    }

    #[tokio::test]
    async fn cancel_loses_race_against_prior_completion() {
        let store: Arc<dyn RunStore> = Arc::new(MemoryStore::new());
        let mgr = TokenManager::new(store);
        let run_id = Uuid::new_v4();
        let token = mgr.create(run_id, spec(), 0).await.unwrap();
        mgr.mark_dispatched(token.id).await.unwrap();
        mgr.mark_executing(token.id).await.unwrap();
        assert!(mgr.complete(token.id).await.unwrap());
        assert!(!mgr.cancel(token.id).await.unwrap());
    }
}
