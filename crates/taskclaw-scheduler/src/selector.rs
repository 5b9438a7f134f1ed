//! Due-task selection with claim-with-skip semantics.

use chrono::{DateTime, Utc};
use std::sync::Arc;

use taskclaw_core::error::Result;
use taskclaw_core::traits::{ClaimedChain, ClaimedTask, TaskStore};

/// Everything one tick claimed.
#[derive(Debug, Default)]
pub struct DueBatch {
    pub tasks: Vec<ClaimedTask>,
    pub chains: Vec<ClaimedChain>,
}

impl DueBatch {
    pub fn len(&self) -> usize {
        self.tasks.len() + self.chains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty() && self.chains.is_empty()
    }
}

/// Claims due definitions. Rows another replica holds are skipped rather than
/// waited on, so replicas never block each other or claim the same row.
#[derive(Clone)]
pub struct DueTaskSelector {
    store: Arc<dyn TaskStore>,
    claim_limit: u32,
}

impl DueTaskSelector {
    pub fn new(store: Arc<dyn TaskStore>, claim_limit: u32) -> Self {
        Self {
            store,
            claim_limit: claim_limit.max(1),
        }
    }

    pub async fn claim_due_tasks(&self, now: DateTime<Utc>) -> Result<Vec<ClaimedTask>> {
        self.store.claim_due_tasks(now, self.claim_limit).await
    }

    pub async fn claim_due_chains(&self, now: DateTime<Utc>) -> Result<Vec<ClaimedChain>> {
        self.store.claim_due_chains(now, self.claim_limit).await
    }

    pub async fn claim_due(&self, now: DateTime<Utc>) -> Result<DueBatch> {
        let tasks = self.claim_due_tasks(now).await?;
        let chains = self.claim_due_chains(now).await?;
        if !tasks.is_empty() || !chains.is_empty() {
            tracing::debug!("📋 Claimed {} task(s), {} chain(s)", tasks.len(), chains.len());
        }
        Ok(DueBatch { tasks, chains })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{due_chain, due_task, memory_store};
    use uuid::Uuid;

    #[tokio::test]
    async fn test_claim_due_respects_limit_and_never_reclaims() {
        let store = memory_store();
        let ws = Uuid::new_v4();
        for i in 0..3 {
            store.save_task(&due_task(ws, &format!("t{i}"))).await.unwrap();
        }
        store.save_chain(&due_chain(ws, "c0")).await.unwrap();

        let selector = DueTaskSelector::new(store.clone(), 2);
        let now = Utc::now();
        let first = selector.claim_due(now).await.unwrap();
        assert_eq!(first.tasks.len(), 2);
        assert_eq!(first.chains.len(), 1);

        let second = selector.claim_due(now).await.unwrap();
        assert_eq!(second.tasks.len(), 1);
        assert!(second.chains.is_empty());

        assert!(selector.claim_due(now).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_blocked_workspace_not_claimed() {
        let store = memory_store();
        let ws = Uuid::new_v4();
        store.save_task(&due_task(ws, "blocked")).await.unwrap();
        store.set_workspace_blocked(ws, true).unwrap();

        let selector = DueTaskSelector::new(store.clone(), 10);
        assert!(selector.claim_due(Utc::now()).await.unwrap().is_empty());
    }
}
