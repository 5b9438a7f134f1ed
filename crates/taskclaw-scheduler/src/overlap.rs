//! Overlap guard: decides whether a due execution runs, is skipped, or waits
//! in the bounded queue, and promotes queued work as slots free up.
//!
//! Every counter change goes through one atomic store operation, so two
//! replicas admitting the same target can never both squeeze past
//! `max_instances`.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use uuid::Uuid;

use taskclaw_core::error::Result;
use taskclaw_core::traits::{Enqueued, SlotGrant, StaleInstance, TaskStore, TenantGate};
use taskclaw_core::types::{OverlapPolicy, QueueEntry, TaskRef, Variables, WorkspaceCounter};

/// Outcome of one admission attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// A slot was taken; `running` includes this execution.
    Allowed { running: u32 },
    /// SKIP policy and every slot is busy.
    Skipped,
    /// QUEUE policy; 1-based position in the queue.
    Queued { position: u32 },
    /// QUEUE policy and the queue is at `max_queue_size`.
    QueueFull,
}

impl Admission {
    pub fn as_str(&self) -> &'static str {
        match self {
            Admission::Allowed { .. } => "allowed",
            Admission::Skipped => "skipped",
            Admission::Queued { .. } => "queued",
            Admission::QueueFull => "queue_full",
        }
    }
}

#[derive(Clone)]
pub struct OverlapGuard {
    store: Arc<dyn TaskStore>,
    tenants: Arc<dyn TenantGate>,
}

impl OverlapGuard {
    pub fn new(store: Arc<dyn TaskStore>, tenants: Arc<dyn TenantGate>) -> Self {
        Self { store, tenants }
    }

    /// Try to start an execution of `target`.
    pub async fn admit(
        &self,
        target: TaskRef,
        workspace_id: Uuid,
        priority: i32,
        variables: &Variables,
    ) -> Result<Admission> {
        let overlap = match self.store.acquire_slot(target, Utc::now()).await? {
            SlotGrant::Acquired { running } => {
                tracing::debug!("🎟️ {} admitted ({} running)", target, running);
                return Ok(Admission::Allowed { running });
            }
            SlotGrant::Saturated { overlap } => overlap,
        };

        if overlap.policy != OverlapPolicy::Queue {
            self.store
                .increment_workspace_counter(workspace_id, WorkspaceCounter::ExecutionsSkipped)
                .await?;
            tracing::info!("⏭️ {} skipped: {} instance(s) already running", target, overlap.max_instances);
            return Ok(Admission::Skipped);
        }

        let entry = QueueEntry::new(workspace_id, target, priority, variables.clone());
        match self.store.enqueue_bounded(&entry, Utc::now()).await? {
            Enqueued::Acquired { running } => {
                tracing::debug!("🎟️ {} admitted on re-check ({} running)", target, running);
                Ok(Admission::Allowed { running })
            }
            Enqueued::Queued { position } => {
                self.store
                    .increment_workspace_counter(workspace_id, WorkspaceCounter::ExecutionsQueued)
                    .await?;
                tracing::info!("📥 {} queued at position {}", target, position);
                Ok(Admission::Queued { position })
            }
            Enqueued::Full => {
                self.store
                    .increment_workspace_counter(workspace_id, WorkspaceCounter::ExecutionsSkipped)
                    .await?;
                tracing::warn!("🚫 {} queue full ({} waiting)", target, overlap.max_queue_size);
                Ok(Admission::QueueFull)
            }
        }
    }

    /// Give back a slot and promote whatever queued work now fits.
    /// Returned entries already hold a slot each.
    pub async fn release(&self, target: TaskRef, workspace_id: Uuid) -> Result<Vec<QueueEntry>> {
        let released = self.store.release_slot(target).await?;
        tracing::debug!("🔓 {} released ({} running)", target, released.running);
        if released.overlap.policy != OverlapPolicy::Queue {
            return Ok(Vec::new());
        }
        self.promote(target, workspace_id).await
    }

    /// Pop queue heads while capacity remains. Blocked tenants keep their queue.
    pub async fn promote(&self, target: TaskRef, workspace_id: Uuid) -> Result<Vec<QueueEntry>> {
        if self.tenants.is_blocked(workspace_id).await? {
            tracing::debug!("🔒 Workspace {} blocked, not promoting {}", workspace_id, target);
            return Ok(Vec::new());
        }
        let mut promoted = Vec::new();
        while let Some(entry) = self.store.promote_queue_head(target, Utc::now()).await? {
            tracing::info!("⬆️ Promoted queued {} (priority {})", target, entry.priority);
            promoted.push(entry);
        }
        Ok(promoted)
    }

    /// Zero leaked counters and promote the queues they were holding back.
    pub async fn sweep_stale(&self, now: DateTime<Utc>) -> Result<Vec<(StaleInstance, Vec<QueueEntry>)>> {
        let stale = self.store.reset_stale_instances(now).await?;
        let mut out = Vec::with_capacity(stale.len());
        for instance in stale {
            tracing::warn!(
                "🧹 Reset {} stale instance(s) of {} (last run {:?})",
                instance.running_instances,
                instance.target,
                instance.last_run_at
            );
            let promoted = self.promote(instance.target, instance.workspace_id).await?;
            out.push((instance, promoted));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{memory_store, queue_task};
    use taskclaw_core::types::OverlapSettings;

    #[tokio::test]
    async fn test_skip_policy_across_concurrent_admits() {
        let store = memory_store();
        let guard = OverlapGuard::new(store.clone(), store.clone());
        let mut task = queue_task("skip-me", OverlapPolicy::Skip, 1, 0);
        task.overlap.max_instances = 1;
        store.save_task(&task).await.unwrap();
        let target = task.task_ref();
        let vars = Variables::new();

        let (a, b) = tokio::join!(
            guard.admit(target, task.workspace_id, 0, &vars),
            guard.admit(target, task.workspace_id, 0, &vars)
        );
        let mut outcomes = [a.unwrap(), b.unwrap()];
        outcomes.sort_by_key(|o| o.as_str());
        assert_eq!(outcomes, [Admission::Allowed { running: 1 }, Admission::Skipped]);
        assert_eq!(store.running_instances(target).await.unwrap(), 1);
        let stats = store.workspace_stats(task.workspace_id).await.unwrap();
        assert_eq!(stats.executions_skipped, 1);
    }

    #[tokio::test]
    async fn test_queue_policy_admits_queues_then_rejects() {
        let store = memory_store();
        let guard = OverlapGuard::new(store.clone(), store.clone());
        let task = queue_task("queue-me", OverlapPolicy::Queue, 1, 1);
        store.save_task(&task).await.unwrap();
        let target = task.task_ref();
        let ws = task.workspace_id;
        let vars = Variables::new();

        assert_eq!(guard.admit(target, ws, 0, &vars).await.unwrap(), Admission::Allowed { running: 1 });
        assert_eq!(guard.admit(target, ws, 0, &vars).await.unwrap(), Admission::Queued { position: 1 });
        assert_eq!(guard.admit(target, ws, 0, &vars).await.unwrap(), Admission::QueueFull);

        let stats = store.workspace_stats(ws).await.unwrap();
        assert_eq!(stats.executions_queued, 1);
        assert_eq!(stats.executions_skipped, 1);
        assert_eq!(store.queue_depth(target).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_release_promotes_queue_head() {
        let store = memory_store();
        let guard = OverlapGuard::new(store.clone(), store.clone());
        let task = queue_task("promote", OverlapPolicy::Queue, 1, 5);
        store.save_task(&task).await.unwrap();
        let target = task.task_ref();
        let ws = task.workspace_id;
        let vars = Variables::new();

        guard.admit(target, ws, 0, &vars).await.unwrap();
        guard.admit(target, ws, 1, &vars).await.unwrap();
        guard.admit(target, ws, 9, &vars).await.unwrap();

        let promoted = guard.release(target, ws).await.unwrap();
        assert_eq!(promoted.len(), 1);
        assert_eq!(promoted[0].priority, 9);
        assert_eq!(store.running_instances(target).await.unwrap(), 1);
        assert_eq!(store.queue_depth(target).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_release_at_zero_stays_zero() {
        let store = memory_store();
        let guard = OverlapGuard::new(store.clone(), store.clone());
        let task = queue_task("idle", OverlapPolicy::Allow, 1, 0);
        store.save_task(&task).await.unwrap();

        assert!(guard.release(task.task_ref(), task.workspace_id).await.unwrap().is_empty());
        assert_eq!(store.running_instances(task.task_ref()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_blocked_tenant_queue_is_not_promoted() {
        let store = memory_store();
        let guard = OverlapGuard::new(store.clone(), store.clone());
        let task = queue_task("blocked", OverlapPolicy::Queue, 1, 5);
        store.save_task(&task).await.unwrap();
        let target = task.task_ref();
        let ws = task.workspace_id;

        guard.admit(target, ws, 0, &Variables::new()).await.unwrap();
        guard.admit(target, ws, 0, &Variables::new()).await.unwrap();
        store.set_workspace_blocked(ws, true).unwrap();

        assert!(guard.release(target, ws).await.unwrap().is_empty());
        assert_eq!(store.queue_depth(target).await.unwrap(), 1);
        assert_eq!(store.running_instances(target).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_sweep_resets_and_promotes() {
        let store = memory_store();
        let guard = OverlapGuard::new(store.clone(), store.clone());
        let mut task = queue_task("stuck", OverlapPolicy::Queue, 1, 5);
        task.overlap = OverlapSettings {
            execution_timeout: Some(60),
            ..task.overlap
        };
        store.save_task(&task).await.unwrap();
        let target = task.task_ref();
        let ws = task.workspace_id;

        guard.admit(target, ws, 0, &Variables::new()).await.unwrap();
        guard.admit(target, ws, 0, &Variables::new()).await.unwrap();

        let later = Utc::now() + chrono::Duration::seconds(120);
        let swept = guard.sweep_stale(later).await.unwrap();
        assert_eq!(swept.len(), 1);
        assert_eq!(swept[0].0.running_instances, 1);
        assert_eq!(swept[0].1.len(), 1);
        assert_eq!(store.running_instances(target).await.unwrap(), 1);
    }

    /// Two handles on one database file, like two scheduler replicas.
    fn replicas(dir: &std::path::Path) -> (OverlapGuard, OverlapGuard, Arc<taskclaw_db::SqliteStore>) {
        let path = dir.join("taskclaw.db");
        let a = Arc::new(taskclaw_db::SqliteStore::open(&path).unwrap());
        let b = Arc::new(taskclaw_db::SqliteStore::open(&path).unwrap());
        (OverlapGuard::new(a.clone(), a.clone()), OverlapGuard::new(b.clone(), b), a)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_parallel_admits_from_two_replicas() {
        let dir = std::env::temp_dir().join(format!("taskclaw-admit-{}", Uuid::new_v4()));
        let (a, b, store) = replicas(&dir);

        let skip = queue_task("skip-race", OverlapPolicy::Skip, 1, 0);
        let queue = queue_task("queue-race", OverlapPolicy::Queue, 1, 5);
        store.save_task(&skip).await.unwrap();
        store.save_task(&queue).await.unwrap();

        for task in [&skip, &queue] {
            let (target, ws) = (task.task_ref(), task.workspace_id);
            let first = {
                let a = a.clone();
                tokio::spawn(async move { a.admit(target, ws, 0, &Variables::new()).await })
            };
            let second = {
                let b = b.clone();
                tokio::spawn(async move { b.admit(target, ws, 0, &Variables::new()).await })
            };
            let mut outcomes = [first.await.unwrap().unwrap(), second.await.unwrap().unwrap()];
            outcomes.sort_by_key(|o| o.as_str());
            let expected = match task.overlap.policy {
                OverlapPolicy::Skip => [Admission::Allowed { running: 1 }, Admission::Skipped],
                _ => [Admission::Allowed { running: 1 }, Admission::Queued { position: 1 }],
            };
            assert_eq!(outcomes, expected);
            assert_eq!(store.running_instances(target).await.unwrap(), 1);
        }
        assert_eq!(store.queue_depth(queue.task_ref()).await.unwrap(), 1);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_release_racing_admit_never_strands_an_entry() {
        let dir = std::env::temp_dir().join(format!("taskclaw-strand-{}", Uuid::new_v4()));
        let (a, b, store) = replicas(&dir);
        let task = queue_task("handover", OverlapPolicy::Queue, 1, 5);
        store.save_task(&task).await.unwrap();
        let (target, ws) = (task.task_ref(), task.workspace_id);

        for _ in 0..20 {
            assert!(matches!(
                a.admit(target, ws, 0, &Variables::new()).await.unwrap(),
                Admission::Allowed { .. }
            ));
            let release = {
                let a = a.clone();
                tokio::spawn(async move { a.release(target, ws).await })
            };
            let admit = {
                let b = b.clone();
                tokio::spawn(async move { b.admit(target, ws, 0, &Variables::new()).await })
            };
            release.await.unwrap().unwrap();
            admit.await.unwrap().unwrap();

            // Whichever order the two landed in, the newcomer holds the slot.
            assert_eq!(store.running_instances(target).await.unwrap(), 1);
            assert_eq!(store.queue_depth(target).await.unwrap(), 0);
            a.release(target, ws).await.unwrap();
        }

        std::fs::remove_dir_all(&dir).ok();
    }
}
