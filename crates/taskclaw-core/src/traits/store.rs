//! Persistence boundary: task definitions, overlap state, queue and execution log.
//!
//! Every overlap mutation is a single-row atomic operation scoped to the
//! owning task or chain row; callers never read-modify-write counters.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::Result;
use crate::types::{
    ChainDefinition, ChainExecutionRecord, OverlapSettings, QueueEntry, StepExecutionRecord,
    TaskDefinition, TaskExecutionRecord, TaskRef, WorkspaceCounter, WorkspaceStats,
};

/// A task claimed by one scheduler; `task.next_run_at` is already advanced.
#[derive(Debug, Clone)]
pub struct ClaimedTask {
    pub task: TaskDefinition,
    /// The `next_run_at` the claim was made for.
    pub due_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ClaimedChain {
    pub chain: ChainDefinition,
    pub due_at: DateTime<Utc>,
}

/// Result of a conditional `running_instances` increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotGrant {
    Acquired { running: u32 },
    /// No capacity; carries the row's current overlap settings.
    Saturated { overlap: OverlapSettings },
}

/// Result of a bounded enqueue, decided under the owner row's lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    /// 1-based position in (priority desc, queued_at asc) order.
    Queued { position: u32 },
    /// A slot freed up since admission was refused; it was taken instead of
    /// writing the entry.
    Acquired { running: u32 },
    /// Depth already at `max_queue_size`.
    Full,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotRelease {
    pub running: u32,
    pub overlap: OverlapSettings,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaleInstance {
    pub target: TaskRef,
    pub workspace_id: Uuid,
    /// Count before the reset.
    pub running_instances: u32,
    pub last_run_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutcomeUpdate {
    pub previous_failures: u32,
    pub consecutive_failures: u32,
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    // ─── Definitions ───

    async fn save_task(&self, task: &TaskDefinition) -> Result<()>;

    async fn get_task(&self, id: Uuid) -> Result<Option<TaskDefinition>>;

    /// Upserts the chain row and replaces its steps.
    async fn save_chain(&self, chain: &ChainDefinition) -> Result<()>;

    /// Steps come back sorted by `step_order`.
    async fn get_chain(&self, id: Uuid) -> Result<Option<ChainDefinition>>;

    async fn save_workspace(&self, workspace_id: Uuid, name: &str, is_blocked: bool) -> Result<()>;

    // ─── Claim-with-skip ───

    /// Claim due cron/delayed tasks, skipping rows locked by other claimants,
    /// and advance their `next_run_at` in the same transaction.
    async fn claim_due_tasks(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<ClaimedTask>>;

    async fn claim_due_chains(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<ClaimedChain>>;

    /// Put a claimed definition back to `due_at` after its dispatch failed.
    async fn restore_next_run(&self, target: TaskRef, due_at: DateTime<Utc>) -> Result<()>;

    // ─── Overlap counters ───

    /// Increment `running_instances` when policy is ALLOW or capacity remains;
    /// stamps `last_run_at = now` on success.
    async fn acquire_slot(&self, target: TaskRef, now: DateTime<Utc>) -> Result<SlotGrant>;

    /// Decrement `running_instances`, never below zero.
    async fn release_slot(&self, target: TaskRef) -> Result<SlotRelease>;

    async fn running_instances(&self, target: TaskRef) -> Result<u32>;

    /// Zero the counter of definitions whose newest run outlived `execution_timeout`.
    async fn reset_stale_instances(&self, now: DateTime<Utc>) -> Result<Vec<StaleInstance>>;

    // ─── Bounded queue ───

    /// Under the owner row's lock: take a slot when one is free, otherwise
    /// insert when depth < the row's `max_queue_size`.
    async fn enqueue_bounded(&self, entry: &QueueEntry, now: DateTime<Utc>) -> Result<Enqueued>;

    /// Pop the head entry and take a slot for it, atomically, when capacity remains.
    async fn promote_queue_head(&self, target: TaskRef, now: DateTime<Utc>) -> Result<Option<QueueEntry>>;

    async fn queue_depth(&self, target: TaskRef) -> Result<u32>;

    async fn queue_head(&self, target: TaskRef, limit: u32) -> Result<Vec<QueueEntry>>;

    async fn clear_queue(&self, target: TaskRef) -> Result<u32>;

    // ─── Workspace counters ───

    async fn increment_workspace_counter(&self, workspace_id: Uuid, counter: WorkspaceCounter) -> Result<()>;

    async fn workspace_stats(&self, workspace_id: Uuid) -> Result<WorkspaceStats>;

    /// Reset (success) or bump (failure) `consecutive_failures`.
    async fn record_outcome(&self, target: TaskRef, success: bool) -> Result<OutcomeUpdate>;
}

/// Append-only execution records: inserted at start, sealed once at finish.
#[async_trait]
pub trait ExecutionLog: Send + Sync {
    async fn insert_task_execution(&self, record: &TaskExecutionRecord) -> Result<()>;

    async fn finish_task_execution(&self, record: &TaskExecutionRecord) -> Result<()>;

    async fn get_task_execution(&self, id: Uuid) -> Result<Option<TaskExecutionRecord>>;

    async fn insert_chain_execution(&self, record: &ChainExecutionRecord) -> Result<()>;

    async fn finish_chain_execution(&self, record: &ChainExecutionRecord) -> Result<()>;

    async fn get_chain_execution(&self, id: Uuid) -> Result<Option<ChainExecutionRecord>>;

    async fn insert_step_execution(&self, record: &StepExecutionRecord) -> Result<()>;

    async fn finish_step_execution(&self, record: &StepExecutionRecord) -> Result<()>;

    /// Ordered by `step_order`.
    async fn list_step_executions(&self, chain_execution_id: Uuid) -> Result<Vec<StepExecutionRecord>>;
}
