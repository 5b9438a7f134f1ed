//! Dispatcher: runs admitted work in the local pool or hands it to a bound
//! external worker, and closes the loop on completion from either path.

use chrono::Utc;
use futures::FutureExt;
use futures::future::BoxFuture;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{Notify, Semaphore};
use uuid::Uuid;

use taskclaw_core::error::{Result, TaskClawError};
use taskclaw_core::traits::{FailureAlert, NotificationService, OutcomeUpdate, TaskStore, WorkerQueue};
use taskclaw_core::types::{
    ChainDefinition, ChainExecutionRecord, ChainStatus, ProbeErrorKind, QueueEntry, StepResult, TaskDefinition,
    TaskKind, TaskRef, Variables, WorkPayload, WorkUnit, WorkerReport,
};

use crate::chain::ChainExecutor;
use crate::engine::EngineServices;
use crate::overlap::OverlapGuard;
use crate::recorder::ExecutionRecorder;
use crate::step::StepRunner;

/// Admitted work. Whoever holds one also holds a slot on its target.
#[derive(Debug, Clone)]
pub enum WorkItem {
    Task { task: TaskDefinition },
    Chain { chain: ChainDefinition, variables: Variables },
}

impl WorkItem {
    pub fn target(&self) -> TaskRef {
        match self {
            WorkItem::Task { task } => task.task_ref(),
            WorkItem::Chain { chain, .. } => chain.task_ref(),
        }
    }

    pub fn workspace_id(&self) -> Uuid {
        match self {
            WorkItem::Task { task } => task.workspace_id,
            WorkItem::Chain { chain, .. } => chain.workspace_id,
        }
    }

    pub fn worker_id(&self) -> Option<Uuid> {
        match self {
            WorkItem::Task { task } => task.worker_id,
            WorkItem::Chain { chain, .. } => chain.worker_id,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            WorkItem::Task { task } => &task.name,
            WorkItem::Chain { chain, .. } => &chain.name,
        }
    }
}

struct Inner {
    store: Arc<dyn TaskStore>,
    recorder: ExecutionRecorder,
    guard: OverlapGuard,
    runner: Arc<dyn StepRunner>,
    chains: ChainExecutor,
    workers: Arc<dyn WorkerQueue>,
    notifier: Arc<dyn NotificationService>,
    pool: Arc<Semaphore>,
    failure_threshold: u32,
    in_flight: AtomicUsize,
    idle: Notify,
}

#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Dispatcher {
    pub fn new(services: &EngineServices, pool_size: usize, failure_threshold: u32) -> Self {
        let recorder = ExecutionRecorder::new(services.executions.clone()).with_body_limit(services.record_body_limit);
        let chains = ChainExecutor::new(services.runner.clone(), recorder.clone(), services.tasks.clone());
        Self {
            inner: Arc::new(Inner {
                store: services.tasks.clone(),
                guard: OverlapGuard::new(services.tasks.clone(), services.tenants.clone()),
                recorder,
                runner: services.runner.clone(),
                chains,
                workers: services.workers.clone(),
                notifier: services.notifier.clone(),
                pool: Arc::new(Semaphore::new(pool_size.max(1))),
                failure_threshold: failure_threshold.max(1),
                in_flight: AtomicUsize::new(0),
                idle: Notify::new(),
            }),
        }
    }

    pub fn guard(&self) -> &OverlapGuard {
        &self.inner.guard
    }

    pub fn recorder(&self) -> &ExecutionRecorder {
        &self.inner.recorder
    }

    /// Local executions currently running.
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    /// Send admitted work down its execution path. On `Err` the slot is still
    /// held and the caller must release it.
    pub fn dispatch(&self, item: WorkItem) -> BoxFuture<'static, Result<()>> {
        let this = self.clone();
        async move {
            match item.worker_id() {
                Some(worker_id) => this.hand_off(worker_id, item).await,
                None => this.spawn_local(item).await,
            }
        }
        .boxed()
    }

    async fn hand_off(&self, worker_id: Uuid, item: WorkItem) -> Result<()> {
        let target = item.target();
        let workspace_id = item.workspace_id();
        let (execution_id, payload) = match item {
            WorkItem::Task { task } => {
                let record = self.inner.recorder.start_task(&task).await?;
                (record.id, WorkPayload::Task { task })
            }
            WorkItem::Chain { chain, variables } => {
                let record = self.inner.recorder.start_chain(&chain, &variables).await?;
                (record.id, WorkPayload::Chain { chain, variables })
            }
        };
        let unit = WorkUnit {
            id: Uuid::new_v4(),
            target,
            workspace_id,
            worker_id,
            execution_id,
            payload,
            enqueued_at: Utc::now(),
        };
        if let Err(e) = self.inner.workers.enqueue(worker_id, &unit).await {
            self.seal_unit(&unit, &WorkerReport {
                error_message: Some(format!("worker hand-off failed: {e}")),
                error_type: Some(ProbeErrorKind::Generic),
                ..Default::default()
            })
            .await;
            return Err(e);
        }
        tracing::info!("📤 {} handed to worker {}", target, worker_id);
        Ok(())
    }

    async fn spawn_local(&self, item: WorkItem) -> Result<()> {
        let permit = self
            .inner
            .pool
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| TaskClawError::Worker("execution pool closed".into()))?;
        self.inner.in_flight.fetch_add(1, Ordering::SeqCst);

        let this = self.clone();
        tokio::spawn(async move {
            let target = item.target();
            let workspace_id = item.workspace_id();
            let name = item.name().to_string();
            let (success, error) = match this.execute_local(item).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    tracing::error!("❌ {} '{}' execution error: {}", target, name, e);
                    (false, Some(e.to_string()))
                }
            };
            drop(permit);
            if let Err(e) = this.complete(target, workspace_id, &name, success, error).await {
                tracing::error!("❌ Completing {} failed: {}", target, e);
            }
            if this.inner.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
                this.inner.idle.notify_waiters();
            }
        });
        Ok(())
    }

    async fn execute_local(&self, item: WorkItem) -> Result<(bool, Option<String>)> {
        match item {
            WorkItem::Task { task } => {
                let record = self.inner.recorder.start_task(&task).await?;
                let result = self.inner.runner.run(&task.protocol, &task.probe).await;
                self.inner.recorder.finish_task(record, &result).await?;
                if result.is_success() {
                    tracing::info!("✅ Task '{}' ok ({}ms)", task.name, result.duration_ms);
                } else {
                    tracing::warn!(
                        "❌ Task '{}' failed: {}",
                        task.name,
                        result.error_message().unwrap_or_default()
                    );
                }
                Ok((result.is_success(), result.error_message()))
            }
            WorkItem::Chain { chain, variables } => {
                let record = self.inner.chains.run(&chain, variables).await?;
                Ok((record.status == ChainStatus::Success, record.error_message))
            }
        }
    }

    /// Run an admitted chain to completion on the caller's task.
    pub async fn run_chain_inline(
        &self,
        chain: &ChainDefinition,
        variables: Variables,
    ) -> Result<ChainExecutionRecord> {
        let result = self.inner.chains.run(chain, variables).await;
        let (success, error) = match &result {
            Ok(record) => (record.status == ChainStatus::Success, record.error_message.clone()),
            Err(e) => (false, Some(e.to_string())),
        };
        self.complete(chain.task_ref(), chain.workspace_id, &chain.name, success, error)
            .await?;
        result
    }

    /// Terminal completion from either path: failure streak, alerts, slot
    /// release and promotion of queued work.
    async fn complete(
        &self,
        target: TaskRef,
        workspace_id: Uuid,
        name: &str,
        success: bool,
        error: Option<String>,
    ) -> Result<()> {
        match self.inner.store.record_outcome(target, success).await {
            Ok(update) => self.notify(target.kind, workspace_id, name, success, error, update),
            Err(e) => tracing::error!("❌ Recording outcome of {} failed: {}", target, e),
        }
        let promoted = self.inner.guard.release(target, workspace_id).await?;
        self.dispatch_promoted(promoted).await;
        Ok(())
    }

    fn notify(
        &self,
        kind: TaskKind,
        workspace_id: Uuid,
        name: &str,
        success: bool,
        error: Option<String>,
        update: OutcomeUpdate,
    ) {
        let threshold = self.inner.failure_threshold;
        let alert = FailureAlert {
            workspace_id,
            task_name: name.to_string(),
            task_type: kind,
            error,
            consecutive_failures: update.consecutive_failures,
        };
        let notifier = self.inner.notifier.clone();
        if !success && update.consecutive_failures == threshold {
            tokio::spawn(async move {
                if let Err(e) = notifier.send_failure(&alert).await {
                    tracing::warn!("⚠️ {} failure notification: {}", notifier.name(), e);
                }
            });
        } else if success && update.previous_failures >= threshold {
            tokio::spawn(async move {
                if let Err(e) = notifier.send_recovery(&alert).await {
                    tracing::warn!("⚠️ {} recovery notification: {}", notifier.name(), e);
                }
            });
        }
    }

    /// Dispatch promoted queue entries. Each already holds a slot; entries that
    /// cannot be dispatched give it back, which may promote the next one.
    pub async fn dispatch_promoted(&self, entries: Vec<QueueEntry>) -> usize {
        let mut pending: VecDeque<QueueEntry> = entries.into();
        let mut dispatched = 0;
        while let Some(entry) = pending.pop_front() {
            let target = entry.target();
            let failure = match self.load_item(&entry).await {
                Ok(Some(item)) => match self.dispatch(item).await {
                    Ok(()) => {
                        dispatched += 1;
                        continue;
                    }
                    Err(e) => e.to_string(),
                },
                Ok(None) => "definition no longer exists".to_string(),
                Err(e) => e.to_string(),
            };
            tracing::error!("❌ Promoted {} not dispatched: {}", target, failure);
            match self.inner.guard.release(target, entry.workspace_id).await {
                Ok(more) => pending.extend(more),
                Err(e) => tracing::error!("❌ Releasing {} failed: {}", target, e),
            }
        }
        dispatched
    }

    async fn load_item(&self, entry: &QueueEntry) -> Result<Option<WorkItem>> {
        if entry.task_type == TaskKind::Chain {
            Ok(self.inner.store.get_chain(entry.task_id).await?.map(|chain| WorkItem::Chain {
                chain,
                variables: entry.initial_variables.clone(),
            }))
        } else {
            Ok(self.inner.store.get_task(entry.task_id).await?.map(|task| WorkItem::Task { task }))
        }
    }

    /// Units waiting for a worker's next poll.
    pub async fn poll(&self, worker_id: Uuid, max: usize) -> Result<Vec<WorkUnit>> {
        self.inner.workers.poll(worker_id, max).await
    }

    /// Close out a worker-executed unit. Only the worker the unit was handed
    /// to may report it; anyone else gets `NotFound`.
    pub async fn report_result(&self, worker_id: Uuid, unit_id: Uuid, report: WorkerReport) -> Result<WorkUnit> {
        let unit = self
            .inner
            .workers
            .take(worker_id, unit_id)
            .await?
            .ok_or_else(|| TaskClawError::NotFound(format!("work unit {unit_id} for worker {worker_id}")))?;
        self.seal_unit(&unit, &report).await;

        tracing::info!(
            "📥 Worker {} reported {} ({})",
            unit.worker_id,
            unit.target,
            if report.is_success() { "ok" } else { "failed" }
        );
        let error = report
            .error_message
            .clone()
            .or_else(|| StepResult { status_code: report.status_code, ..Default::default() }.error_message());
        self.complete(unit.target, unit.workspace_id, unit_name(&unit), report.is_success(), error)
            .await?;
        Ok(unit)
    }

    /// Fail every worker unit of a target the stale sweep just reset. Late
    /// reports for these units then find nothing. The sweep already zeroed
    /// the counter, so no slot is released here.
    pub async fn expire_units(&self, target: TaskRef) -> Result<usize> {
        let units = self.inner.workers.drain_target(target).await?;
        for unit in &units {
            tracing::warn!("⌛ Unit {} of {} expired on worker {}", unit.id, target, unit.worker_id);
            let report = WorkerReport {
                error_message: Some("worker did not report before execution_timeout".to_string()),
                error_type: Some(ProbeErrorKind::Timeout),
                ..Default::default()
            };
            self.seal_unit(unit, &report).await;
            match self.inner.store.record_outcome(target, false).await {
                Ok(update) => self.notify(
                    target.kind,
                    unit.workspace_id,
                    unit_name(unit),
                    false,
                    report.error_message,
                    update,
                ),
                Err(e) => tracing::error!("❌ Recording outcome of {} failed: {}", target, e),
            }
        }
        Ok(units.len())
    }

    /// Seal the execution record opened at hand-off. Store errors are logged;
    /// completion must still run so the slot is released.
    async fn seal_unit(&self, unit: &WorkUnit, report: &WorkerReport) {
        let log = self.inner.recorder.log();
        let sealed = match &unit.payload {
            WorkPayload::Task { .. } => match log.get_task_execution(unit.execution_id).await {
                Ok(Some(record)) => self.inner.recorder.finish_task_report(record, report).await.map(|_| ()),
                Ok(None) => Err(TaskClawError::NotFound(format!("task execution {}", unit.execution_id))),
                Err(e) => Err(e),
            },
            WorkPayload::Chain { .. } => match log.get_chain_execution(unit.execution_id).await {
                Ok(Some(mut record)) => {
                    match &report.chain {
                        Some(summary) => {
                            record.status = if summary.status.is_terminal() {
                                summary.status
                            } else {
                                ChainStatus::Failed
                            };
                            record.completed_steps = summary.completed_steps;
                            record.failed_steps = summary.failed_steps;
                            record.skipped_steps = summary.skipped_steps;
                            record.total_steps = summary.completed_steps + summary.failed_steps + summary.skipped_steps;
                            if !summary.variables.is_empty() {
                                record.variables = summary.variables.clone();
                            }
                        }
                        None => record.status = ChainStatus::Failed,
                    }
                    record.error_message = report.error_message.clone();
                    self.inner.recorder.finish_chain(record).await.map(|_| ())
                }
                Ok(None) => Err(TaskClawError::NotFound(format!("chain execution {}", unit.execution_id))),
                Err(e) => Err(e),
            },
        };
        if let Err(e) = sealed {
            tracing::error!("❌ Sealing record for unit {} failed: {}", unit.id, e);
        }
    }

    /// Resolves once no local execution is running.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            if self.in_flight() == 0 {
                return;
            }
            notified.await;
        }
    }
}

fn unit_name(unit: &WorkUnit) -> &str {
    match &unit.payload {
        WorkPayload::Task { task } => &task.name,
        WorkPayload::Chain { chain, .. } => &chain.name,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{RecordingNotifier, ScriptedRunner, memory_store, ok, queue_task, services};
    use taskclaw_core::traits::ExecutionLog;
    use taskclaw_core::types::{ChainReport, ExecutionStatus, HttpRequest, OverlapPolicy, Protocol};

    #[tokio::test]
    async fn test_local_task_runs_and_releases() {
        let store = memory_store();
        let runner = ScriptedRunner::new();
        let svc = services(&store, runner.clone(), RecordingNotifier::new());
        let dispatcher = Dispatcher::new(&svc, 4, 1);

        let task = queue_task("local", OverlapPolicy::Skip, 1, 0);
        store.save_task(&task).await.unwrap();
        dispatcher.guard().admit(task.task_ref(), task.workspace_id, 0, &Variables::new()).await.unwrap();
        assert_eq!(store.running_instances(task.task_ref()).await.unwrap(), 1);

        dispatcher.dispatch(WorkItem::Task { task: task.clone() }).await.unwrap();
        dispatcher.wait_idle().await;
        assert_eq!(store.running_instances(task.task_ref()).await.unwrap(), 0);
        assert_eq!(runner.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_completion_promotes_queued_entry() {
        let store = memory_store();
        let runner = ScriptedRunner::new();
        let svc = services(&store, runner.clone(), RecordingNotifier::new());
        let dispatcher = Dispatcher::new(&svc, 4, 1);

        let task = queue_task("queued", OverlapPolicy::Queue, 1, 3);
        store.save_task(&task).await.unwrap();
        let target = task.task_ref();
        let guard = dispatcher.guard();
        guard.admit(target, task.workspace_id, 0, &Variables::new()).await.unwrap();
        guard.admit(target, task.workspace_id, 0, &Variables::new()).await.unwrap();
        assert_eq!(store.queue_depth(target).await.unwrap(), 1);

        dispatcher.dispatch(WorkItem::Task { task }).await.unwrap();
        dispatcher.wait_idle().await;
        assert_eq!(runner.calls().len(), 2);
        assert_eq!(store.queue_depth(target).await.unwrap(), 0);
        assert_eq!(store.running_instances(target).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_failure_alert_at_threshold_then_recovery() {
        let store = memory_store();
        let runner = ScriptedRunner::new();
        runner.script("http://localhost/queue_task", vec![ok(500, ""), ok(500, ""), ok(200, "")]);
        let notifier = RecordingNotifier::new();
        let svc = services(&store, runner.clone(), notifier.clone());
        let dispatcher = Dispatcher::new(&svc, 1, 2);

        let task = queue_task("queue_task", OverlapPolicy::Allow, 1, 0);
        store.save_task(&task).await.unwrap();
        for _ in 0..3 {
            dispatcher.guard().admit(task.task_ref(), task.workspace_id, 0, &Variables::new()).await.unwrap();
            dispatcher.dispatch(WorkItem::Task { task: task.clone() }).await.unwrap();
            dispatcher.wait_idle().await;
        }
        notifier.settle().await;
        assert_eq!(notifier.failures().len(), 1);
        assert_eq!(notifier.failures()[0].consecutive_failures, 2);
        assert_eq!(notifier.recoveries().len(), 1);
    }

    #[tokio::test]
    async fn test_worker_round_trip() {
        let store = memory_store();
        let svc = services(&store, ScriptedRunner::new(), RecordingNotifier::new());
        let dispatcher = Dispatcher::new(&svc, 2, 1);

        let worker_id = Uuid::new_v4();
        let mut task = TaskDefinition::cron(
            Uuid::new_v4(),
            "remote",
            "* * * * *",
            Protocol::Http(HttpRequest::get("http://intranet/health")),
        );
        task.worker_id = Some(worker_id);
        store.save_task(&task).await.unwrap();
        dispatcher.guard().admit(task.task_ref(), task.workspace_id, 0, &Variables::new()).await.unwrap();
        dispatcher.dispatch(WorkItem::Task { task: task.clone() }).await.unwrap();

        let units = dispatcher.poll(worker_id, 10).await.unwrap();
        assert_eq!(units.len(), 1);
        assert_eq!(store.running_instances(task.task_ref()).await.unwrap(), 1);

        let report = WorkerReport {
            status_code: Some(200),
            duration_ms: 12,
            ..Default::default()
        };
        let intruder = dispatcher.report_result(Uuid::new_v4(), units[0].id, report.clone()).await;
        assert!(matches!(intruder, Err(TaskClawError::NotFound(_))));
        assert_eq!(store.running_instances(task.task_ref()).await.unwrap(), 1);

        dispatcher.report_result(worker_id, units[0].id, report).await.unwrap();
        assert_eq!(store.running_instances(task.task_ref()).await.unwrap(), 0);
        let record = store.get_task_execution(units[0].execution_id).await.unwrap().unwrap();
        assert_eq!(record.status, ExecutionStatus::Success);
        assert_eq!(record.worker_id, Some(worker_id));

        let again = dispatcher.report_result(worker_id, units[0].id, WorkerReport::default()).await;
        assert!(matches!(again, Err(TaskClawError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_worker_chain_report_seals_counts() {
        let store = memory_store();
        let svc = services(&store, ScriptedRunner::new(), RecordingNotifier::new());
        let dispatcher = Dispatcher::new(&svc, 2, 1);

        let worker_id = Uuid::new_v4();
        let mut chain = ChainDefinition::new(Uuid::new_v4(), "remote-flow");
        chain.push_step("a", HttpRequest::get("http://a"));
        chain.push_step("b", HttpRequest::get("http://b"));
        chain.worker_id = Some(worker_id);
        store.save_chain(&chain).await.unwrap();
        dispatcher.guard().admit(chain.task_ref(), chain.workspace_id, 0, &Variables::new()).await.unwrap();
        dispatcher
            .dispatch(WorkItem::Chain { chain: chain.clone(), variables: Variables::new() })
            .await
            .unwrap();

        let unit = dispatcher.poll(worker_id, 1).await.unwrap().remove(0);
        let report = WorkerReport {
            chain: Some(ChainReport {
                status: ChainStatus::Partial,
                completed_steps: 1,
                failed_steps: 1,
                skipped_steps: 0,
                variables: Variables::new(),
            }),
            ..Default::default()
        };
        dispatcher.report_result(worker_id, unit.id, report).await.unwrap();
        let record = store.get_chain_execution(unit.execution_id).await.unwrap().unwrap();
        assert_eq!(record.status, ChainStatus::Partial);
        assert_eq!(record.total_steps, 2);
        assert_eq!(store.running_instances(chain.task_ref()).await.unwrap(), 0);
    }
}
