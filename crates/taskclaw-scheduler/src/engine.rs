//! Scheduler engine: the tick loop that claims due work, runs it through the
//! overlap guard and hands admitted units to the dispatcher, plus the stale
//! sweep that recovers leaked slots.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use taskclaw_core::config::SchedulerConfig;
use taskclaw_core::error::{Result, TaskClawError};
use taskclaw_core::traits::{ExecutionLog, NotificationService, TaskStore, TenantGate, WorkerQueue};
use taskclaw_core::types::{ChainExecutionRecord, TaskRef, Variables};

use crate::dispatch::{Dispatcher, WorkItem};
use crate::overlap::Admission;
use crate::selector::DueTaskSelector;
use crate::step::StepRunner;

const SKIPPED_REASON: &str = "max_instances reached";
const QUEUE_FULL_REASON: &str = "queue full";

/// Collaborators the engine is wired from.
#[derive(Clone)]
pub struct EngineServices {
    pub tasks: Arc<dyn TaskStore>,
    pub executions: Arc<dyn ExecutionLog>,
    pub tenants: Arc<dyn TenantGate>,
    pub workers: Arc<dyn WorkerQueue>,
    pub runner: Arc<dyn StepRunner>,
    pub notifier: Arc<dyn NotificationService>,
    /// Response bodies are cut to this many bytes in execution records.
    pub record_body_limit: usize,
}

/// What one tick did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub claimed: usize,
    pub dispatched: usize,
    pub skipped: usize,
    pub queued: usize,
    pub queue_full: usize,
    pub errors: usize,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Targets whose counter was reset.
    pub reset: usize,
    /// Queued entries dispatched after the reset.
    pub resumed: usize,
    /// Worker units failed because their target was reset.
    pub expired: usize,
}

/// Result of an on-demand chain run.
#[derive(Debug, Clone)]
pub enum ChainRunOutcome {
    Completed(ChainExecutionRecord),
    Queued { position: u32 },
    /// Overlap denied the run; the record is CANCELLED.
    Denied(ChainExecutionRecord),
}

pub struct SchedulerEngine {
    config: SchedulerConfig,
    store: Arc<dyn TaskStore>,
    selector: DueTaskSelector,
    dispatcher: Dispatcher,
}

impl SchedulerEngine {
    pub fn new(config: &SchedulerConfig, failure_threshold: u32, services: EngineServices) -> Self {
        Self {
            config: config.clone(),
            store: services.tasks.clone(),
            selector: DueTaskSelector::new(services.tasks.clone(), config.claim_limit),
            dispatcher: Dispatcher::new(&services, config.worker_pool_size, failure_threshold),
        }
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    /// Claim everything due now and push it through admission.
    pub async fn tick(&self) -> Result<TickReport> {
        let batch = self.selector.claim_due(Utc::now()).await?;
        let mut report = TickReport {
            claimed: batch.len(),
            ..Default::default()
        };
        for claimed in batch.tasks {
            let item = WorkItem::Task { task: claimed.task };
            self.admit_and_dispatch(item, claimed.due_at, &mut report).await;
        }
        for claimed in batch.chains {
            let item = WorkItem::Chain {
                chain: claimed.chain,
                variables: Variables::new(),
            };
            self.admit_and_dispatch(item, claimed.due_at, &mut report).await;
        }
        Ok(report)
    }

    async fn admit_and_dispatch(&self, item: WorkItem, due_at: DateTime<Utc>, report: &mut TickReport) {
        let target = item.target();
        let workspace_id = item.workspace_id();
        let variables = match &item {
            WorkItem::Chain { variables, .. } => variables.clone(),
            WorkItem::Task { .. } => Variables::new(),
        };

        let admission = match self.dispatcher.guard().admit(target, workspace_id, 0, &variables).await {
            Ok(admission) => admission,
            Err(e) => {
                tracing::error!("❌ Admission of {} failed: {}", target, e);
                report.errors += 1;
                self.restore(target, due_at).await;
                return;
            }
        };

        match admission {
            Admission::Allowed { .. } => match self.dispatcher.dispatch(item).await {
                Ok(()) => report.dispatched += 1,
                Err(e) => {
                    tracing::error!("❌ Dispatch of {} failed: {}", target, e);
                    report.errors += 1;
                    match self.dispatcher.guard().release(target, workspace_id).await {
                        Ok(promoted) => {
                            self.dispatcher.dispatch_promoted(promoted).await;
                        }
                        Err(e) => tracing::error!("❌ Releasing {} failed: {}", target, e),
                    }
                    self.restore(target, due_at).await;
                }
            },
            Admission::Queued { .. } => report.queued += 1,
            Admission::Skipped => {
                report.skipped += 1;
                self.cancel_chain(&item, &variables, SKIPPED_REASON).await;
            }
            Admission::QueueFull => {
                report.queue_full += 1;
                self.cancel_chain(&item, &variables, QUEUE_FULL_REASON).await;
            }
        }
    }

    async fn restore(&self, target: TaskRef, due_at: DateTime<Utc>) {
        if let Err(e) = self.store.restore_next_run(target, due_at).await {
            tracing::error!("❌ Restoring next run of {} failed: {}", target, e);
        }
    }

    async fn cancel_chain(&self, item: &WorkItem, variables: &Variables, reason: &str) {
        if let WorkItem::Chain { chain, .. } = item {
            if let Err(e) = self.dispatcher.recorder().cancelled_chain(chain, variables, reason).await {
                tracing::error!("❌ Recording cancelled run of chain '{}' failed: {}", chain.name, e);
            }
        }
    }

    /// Admit a chain and, when allowed, run it to completion before returning.
    pub async fn run_chain_now(&self, chain_id: Uuid, variables: Variables, priority: i32) -> Result<ChainRunOutcome> {
        let chain = self
            .store
            .get_chain(chain_id)
            .await?
            .ok_or_else(|| TaskClawError::NotFound(format!("chain:{chain_id}")))?;
        let admission = self
            .dispatcher
            .guard()
            .admit(chain.task_ref(), chain.workspace_id, priority, &variables)
            .await?;
        let recorder = self.dispatcher.recorder();
        Ok(match admission {
            Admission::Allowed { .. } => ChainRunOutcome::Completed(self.dispatcher.run_chain_inline(&chain, variables).await?),
            Admission::Queued { position } => ChainRunOutcome::Queued { position },
            Admission::Skipped => ChainRunOutcome::Denied(recorder.cancelled_chain(&chain, &variables, SKIPPED_REASON).await?),
            Admission::QueueFull => {
                ChainRunOutcome::Denied(recorder.cancelled_chain(&chain, &variables, QUEUE_FULL_REASON).await?)
            }
        })
    }

    /// Reset leaked slots and resume the queues behind them.
    pub async fn sweep(&self) -> Result<SweepReport> {
        let swept = self.dispatcher.guard().sweep_stale(Utc::now()).await?;
        let mut report = SweepReport {
            reset: swept.len(),
            ..Default::default()
        };
        for (instance, promoted) in swept {
            report.expired += self.dispatcher.expire_units(instance.target).await?;
            report.resumed += self.dispatcher.dispatch_promoted(promoted).await;
        }
        Ok(report)
    }

    /// Tick and sweep on their intervals until `shutdown` flips to true, then
    /// wait for local executions to drain.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            "⏰ Scheduler '{}' started (tick every {}s, sweep every {}s)",
            self.config.instance_id,
            self.config.tick_interval_secs,
            self.config.sweep_interval_secs
        );

        let mut ticks = tokio::time::interval(Duration::from_secs(self.config.tick_interval_secs.max(1)));
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut sweeps = tokio::time::interval(Duration::from_secs(self.config.sweep_interval_secs.max(1)));
        sweeps.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticks.tick() => match self.tick().await {
                    Ok(report) if report.claimed > 0 => tracing::info!(
                        "📋 Tick: {} claimed, {} dispatched, {} skipped, {} queued, {} queue-full, {} errors",
                        report.claimed, report.dispatched, report.skipped, report.queued, report.queue_full, report.errors
                    ),
                    Ok(_) => {}
                    Err(e) => tracing::error!("❌ Tick failed: {}", e),
                },
                _ = sweeps.tick() => match self.sweep().await {
                    Ok(report) if report.reset > 0 => tracing::warn!(
                        "🧹 Sweep reset {} target(s), expired {} worker unit(s), resumed {} queued run(s)",
                        report.reset, report.expired, report.resumed
                    ),
                    Ok(_) => {}
                    Err(e) => tracing::error!("❌ Stale sweep failed: {}", e),
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        let running = self.dispatcher.in_flight();
        if running > 0 {
            tracing::info!("⏳ Waiting for {} running execution(s)", running);
        }
        self.dispatcher.wait_idle().await;
        tracing::info!("🛑 Scheduler '{}' stopped", self.config.instance_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{RecordingNotifier, ScriptedRunner, due_chain, due_task, memory_store, services};
    use taskclaw_core::types::{ChainStatus, ExecutionStatus, OverlapPolicy, WorkerReport};

    fn config() -> SchedulerConfig {
        SchedulerConfig {
            tick_interval_secs: 1,
            claim_limit: 10,
            worker_pool_size: 4,
            sweep_interval_secs: 60,
            instance_id: "test".into(),
        }
    }

    #[tokio::test]
    async fn test_tick_dispatches_due_task_once() {
        let store = memory_store();
        let runner = ScriptedRunner::new();
        let engine = SchedulerEngine::new(&config(), 1, services(&store, runner.clone(), RecordingNotifier::new()));
        let task = due_task(Uuid::new_v4(), "health");
        store.save_task(&task).await.unwrap();

        let report = engine.tick().await.unwrap();
        assert_eq!(report.claimed, 1);
        assert_eq!(report.dispatched, 1);
        engine.dispatcher().wait_idle().await;
        assert_eq!(runner.urls(), vec!["http://localhost/health"]);
        assert_eq!(store.running_instances(task.task_ref()).await.unwrap(), 0);

        assert_eq!(engine.tick().await.unwrap(), TickReport::default());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_skip_while_previous_run_in_flight() {
        let store = memory_store();
        let runner = ScriptedRunner::with_delay(Duration::from_millis(300));
        let engine = SchedulerEngine::new(&config(), 1, services(&store, runner.clone(), RecordingNotifier::new()));
        let mut task = due_task(Uuid::new_v4(), "slow");
        task.overlap.policy = OverlapPolicy::Skip;
        store.save_task(&task).await.unwrap();

        assert_eq!(engine.tick().await.unwrap().dispatched, 1);
        store
            .restore_next_run(task.task_ref(), Utc::now() - chrono::Duration::seconds(1))
            .await
            .unwrap();
        let second = engine.tick().await.unwrap();
        assert_eq!(second.skipped, 1);

        engine.dispatcher().wait_idle().await;
        assert_eq!(runner.calls().len(), 1);
        assert_eq!(store.running_instances(task.task_ref()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_tick_skips_saturated_chain_and_records_cancel() {
        let store = memory_store();
        let engine = SchedulerEngine::new(
            &config(),
            1,
            services(&store, ScriptedRunner::new(), RecordingNotifier::new()),
        );
        let mut chain = due_chain(Uuid::new_v4(), "busy");
        chain.overlap.policy = OverlapPolicy::Skip;
        store.save_chain(&chain).await.unwrap();
        store.acquire_slot(chain.task_ref(), Utc::now()).await.unwrap();

        let report = engine.tick().await.unwrap();
        assert_eq!(report.skipped, 1);
        assert_eq!(report.dispatched, 0);
        let stats = store.workspace_stats(chain.workspace_id).await.unwrap();
        assert_eq!(stats.executions_skipped, 1);
        assert_eq!(store.running_instances(chain.task_ref()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_sweep_resumes_queue_behind_stale_slot() {
        let store = memory_store();
        let runner = ScriptedRunner::new();
        let engine = SchedulerEngine::new(&config(), 1, services(&store, runner.clone(), RecordingNotifier::new()));
        let mut task = due_task(Uuid::new_v4(), "stuck");
        task.overlap.policy = OverlapPolicy::Queue;
        task.overlap.max_queue_size = 5;
        task.overlap.execution_timeout = Some(0);
        store.save_task(&task).await.unwrap();
        store.acquire_slot(task.task_ref(), Utc::now()).await.unwrap();

        assert_eq!(engine.tick().await.unwrap().queued, 1);
        tokio::time::sleep(Duration::from_millis(20)).await;

        let report = engine.sweep().await.unwrap();
        assert_eq!(report, SweepReport { reset: 1, resumed: 1, expired: 0 });
        engine.dispatcher().wait_idle().await;
        assert_eq!(runner.urls().len(), 1);
        assert_eq!(store.queue_depth(task.task_ref()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_sweep_expires_unreported_worker_units() {
        let store = memory_store();
        let engine = SchedulerEngine::new(&config(), 1, services(&store, ScriptedRunner::new(), RecordingNotifier::new()));
        let worker_id = Uuid::new_v4();
        let mut task = due_task(Uuid::new_v4(), "silent-worker");
        task.worker_id = Some(worker_id);
        task.overlap.execution_timeout = Some(0);
        store.save_task(&task).await.unwrap();

        assert_eq!(engine.tick().await.unwrap().dispatched, 1);
        let units = engine.dispatcher().poll(worker_id, 10).await.unwrap();
        assert_eq!(units.len(), 1);
        tokio::time::sleep(Duration::from_millis(20)).await;

        let report = engine.sweep().await.unwrap();
        assert_eq!(report, SweepReport { reset: 1, resumed: 0, expired: 1 });
        assert_eq!(store.running_instances(task.task_ref()).await.unwrap(), 0);

        let record = store.get_task_execution(units[0].execution_id).await.unwrap().unwrap();
        assert_eq!(record.status, ExecutionStatus::Failed);
        assert_eq!(record.error_type.as_deref(), Some("timeout"));
        assert!(record.finished_at.is_some());

        let late = engine
            .dispatcher()
            .report_result(worker_id, units[0].id, WorkerReport::default())
            .await;
        assert!(matches!(late, Err(TaskClawError::NotFound(_))));
        assert_eq!(store.running_instances(task.task_ref()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_run_chain_now_completes_and_denies() {
        let store = memory_store();
        let runner = ScriptedRunner::new();
        let engine = SchedulerEngine::new(&config(), 1, services(&store, runner.clone(), RecordingNotifier::new()));
        let mut chain = due_chain(Uuid::new_v4(), "on-demand");
        chain.overlap.policy = OverlapPolicy::Skip;
        store.save_chain(&chain).await.unwrap();

        match engine.run_chain_now(chain.id, Variables::new(), 0).await.unwrap() {
            ChainRunOutcome::Completed(record) => assert_eq!(record.status, ChainStatus::Success),
            other => panic!("expected completion, got {other:?}"),
        }
        assert_eq!(store.running_instances(chain.task_ref()).await.unwrap(), 0);

        store.acquire_slot(chain.task_ref(), Utc::now()).await.unwrap();
        match engine.run_chain_now(chain.id, Variables::new(), 0).await.unwrap() {
            ChainRunOutcome::Denied(record) => {
                assert_eq!(record.status, ChainStatus::Cancelled);
                assert_eq!(record.skipped_steps, record.total_steps);
            }
            other => panic!("expected denial, got {other:?}"),
        }

        let missing = engine.run_chain_now(Uuid::new_v4(), Variables::new(), 0).await;
        assert!(matches!(missing, Err(TaskClawError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_run_loop_stops_on_shutdown() {
        let store = memory_store();
        let runner = ScriptedRunner::new();
        let engine = Arc::new(SchedulerEngine::new(
            &config(),
            1,
            services(&store, runner.clone(), RecordingNotifier::new()),
        ));
        store.save_task(&due_task(Uuid::new_v4(), "looped")).await.unwrap();

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn({
            let engine = engine.clone();
            async move { engine.run(rx).await }
        });
        tokio::time::sleep(Duration::from_millis(200)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
        assert_eq!(runner.urls(), vec!["http://localhost/looped"]);
    }
}
