//! Chain execution state machine: ordered HTTP steps with variable
//! propagation, conditional skips and partial-failure semantics.

use std::sync::Arc;
use uuid::Uuid;

use taskclaw_core::error::{Result, TaskClawError};
use taskclaw_core::traits::TaskStore;
use taskclaw_core::types::{
    ChainDefinition, ChainExecutionRecord, ChainStatus, ProbeErrorKind, Protocol, StepResult, StepStatus, Variables,
};

use crate::condition;
use crate::recorder::ExecutionRecorder;
use crate::step::StepRunner;
use crate::variables::{extract, render_request};

/// Terminal chain status from step counts. Check order matters: mixed
/// outcomes are PARTIAL and an all-skipped run is FAILED.
pub fn derive_status(completed: u32, failed: u32, skipped: u32, total: u32) -> ChainStatus {
    if completed == total {
        ChainStatus::Success
    } else if failed > 0 && completed > 0 {
        ChainStatus::Partial
    } else if failed > 0 {
        ChainStatus::Failed
    } else if skipped == total {
        ChainStatus::Failed
    } else {
        ChainStatus::Partial
    }
}

#[derive(Clone)]
pub struct ChainExecutor {
    runner: Arc<dyn StepRunner>,
    recorder: ExecutionRecorder,
    store: Arc<dyn TaskStore>,
}

impl ChainExecutor {
    pub fn new(runner: Arc<dyn StepRunner>, recorder: ExecutionRecorder, store: Arc<dyn TaskStore>) -> Self {
        Self { runner, recorder, store }
    }

    /// Load a chain by id and run it.
    pub async fn run_chain(&self, chain_id: Uuid, variables: Variables) -> Result<ChainExecutionRecord> {
        let chain = self
            .store
            .get_chain(chain_id)
            .await?
            .ok_or_else(|| TaskClawError::NotFound(format!("chain:{chain_id}")))?;
        self.run(&chain, variables).await
    }

    pub async fn run(&self, chain: &ChainDefinition, variables: Variables) -> Result<ChainExecutionRecord> {
        let record = self.recorder.start_chain(chain, &variables).await?;
        self.run_recorded(chain, record).await
    }

    /// Run against an already inserted RUNNING record.
    pub async fn run_recorded(
        &self,
        chain: &ChainDefinition,
        mut record: ChainExecutionRecord,
    ) -> Result<ChainExecutionRecord> {
        tracing::info!("🔗 Chain '{}' started ({} steps)", chain.name, chain.steps.len());
        match self.execute_steps(chain, &mut record).await {
            Ok(()) => {
                let record = self.recorder.finish_chain(record).await?;
                tracing::info!(
                    "🔗 Chain '{}' finished {} ({} ok, {} failed, {} skipped)",
                    chain.name,
                    record.status.as_str(),
                    record.completed_steps,
                    record.failed_steps,
                    record.skipped_steps
                );
                Ok(record)
            }
            Err(e) => {
                tracing::error!("❌ Chain '{}' aborted: {}", chain.name, e);
                record.status = ChainStatus::Failed;
                record.error_message = Some(e.to_string());
                if let Err(seal) = self.recorder.finish_chain(record).await {
                    tracing::error!("❌ Failed to seal chain record: {}", seal);
                }
                Err(e)
            }
        }
    }

    async fn execute_steps(&self, chain: &ChainDefinition, record: &mut ChainExecutionRecord) -> Result<()> {
        let mut vars = record.variables.clone();
        let mut previous: Option<StepResult> = None;
        let (mut reached, mut completed, mut failed, mut skipped) = (0u32, 0u32, 0u32, 0u32);
        let mut last_error = None;

        for step in &chain.steps {
            reached += 1;
            let mut step_record = self.recorder.start_step(record.id, step).await?;

            if !condition::is_met(step.condition.as_ref(), previous.as_ref()) {
                tracing::debug!("⏭️ Step {} '{}' skipped: condition not met", step.step_order, step.name);
                step_record.status = StepStatus::Skipped;
                step_record.condition_met = Some(false);
                self.recorder.finish_step(step_record).await?;
                skipped += 1;
                continue;
            }
            step_record.condition_met = step.condition.as_ref().map(|_| true);

            let result = match render_request(&step.request, &vars) {
                Ok(request) => {
                    step_record.request_snapshot = serde_json::to_value(&request).ok();
                    let result = self.runner.run(&Protocol::Http(request), &step.probe_settings()).await;
                    step_record.response_snapshot = Some(self.recorder.response_snapshot(&result));
                    step_record.retry_attempt = result.retry_attempt;
                    step_record.duration_ms = Some(result.duration_ms);
                    step_record.error_message = result.error_message();
                    step_record.error_type = result.error_type();
                    if result.error.is_none() {
                        let extracted = extract(&result.body, &step.extract_variables);
                        vars.extend(extracted.iter().map(|(k, v)| (k.clone(), v.clone())));
                        step_record.extracted_variables = extracted;
                    }
                    result
                }
                Err(e) => {
                    tracing::warn!("⚠️ Step {} '{}': {}", step.step_order, step.name, e);
                    step_record.request_snapshot = serde_json::to_value(&step.request).ok();
                    step_record.error_message = Some(e.to_string());
                    step_record.error_type = Some(e.kind().to_string());
                    StepResult::failed(ProbeErrorKind::Generic, e.to_string(), 0)
                }
            };

            let success = result.is_success();
            step_record.status = if success { StepStatus::Success } else { StepStatus::Failed };
            self.recorder.finish_step(step_record).await?;

            if success {
                completed += 1;
            } else {
                failed += 1;
                last_error = result.error_message();
            }
            previous = Some(result);

            if !success && !step.continue_on_failure && chain.stop_on_failure {
                tracing::warn!("🛑 Chain '{}' stopped at step {} '{}'", chain.name, step.step_order, step.name);
                break;
            }
        }

        record.total_steps = reached;
        record.completed_steps = completed;
        record.failed_steps = failed;
        record.skipped_steps = skipped;
        record.variables = vars;
        record.error_message = last_error;
        record.status = derive_status(completed, failed, skipped, reached);
        Ok(())
    }
}
