//! Execution recorder: opens a record when work starts and seals it once.

use chrono::Utc;
use serde_json::{Value, json};
use std::sync::Arc;
use uuid::Uuid;

use taskclaw_core::error::Result;
use taskclaw_core::traits::ExecutionLog;
use taskclaw_core::types::{
    ChainDefinition, ChainExecutionRecord, ChainStatus, ChainStep, ExecutionStatus, StepExecutionRecord, StepResult,
    StepStatus, TaskDefinition, TaskExecutionRecord, Variables, WorkerReport,
};

/// Matches the `http.max_response_bytes` default.
pub const DEFAULT_BODY_LIMIT: usize = 64 * 1024;

/// Writes execution records. Response bodies are cut to `body_limit` here and
/// nowhere earlier, so extraction always sees the whole body.
#[derive(Clone)]
pub struct ExecutionRecorder {
    log: Arc<dyn ExecutionLog>,
    body_limit: usize,
}

impl ExecutionRecorder {
    pub fn new(log: Arc<dyn ExecutionLog>) -> Self {
        Self {
            log,
            body_limit: DEFAULT_BODY_LIMIT,
        }
    }

    pub fn with_body_limit(mut self, limit: usize) -> Self {
        self.body_limit = limit;
        self
    }

    /// Response half of a step record.
    pub fn response_snapshot(&self, result: &StepResult) -> Value {
        json!({
            "status_code": result.status_code,
            "headers": result.headers,
            "body": truncate_body(&result.body, self.body_limit),
        })
    }

    pub fn log(&self) -> &Arc<dyn ExecutionLog> {
        &self.log
    }

    // ─── Tasks ───

    pub async fn start_task(&self, task: &TaskDefinition) -> Result<TaskExecutionRecord> {
        let record = TaskExecutionRecord {
            id: Uuid::new_v4(),
            task_id: task.id,
            kind: task.kind,
            workspace_id: task.workspace_id,
            status: ExecutionStatus::Running,
            started_at: Utc::now(),
            finished_at: None,
            status_code: None,
            duration_ms: None,
            response_body: None,
            error_message: None,
            error_type: None,
            retry_attempt: 0,
            worker_id: task.worker_id,
        };
        self.log.insert_task_execution(&record).await?;
        Ok(record)
    }

    pub async fn finish_task(&self, mut record: TaskExecutionRecord, result: &StepResult) -> Result<TaskExecutionRecord> {
        record.status = if result.is_success() {
            ExecutionStatus::Success
        } else {
            ExecutionStatus::Failed
        };
        record.finished_at = Some(Utc::now());
        record.status_code = result.status_code;
        record.duration_ms = Some(result.duration_ms);
        record.response_body = Some(truncate_body(&result.body, self.body_limit)).filter(|b| !b.is_empty());
        record.error_message = result.error_message();
        record.error_type = result.error_type();
        record.retry_attempt = result.retry_attempt;
        self.log.finish_task_execution(&record).await?;
        Ok(record)
    }

    /// Seal a task record from what an external worker reported.
    pub async fn finish_task_report(
        &self,
        mut record: TaskExecutionRecord,
        report: &WorkerReport,
    ) -> Result<TaskExecutionRecord> {
        record.status = if report.is_success() {
            ExecutionStatus::Success
        } else {
            ExecutionStatus::Failed
        };
        record.finished_at = Some(Utc::now());
        record.status_code = report.status_code;
        record.duration_ms = Some(report.duration_ms);
        record.response_body = report.response_body.as_deref().map(|b| truncate_body(b, self.body_limit));
        record.error_message = report.error_message.clone();
        record.error_type = report.error_type.map(|k| k.as_str().to_string()).or_else(|| {
            match report.status_code {
                Some(code) if code >= 400 => Some("http_status".to_string()),
                _ => None,
            }
        });
        self.log.finish_task_execution(&record).await?;
        Ok(record)
    }

    // ─── Chains ───

    pub async fn start_chain(&self, chain: &ChainDefinition, variables: &Variables) -> Result<ChainExecutionRecord> {
        let record = ChainExecutionRecord {
            id: Uuid::new_v4(),
            chain_id: chain.id,
            workspace_id: chain.workspace_id,
            status: ChainStatus::Running,
            started_at: Utc::now(),
            finished_at: None,
            total_steps: 0,
            completed_steps: 0,
            failed_steps: 0,
            skipped_steps: 0,
            variables: variables.clone(),
            skipped_reason: None,
            error_message: None,
            worker_id: chain.worker_id,
        };
        self.log.insert_chain_execution(&record).await?;
        Ok(record)
    }

    pub async fn finish_chain(&self, mut record: ChainExecutionRecord) -> Result<ChainExecutionRecord> {
        record.finished_at = Some(Utc::now());
        self.log.finish_chain_execution(&record).await?;
        Ok(record)
    }

    /// A chain run that never started: SKIP saturation or a full queue.
    pub async fn cancelled_chain(
        &self,
        chain: &ChainDefinition,
        variables: &Variables,
        reason: &str,
    ) -> Result<ChainExecutionRecord> {
        let mut record = self.start_chain(chain, variables).await?;
        let total = u32::try_from(chain.steps.len()).unwrap_or(u32::MAX);
        record.status = ChainStatus::Cancelled;
        record.total_steps = total;
        record.skipped_steps = total;
        record.skipped_reason = Some(reason.to_string());
        self.finish_chain(record).await
    }

    // ─── Steps ───

    pub async fn start_step(&self, chain_execution_id: Uuid, step: &ChainStep) -> Result<StepExecutionRecord> {
        let record = StepExecutionRecord {
            id: Uuid::new_v4(),
            chain_execution_id,
            step_id: step.id,
            step_order: step.step_order,
            status: StepStatus::Running,
            started_at: Utc::now(),
            finished_at: None,
            request_snapshot: None,
            response_snapshot: None,
            extracted_variables: Variables::new(),
            condition_met: None,
            retry_attempt: 0,
            duration_ms: None,
            error_message: None,
            error_type: None,
        };
        self.log.insert_step_execution(&record).await?;
        Ok(record)
    }

    pub async fn finish_step(&self, mut record: StepExecutionRecord) -> Result<StepExecutionRecord> {
        record.finished_at = Some(Utc::now());
        self.log.finish_step_execution(&record).await?;
        Ok(record)
    }
}

/// Cut at a char boundary so records stay valid UTF-8.
fn truncate_body(body: &str, max: usize) -> String {
    if body.len() <= max {
        return body.to_string();
    }
    let mut end = max;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    body[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::memory_store;
    use taskclaw_core::types::{HttpRequest, ProbeErrorKind, Protocol};

    #[tokio::test]
    async fn test_task_record_lifecycle() {
        let store = memory_store();
        let recorder = ExecutionRecorder::new(store.clone());
        let task = TaskDefinition::cron(Uuid::new_v4(), "ping", "* * * * *", Protocol::Http(HttpRequest::get("http://x")));

        let record = recorder.start_task(&task).await.unwrap();
        let stored = store.get_task_execution(record.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ExecutionStatus::Running);

        let result = StepResult::failed(ProbeErrorKind::Timeout, "timed out", 30_000);
        recorder.finish_task(record.clone(), &result).await.unwrap();
        let sealed = store.get_task_execution(record.id).await.unwrap().unwrap();
        assert_eq!(sealed.status, ExecutionStatus::Failed);
        assert_eq!(sealed.error_type.as_deref(), Some("timeout"));
        assert!(sealed.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_cancelled_chain_counts_every_step_skipped() {
        let store = memory_store();
        let recorder = ExecutionRecorder::new(store.clone());
        let mut chain = ChainDefinition::new(Uuid::new_v4(), "flow");
        chain.push_step("a", HttpRequest::get("http://a"));
        chain.push_step("b", HttpRequest::get("http://b"));

        let record = recorder.cancelled_chain(&chain, &Variables::new(), "queue_full").await.unwrap();
        let stored = store.get_chain_execution(record.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ChainStatus::Cancelled);
        assert_eq!(stored.total_steps, 2);
        assert_eq!(stored.skipped_steps, 2);
        assert_eq!(stored.skipped_reason.as_deref(), Some("queue_full"));
    }

    #[tokio::test]
    async fn test_response_body_is_truncated_in_records() {
        let store = memory_store();
        let recorder = ExecutionRecorder::new(store.clone()).with_body_limit(4);
        let task = TaskDefinition::cron(Uuid::new_v4(), "ping", "* * * * *", Protocol::Http(HttpRequest::get("http://x")));

        let record = recorder.start_task(&task).await.unwrap();
        let result = StepResult {
            status_code: Some(200),
            body: "hello world".into(),
            ..Default::default()
        };
        recorder.finish_task(record.clone(), &result).await.unwrap();
        let sealed = store.get_task_execution(record.id).await.unwrap().unwrap();
        assert_eq!(sealed.response_body.as_deref(), Some("hell"));

        let snapshot = recorder.response_snapshot(&result);
        assert_eq!(snapshot["body"], "hell");
        assert_eq!(snapshot["status_code"], 200);
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate_body("héllo", 2), "h");
        assert_eq!(truncate_body("abc", 10), "abc");
    }
}
