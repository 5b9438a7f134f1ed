//! Core data model for tasks, chains, queue entries and execution records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Variable context threaded through a chain run.
pub type Variables = BTreeMap<String, serde_json::Value>;

// ─── Task identity ──────────────────────────────────────

/// Which kind of definition owns an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Cron,
    Delayed,
    Chain,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Cron => "cron",
            TaskKind::Delayed => "delayed",
            TaskKind::Chain => "chain",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "cron" => Some(TaskKind::Cron),
            "delayed" => Some(TaskKind::Delayed),
            "chain" => Some(TaskKind::Chain),
            _ => None,
        }
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Address of the row that owns `running_instances` and the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskRef {
    pub kind: TaskKind,
    pub id: Uuid,
}

impl TaskRef {
    pub fn new(kind: TaskKind, id: Uuid) -> Self {
        Self { kind, id }
    }

    /// Cron and delayed tasks share the tasks table.
    pub fn is_chain(&self) -> bool {
        self.kind == TaskKind::Chain
    }
}

impl std::fmt::Display for TaskRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

// ─── Scheduling ──────────────────────────────────────

/// When a task fires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Schedule {
    /// Recurring cron expression evaluated in an IANA timezone.
    Cron {
        expression: String,
        #[serde(default = "default_timezone")]
        timezone: String,
    },
    /// One-shot execution at a fixed instant.
    At { execute_at: DateTime<Utc> },
}

pub fn default_timezone() -> String {
    "UTC".into()
}

// ─── Overlap control ──────────────────────────────────────

/// What happens when a run becomes due while another is still running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverlapPolicy {
    Allow,
    Skip,
    Queue,
}

impl OverlapPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            OverlapPolicy::Allow => "allow",
            OverlapPolicy::Skip => "skip",
            OverlapPolicy::Queue => "queue",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "allow" => Some(OverlapPolicy::Allow),
            "skip" => Some(OverlapPolicy::Skip),
            "queue" => Some(OverlapPolicy::Queue),
            _ => None,
        }
    }
}

/// Overlap fields shared by tasks and chains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverlapSettings {
    pub policy: OverlapPolicy,
    /// At least 1.
    pub max_instances: u32,
    pub max_queue_size: u32,
    /// Seconds after `last_run_at` at which running instances count as stale.
    /// For chains this is the chain-level `timeout_seconds`.
    pub execution_timeout: Option<u32>,
}

impl Default for OverlapSettings {
    fn default() -> Self {
        Self {
            policy: OverlapPolicy::Allow,
            max_instances: 1,
            max_queue_size: 10,
            execution_timeout: None,
        }
    }
}

// ─── Probes ──────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Head,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Head => "HEAD",
        }
    }
}

/// An HTTP request template; `{{name}}` placeholders are resolved per run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct HttpRequest {
    #[serde(default)]
    pub method: HttpMethod,
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<String>,
}

impl HttpRequest {
    pub fn get(url: &str) -> Self {
        Self {
            method: HttpMethod::Get,
            url: url.to_string(),
            headers: BTreeMap::new(),
            body: None,
        }
    }
}

/// What a single probe talks to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "protocol", rename_all = "snake_case")]
pub enum Protocol {
    Http(HttpRequest),
    Icmp { host: String },
    Tcp { host: String, port: u16 },
}

/// Timeout and retry behavior for one probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeSettings {
    pub timeout_seconds: u32,
    /// Extra attempts after the first one fails.
    pub retry_count: u32,
    /// Fixed delay between attempts.
    pub retry_delay_seconds: u32,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            timeout_seconds: 30,
            retry_count: 0,
            retry_delay_seconds: 1,
        }
    }
}

/// Typed probe failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeErrorKind {
    Timeout,
    ConnectionRefused,
    DnsFailure,
    Generic,
}

impl ProbeErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProbeErrorKind::Timeout => "timeout",
            ProbeErrorKind::ConnectionRefused => "connection_refused",
            ProbeErrorKind::DnsFailure => "dns_failure",
            ProbeErrorKind::Generic => "generic",
        }
    }
}

impl std::fmt::Display for ProbeErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeError {
    pub kind: ProbeErrorKind,
    pub message: String,
}

/// Structured outcome of one probe (after retries).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct StepResult {
    pub status_code: Option<u16>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: String,
    pub duration_ms: u64,
    /// Zero-based index of the attempt that produced this result.
    pub retry_attempt: u32,
    pub error: Option<ProbeError>,
}

impl StepResult {
    /// No transport error and (for HTTP) a status below 400.
    pub fn is_success(&self) -> bool {
        self.error.is_none() && self.status_code.is_none_or(|code| code < 400)
    }

    pub fn failed(kind: ProbeErrorKind, message: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            duration_ms,
            error: Some(ProbeError {
                kind,
                message: message.into(),
            }),
            ..Default::default()
        }
    }

    /// Error message for records: transport error or the failing status.
    pub fn error_message(&self) -> Option<String> {
        if let Some(err) = &self.error {
            return Some(err.message.clone());
        }
        match self.status_code {
            Some(code) if code >= 400 => Some(format!("HTTP status {code}")),
            _ => None,
        }
    }

    pub fn error_type(&self) -> Option<String> {
        if let Some(err) = &self.error {
            return Some(err.kind.as_str().to_string());
        }
        match self.status_code {
            Some(code) if code >= 400 => Some("http_status".to_string()),
            _ => None,
        }
    }
}

// ─── Definitions ──────────────────────────────────────

/// A cron or delayed task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDefinition {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub name: String,
    /// `Cron` or `Delayed`.
    pub kind: TaskKind,
    pub schedule: Schedule,
    pub protocol: Protocol,
    pub probe: ProbeSettings,
    pub overlap: OverlapSettings,
    /// Mutated only through the overlap guard's store operations.
    pub running_instances: u32,
    pub is_active: bool,
    pub is_paused: bool,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    /// Bound external worker; `None` runs in the scheduler's own pool.
    pub worker_id: Option<Uuid>,
}

impl TaskDefinition {
    /// Create a recurring cron task.
    pub fn cron(workspace_id: Uuid, name: &str, expression: &str, protocol: Protocol) -> Self {
        Self {
            id: Uuid::new_v4(),
            workspace_id,
            name: name.to_string(),
            kind: TaskKind::Cron,
            schedule: Schedule::Cron {
                expression: expression.to_string(),
                timezone: default_timezone(),
            },
            protocol,
            probe: ProbeSettings::default(),
            overlap: OverlapSettings::default(),
            running_instances: 0,
            is_active: true,
            is_paused: false,
            next_run_at: None,
            last_run_at: None,
            consecutive_failures: 0,
            worker_id: None,
        }
    }

    /// Create a one-shot task that fires at `at`.
    pub fn delayed(workspace_id: Uuid, name: &str, at: DateTime<Utc>, protocol: Protocol) -> Self {
        Self {
            kind: TaskKind::Delayed,
            schedule: Schedule::At { execute_at: at },
            next_run_at: Some(at),
            ..Self::cron(workspace_id, name, "* * * * *", protocol)
        }
    }

    pub fn task_ref(&self) -> TaskRef {
        TaskRef::new(self.kind, self.id)
    }
}

/// Check applied to the previous executed step's response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    StatusCodeIn,
    StatusCodeNotIn,
    StatusCodeEquals,
    Equals,
    NotEquals,
    Contains,
    NotContains,
    Regex,
    Exists,
    NotExists,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepCondition {
    pub operator: ConditionOperator,
    /// JSONPath into the previous response body; `None` means the whole body.
    #[serde(default)]
    pub field: Option<String>,
    #[serde(default)]
    pub value: serde_json::Value,
}

/// One ordered HTTP step of a chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainStep {
    pub id: Uuid,
    pub chain_id: Uuid,
    /// Unique per chain.
    pub step_order: i32,
    pub name: String,
    pub request: HttpRequest,
    pub timeout_seconds: u32,
    pub retry_count: u32,
    #[serde(default = "default_retry_delay")]
    pub retry_delay_seconds: u32,
    #[serde(default)]
    pub condition: Option<StepCondition>,
    /// variable name → JSONPath against the JSON response body.
    #[serde(default)]
    pub extract_variables: BTreeMap<String, String>,
    #[serde(default)]
    pub continue_on_failure: bool,
}

fn default_retry_delay() -> u32 {
    1
}

impl ChainStep {
    pub fn new(chain_id: Uuid, step_order: i32, name: &str, request: HttpRequest) -> Self {
        Self {
            id: Uuid::new_v4(),
            chain_id,
            step_order,
            name: name.to_string(),
            request,
            timeout_seconds: 30,
            retry_count: 0,
            retry_delay_seconds: default_retry_delay(),
            condition: None,
            extract_variables: BTreeMap::new(),
            continue_on_failure: false,
        }
    }

    pub fn probe_settings(&self) -> ProbeSettings {
        ProbeSettings {
            timeout_seconds: self.timeout_seconds,
            retry_count: self.retry_count,
            retry_delay_seconds: self.retry_delay_seconds,
        }
    }
}

/// A multi-step HTTP workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainDefinition {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub name: String,
    /// `None` for chains that only run on demand.
    pub schedule: Option<Schedule>,
    /// Kept sorted by `step_order`.
    pub steps: Vec<ChainStep>,
    pub stop_on_failure: bool,
    pub overlap: OverlapSettings,
    pub running_instances: u32,
    pub is_active: bool,
    pub is_paused: bool,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub worker_id: Option<Uuid>,
}

impl ChainDefinition {
    pub fn new(workspace_id: Uuid, name: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            workspace_id,
            name: name.to_string(),
            schedule: None,
            steps: Vec::new(),
            stop_on_failure: true,
            overlap: OverlapSettings::default(),
            running_instances: 0,
            is_active: true,
            is_paused: false,
            next_run_at: None,
            last_run_at: None,
            consecutive_failures: 0,
            worker_id: None,
        }
    }

    /// Append a step with the next `step_order`.
    pub fn push_step(&mut self, name: &str, request: HttpRequest) -> &mut ChainStep {
        let order = self.steps.last().map(|s| s.step_order + 1).unwrap_or(1);
        self.steps.push(ChainStep::new(self.id, order, name, request));
        let last = self.steps.len() - 1;
        &mut self.steps[last]
    }

    pub fn task_ref(&self) -> TaskRef {
        TaskRef::new(TaskKind::Chain, self.id)
    }
}

// ─── Queue ──────────────────────────────────────

/// A saturated QUEUE-policy execution waiting for a slot.
/// Ordered by (priority desc, queued_at asc).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub task_type: TaskKind,
    pub task_id: Uuid,
    pub priority: i32,
    pub queued_at: DateTime<Utc>,
    #[serde(default)]
    pub initial_variables: Variables,
}

impl QueueEntry {
    pub fn new(workspace_id: Uuid, target: TaskRef, priority: i32, initial_variables: Variables) -> Self {
        Self {
            id: Uuid::new_v4(),
            workspace_id,
            task_type: target.kind,
            task_id: target.id,
            priority,
            queued_at: Utc::now(),
            initial_variables,
        }
    }

    pub fn target(&self) -> TaskRef {
        TaskRef::new(self.task_type, self.task_id)
    }
}

// ─── Workspaces ──────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkspaceCounter {
    ExecutionsSkipped,
    ExecutionsQueued,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct WorkspaceStats {
    pub workspace_id: Uuid,
    pub is_blocked: bool,
    pub executions_skipped: u64,
    pub executions_queued: u64,
}

// ─── Execution records ──────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Success,
    Failed,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Running => "running",
            ExecutionStatus::Success => "success",
            ExecutionStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(ExecutionStatus::Running),
            "success" => Some(ExecutionStatus::Success),
            "failed" => Some(ExecutionStatus::Failed),
            _ => None,
        }
    }
}

/// One cron/delayed task run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskExecutionRecord {
    pub id: Uuid,
    pub task_id: Uuid,
    pub kind: TaskKind,
    pub workspace_id: Uuid,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status_code: Option<u16>,
    pub duration_ms: Option<u64>,
    pub response_body: Option<String>,
    pub error_message: Option<String>,
    pub error_type: Option<String>,
    pub retry_attempt: u32,
    pub worker_id: Option<Uuid>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainStatus {
    Pending,
    Running,
    Success,
    Failed,
    Partial,
    Cancelled,
}

impl ChainStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChainStatus::Pending => "pending",
            ChainStatus::Running => "running",
            ChainStatus::Success => "success",
            ChainStatus::Failed => "failed",
            ChainStatus::Partial => "partial",
            ChainStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ChainStatus::Pending),
            "running" => Some(ChainStatus::Running),
            "success" => Some(ChainStatus::Success),
            "failed" => Some(ChainStatus::Failed),
            "partial" => Some(ChainStatus::Partial),
            "cancelled" => Some(ChainStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ChainStatus::Pending | ChainStatus::Running)
    }
}

/// One chain run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainExecutionRecord {
    pub id: Uuid,
    pub chain_id: Uuid,
    pub workspace_id: Uuid,
    pub status: ChainStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub total_steps: u32,
    pub completed_steps: u32,
    pub failed_steps: u32,
    pub skipped_steps: u32,
    pub variables: Variables,
    pub skipped_reason: Option<String>,
    pub error_message: Option<String>,
    pub worker_id: Option<Uuid>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Success,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Success => "success",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(StepStatus::Pending),
            "running" => Some(StepStatus::Running),
            "success" => Some(StepStatus::Success),
            "failed" => Some(StepStatus::Failed),
            "skipped" => Some(StepStatus::Skipped),
            _ => None,
        }
    }
}

/// One step inside a chain run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepExecutionRecord {
    pub id: Uuid,
    pub chain_execution_id: Uuid,
    pub step_id: Uuid,
    pub step_order: i32,
    pub status: StepStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub request_snapshot: Option<serde_json::Value>,
    pub response_snapshot: Option<serde_json::Value>,
    pub extracted_variables: Variables,
    pub condition_met: Option<bool>,
    pub retry_attempt: u32,
    pub duration_ms: Option<u64>,
    pub error_message: Option<String>,
    pub error_type: Option<String>,
}

// ─── Worker protocol ──────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkPayload {
    Task { task: TaskDefinition },
    Chain { chain: ChainDefinition, variables: Variables },
}

/// A unit of admitted work handed to an external worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkUnit {
    pub id: Uuid,
    pub target: TaskRef,
    pub workspace_id: Uuid,
    pub worker_id: Uuid,
    /// Task or chain execution record created at hand-off.
    pub execution_id: Uuid,
    pub payload: WorkPayload,
    pub enqueued_at: DateTime<Utc>,
}

/// Chain-level summary reported by a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainReport {
    pub status: ChainStatus,
    pub completed_steps: u32,
    pub failed_steps: u32,
    pub skipped_steps: u32,
    #[serde(default)]
    pub variables: Variables,
}

/// Result a worker posts back for a polled unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct WorkerReport {
    pub status_code: Option<u16>,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default)]
    pub response_body: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub error_type: Option<ProbeErrorKind>,
    #[serde(default)]
    pub chain: Option<ChainReport>,
}

impl WorkerReport {
    pub fn is_success(&self) -> bool {
        if let Some(chain) = &self.chain {
            return chain.status == ChainStatus::Success;
        }
        self.error_type.is_none()
            && self.error_message.is_none()
            && self.status_code.is_none_or(|code| code < 400)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_result_success_rules() {
        let ok = StepResult {
            status_code: Some(204),
            ..Default::default()
        };
        assert!(ok.is_success());

        let server_error = StepResult {
            status_code: Some(503),
            ..Default::default()
        };
        assert!(!server_error.is_success());
        assert_eq!(server_error.error_type().as_deref(), Some("http_status"));

        let refused = StepResult::failed(ProbeErrorKind::ConnectionRefused, "refused", 3);
        assert!(!refused.is_success());
        assert_eq!(refused.error_type().as_deref(), Some("connection_refused"));
    }

    #[test]
    fn test_push_step_orders() {
        let mut chain = ChainDefinition::new(Uuid::new_v4(), "login-flow");
        chain.push_step("login", HttpRequest::get("http://localhost/login"));
        chain.push_step("profile", HttpRequest::get("http://localhost/me"));
        assert_eq!(chain.steps[0].step_order, 1);
        assert_eq!(chain.steps[1].step_order, 2);
        assert_eq!(chain.steps[1].chain_id, chain.id);
    }

    #[test]
    fn test_condition_serde_names() {
        let json = r#"{"operator":"status_code_in","value":[200,201]}"#;
        let cond: StepCondition = serde_json::from_str(json).unwrap();
        assert_eq!(cond.operator, ConditionOperator::StatusCodeIn);
        assert!(cond.field.is_none());
    }

    #[test]
    fn test_worker_report_chain_status_wins() {
        let report = WorkerReport {
            status_code: Some(200),
            chain: Some(ChainReport {
                status: ChainStatus::Partial,
                completed_steps: 1,
                failed_steps: 1,
                skipped_steps: 0,
                variables: Variables::new(),
            }),
            ..Default::default()
        };
        assert!(!report.is_success());
    }
}
