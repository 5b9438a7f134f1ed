//! Shared test fixtures: scripted probe runner, recording notifier, stores and
//! a throwaway HTTP server.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

use taskclaw_core::error::Result;
use taskclaw_core::traits::{FailureAlert, NotificationService};
use taskclaw_core::types::{
    ChainDefinition, HttpRequest, OverlapPolicy, OverlapSettings, ProbeSettings, Protocol, Schedule, StepResult,
    TaskDefinition,
};
use taskclaw_db::SqliteStore;

use crate::engine::EngineServices;
use crate::recorder::DEFAULT_BODY_LIMIT;
use crate::step::StepRunner;
use crate::worker_queue::MemoryWorkerQueue;

pub fn memory_store() -> Arc<SqliteStore> {
    Arc::new(SqliteStore::open_in_memory().unwrap())
}

pub fn services(
    store: &Arc<SqliteStore>,
    runner: Arc<ScriptedRunner>,
    notifier: Arc<RecordingNotifier>,
) -> EngineServices {
    EngineServices {
        tasks: store.clone(),
        executions: store.clone(),
        tenants: store.clone(),
        workers: Arc::new(MemoryWorkerQueue::new()),
        runner,
        notifier,
        record_body_limit: DEFAULT_BODY_LIMIT,
    }
}

pub fn ok(status: u16, body: &str) -> StepResult {
    StepResult {
        status_code: Some(status),
        body: body.to_string(),
        duration_ms: 1,
        ..Default::default()
    }
}

/// Cron task in its own workspace, not yet due.
pub fn queue_task(name: &str, policy: OverlapPolicy, max_instances: u32, max_queue_size: u32) -> TaskDefinition {
    let mut task = TaskDefinition::cron(
        Uuid::new_v4(),
        name,
        "* * * * *",
        Protocol::Http(HttpRequest::get(&format!("http://localhost/{name}"))),
    );
    task.overlap = OverlapSettings {
        policy,
        max_instances,
        max_queue_size,
        execution_timeout: None,
    };
    task
}

/// Cron task whose `next_run_at` has already passed.
pub fn due_task(workspace_id: Uuid, name: &str) -> TaskDefinition {
    let mut task = TaskDefinition::cron(
        workspace_id,
        name,
        "* * * * *",
        Protocol::Http(HttpRequest::get(&format!("http://localhost/{name}"))),
    );
    task.next_run_at = Some(Utc::now() - chrono::Duration::seconds(1));
    task
}

/// Single-step scheduled chain whose `next_run_at` has already passed.
pub fn due_chain(workspace_id: Uuid, name: &str) -> ChainDefinition {
    let mut chain = ChainDefinition::new(workspace_id, name);
    chain.schedule = Some(Schedule::Cron {
        expression: "* * * * *".into(),
        timezone: "UTC".into(),
    });
    chain.next_run_at = Some(Utc::now() - chrono::Duration::seconds(1));
    chain.push_step("step1", HttpRequest::get(&format!("http://localhost/{name}/step1")));
    chain
}

/// Bind an axum router on an ephemeral port and return its base URL.
pub async fn serve(router: axum::Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
}

/// Returns canned results per target and records every call. Unscripted
/// targets answer 200. The last scripted result repeats.
#[derive(Default)]
pub struct ScriptedRunner {
    scripts: Mutex<HashMap<String, VecDeque<StepResult>>>,
    calls: Mutex<Vec<Protocol>>,
    delay: Duration,
}

impl ScriptedRunner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            ..Default::default()
        })
    }

    pub fn script(&self, target: &str, results: Vec<StepResult>) {
        self.scripts.lock().unwrap().insert(target.to_string(), results.into());
    }

    pub fn calls(&self) -> Vec<Protocol> {
        self.calls.lock().unwrap().clone()
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.calls()
            .into_iter()
            .filter_map(|p| match p {
                Protocol::Http(req) => Some(req),
                _ => None,
            })
            .collect()
    }

    pub fn urls(&self) -> Vec<String> {
        self.requests().into_iter().map(|r| r.url).collect()
    }
}

fn target_key(protocol: &Protocol) -> String {
    match protocol {
        Protocol::Http(req) => req.url.clone(),
        Protocol::Icmp { host } => host.clone(),
        Protocol::Tcp { host, port } => format!("{host}:{port}"),
    }
}

#[async_trait]
impl StepRunner for ScriptedRunner {
    async fn run(&self, protocol: &Protocol, _settings: &ProbeSettings) -> StepResult {
        self.calls.lock().unwrap().push(protocol.clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let key = target_key(protocol);
        let mut scripts = self.scripts.lock().unwrap();
        match scripts.get_mut(&key) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap_or_else(|| ok(200, "{}")),
            Some(queue) => queue.front().cloned().unwrap_or_else(|| ok(200, "{}")),
            None => ok(200, "{}"),
        }
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    failures: Mutex<Vec<FailureAlert>>,
    recoveries: Mutex<Vec<FailureAlert>>,
}

impl RecordingNotifier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failures(&self) -> Vec<FailureAlert> {
        self.failures.lock().unwrap().clone()
    }

    pub fn recoveries(&self) -> Vec<FailureAlert> {
        self.recoveries.lock().unwrap().clone()
    }

    /// Let spawned notification tasks run.
    pub async fn settle(&self) {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[async_trait]
impl NotificationService for RecordingNotifier {
    fn name(&self) -> &str {
        "recording"
    }

    async fn send_failure(&self, alert: &FailureAlert) -> Result<()> {
        self.failures.lock().unwrap().push(alert.clone());
        Ok(())
    }

    async fn send_recovery(&self, alert: &FailureAlert) -> Result<()> {
        self.recoveries.lock().unwrap().push(alert.clone());
        Ok(())
    }
}
