//! SQLite-backed store for single scheduler deployments and tests.
//!
//! Every mutating operation runs inside a `BEGIN IMMEDIATE` transaction, which
//! takes the database write lock up front. That serializes claims and counter
//! updates across connections, so two processes sharing one database file
//! still never claim the same row twice.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use std::path::Path;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use taskclaw_core::error::{Result, TaskClawError};
use taskclaw_core::schedule;
use taskclaw_core::traits::{
    ClaimedChain, ClaimedTask, Enqueued, ExecutionLog, OutcomeUpdate, SlotGrant, SlotRelease, StaleInstance,
    TaskStore, TenantGate,
};
use taskclaw_core::types::{
    ChainDefinition, ChainExecutionRecord, ChainStep, OverlapPolicy, OverlapSettings, ProbeSettings,
    QueueEntry, Schedule, StepExecutionRecord, TaskDefinition, TaskExecutionRecord, TaskRef,
    WorkspaceCounter, WorkspaceStats,
};

use crate::codec::{self, owner_table, parse_opt_ts, parse_opt_uuid, parse_ts, parse_uuid, ts};

fn lock_and_run<T>(conn: &Mutex<Connection>, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
    let mut conn = conn
        .lock()
        .map_err(|_| TaskClawError::Database("connection mutex poisoned".into()))?;
    f(&mut conn)
}

trait SqlResultExt<T> {
    fn db(self) -> Result<T>;
}

impl<T> SqlResultExt<T> for rusqlite::Result<T> {
    fn db(self) -> Result<T> {
        self.map_err(|e| TaskClawError::Database(e.to_string()))
    }
}

/// SQLite persistence for definitions, overlap state, queues and executions.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open or create the database file.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)
            .map_err(|e| TaskClawError::Database(format!("DB open error: {e}")))?;
        Self::init(conn)
    }

    /// Private in-memory database (tests, dry runs).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| TaskClawError::Database(format!("DB open error: {e}")))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        // WAL lets readers proceed while a claim holds the write lock.
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;
             PRAGMA foreign_keys = ON;",
        )
        .db()?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.migrate()?;
        Ok(store)
    }

    /// Create tables (idempotent).
    fn migrate(&self) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute_batch(
                "
            CREATE TABLE IF NOT EXISTS workspaces (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL DEFAULT '',
                is_blocked INTEGER NOT NULL DEFAULT 0,
                executions_skipped INTEGER NOT NULL DEFAULT 0,
                executions_queued INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            );

            -- Cron + delayed tasks
            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                workspace_id TEXT NOT NULL,
                name TEXT NOT NULL,
                kind TEXT NOT NULL,                 -- 'cron', 'delayed'
                schedule TEXT NOT NULL,             -- JSON Schedule
                protocol TEXT NOT NULL,             -- JSON Protocol
                timeout_seconds INTEGER NOT NULL DEFAULT 30,
                retry_count INTEGER NOT NULL DEFAULT 0,
                retry_delay_seconds INTEGER NOT NULL DEFAULT 1,
                overlap_policy TEXT NOT NULL DEFAULT 'allow',
                max_instances INTEGER NOT NULL DEFAULT 1,
                max_queue_size INTEGER NOT NULL DEFAULT 10,
                execution_timeout INTEGER,
                running_instances INTEGER NOT NULL DEFAULT 0,
                is_active INTEGER NOT NULL DEFAULT 1,
                is_paused INTEGER NOT NULL DEFAULT 0,
                next_run_at TEXT,
                last_run_at TEXT,
                consecutive_failures INTEGER NOT NULL DEFAULT 0,
                worker_id TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_tasks_due ON tasks(next_run_at);

            CREATE TABLE IF NOT EXISTS chains (
                id TEXT PRIMARY KEY,
                workspace_id TEXT NOT NULL,
                name TEXT NOT NULL,
                schedule TEXT,                      -- JSON Schedule, NULL = on demand
                stop_on_failure INTEGER NOT NULL DEFAULT 1,
                overlap_policy TEXT NOT NULL DEFAULT 'allow',
                max_instances INTEGER NOT NULL DEFAULT 1,
                max_queue_size INTEGER NOT NULL DEFAULT 10,
                execution_timeout INTEGER,
                running_instances INTEGER NOT NULL DEFAULT 0,
                is_active INTEGER NOT NULL DEFAULT 1,
                is_paused INTEGER NOT NULL DEFAULT 0,
                next_run_at TEXT,
                last_run_at TEXT,
                consecutive_failures INTEGER NOT NULL DEFAULT 0,
                worker_id TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_chains_due ON chains(next_run_at);

            CREATE TABLE IF NOT EXISTS chain_steps (
                id TEXT PRIMARY KEY,
                chain_id TEXT NOT NULL,
                step_order INTEGER NOT NULL,
                name TEXT NOT NULL,
                request TEXT NOT NULL,              -- JSON HttpRequest
                timeout_seconds INTEGER NOT NULL DEFAULT 30,
                retry_count INTEGER NOT NULL DEFAULT 0,
                retry_delay_seconds INTEGER NOT NULL DEFAULT 1,
                condition TEXT,                     -- JSON StepCondition
                extract_variables TEXT NOT NULL DEFAULT '{}',
                continue_on_failure INTEGER NOT NULL DEFAULT 0,
                UNIQUE (chain_id, step_order),
                FOREIGN KEY (chain_id) REFERENCES chains(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS task_queue (
                id TEXT PRIMARY KEY,
                workspace_id TEXT NOT NULL,
                task_type TEXT NOT NULL,            -- 'cron', 'delayed', 'chain'
                task_id TEXT NOT NULL,
                priority INTEGER NOT NULL DEFAULT 0,
                queued_at TEXT NOT NULL,
                initial_variables TEXT NOT NULL DEFAULT '{}'
            );
            CREATE INDEX IF NOT EXISTS idx_queue_order
                ON task_queue(task_type, task_id, priority DESC, queued_at ASC);

            CREATE TABLE IF NOT EXISTS task_executions (
                id TEXT PRIMARY KEY,
                task_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                workspace_id TEXT NOT NULL,
                status TEXT NOT NULL,
                started_at TEXT NOT NULL,
                finished_at TEXT,
                status_code INTEGER,
                duration_ms INTEGER,
                response_body TEXT,
                error_message TEXT,
                error_type TEXT,
                retry_attempt INTEGER NOT NULL DEFAULT 0,
                worker_id TEXT
            );

            CREATE TABLE IF NOT EXISTS chain_executions (
                id TEXT PRIMARY KEY,
                chain_id TEXT NOT NULL,
                workspace_id TEXT NOT NULL,
                status TEXT NOT NULL,
                started_at TEXT NOT NULL,
                finished_at TEXT,
                total_steps INTEGER NOT NULL DEFAULT 0,
                completed_steps INTEGER NOT NULL DEFAULT 0,
                failed_steps INTEGER NOT NULL DEFAULT 0,
                skipped_steps INTEGER NOT NULL DEFAULT 0,
                variables TEXT NOT NULL DEFAULT '{}',
                skipped_reason TEXT,
                error_message TEXT,
                worker_id TEXT
            );

            CREATE TABLE IF NOT EXISTS step_executions (
                id TEXT PRIMARY KEY,
                chain_execution_id TEXT NOT NULL,
                step_id TEXT NOT NULL,
                step_order INTEGER NOT NULL,
                status TEXT NOT NULL,
                started_at TEXT NOT NULL,
                finished_at TEXT,
                request_snapshot TEXT,
                response_snapshot TEXT,
                extracted_variables TEXT NOT NULL DEFAULT '{}',
                condition_met INTEGER,
                retry_attempt INTEGER NOT NULL DEFAULT 0,
                duration_ms INTEGER,
                error_message TEXT,
                error_type TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_step_exec ON step_executions(chain_execution_id, step_order);
         ",
            )
            .db()
        })
    }

    fn with_conn<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        lock_and_run(&self.conn, f)
    }

    /// Run `f` on tokio's blocking pool; rusqlite calls and the busy wait on
    /// the write lock never stall a runtime worker.
    async fn call<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || lock_and_run(&conn, f))
            .await
            .map_err(|e| TaskClawError::Database(format!("blocking store task failed: {e}")))?
    }

    /// Test/operator helper: block or unblock a workspace.
    pub fn set_workspace_blocked(&self, workspace_id: Uuid, blocked: bool) -> Result<()> {
        self.with_conn(|conn| {
            ensure_workspace(conn, workspace_id)?;
            conn.execute(
                "UPDATE workspaces SET is_blocked = ?1 WHERE id = ?2",
                params![blocked, workspace_id.to_string()],
            )
            .db()?;
            Ok(())
        })
    }
}

// ─── Row mapping ──────────────────────────────────────

const TASK_COLUMNS: &str = "t.id, t.workspace_id, t.name, t.kind, t.schedule, t.protocol, \
    t.timeout_seconds, t.retry_count, t.retry_delay_seconds, t.overlap_policy, t.max_instances, \
    t.max_queue_size, t.execution_timeout, t.running_instances, t.is_active, t.is_paused, \
    t.next_run_at, t.last_run_at, t.consecutive_failures, t.worker_id";

const CHAIN_COLUMNS: &str = "c.id, c.workspace_id, c.name, c.schedule, c.stop_on_failure, \
    c.overlap_policy, c.max_instances, c.max_queue_size, c.execution_timeout, c.running_instances, \
    c.is_active, c.is_paused, c.next_run_at, c.last_run_at, c.consecutive_failures, c.worker_id";

const STEP_COLUMNS: &str = "id, chain_id, step_order, name, request, timeout_seconds, retry_count, \
    retry_delay_seconds, condition, extract_variables, continue_on_failure";

const QUEUE_COLUMNS: &str = "id, workspace_id, task_type, task_id, priority, queued_at, initial_variables";

struct TaskRow {
    id: String,
    workspace_id: String,
    name: String,
    kind: String,
    schedule: String,
    protocol: String,
    timeout_seconds: u32,
    retry_count: u32,
    retry_delay_seconds: u32,
    overlap_policy: String,
    max_instances: u32,
    max_queue_size: u32,
    execution_timeout: Option<u32>,
    running_instances: i64,
    is_active: bool,
    is_paused: bool,
    next_run_at: Option<String>,
    last_run_at: Option<String>,
    consecutive_failures: i64,
    worker_id: Option<String>,
}

fn row_to_task(row: &rusqlite::Row) -> rusqlite::Result<TaskRow> {
    Ok(TaskRow {
        id: row.get(0)?, workspace_id: row.get(1)?, name: row.get(2)?, kind: row.get(3)?,
        schedule: row.get(4)?, protocol: row.get(5)?, timeout_seconds: row.get(6)?,
        retry_count: row.get(7)?, retry_delay_seconds: row.get(8)?, overlap_policy: row.get(9)?,
        max_instances: row.get(10)?, max_queue_size: row.get(11)?, execution_timeout: row.get(12)?,
        running_instances: row.get(13)?, is_active: row.get(14)?, is_paused: row.get(15)?,
        next_run_at: row.get(16)?, last_run_at: row.get(17)?, consecutive_failures: row.get(18)?,
        worker_id: row.get(19)?,
    })
}

impl TaskRow {
    fn into_task(self) -> Result<TaskDefinition> {
        Ok(TaskDefinition {
            id: parse_uuid(&self.id)?,
            workspace_id: parse_uuid(&self.workspace_id)?,
            name: self.name,
            kind: codec::kind(&self.kind)?,
            schedule: serde_json::from_str(&self.schedule)?,
            protocol: serde_json::from_str(&self.protocol)?,
            probe: ProbeSettings {
                timeout_seconds: self.timeout_seconds,
                retry_count: self.retry_count,
                retry_delay_seconds: self.retry_delay_seconds,
            },
            overlap: OverlapSettings {
                policy: codec::policy(&self.overlap_policy)?,
                max_instances: self.max_instances,
                max_queue_size: self.max_queue_size,
                execution_timeout: self.execution_timeout,
            },
            running_instances: codec::to_u32(self.running_instances),
            is_active: self.is_active,
            is_paused: self.is_paused,
            next_run_at: parse_opt_ts(self.next_run_at)?,
            last_run_at: parse_opt_ts(self.last_run_at)?,
            consecutive_failures: codec::to_u32(self.consecutive_failures),
            worker_id: parse_opt_uuid(self.worker_id)?,
        })
    }
}

struct ChainRow {
    id: String,
    workspace_id: String,
    name: String,
    schedule: Option<String>,
    stop_on_failure: bool,
    overlap_policy: String,
    max_instances: u32,
    max_queue_size: u32,
    execution_timeout: Option<u32>,
    running_instances: i64,
    is_active: bool,
    is_paused: bool,
    next_run_at: Option<String>,
    last_run_at: Option<String>,
    consecutive_failures: i64,
    worker_id: Option<String>,
}

fn row_to_chain(row: &rusqlite::Row) -> rusqlite::Result<ChainRow> {
    Ok(ChainRow {
        id: row.get(0)?, workspace_id: row.get(1)?, name: row.get(2)?, schedule: row.get(3)?,
        stop_on_failure: row.get(4)?, overlap_policy: row.get(5)?, max_instances: row.get(6)?,
        max_queue_size: row.get(7)?, execution_timeout: row.get(8)?, running_instances: row.get(9)?,
        is_active: row.get(10)?, is_paused: row.get(11)?, next_run_at: row.get(12)?,
        last_run_at: row.get(13)?, consecutive_failures: row.get(14)?, worker_id: row.get(15)?,
    })
}

impl ChainRow {
    fn into_chain(self, steps: Vec<ChainStep>) -> Result<ChainDefinition> {
        Ok(ChainDefinition {
            id: parse_uuid(&self.id)?,
            workspace_id: parse_uuid(&self.workspace_id)?,
            name: self.name,
            schedule: self.schedule.as_deref().map(serde_json::from_str).transpose()?,
            steps,
            stop_on_failure: self.stop_on_failure,
            overlap: OverlapSettings {
                policy: codec::policy(&self.overlap_policy)?,
                max_instances: self.max_instances,
                max_queue_size: self.max_queue_size,
                execution_timeout: self.execution_timeout,
            },
            running_instances: codec::to_u32(self.running_instances),
            is_active: self.is_active,
            is_paused: self.is_paused,
            next_run_at: parse_opt_ts(self.next_run_at)?,
            last_run_at: parse_opt_ts(self.last_run_at)?,
            consecutive_failures: codec::to_u32(self.consecutive_failures),
            worker_id: parse_opt_uuid(self.worker_id)?,
        })
    }
}

type StepRow = (String, String, i32, String, String, u32, u32, u32, Option<String>, String, bool);

fn row_to_step(row: &rusqlite::Row) -> rusqlite::Result<StepRow> {
    Ok((
        row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?, row.get(5)?,
        row.get(6)?, row.get(7)?, row.get(8)?, row.get(9)?, row.get(10)?,
    ))
}

fn step_from_row(r: StepRow) -> Result<ChainStep> {
    Ok(ChainStep {
        id: parse_uuid(&r.0)?,
        chain_id: parse_uuid(&r.1)?,
        step_order: r.2,
        name: r.3,
        request: serde_json::from_str(&r.4)?,
        timeout_seconds: r.5,
        retry_count: r.6,
        retry_delay_seconds: r.7,
        condition: r.8.as_deref().map(serde_json::from_str).transpose()?,
        extract_variables: serde_json::from_str(&r.9)?,
        continue_on_failure: r.10,
    })
}

type QueueRow = (String, String, String, String, i32, String, String);

fn row_to_queue(row: &rusqlite::Row) -> rusqlite::Result<QueueRow> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?, row.get(5)?, row.get(6)?))
}

fn queue_from_row(r: QueueRow) -> Result<QueueEntry> {
    Ok(QueueEntry {
        id: parse_uuid(&r.0)?,
        workspace_id: parse_uuid(&r.1)?,
        task_type: codec::kind(&r.2)?,
        task_id: parse_uuid(&r.3)?,
        priority: r.4,
        queued_at: parse_ts(&r.5)?,
        initial_variables: serde_json::from_str(&r.6)?,
    })
}

fn load_steps(conn: &Connection, chain_id: &str) -> Result<Vec<ChainStep>> {
    let mut stmt = conn
        .prepare(&format!("SELECT {STEP_COLUMNS} FROM chain_steps WHERE chain_id = ?1 ORDER BY step_order"))
        .db()?;
    let rows = stmt
        .query_map([chain_id], row_to_step)
        .db()?
        .collect::<rusqlite::Result<Vec<_>>>()
        .db()?;
    rows.into_iter().map(step_from_row).collect()
}

fn ensure_workspace(conn: &Connection, workspace_id: Uuid) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO workspaces (id, created_at) VALUES (?1, ?2)",
        params![workspace_id.to_string(), ts(&Utc::now())],
    )
    .db()?;
    Ok(())
}

fn read_overlap(conn: &Connection, target: TaskRef) -> Result<Option<(OverlapSettings, u32)>> {
    let table = owner_table(target);
    let row = conn
        .query_row(
            &format!(
                "SELECT overlap_policy, max_instances, max_queue_size, execution_timeout, running_instances \
                 FROM {table} WHERE id = ?1"
            ),
            [target.id.to_string()],
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, u32>(1)?,
                    r.get::<_, u32>(2)?,
                    r.get::<_, Option<u32>>(3)?,
                    r.get::<_, i64>(4)?,
                ))
            },
        )
        .optional()
        .db()?;
    match row {
        Some((policy, max_instances, max_queue_size, execution_timeout, running)) => Ok(Some((
            OverlapSettings {
                policy: codec::policy(&policy)?,
                max_instances,
                max_queue_size,
                execution_timeout,
            },
            codec::to_u32(running),
        ))),
        None => Ok(None),
    }
}

/// Where a claimed definition's `next_run_at` goes, and whether it stays active.
fn advance(schedule: Option<&Schedule>, name: &str, now: DateTime<Utc>) -> (Option<DateTime<Utc>>, bool) {
    let Some(schedule) = schedule else {
        return (None, true);
    };
    match schedule::next_fire(schedule, now) {
        Ok(Some(next)) => (Some(next), true),
        Ok(None) => (None, false),
        Err(e) => {
            tracing::warn!("⚠️ '{}' has an unusable schedule, not rescheduling: {e}", name);
            (None, true)
        }
    }
}

// ─── TaskStore ──────────────────────────────────────

#[async_trait]
impl TaskStore for SqliteStore {
    async fn save_task(&self, task: &TaskDefinition) -> Result<()> {
        let schedule = serde_json::to_string(&task.schedule)?;
        let protocol = serde_json::to_string(&task.protocol)?;
        let task = task.clone();
        self.call(move |conn| {
            ensure_workspace(conn, task.workspace_id)?;
            conn.execute(
                "INSERT OR REPLACE INTO tasks
                 (id, workspace_id, name, kind, schedule, protocol, timeout_seconds, retry_count,
                  retry_delay_seconds, overlap_policy, max_instances, max_queue_size, execution_timeout,
                  running_instances, is_active, is_paused, next_run_at, last_run_at, consecutive_failures, worker_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)",
                params![
                    task.id.to_string(),
                    task.workspace_id.to_string(),
                    task.name,
                    task.kind.as_str(),
                    schedule,
                    protocol,
                    task.probe.timeout_seconds,
                    task.probe.retry_count,
                    task.probe.retry_delay_seconds,
                    task.overlap.policy.as_str(),
                    task.overlap.max_instances.max(1),
                    task.overlap.max_queue_size,
                    task.overlap.execution_timeout,
                    task.running_instances,
                    task.is_active,
                    task.is_paused,
                    task.next_run_at.as_ref().map(ts),
                    task.last_run_at.as_ref().map(ts),
                    task.consecutive_failures,
                    task.worker_id.map(|w| w.to_string()),
                ],
            )
            .db()?;
            Ok(())
        })
        .await
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<TaskDefinition>> {
        self.call(move |conn| {
            conn.query_row(
                &format!("SELECT {TASK_COLUMNS} FROM tasks t WHERE t.id = ?1"),
                [id.to_string()],
                row_to_task,
            )
            .optional()
            .db()?
            .map(TaskRow::into_task)
            .transpose()
        })
        .await
    }

    async fn save_chain(&self, chain: &ChainDefinition) -> Result<()> {
        let schedule = chain.schedule.as_ref().map(serde_json::to_string).transpose()?;
        let mut steps = Vec::with_capacity(chain.steps.len());
        for step in &chain.steps {
            steps.push((
                step.clone(),
                serde_json::to_string(&step.request)?,
                step.condition.as_ref().map(serde_json::to_string).transpose()?,
                serde_json::to_string(&step.extract_variables)?,
            ));
        }
        let chain = chain.clone();
        self.call(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate).db()?;
            ensure_workspace(&tx, chain.workspace_id)?;
            tx.execute(
                "INSERT OR REPLACE INTO chains
                 (id, workspace_id, name, schedule, stop_on_failure, overlap_policy, max_instances,
                  max_queue_size, execution_timeout, running_instances, is_active, is_paused,
                  next_run_at, last_run_at, consecutive_failures, worker_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
                params![
                    chain.id.to_string(),
                    chain.workspace_id.to_string(),
                    chain.name,
                    schedule,
                    chain.stop_on_failure,
                    chain.overlap.policy.as_str(),
                    chain.overlap.max_instances.max(1),
                    chain.overlap.max_queue_size,
                    chain.overlap.execution_timeout,
                    chain.running_instances,
                    chain.is_active,
                    chain.is_paused,
                    chain.next_run_at.as_ref().map(ts),
                    chain.last_run_at.as_ref().map(ts),
                    chain.consecutive_failures,
                    chain.worker_id.map(|w| w.to_string()),
                ],
            )
            .db()?;
            tx.execute("DELETE FROM chain_steps WHERE chain_id = ?1", [chain.id.to_string()])
                .db()?;
            for (step, request, condition, extract) in &steps {
                tx.execute(
                    &format!("INSERT INTO chain_steps ({STEP_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"),
                    params![
                        step.id.to_string(),
                        chain.id.to_string(),
                        step.step_order,
                        step.name,
                        request,
                        step.timeout_seconds,
                        step.retry_count,
                        step.retry_delay_seconds,
                        condition,
                        extract,
                        step.continue_on_failure,
                    ],
                )
                .db()?;
            }
            tx.commit().db()?;
            Ok(())
        })
        .await
    }

    async fn get_chain(&self, id: Uuid) -> Result<Option<ChainDefinition>> {
        self.call(move |conn| {
            let row = conn
                .query_row(
                    &format!("SELECT {CHAIN_COLUMNS} FROM chains c WHERE c.id = ?1"),
                    [id.to_string()],
                    row_to_chain,
                )
                .optional()
                .db()?;
            match row {
                Some(row) => {
                    let steps = load_steps(conn, &row.id)?;
                    row.into_chain(steps).map(Some)
                }
                None => Ok(None),
            }
        })
        .await
    }

    async fn save_workspace(&self, workspace_id: Uuid, name: &str, is_blocked: bool) -> Result<()> {
        let name = name.to_string();
        self.call(move |conn| {
            ensure_workspace(conn, workspace_id)?;
            conn.execute(
                "UPDATE workspaces SET name = ?1, is_blocked = ?2 WHERE id = ?3",
                params![name, is_blocked, workspace_id.to_string()],
            )
            .db()?;
            Ok(())
        })
        .await
    }

    async fn claim_due_tasks(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<ClaimedTask>> {
        self.call(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate).db()?;
            let rows = {
                let mut stmt = tx
                    .prepare(&format!(
                        "SELECT {TASK_COLUMNS} FROM tasks t
                         LEFT JOIN workspaces w ON w.id = t.workspace_id
                         WHERE t.is_active = 1 AND t.is_paused = 0
                           AND t.next_run_at IS NOT NULL AND t.next_run_at <= ?1
                           AND COALESCE(w.is_blocked, 0) = 0
                         ORDER BY t.next_run_at ASC
                         LIMIT ?2"
                    ))
                    .db()?;
                stmt.query_map(params![ts(&now), limit], row_to_task)
                    .db()?
                    .collect::<rusqlite::Result<Vec<_>>>()
                    .db()?
            };

            let mut claimed = Vec::with_capacity(rows.len());
            for row in rows {
                let mut task = row.into_task()?;
                let due_at = task.next_run_at.unwrap_or(now);
                let (next_run_at, is_active) = advance(Some(&task.schedule), &task.name, now);
                tx.execute(
                    "UPDATE tasks SET next_run_at = ?1, is_active = ?2 WHERE id = ?3",
                    params![next_run_at.as_ref().map(ts), is_active, task.id.to_string()],
                )
                .db()?;
                task.next_run_at = next_run_at;
                task.is_active = is_active;
                claimed.push(ClaimedTask { task, due_at });
            }
            tx.commit().db()?;
            Ok(claimed)
        })
        .await
    }

    async fn claim_due_chains(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<ClaimedChain>> {
        self.call(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate).db()?;
            let rows = {
                let mut stmt = tx
                    .prepare(&format!(
                        "SELECT {CHAIN_COLUMNS} FROM chains c
                         LEFT JOIN workspaces w ON w.id = c.workspace_id
                         WHERE c.is_active = 1 AND c.is_paused = 0
                           AND c.next_run_at IS NOT NULL AND c.next_run_at <= ?1
                           AND COALESCE(w.is_blocked, 0) = 0
                         ORDER BY c.next_run_at ASC
                         LIMIT ?2"
                    ))
                    .db()?;
                stmt.query_map(params![ts(&now), limit], row_to_chain)
                    .db()?
                    .collect::<rusqlite::Result<Vec<_>>>()
                    .db()?
            };

            let mut claimed = Vec::with_capacity(rows.len());
            for row in rows {
                let steps = load_steps(&tx, &row.id)?;
                let mut chain = row.into_chain(steps)?;
                let due_at = chain.next_run_at.unwrap_or(now);
                let (next_run_at, is_active) = advance(chain.schedule.as_ref(), &chain.name, now);
                tx.execute(
                    "UPDATE chains SET next_run_at = ?1, is_active = ?2 WHERE id = ?3",
                    params![next_run_at.as_ref().map(ts), is_active, chain.id.to_string()],
                )
                .db()?;
                chain.next_run_at = next_run_at;
                chain.is_active = is_active;
                claimed.push(ClaimedChain { chain, due_at });
            }
            tx.commit().db()?;
            Ok(claimed)
        })
        .await
    }

    async fn restore_next_run(&self, target: TaskRef, due_at: DateTime<Utc>) -> Result<()> {
        let table = owner_table(target);
        self.call(move |conn| {
            conn.execute(
                &format!("UPDATE {table} SET next_run_at = ?1, is_active = 1 WHERE id = ?2"),
                params![ts(&due_at), target.id.to_string()],
            )
            .db()?;
            Ok(())
        })
        .await
    }

    async fn acquire_slot(&self, target: TaskRef, now: DateTime<Utc>) -> Result<SlotGrant> {
        let table = owner_table(target);
        self.call(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate).db()?;
            let running: Option<i64> = tx
                .query_row(
                    &format!(
                        "UPDATE {table}
                         SET running_instances = running_instances + 1, last_run_at = ?2
                         WHERE id = ?1 AND (overlap_policy = 'allow' OR running_instances < max_instances)
                         RETURNING running_instances"
                    ),
                    params![target.id.to_string(), ts(&now)],
                    |r| r.get(0),
                )
                .optional()
                .db()?;
            let grant = match running {
                Some(running) => SlotGrant::Acquired {
                    running: codec::to_u32(running),
                },
                None => {
                    let (overlap, _) = read_overlap(&tx, target)?.ok_or_else(|| codec::not_found(target))?;
                    SlotGrant::Saturated { overlap }
                }
            };
            tx.commit().db()?;
            Ok(grant)
        })
        .await
    }

    async fn release_slot(&self, target: TaskRef) -> Result<SlotRelease> {
        let table = owner_table(target);
        self.call(move |conn| {
            let row = conn
                .query_row(
                    &format!(
                        "UPDATE {table} SET running_instances = MAX(running_instances - 1, 0)
                         WHERE id = ?1
                         RETURNING running_instances, overlap_policy, max_instances, max_queue_size, execution_timeout"
                    ),
                    [target.id.to_string()],
                    |r| {
                        Ok((
                            r.get::<_, i64>(0)?,
                            r.get::<_, String>(1)?,
                            r.get::<_, u32>(2)?,
                            r.get::<_, u32>(3)?,
                            r.get::<_, Option<u32>>(4)?,
                        ))
                    },
                )
                .optional()
                .db()?
                .ok_or_else(|| codec::not_found(target))?;
            Ok(SlotRelease {
                running: codec::to_u32(row.0),
                overlap: OverlapSettings {
                    policy: codec::policy(&row.1)?,
                    max_instances: row.2,
                    max_queue_size: row.3,
                    execution_timeout: row.4,
                },
            })
        })
        .await
    }

    async fn running_instances(&self, target: TaskRef) -> Result<u32> {
        self.call(move |conn| {
            read_overlap(conn, target)?
                .map(|(_, running)| running)
                .ok_or_else(|| codec::not_found(target))
        })
        .await
    }

    async fn reset_stale_instances(&self, now: DateTime<Utc>) -> Result<Vec<StaleInstance>> {
        self.call(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate).db()?;
            let mut reset = Vec::new();
            for (table, kind_column) in [("tasks", "kind"), ("chains", "'chain'")] {
                let candidates = {
                    let mut stmt = tx
                        .prepare(&format!(
                            "SELECT id, {kind_column}, workspace_id, running_instances, last_run_at, execution_timeout
                             FROM {table}
                             WHERE execution_timeout IS NOT NULL AND running_instances > 0"
                        ))
                        .db()?;
                    stmt.query_map([], |r| {
                        Ok((
                            r.get::<_, String>(0)?,
                            r.get::<_, String>(1)?,
                            r.get::<_, String>(2)?,
                            r.get::<_, i64>(3)?,
                            r.get::<_, Option<String>>(4)?,
                            r.get::<_, u32>(5)?,
                        ))
                    })
                    .db()?
                    .collect::<rusqlite::Result<Vec<_>>>()
                    .db()?
                };
                for (id, kind, workspace_id, running, last_run_at, timeout) in candidates {
                    let last_run_at = parse_opt_ts(last_run_at)?;
                    let expired = last_run_at
                        .is_none_or(|t| t + chrono::Duration::seconds(timeout as i64) < now);
                    if !expired {
                        continue;
                    }
                    tx.execute(
                        &format!("UPDATE {table} SET running_instances = 0 WHERE id = ?1"),
                        [&id],
                    )
                    .db()?;
                    reset.push(StaleInstance {
                        target: TaskRef::new(codec::kind(&kind)?, parse_uuid(&id)?),
                        workspace_id: parse_uuid(&workspace_id)?,
                        running_instances: codec::to_u32(running),
                        last_run_at,
                    });
                }
            }
            tx.commit().db()?;
            Ok(reset)
        })
        .await
    }

    async fn enqueue_bounded(&self, entry: &QueueEntry, now: DateTime<Utc>) -> Result<Enqueued> {
        let target = entry.target();
        let table = owner_table(target);
        let variables = serde_json::to_string(&entry.initial_variables)?;
        let entry = entry.clone();
        self.call(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate).db()?;
            let (overlap, running) = read_overlap(&tx, target)?.ok_or_else(|| codec::not_found(target))?;
            if overlap.policy == OverlapPolicy::Allow || running < overlap.max_instances {
                tx.execute(
                    &format!(
                        "UPDATE {table} SET running_instances = running_instances + 1, last_run_at = ?2 WHERE id = ?1"
                    ),
                    params![target.id.to_string(), ts(&now)],
                )
                .db()?;
                tx.commit().db()?;
                return Ok(Enqueued::Acquired { running: running + 1 });
            }
            let depth: u32 = tx
                .query_row(
                    "SELECT COUNT(*) FROM task_queue WHERE task_type = ?1 AND task_id = ?2",
                    params![target.kind.as_str(), target.id.to_string()],
                    |r| r.get(0),
                )
                .db()?;
            if depth >= overlap.max_queue_size {
                return Ok(Enqueued::Full);
            }
            tx.execute(
                &format!("INSERT INTO task_queue ({QUEUE_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"),
                params![
                    entry.id.to_string(),
                    entry.workspace_id.to_string(),
                    target.kind.as_str(),
                    target.id.to_string(),
                    entry.priority,
                    ts(&entry.queued_at),
                    variables,
                ],
            )
            .db()?;
            let position: u32 = tx
                .query_row(
                    "SELECT COUNT(*) FROM task_queue WHERE task_type = ?1 AND task_id = ?2 AND priority >= ?3",
                    params![target.kind.as_str(), target.id.to_string(), entry.priority],
                    |r| r.get(0),
                )
                .db()?;
            tx.commit().db()?;
            Ok(Enqueued::Queued { position })
        })
        .await
    }

    async fn promote_queue_head(&self, target: TaskRef, now: DateTime<Utc>) -> Result<Option<QueueEntry>> {
        let table = owner_table(target);
        self.call(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate).db()?;
            let Some((overlap, running)) = read_overlap(&tx, target)? else {
                return Ok(None);
            };
            if overlap.policy != OverlapPolicy::Allow && running >= overlap.max_instances {
                return Ok(None);
            }
            let head = tx
                .query_row(
                    &format!(
                        "SELECT {QUEUE_COLUMNS} FROM task_queue
                         WHERE task_type = ?1 AND task_id = ?2
                         ORDER BY priority DESC, queued_at ASC, rowid ASC
                         LIMIT 1"
                    ),
                    params![target.kind.as_str(), target.id.to_string()],
                    row_to_queue,
                )
                .optional()
                .db()?;
            let Some(head) = head else {
                return Ok(None);
            };
            let entry = queue_from_row(head)?;
            tx.execute("DELETE FROM task_queue WHERE id = ?1", [entry.id.to_string()])
                .db()?;
            tx.execute(
                &format!(
                    "UPDATE {table} SET running_instances = running_instances + 1, last_run_at = ?2 WHERE id = ?1"
                ),
                params![target.id.to_string(), ts(&now)],
            )
            .db()?;
            tx.commit().db()?;
            Ok(Some(entry))
        })
        .await
    }

    async fn queue_depth(&self, target: TaskRef) -> Result<u32> {
        self.call(move |conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM task_queue WHERE task_type = ?1 AND task_id = ?2",
                params![target.kind.as_str(), target.id.to_string()],
                |r| r.get(0),
            )
            .db()
        })
        .await
    }

    async fn queue_head(&self, target: TaskRef, limit: u32) -> Result<Vec<QueueEntry>> {
        self.call(move |conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {QUEUE_COLUMNS} FROM task_queue
                     WHERE task_type = ?1 AND task_id = ?2
                     ORDER BY priority DESC, queued_at ASC, rowid ASC
                     LIMIT ?3"
                ))
                .db()?;
            let rows = stmt
                .query_map(params![target.kind.as_str(), target.id.to_string(), limit], row_to_queue)
                .db()?
                .collect::<rusqlite::Result<Vec<_>>>()
                .db()?;
            rows.into_iter().map(queue_from_row).collect()
        })
        .await
    }

    async fn clear_queue(&self, target: TaskRef) -> Result<u32> {
        self.call(move |conn| {
            let removed = conn
                .execute(
                    "DELETE FROM task_queue WHERE task_type = ?1 AND task_id = ?2",
                    params![target.kind.as_str(), target.id.to_string()],
                )
                .db()?;
            Ok(removed as u32)
        })
        .await
    }

    async fn increment_workspace_counter(&self, workspace_id: Uuid, counter: WorkspaceCounter) -> Result<()> {
        let column = match counter {
            WorkspaceCounter::ExecutionsSkipped => "executions_skipped",
            WorkspaceCounter::ExecutionsQueued => "executions_queued",
        };
        self.call(move |conn| {
            ensure_workspace(conn, workspace_id)?;
            conn.execute(
                &format!("UPDATE workspaces SET {column} = {column} + 1 WHERE id = ?1"),
                [workspace_id.to_string()],
            )
            .db()?;
            Ok(())
        })
        .await
    }

    async fn workspace_stats(&self, workspace_id: Uuid) -> Result<WorkspaceStats> {
        self.call(move |conn| {
            let row = conn
                .query_row(
                    "SELECT is_blocked, executions_skipped, executions_queued FROM workspaces WHERE id = ?1",
                    [workspace_id.to_string()],
                    |r| Ok((r.get::<_, bool>(0)?, r.get::<_, i64>(1)?, r.get::<_, i64>(2)?)),
                )
                .optional()
                .db()?;
            let (is_blocked, skipped, queued) = row.unwrap_or((false, 0, 0));
            Ok(WorkspaceStats {
                workspace_id,
                is_blocked,
                executions_skipped: codec::to_u64(skipped),
                executions_queued: codec::to_u64(queued),
            })
        })
        .await
    }

    async fn record_outcome(&self, target: TaskRef, success: bool) -> Result<OutcomeUpdate> {
        let table = owner_table(target);
        self.call(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate).db()?;
            let previous: i64 = tx
                .query_row(
                    &format!("SELECT consecutive_failures FROM {table} WHERE id = ?1"),
                    [target.id.to_string()],
                    |r| r.get(0),
                )
                .optional()
                .db()?
                .ok_or_else(|| codec::not_found(target))?;
            let current: i64 = if success { 0 } else { previous + 1 };
            tx.execute(
                &format!("UPDATE {table} SET consecutive_failures = ?1 WHERE id = ?2"),
                params![current, target.id.to_string()],
            )
            .db()?;
            tx.commit().db()?;
            Ok(OutcomeUpdate {
                previous_failures: codec::to_u32(previous),
                consecutive_failures: codec::to_u32(current),
            })
        })
        .await
    }
}

#[async_trait]
impl TenantGate for SqliteStore {
    async fn is_blocked(&self, workspace_id: Uuid) -> Result<bool> {
        self.call(move |conn| {
            let blocked = conn
                .query_row(
                    "SELECT is_blocked FROM workspaces WHERE id = ?1",
                    [workspace_id.to_string()],
                    |r| r.get::<_, bool>(0),
                )
                .optional()
                .db()?;
            Ok(blocked.unwrap_or(false))
        })
        .await
    }
}

// ─── ExecutionLog ──────────────────────────────────────

const TASK_EXEC_COLUMNS: &str = "id, task_id, kind, workspace_id, status, started_at, finished_at, \
    status_code, duration_ms, response_body, error_message, error_type, retry_attempt, worker_id";

const CHAIN_EXEC_COLUMNS: &str = "id, chain_id, workspace_id, status, started_at, finished_at, \
    total_steps, completed_steps, failed_steps, skipped_steps, variables, skipped_reason, error_message, worker_id";

const STEP_EXEC_COLUMNS: &str = "id, chain_execution_id, step_id, step_order, status, started_at, \
    finished_at, request_snapshot, response_snapshot, extracted_variables, condition_met, retry_attempt, \
    duration_ms, error_message, error_type";

fn row_to_task_exec(row: &rusqlite::Row) -> rusqlite::Result<Result<TaskExecutionRecord>> {
    let id: String = row.get(0)?;
    let task_id: String = row.get(1)?;
    let kind: String = row.get(2)?;
    let workspace_id: String = row.get(3)?;
    let status: String = row.get(4)?;
    let started_at: String = row.get(5)?;
    let finished_at: Option<String> = row.get(6)?;
    let status_code: Option<u16> = row.get(7)?;
    let duration_ms: Option<i64> = row.get(8)?;
    let response_body: Option<String> = row.get(9)?;
    let error_message: Option<String> = row.get(10)?;
    let error_type: Option<String> = row.get(11)?;
    let retry_attempt: u32 = row.get(12)?;
    let worker_id: Option<String> = row.get(13)?;
    Ok((|| {
        Ok(TaskExecutionRecord {
            id: parse_uuid(&id)?,
            task_id: parse_uuid(&task_id)?,
            kind: codec::kind(&kind)?,
            workspace_id: parse_uuid(&workspace_id)?,
            status: codec::execution_status(&status)?,
            started_at: parse_ts(&started_at)?,
            finished_at: parse_opt_ts(finished_at)?,
            status_code,
            duration_ms: duration_ms.map(codec::to_u64),
            response_body,
            error_message,
            error_type,
            retry_attempt,
            worker_id: parse_opt_uuid(worker_id)?,
        })
    })())
}

fn row_to_chain_exec(row: &rusqlite::Row) -> rusqlite::Result<Result<ChainExecutionRecord>> {
    let id: String = row.get(0)?;
    let chain_id: String = row.get(1)?;
    let workspace_id: String = row.get(2)?;
    let status: String = row.get(3)?;
    let started_at: String = row.get(4)?;
    let finished_at: Option<String> = row.get(5)?;
    let total_steps: u32 = row.get(6)?;
    let completed_steps: u32 = row.get(7)?;
    let failed_steps: u32 = row.get(8)?;
    let skipped_steps: u32 = row.get(9)?;
    let variables: String = row.get(10)?;
    let skipped_reason: Option<String> = row.get(11)?;
    let error_message: Option<String> = row.get(12)?;
    let worker_id: Option<String> = row.get(13)?;
    Ok((|| {
        Ok(ChainExecutionRecord {
            id: parse_uuid(&id)?,
            chain_id: parse_uuid(&chain_id)?,
            workspace_id: parse_uuid(&workspace_id)?,
            status: codec::chain_status(&status)?,
            started_at: parse_ts(&started_at)?,
            finished_at: parse_opt_ts(finished_at)?,
            total_steps,
            completed_steps,
            failed_steps,
            skipped_steps,
            variables: serde_json::from_str(&variables)?,
            skipped_reason,
            error_message,
            worker_id: parse_opt_uuid(worker_id)?,
        })
    })())
}

fn row_to_step_exec(row: &rusqlite::Row) -> rusqlite::Result<Result<StepExecutionRecord>> {
    let id: String = row.get(0)?;
    let chain_execution_id: String = row.get(1)?;
    let step_id: String = row.get(2)?;
    let step_order: i32 = row.get(3)?;
    let status: String = row.get(4)?;
    let started_at: String = row.get(5)?;
    let finished_at: Option<String> = row.get(6)?;
    let request_snapshot: Option<String> = row.get(7)?;
    let response_snapshot: Option<String> = row.get(8)?;
    let extracted_variables: String = row.get(9)?;
    let condition_met: Option<bool> = row.get(10)?;
    let retry_attempt: u32 = row.get(11)?;
    let duration_ms: Option<i64> = row.get(12)?;
    let error_message: Option<String> = row.get(13)?;
    let error_type: Option<String> = row.get(14)?;
    Ok((|| {
        Ok(StepExecutionRecord {
            id: parse_uuid(&id)?,
            chain_execution_id: parse_uuid(&chain_execution_id)?,
            step_id: parse_uuid(&step_id)?,
            step_order,
            status: codec::step_status(&status)?,
            started_at: parse_ts(&started_at)?,
            finished_at: parse_opt_ts(finished_at)?,
            request_snapshot: request_snapshot.as_deref().map(serde_json::from_str).transpose()?,
            response_snapshot: response_snapshot.as_deref().map(serde_json::from_str).transpose()?,
            extracted_variables: serde_json::from_str(&extracted_variables)?,
            condition_met,
            retry_attempt,
            duration_ms: duration_ms.map(codec::to_u64),
            error_message,
            error_type,
        })
    })())
}

#[async_trait]
impl ExecutionLog for SqliteStore {
    async fn insert_task_execution(&self, r: &TaskExecutionRecord) -> Result<()> {
        let r = r.clone();
        self.call(move |conn| {
            conn.execute(
                &format!("INSERT INTO task_executions ({TASK_EXEC_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)"),
                params![
                    r.id.to_string(),
                    r.task_id.to_string(),
                    r.kind.as_str(),
                    r.workspace_id.to_string(),
                    r.status.as_str(),
                    ts(&r.started_at),
                    r.finished_at.as_ref().map(ts),
                    r.status_code,
                    r.duration_ms.map(|d| d as i64),
                    r.response_body,
                    r.error_message,
                    r.error_type,
                    r.retry_attempt,
                    r.worker_id.map(|w| w.to_string()),
                ],
            )
            .db()?;
            Ok(())
        })
        .await
    }

    async fn finish_task_execution(&self, r: &TaskExecutionRecord) -> Result<()> {
        let r = r.clone();
        self.call(move |conn| {
            conn.execute(
                "UPDATE task_executions SET status = ?2, finished_at = ?3, status_code = ?4, duration_ms = ?5,
                 response_body = ?6, error_message = ?7, error_type = ?8, retry_attempt = ?9
                 WHERE id = ?1",
                params![
                    r.id.to_string(),
                    r.status.as_str(),
                    r.finished_at.as_ref().map(ts),
                    r.status_code,
                    r.duration_ms.map(|d| d as i64),
                    r.response_body,
                    r.error_message,
                    r.error_type,
                    r.retry_attempt,
                ],
            )
            .db()?;
            Ok(())
        })
        .await
    }

    async fn get_task_execution(&self, id: Uuid) -> Result<Option<TaskExecutionRecord>> {
        self.call(move |conn| {
            conn.query_row(
                &format!("SELECT {TASK_EXEC_COLUMNS} FROM task_executions WHERE id = ?1"),
                [id.to_string()],
                row_to_task_exec,
            )
            .optional()
            .db()?
            .transpose()
        })
        .await
    }

    async fn insert_chain_execution(&self, r: &ChainExecutionRecord) -> Result<()> {
        let variables = serde_json::to_string(&r.variables)?;
        let r = r.clone();
        self.call(move |conn| {
            conn.execute(
                &format!("INSERT INTO chain_executions ({CHAIN_EXEC_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)"),
                params![
                    r.id.to_string(),
                    r.chain_id.to_string(),
                    r.workspace_id.to_string(),
                    r.status.as_str(),
                    ts(&r.started_at),
                    r.finished_at.as_ref().map(ts),
                    r.total_steps,
                    r.completed_steps,
                    r.failed_steps,
                    r.skipped_steps,
                    variables,
                    r.skipped_reason,
                    r.error_message,
                    r.worker_id.map(|w| w.to_string()),
                ],
            )
            .db()?;
            Ok(())
        })
        .await
    }

    async fn finish_chain_execution(&self, r: &ChainExecutionRecord) -> Result<()> {
        let variables = serde_json::to_string(&r.variables)?;
        let r = r.clone();
        self.call(move |conn| {
            conn.execute(
                "UPDATE chain_executions SET status = ?2, finished_at = ?3, total_steps = ?4,
                 completed_steps = ?5, failed_steps = ?6, skipped_steps = ?7, variables = ?8,
                 skipped_reason = ?9, error_message = ?10
                 WHERE id = ?1",
                params![
                    r.id.to_string(),
                    r.status.as_str(),
                    r.finished_at.as_ref().map(ts),
                    r.total_steps,
                    r.completed_steps,
                    r.failed_steps,
                    r.skipped_steps,
                    variables,
                    r.skipped_reason,
                    r.error_message,
                ],
            )
            .db()?;
            Ok(())
        })
        .await
    }

    async fn get_chain_execution(&self, id: Uuid) -> Result<Option<ChainExecutionRecord>> {
        self.call(move |conn| {
            conn.query_row(
                &format!("SELECT {CHAIN_EXEC_COLUMNS} FROM chain_executions WHERE id = ?1"),
                [id.to_string()],
                row_to_chain_exec,
            )
            .optional()
            .db()?
            .transpose()
        })
        .await
    }

    async fn insert_step_execution(&self, r: &StepExecutionRecord) -> Result<()> {
        let request = r.request_snapshot.as_ref().map(serde_json::to_string).transpose()?;
        let response = r.response_snapshot.as_ref().map(serde_json::to_string).transpose()?;
        let extracted = serde_json::to_string(&r.extracted_variables)?;
        let r = r.clone();
        self.call(move |conn| {
            conn.execute(
                &format!("INSERT INTO step_executions ({STEP_EXEC_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)"),
                params![
                    r.id.to_string(),
                    r.chain_execution_id.to_string(),
                    r.step_id.to_string(),
                    r.step_order,
                    r.status.as_str(),
                    ts(&r.started_at),
                    r.finished_at.as_ref().map(ts),
                    request,
                    response,
                    extracted,
                    r.condition_met,
                    r.retry_attempt,
                    r.duration_ms.map(|d| d as i64),
                    r.error_message,
                    r.error_type,
                ],
            )
            .db()?;
            Ok(())
        })
        .await
    }

    async fn finish_step_execution(&self, r: &StepExecutionRecord) -> Result<()> {
        let request = r.request_snapshot.as_ref().map(serde_json::to_string).transpose()?;
        let response = r.response_snapshot.as_ref().map(serde_json::to_string).transpose()?;
        let extracted = serde_json::to_string(&r.extracted_variables)?;
        let r = r.clone();
        self.call(move |conn| {
            conn.execute(
                "UPDATE step_executions SET status = ?2, finished_at = ?3, request_snapshot = ?4,
                 response_snapshot = ?5, extracted_variables = ?6, condition_met = ?7, retry_attempt = ?8,
                 duration_ms = ?9, error_message = ?10, error_type = ?11
                 WHERE id = ?1",
                params![
                    r.id.to_string(),
                    r.status.as_str(),
                    r.finished_at.as_ref().map(ts),
                    request,
                    response,
                    extracted,
                    r.condition_met,
                    r.retry_attempt,
                    r.duration_ms.map(|d| d as i64),
                    r.error_message,
                    r.error_type,
                ],
            )
            .db()?;
            Ok(())
        })
        .await
    }

    async fn list_step_executions(&self, chain_execution_id: Uuid) -> Result<Vec<StepExecutionRecord>> {
        self.call(move |conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {STEP_EXEC_COLUMNS} FROM step_executions WHERE chain_execution_id = ?1 ORDER BY step_order"
                ))
                .db()?;
            let rows = stmt
                .query_map([chain_execution_id.to_string()], row_to_step_exec)
                .db()?
                .collect::<rusqlite::Result<Vec<_>>>()
                .db()?;
            rows.into_iter().collect()
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use taskclaw_core::types::{ChainStatus, HttpRequest, Protocol, TaskKind};

    fn http() -> Protocol {
        Protocol::Http(HttpRequest::get("http://127.0.0.1:9/health"))
    }

    fn due_task(workspace: Uuid, name: &str, secs_ago: i64) -> TaskDefinition {
        let mut task = TaskDefinition::cron(workspace, name, "*/5 * * * *", http());
        task.next_run_at = Some(Utc::now() - chrono::Duration::seconds(secs_ago));
        task
    }

    fn queued(task: &TaskDefinition, max_instances: u32, max_queue_size: u32) -> TaskDefinition {
        let mut task = task.clone();
        task.overlap = OverlapSettings {
            policy: OverlapPolicy::Queue,
            max_instances,
            max_queue_size,
            execution_timeout: None,
        };
        task
    }

    #[tokio::test]
    async fn test_open_and_migrate() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert!(store.get_task(Uuid::new_v4()).await.unwrap().is_none());
        // Running the migration a second time is a no-op.
        store.migrate().unwrap();
    }

    #[tokio::test]
    async fn test_save_and_load_task() {
        let store = SqliteStore::open_in_memory().unwrap();
        let task = due_task(Uuid::new_v4(), "health", 10);
        store.save_task(&task).await.unwrap();

        let loaded = store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(loaded.name, "health");
        assert_eq!(loaded.protocol, task.protocol);
        assert_eq!(loaded.overlap, task.overlap);
    }

    #[tokio::test]
    async fn test_save_chain_keeps_step_order() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut chain = ChainDefinition::new(Uuid::new_v4(), "checkout");
        chain.push_step("login", HttpRequest::get("http://localhost/login"));
        chain.push_step("cart", HttpRequest::get("http://localhost/cart"));
        chain.steps.reverse();
        store.save_chain(&chain).await.unwrap();

        let loaded = store.get_chain(chain.id).await.unwrap().unwrap();
        let names: Vec<_> = loaded.steps.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, ["login", "cart"]);
    }

    #[tokio::test]
    async fn test_claim_advances_and_excludes() {
        let store = SqliteStore::open_in_memory().unwrap();
        let workspace = Uuid::new_v4();
        let due = due_task(workspace, "due", 30);
        let mut paused = due_task(workspace, "paused", 30);
        paused.is_paused = true;
        let mut future = due_task(workspace, "future", 0);
        future.next_run_at = Some(Utc::now() + chrono::Duration::hours(1));
        for t in [&due, &paused, &future] {
            store.save_task(t).await.unwrap();
        }

        let blocked_ws = Uuid::new_v4();
        let blocked = due_task(blocked_ws, "blocked", 30);
        store.save_task(&blocked).await.unwrap();
        store.set_workspace_blocked(blocked_ws, true).unwrap();

        let now = Utc::now();
        let claimed = store.claim_due_tasks(now, 10).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].task.id, due.id);
        assert!(claimed[0].task.next_run_at.unwrap() > now);

        // Already advanced: a second claim finds nothing.
        assert!(store.claim_due_tasks(now, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_claim_orders_by_next_run_and_limits() {
        let store = SqliteStore::open_in_memory().unwrap();
        let workspace = Uuid::new_v4();
        let newer = due_task(workspace, "newer", 10);
        let older = due_task(workspace, "older", 60);
        store.save_task(&newer).await.unwrap();
        store.save_task(&older).await.unwrap();

        let claimed = store.claim_due_tasks(Utc::now(), 1).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].task.name, "older");
    }

    #[tokio::test]
    async fn test_delayed_task_deactivates_after_claim() {
        let store = SqliteStore::open_in_memory().unwrap();
        let at = Utc::now() - chrono::Duration::seconds(5);
        let task = TaskDefinition::delayed(Uuid::new_v4(), "once", at, http());
        store.save_task(&task).await.unwrap();

        let claimed = store.claim_due_tasks(Utc::now(), 10).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].due_at.timestamp_micros(), at.timestamp_micros());
        let loaded = store.get_task(task.id).await.unwrap().unwrap();
        assert!(!loaded.is_active);
        assert!(loaded.next_run_at.is_none());
        assert!(matches!(loaded.schedule, Schedule::At { .. }));
    }

    #[tokio::test]
    async fn test_restore_next_run_makes_task_due_again() {
        let store = SqliteStore::open_in_memory().unwrap();
        let task = due_task(Uuid::new_v4(), "retry-me", 10);
        store.save_task(&task).await.unwrap();
        let claimed = store.claim_due_tasks(Utc::now(), 10).await.unwrap();
        store.restore_next_run(task.task_ref(), claimed[0].due_at).await.unwrap();
        assert_eq!(store.claim_due_tasks(Utc::now(), 10).await.unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_two_replicas_never_double_claim() {
        let dir = std::env::temp_dir().join(format!("taskclaw-claim-{}", Uuid::new_v4()));
        let path = dir.join("claims.db");
        let replica_a = Arc::new(SqliteStore::open(&path).unwrap());
        let replica_b = Arc::new(SqliteStore::open(&path).unwrap());

        let workspace = Uuid::new_v4();
        let mut ids = Vec::new();
        for i in 0..5 {
            let task = due_task(workspace, &format!("t{i}"), 30 + i);
            ids.push(task.id);
            replica_a.save_task(&task).await.unwrap();
        }

        let now = Utc::now();
        let a = tokio::spawn({
            let store = replica_a.clone();
            async move { store.claim_due_tasks(now, 10).await.unwrap() }
        });
        let b = tokio::spawn({
            let store = replica_b.clone();
            async move { store.claim_due_tasks(now, 10).await.unwrap() }
        });
        let (a, b) = (a.await.unwrap(), b.await.unwrap());

        let mut union: Vec<Uuid> = a.iter().chain(b.iter()).map(|c| c.task.id).collect();
        union.sort();
        ids.sort();
        assert_eq!(union, ids);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_acquire_respects_max_instances() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut task = due_task(Uuid::new_v4(), "skip", 0);
        task.overlap.policy = OverlapPolicy::Skip;
        task.overlap.max_instances = 2;
        store.save_task(&task).await.unwrap();
        let target = task.task_ref();

        let now = Utc::now();
        assert_eq!(store.acquire_slot(target, now).await.unwrap(), SlotGrant::Acquired { running: 1 });
        assert_eq!(store.acquire_slot(target, now).await.unwrap(), SlotGrant::Acquired { running: 2 });
        assert!(matches!(store.acquire_slot(target, now).await.unwrap(), SlotGrant::Saturated { .. }));
        assert_eq!(store.running_instances(target).await.unwrap(), 2);
        let loaded = store.get_task(task.id).await.unwrap().unwrap();
        assert!(loaded.last_run_at.is_some());
    }

    #[tokio::test]
    async fn test_release_floors_at_zero() {
        let store = SqliteStore::open_in_memory().unwrap();
        let task = due_task(Uuid::new_v4(), "floor", 0);
        store.save_task(&task).await.unwrap();
        let release = store.release_slot(task.task_ref()).await.unwrap();
        assert_eq!(release.running, 0);
        assert_eq!(store.running_instances(task.task_ref()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_missing_target_is_not_found() {
        let store = SqliteStore::open_in_memory().unwrap();
        let target = TaskRef::new(TaskKind::Cron, Uuid::new_v4());
        assert!(matches!(
            store.acquire_slot(target, Utc::now()).await,
            Err(TaskClawError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_queue_is_bounded_and_ordered() {
        let store = SqliteStore::open_in_memory().unwrap();
        let task = queued(&due_task(Uuid::new_v4(), "queued", 0), 1, 3);
        store.save_task(&task).await.unwrap();
        let target = task.task_ref();
        let now = Utc::now();
        store.acquire_slot(target, now).await.unwrap();

        let low = QueueEntry::new(task.workspace_id, target, 0, Default::default());
        let high = QueueEntry::new(task.workspace_id, target, 5, Default::default());
        let low2 = QueueEntry::new(task.workspace_id, target, 0, Default::default());
        assert_eq!(store.enqueue_bounded(&low, now).await.unwrap(), Enqueued::Queued { position: 1 });
        assert_eq!(store.enqueue_bounded(&high, now).await.unwrap(), Enqueued::Queued { position: 1 });
        assert_eq!(store.enqueue_bounded(&low2, now).await.unwrap(), Enqueued::Queued { position: 3 });
        let overflow = QueueEntry::new(task.workspace_id, target, 9, Default::default());
        assert_eq!(store.enqueue_bounded(&overflow, now).await.unwrap(), Enqueued::Full);
        assert_eq!(store.queue_depth(target).await.unwrap(), 3);

        let head: Vec<Uuid> = store.queue_head(target, 10).await.unwrap().iter().map(|e| e.id).collect();
        assert_eq!(head, vec![high.id, low.id, low2.id]);
    }

    #[tokio::test]
    async fn test_promote_takes_slot_atomically() {
        let store = SqliteStore::open_in_memory().unwrap();
        let task = queued(&due_task(Uuid::new_v4(), "promote", 0), 1, 5);
        store.save_task(&task).await.unwrap();
        let target = task.task_ref();
        let now = Utc::now();

        store.acquire_slot(target, now).await.unwrap();
        let entry = QueueEntry::new(task.workspace_id, target, 0, Default::default());
        store.enqueue_bounded(&entry, now).await.unwrap();

        // Saturated: nothing promoted.
        assert!(store.promote_queue_head(target, now).await.unwrap().is_none());

        store.release_slot(target).await.unwrap();
        let promoted = store.promote_queue_head(target, now).await.unwrap().unwrap();
        assert_eq!(promoted.id, entry.id);
        assert_eq!(store.running_instances(target).await.unwrap(), 1);
        assert_eq!(store.queue_depth(target).await.unwrap(), 0);

        // Empty queue: no spurious slot.
        store.release_slot(target).await.unwrap();
        assert!(store.promote_queue_head(target, now).await.unwrap().is_none());
        assert_eq!(store.running_instances(target).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_clear_queue() {
        let store = SqliteStore::open_in_memory().unwrap();
        let task = queued(&due_task(Uuid::new_v4(), "clear", 0), 1, 5);
        store.save_task(&task).await.unwrap();
        store.acquire_slot(task.task_ref(), Utc::now()).await.unwrap();
        for _ in 0..2 {
            let entry = QueueEntry::new(task.workspace_id, task.task_ref(), 0, Default::default());
            store.enqueue_bounded(&entry, Utc::now()).await.unwrap();
        }
        assert_eq!(store.clear_queue(task.task_ref()).await.unwrap(), 2);
        assert_eq!(store.queue_depth(task.task_ref()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_enqueue_takes_slot_freed_after_refusal() {
        let store = SqliteStore::open_in_memory().unwrap();
        let task = queued(&due_task(Uuid::new_v4(), "race", 0), 1, 5);
        store.save_task(&task).await.unwrap();
        let target = task.task_ref();
        let now = Utc::now();

        // First run holds the slot, second sees it saturated.
        store.acquire_slot(target, now).await.unwrap();
        assert!(matches!(store.acquire_slot(target, now).await.unwrap(), SlotGrant::Saturated { .. }));
        // First run finishes before the second gets to enqueue.
        store.release_slot(target).await.unwrap();

        let entry = QueueEntry::new(task.workspace_id, target, 0, Default::default());
        assert_eq!(store.enqueue_bounded(&entry, now).await.unwrap(), Enqueued::Acquired { running: 1 });
        assert_eq!(store.queue_depth(target).await.unwrap(), 0);
        assert_eq!(store.running_instances(target).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_reset_stale_instances() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut stale = due_task(Uuid::new_v4(), "stale", 0);
        stale.overlap.execution_timeout = Some(60);
        stale.overlap.max_instances = 3;
        stale.running_instances = 2;
        stale.last_run_at = Some(Utc::now() - chrono::Duration::seconds(120));
        let mut fresh = stale.clone();
        fresh.id = Uuid::new_v4();
        fresh.last_run_at = Some(Utc::now());
        let mut untimed = stale.clone();
        untimed.id = Uuid::new_v4();
        untimed.overlap.execution_timeout = None;
        for t in [&stale, &fresh, &untimed] {
            store.save_task(t).await.unwrap();
        }

        let reset = store.reset_stale_instances(Utc::now()).await.unwrap();
        assert_eq!(reset.len(), 1);
        assert_eq!(reset[0].target, stale.task_ref());
        assert_eq!(reset[0].running_instances, 2);
        assert_eq!(store.running_instances(stale.task_ref()).await.unwrap(), 0);
        assert_eq!(store.running_instances(fresh.task_ref()).await.unwrap(), 2);
        assert_eq!(store.running_instances(untimed.task_ref()).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_workspace_counters_and_gate() {
        let store = SqliteStore::open_in_memory().unwrap();
        let workspace = Uuid::new_v4();
        store.increment_workspace_counter(workspace, WorkspaceCounter::ExecutionsSkipped).await.unwrap();
        store.increment_workspace_counter(workspace, WorkspaceCounter::ExecutionsSkipped).await.unwrap();
        store.increment_workspace_counter(workspace, WorkspaceCounter::ExecutionsQueued).await.unwrap();
        let stats = store.workspace_stats(workspace).await.unwrap();
        assert_eq!(stats.executions_skipped, 2);
        assert_eq!(stats.executions_queued, 1);
        assert!(!store.is_blocked(workspace).await.unwrap());

        store.save_workspace(workspace, "acme", true).await.unwrap();
        assert!(store.is_blocked(workspace).await.unwrap());
    }

    #[tokio::test]
    async fn test_record_outcome_streak() {
        let store = SqliteStore::open_in_memory().unwrap();
        let task = due_task(Uuid::new_v4(), "flaky", 0);
        store.save_task(&task).await.unwrap();
        let target = task.task_ref();

        store.record_outcome(target, false).await.unwrap();
        let update = store.record_outcome(target, false).await.unwrap();
        assert_eq!(update.previous_failures, 1);
        assert_eq!(update.consecutive_failures, 2);
        let update = store.record_outcome(target, true).await.unwrap();
        assert_eq!(update.previous_failures, 2);
        assert_eq!(update.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_chain_execution_log() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut record = ChainExecutionRecord {
            id: Uuid::new_v4(),
            chain_id: Uuid::new_v4(),
            workspace_id: Uuid::new_v4(),
            status: ChainStatus::Running,
            started_at: Utc::now(),
            finished_at: None,
            total_steps: 2,
            completed_steps: 0,
            failed_steps: 0,
            skipped_steps: 0,
            variables: Default::default(),
            skipped_reason: None,
            error_message: None,
            worker_id: None,
        };
        store.insert_chain_execution(&record).await.unwrap();

        record.status = ChainStatus::Partial;
        record.completed_steps = 1;
        record.failed_steps = 1;
        record.finished_at = Some(Utc::now());
        record.variables.insert("token".into(), serde_json::json!("abc"));
        store.finish_chain_execution(&record).await.unwrap();

        let loaded = store.get_chain_execution(record.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, ChainStatus::Partial);
        assert_eq!(loaded.variables["token"], serde_json::json!("abc"));
        assert!(loaded.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_contended_connection_does_not_stall_the_runtime() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let task = due_task(Uuid::new_v4(), "busy", 0);
        store.save_task(&task).await.unwrap();

        let (locked_tx, locked_rx) = std::sync::mpsc::channel();
        let conn = store.conn.clone();
        let holder = std::thread::spawn(move || {
            let _guard = conn.lock().unwrap();
            locked_tx.send(()).unwrap();
            std::thread::sleep(std::time::Duration::from_millis(300));
        });
        locked_rx.recv().unwrap();

        let reader = {
            let store = store.clone();
            tokio::spawn(async move { store.running_instances(task.task_ref()).await })
        };
        let started = std::time::Instant::now();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(started.elapsed() < std::time::Duration::from_millis(250));

        assert_eq!(reader.await.unwrap().unwrap(), 0);
        holder.join().unwrap();
    }
}
