//! PostgreSQL store for multi-replica deployments.
//!
//! Claims use `FOR UPDATE ... SKIP LOCKED` so concurrent schedulers each take
//! a disjoint set of due rows. Counter and queue operations lock only the
//! owning task or chain row.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use std::collections::BTreeMap;
use uuid::Uuid;

use taskclaw_core::error::{Result, TaskClawError};
use taskclaw_core::schedule;
use taskclaw_core::traits::{
    ClaimedChain, ClaimedTask, Enqueued, ExecutionLog, OutcomeUpdate, SlotGrant, SlotRelease, StaleInstance,
    TaskStore, TenantGate, WorkerQueue,
};
use taskclaw_core::types::{
    ChainDefinition, ChainExecutionRecord, ChainStep, HttpRequest, OverlapPolicy, OverlapSettings,
    ProbeSettings, Protocol, QueueEntry, Schedule, StepCondition, StepExecutionRecord, TaskDefinition,
    TaskExecutionRecord, TaskRef, Variables, WorkUnit, WorkspaceCounter, WorkspaceStats,
};

use crate::codec::{self, owner_table, to_i32, to_u32};

trait SqlxResultExt<T> {
    fn db(self) -> Result<T>;
}

impl<T> SqlxResultExt<T> for std::result::Result<T, sqlx::Error> {
    fn db(self) -> Result<T> {
        self.map_err(|e| TaskClawError::Database(e.to_string()))
    }
}

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(url)
            .await
            .map_err(|e| TaskClawError::Database(format!("Postgres connect error: {e}")))?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply embedded migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| TaskClawError::Database(format!("migration failed: {e}")))?;
        tracing::info!("🗄️ Postgres schema up to date");
        Ok(())
    }
}

// ─── Rows ──────────────────────────────────────

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

#[derive(sqlx::FromRow)]
struct TaskRow {
    id: Uuid,
    workspace_id: Uuid,
    name: String,
    kind: String,
    schedule: Json<Schedule>,
    protocol: Json<Protocol>,
    timeout_seconds: i32,
    retry_count: i32,
    retry_delay_seconds: i32,
    overlap_policy: String,
    max_instances: i32,
    max_queue_size: i32,
    execution_timeout: Option<i32>,
    running_instances: i32,
    is_active: bool,
    is_paused: bool,
    next_run_at: Option<DateTime<Utc>>,
    last_run_at: Option<DateTime<Utc>>,
    consecutive_failures: i32,
    worker_id: Option<Uuid>,
}

fn overlap_from(policy: &str, max_instances: i32, max_queue_size: i32, execution_timeout: Option<i32>) -> Result<OverlapSettings> {
    Ok(OverlapSettings {
        policy: codec::policy(policy)?,
        max_instances: to_u32(max_instances.into()),
        max_queue_size: to_u32(max_queue_size.into()),
        execution_timeout: execution_timeout.map(|t| to_u32(t.into())),
    })
}

impl TryFrom<TaskRow> for TaskDefinition {
    type Error = TaskClawError;

    fn try_from(row: TaskRow) -> Result<Self> {
        Ok(TaskDefinition {
            id: row.id,
            workspace_id: row.workspace_id,
            name: row.name,
            kind: codec::kind(&row.kind)?,
            schedule: row.schedule.0,
            protocol: row.protocol.0,
            probe: ProbeSettings {
                timeout_seconds: to_u32(row.timeout_seconds.into()),
                retry_count: to_u32(row.retry_count.into()),
                retry_delay_seconds: to_u32(row.retry_delay_seconds.into()),
            },
            overlap: overlap_from(&row.overlap_policy, row.max_instances, row.max_queue_size, row.execution_timeout)?,
            running_instances: to_u32(row.running_instances.into()),
            is_active: row.is_active,
            is_paused: row.is_paused,
            next_run_at: row.next_run_at,
            last_run_at: row.last_run_at,
            consecutive_failures: to_u32(row.consecutive_failures.into()),
            worker_id: row.worker_id,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ChainRow {
    id: Uuid,
    workspace_id: Uuid,
    name: String,
    schedule: Option<Json<Schedule>>,
    stop_on_failure: bool,
    overlap_policy: String,
    max_instances: i32,
    max_queue_size: i32,
    execution_timeout: Option<i32>,
    running_instances: i32,
    is_active: bool,
    is_paused: bool,
    next_run_at: Option<DateTime<Utc>>,
    last_run_at: Option<DateTime<Utc>>,
    consecutive_failures: i32,
    worker_id: Option<Uuid>,
}

impl ChainRow {
    fn into_chain(self, steps: Vec<ChainStep>) -> Result<ChainDefinition> {
        Ok(ChainDefinition {
            id: self.id,
            workspace_id: self.workspace_id,
            name: self.name,
            schedule: self.schedule.map(|s| s.0),
            steps,
            stop_on_failure: self.stop_on_failure,
            overlap: overlap_from(&self.overlap_policy, self.max_instances, self.max_queue_size, self.execution_timeout)?,
            running_instances: to_u32(self.running_instances.into()),
            is_active: self.is_active,
            is_paused: self.is_paused,
            next_run_at: self.next_run_at,
            last_run_at: self.last_run_at,
            consecutive_failures: to_u32(self.consecutive_failures.into()),
            worker_id: self.worker_id,
        })
    }
}

#[derive(sqlx::FromRow)]
struct StepRow {
    id: Uuid,
    chain_id: Uuid,
    step_order: i32,
    name: String,
    request: Json<HttpRequest>,
    timeout_seconds: i32,
    retry_count: i32,
    retry_delay_seconds: i32,
    condition: Option<Json<StepCondition>>,
    extract_variables: Json<BTreeMap<String, String>>,
    continue_on_failure: bool,
}

impl From<StepRow> for ChainStep {
    fn from(row: StepRow) -> Self {
        Self {
            id: row.id,
            chain_id: row.chain_id,
            step_order: row.step_order,
            name: row.name,
            request: row.request.0,
            timeout_seconds: to_u32(row.timeout_seconds.into()),
            retry_count: to_u32(row.retry_count.into()),
            retry_delay_seconds: to_u32(row.retry_delay_seconds.into()),
            condition: row.condition.map(|c| c.0),
            extract_variables: row.extract_variables.0,
            continue_on_failure: row.continue_on_failure,
        }
    }
}

#[derive(sqlx::FromRow)]
struct QueueRow {
    id: Uuid,
    workspace_id: Uuid,
    task_type: String,
    task_id: Uuid,
    priority: i32,
    queued_at: DateTime<Utc>,
    initial_variables: Json<Variables>,
}

impl TryFrom<QueueRow> for QueueEntry {
    type Error = TaskClawError;

    fn try_from(row: QueueRow) -> Result<Self> {
        Ok(QueueEntry {
            id: row.id,
            workspace_id: row.workspace_id,
            task_type: codec::kind(&row.task_type)?,
            task_id: row.task_id,
            priority: row.priority,
            queued_at: row.queued_at,
            initial_variables: row.initial_variables.0,
        })
    }
}

#[derive(sqlx::FromRow)]
struct OverlapRow {
    overlap_policy: String,
    max_instances: i32,
    max_queue_size: i32,
    execution_timeout: Option<i32>,
    running_instances: i32,
}

impl OverlapRow {
    fn settings(&self) -> Result<OverlapSettings> {
        overlap_from(&self.overlap_policy, self.max_instances, self.max_queue_size, self.execution_timeout)
    }
}

async fn load_steps<'e, E>(executor: E, chain_id: Uuid) -> Result<Vec<ChainStep>>
where
    E: sqlx::PgExecutor<'e>,
{
    let rows = sqlx::query_as::<_, StepRow>(&format!(
        "SELECT {STEP_COLUMNS} FROM chain_steps WHERE chain_id = $1 ORDER BY step_order"
    ))
    .bind(chain_id)
    .fetch_all(executor)
    .await
    .db()?;
    Ok(rows.into_iter().map(ChainStep::from).collect())
}

async fn ensure_workspace<'e, E>(executor: E, workspace_id: Uuid) -> Result<()>
where
    E: sqlx::PgExecutor<'e>,
{
    sqlx::query("INSERT INTO workspaces (id) VALUES ($1) ON CONFLICT (id) DO NOTHING")
        .bind(workspace_id)
        .execute(executor)
        .await
        .db()?;
    Ok(())
}

/// `next_run_at` after a claim at `now`, and whether the definition stays active.
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
impl TaskStore for PgStore {
    async fn save_task(&self, task: &TaskDefinition) -> Result<()> {
        ensure_workspace(&self.pool, task.workspace_id).await?;
        sqlx::query(
            r#"
            INSERT INTO tasks
                (id, workspace_id, name, kind, schedule, protocol, timeout_seconds, retry_count,
                 retry_delay_seconds, overlap_policy, max_instances, max_queue_size, execution_timeout,
                 running_instances, is_active, is_paused, next_run_at, last_run_at, consecutive_failures, worker_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20)
            ON CONFLICT (id) DO UPDATE SET
                workspace_id = EXCLUDED.workspace_id,
                name = EXCLUDED.name,
                kind = EXCLUDED.kind,
                schedule = EXCLUDED.schedule,
                protocol = EXCLUDED.protocol,
                timeout_seconds = EXCLUDED.timeout_seconds,
                retry_count = EXCLUDED.retry_count,
                retry_delay_seconds = EXCLUDED.retry_delay_seconds,
                overlap_policy = EXCLUDED.overlap_policy,
                max_instances = EXCLUDED.max_instances,
                max_queue_size = EXCLUDED.max_queue_size,
                execution_timeout = EXCLUDED.execution_timeout,
                running_instances = EXCLUDED.running_instances,
                is_active = EXCLUDED.is_active,
                is_paused = EXCLUDED.is_paused,
                next_run_at = EXCLUDED.next_run_at,
                last_run_at = EXCLUDED.last_run_at,
                consecutive_failures = EXCLUDED.consecutive_failures,
                worker_id = EXCLUDED.worker_id
            "#,
        )
        .bind(task.id)
        .bind(task.workspace_id)
        .bind(&task.name)
        .bind(task.kind.as_str())
        .bind(Json(&task.schedule))
        .bind(Json(&task.protocol))
        .bind(to_i32(task.probe.timeout_seconds))
        .bind(to_i32(task.probe.retry_count))
        .bind(to_i32(task.probe.retry_delay_seconds))
        .bind(task.overlap.policy.as_str())
        .bind(to_i32(task.overlap.max_instances.max(1)))
        .bind(to_i32(task.overlap.max_queue_size))
        .bind(task.overlap.execution_timeout.map(to_i32))
        .bind(to_i32(task.running_instances))
        .bind(task.is_active)
        .bind(task.is_paused)
        .bind(task.next_run_at)
        .bind(task.last_run_at)
        .bind(to_i32(task.consecutive_failures))
        .bind(task.worker_id)
        .execute(&self.pool)
        .await
        .db()?;
        Ok(())
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<TaskDefinition>> {
        sqlx::query_as::<_, TaskRow>(&format!("SELECT {TASK_COLUMNS} FROM tasks t WHERE t.id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .db()?
            .map(TaskDefinition::try_from)
            .transpose()
    }

    async fn save_chain(&self, chain: &ChainDefinition) -> Result<()> {
        let mut tx = self.pool.begin().await.db()?;
        ensure_workspace(&mut *tx, chain.workspace_id).await?;
        sqlx::query(
            r#"
            INSERT INTO chains
                (id, workspace_id, name, schedule, stop_on_failure, overlap_policy, max_instances,
                 max_queue_size, execution_timeout, running_instances, is_active, is_paused,
                 next_run_at, last_run_at, consecutive_failures, worker_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            ON CONFLICT (id) DO UPDATE SET
                workspace_id = EXCLUDED.workspace_id,
                name = EXCLUDED.name,
                schedule = EXCLUDED.schedule,
                stop_on_failure = EXCLUDED.stop_on_failure,
                overlap_policy = EXCLUDED.overlap_policy,
                max_instances = EXCLUDED.max_instances,
                max_queue_size = EXCLUDED.max_queue_size,
                execution_timeout = EXCLUDED.execution_timeout,
                running_instances = EXCLUDED.running_instances,
                is_active = EXCLUDED.is_active,
                is_paused = EXCLUDED.is_paused,
                next_run_at = EXCLUDED.next_run_at,
                last_run_at = EXCLUDED.last_run_at,
                consecutive_failures = EXCLUDED.consecutive_failures,
                worker_id = EXCLUDED.worker_id
            "#,
        )
        .bind(chain.id)
        .bind(chain.workspace_id)
        .bind(&chain.name)
        .bind(chain.schedule.as_ref().map(Json))
        .bind(chain.stop_on_failure)
        .bind(chain.overlap.policy.as_str())
        .bind(to_i32(chain.overlap.max_instances.max(1)))
        .bind(to_i32(chain.overlap.max_queue_size))
        .bind(chain.overlap.execution_timeout.map(to_i32))
        .bind(to_i32(chain.running_instances))
        .bind(chain.is_active)
        .bind(chain.is_paused)
        .bind(chain.next_run_at)
        .bind(chain.last_run_at)
        .bind(to_i32(chain.consecutive_failures))
        .bind(chain.worker_id)
        .execute(&mut *tx)
        .await
        .db()?;

        sqlx::query("DELETE FROM chain_steps WHERE chain_id = $1")
            .bind(chain.id)
            .execute(&mut *tx)
            .await
            .db()?;
        for step in &chain.steps {
            sqlx::query(&format!(
                "INSERT INTO chain_steps ({STEP_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)"
            ))
            .bind(step.id)
            .bind(chain.id)
            .bind(step.step_order)
            .bind(&step.name)
            .bind(Json(&step.request))
            .bind(to_i32(step.timeout_seconds))
            .bind(to_i32(step.retry_count))
            .bind(to_i32(step.retry_delay_seconds))
            .bind(step.condition.as_ref().map(Json))
            .bind(Json(&step.extract_variables))
            .bind(step.continue_on_failure)
            .execute(&mut *tx)
            .await
            .db()?;
        }
        tx.commit().await.db()?;
        Ok(())
    }

    async fn get_chain(&self, id: Uuid) -> Result<Option<ChainDefinition>> {
        let row = sqlx::query_as::<_, ChainRow>(&format!("SELECT {CHAIN_COLUMNS} FROM chains c WHERE c.id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .db()?;
        match row {
            Some(row) => {
                let steps = load_steps(&self.pool, row.id).await?;
                row.into_chain(steps).map(Some)
            }
            None => Ok(None),
        }
    }

    async fn save_workspace(&self, workspace_id: Uuid, name: &str, is_blocked: bool) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO workspaces (id, name, is_blocked) VALUES ($1, $2, $3)
            ON CONFLICT (id) DO UPDATE SET name = EXCLUDED.name, is_blocked = EXCLUDED.is_blocked
            "#,
        )
        .bind(workspace_id)
        .bind(name)
        .bind(is_blocked)
        .execute(&self.pool)
        .await
        .db()?;
        Ok(())
    }

    async fn claim_due_tasks(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<ClaimedTask>> {
        let mut tx = self.pool.begin().await.db()?;
        let rows = sqlx::query_as::<_, TaskRow>(&format!(
            r#"
            SELECT {TASK_COLUMNS}
            FROM tasks t
            LEFT JOIN workspaces w ON w.id = t.workspace_id
            WHERE t.is_active AND NOT t.is_paused
              AND t.next_run_at IS NOT NULL AND t.next_run_at <= $1
              AND NOT COALESCE(w.is_blocked, FALSE)
            ORDER BY t.next_run_at
            LIMIT $2
            FOR UPDATE OF t SKIP LOCKED
            "#
        ))
        .bind(now)
        .bind(i64::from(limit))
        .fetch_all(&mut *tx)
        .await
        .db()?;

        let mut claimed = Vec::with_capacity(rows.len());
        for row in rows {
            let mut task = TaskDefinition::try_from(row)?;
            let due_at = task.next_run_at.unwrap_or(now);
            let (next_run_at, is_active) = advance(Some(&task.schedule), &task.name, now);
            sqlx::query("UPDATE tasks SET next_run_at = $2, is_active = $3 WHERE id = $1")
                .bind(task.id)
                .bind(next_run_at)
                .bind(is_active)
                .execute(&mut *tx)
                .await
                .db()?;
            task.next_run_at = next_run_at;
            task.is_active = is_active;
            claimed.push(ClaimedTask { task, due_at });
        }
        tx.commit().await.db()?;
        Ok(claimed)
    }

    async fn claim_due_chains(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<ClaimedChain>> {
        let mut tx = self.pool.begin().await.db()?;
        let rows = sqlx::query_as::<_, ChainRow>(&format!(
            r#"
            SELECT {CHAIN_COLUMNS}
            FROM chains c
            LEFT JOIN workspaces w ON w.id = c.workspace_id
            WHERE c.is_active AND NOT c.is_paused
              AND c.next_run_at IS NOT NULL AND c.next_run_at <= $1
              AND NOT COALESCE(w.is_blocked, FALSE)
            ORDER BY c.next_run_at
            LIMIT $2
            FOR UPDATE OF c SKIP LOCKED
            "#
        ))
        .bind(now)
        .bind(i64::from(limit))
        .fetch_all(&mut *tx)
        .await
        .db()?;

        let mut claimed = Vec::with_capacity(rows.len());
        for row in rows {
            let steps = load_steps(&mut *tx, row.id).await?;
            let mut chain = row.into_chain(steps)?;
            let due_at = chain.next_run_at.unwrap_or(now);
            let (next_run_at, is_active) = advance(chain.schedule.as_ref(), &chain.name, now);
            sqlx::query("UPDATE chains SET next_run_at = $2, is_active = $3 WHERE id = $1")
                .bind(chain.id)
                .bind(next_run_at)
                .bind(is_active)
                .execute(&mut *tx)
                .await
                .db()?;
            chain.next_run_at = next_run_at;
            chain.is_active = is_active;
            claimed.push(ClaimedChain { chain, due_at });
        }
        tx.commit().await.db()?;
        Ok(claimed)
    }

    async fn restore_next_run(&self, target: TaskRef, due_at: DateTime<Utc>) -> Result<()> {
        let table = owner_table(target);
        sqlx::query(&format!("UPDATE {table} SET next_run_at = $2, is_active = TRUE WHERE id = $1"))
            .bind(target.id)
            .bind(due_at)
            .execute(&self.pool)
            .await
            .db()?;
        Ok(())
    }

    async fn acquire_slot(&self, target: TaskRef, now: DateTime<Utc>) -> Result<SlotGrant> {
        let table = owner_table(target);
        let running: Option<i32> = sqlx::query_scalar(&format!(
            r#"
            UPDATE {table}
            SET running_instances = running_instances + 1, last_run_at = $2
            WHERE id = $1 AND (overlap_policy = 'allow' OR running_instances < max_instances)
            RETURNING running_instances
            "#
        ))
        .bind(target.id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .db()?;

        if let Some(running) = running {
            return Ok(SlotGrant::Acquired {
                running: to_u32(running.into()),
            });
        }
        let row = self.overlap_row(target).await?;
        Ok(SlotGrant::Saturated {
            overlap: row.settings()?,
        })
    }

    async fn release_slot(&self, target: TaskRef) -> Result<SlotRelease> {
        let table = owner_table(target);
        let row = sqlx::query_as::<_, OverlapRow>(&format!(
            r#"
            UPDATE {table} SET running_instances = GREATEST(running_instances - 1, 0)
            WHERE id = $1
            RETURNING overlap_policy, max_instances, max_queue_size, execution_timeout, running_instances
            "#
        ))
        .bind(target.id)
        .fetch_optional(&self.pool)
        .await
        .db()?
        .ok_or_else(|| codec::not_found(target))?;
        Ok(SlotRelease {
            running: to_u32(row.running_instances.into()),
            overlap: row.settings()?,
        })
    }

    async fn running_instances(&self, target: TaskRef) -> Result<u32> {
        let row = self.overlap_row(target).await?;
        Ok(to_u32(row.running_instances.into()))
    }

    async fn reset_stale_instances(&self, now: DateTime<Utc>) -> Result<Vec<StaleInstance>> {
        let mut reset = Vec::new();
        for (table, kind_column) in [("tasks", "t.kind"), ("chains", "'chain'")] {
            let rows: Vec<(Uuid, String, Uuid, i32, Option<DateTime<Utc>>)> = sqlx::query_as(&format!(
                r#"
                WITH stale AS (
                    SELECT id, running_instances
                    FROM {table}
                    WHERE execution_timeout IS NOT NULL
                      AND running_instances > 0
                      AND (last_run_at IS NULL
                           OR last_run_at + make_interval(secs => execution_timeout) < $1)
                    FOR UPDATE SKIP LOCKED
                )
                UPDATE {table} t SET running_instances = 0
                FROM stale
                WHERE t.id = stale.id
                RETURNING t.id, {kind_column}, t.workspace_id, stale.running_instances, t.last_run_at
                "#
            ))
            .bind(now)
            .fetch_all(&self.pool)
            .await
            .db()?;
            for (id, kind, workspace_id, running, last_run_at) in rows {
                reset.push(StaleInstance {
                    target: TaskRef::new(codec::kind(&kind)?, id),
                    workspace_id,
                    running_instances: to_u32(running.into()),
                    last_run_at,
                });
            }
        }
        Ok(reset)
    }

    async fn enqueue_bounded(&self, entry: &QueueEntry, now: DateTime<Utc>) -> Result<Enqueued> {
        let target = entry.target();
        let table = owner_table(target);
        let mut tx = self.pool.begin().await.db()?;

        // Row lock on the owner serializes enqueuers and releasers of the same definition.
        let owner = sqlx::query_as::<_, OverlapRow>(&format!(
            "SELECT overlap_policy, max_instances, max_queue_size, execution_timeout, running_instances
             FROM {table} WHERE id = $1 FOR UPDATE"
        ))
        .bind(target.id)
        .fetch_optional(&mut *tx)
        .await
        .db()?
        .ok_or_else(|| codec::not_found(target))?;
        let settings = owner.settings()?;
        if settings.policy == OverlapPolicy::Allow || owner.running_instances < owner.max_instances {
            let running: i32 = sqlx::query_scalar(&format!(
                "UPDATE {table} SET running_instances = running_instances + 1, last_run_at = $2
                 WHERE id = $1 RETURNING running_instances"
            ))
            .bind(target.id)
            .bind(now)
            .fetch_one(&mut *tx)
            .await
            .db()?;
            tx.commit().await.db()?;
            return Ok(Enqueued::Acquired {
                running: to_u32(running.into()),
            });
        }
        let max_queue_size = owner.max_queue_size;
        let depth: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM task_queue WHERE task_type = $1 AND task_id = $2")
            .bind(target.kind.as_str())
            .bind(target.id)
            .fetch_one(&mut *tx)
            .await
            .db()?;
        if depth >= i64::from(max_queue_size) {
            return Ok(Enqueued::Full);
        }

        sqlx::query(&format!("INSERT INTO task_queue ({QUEUE_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7)"))
            .bind(entry.id)
            .bind(entry.workspace_id)
            .bind(target.kind.as_str())
            .bind(target.id)
            .bind(entry.priority)
            .bind(entry.queued_at)
            .bind(Json(&entry.initial_variables))
            .execute(&mut *tx)
            .await
            .db()?;
        let position: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM task_queue WHERE task_type = $1 AND task_id = $2 AND priority >= $3",
        )
        .bind(target.kind.as_str())
        .bind(target.id)
        .bind(entry.priority)
        .fetch_one(&mut *tx)
        .await
        .db()?;
        tx.commit().await.db()?;
        Ok(Enqueued::Queued {
            position: to_u32(position),
        })
    }

    async fn promote_queue_head(&self, target: TaskRef, now: DateTime<Utc>) -> Result<Option<QueueEntry>> {
        let table = owner_table(target);
        let mut tx = self.pool.begin().await.db()?;
        let owner = sqlx::query_as::<_, OverlapRow>(&format!(
            "SELECT overlap_policy, max_instances, max_queue_size, execution_timeout, running_instances
             FROM {table} WHERE id = $1 FOR UPDATE"
        ))
        .bind(target.id)
        .fetch_optional(&mut *tx)
        .await
        .db()?;
        let Some(owner) = owner else {
            return Ok(None);
        };
        let overlap = owner.settings()?;
        if overlap.policy != OverlapPolicy::Allow && to_u32(owner.running_instances.into()) >= overlap.max_instances {
            return Ok(None);
        }

        let head = sqlx::query_as::<_, QueueRow>(&format!(
            r#"
            DELETE FROM task_queue
            WHERE id = (
                SELECT id FROM task_queue
                WHERE task_type = $1 AND task_id = $2
                ORDER BY priority DESC, queued_at ASC, seq ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {QUEUE_COLUMNS}
            "#
        ))
        .bind(target.kind.as_str())
        .bind(target.id)
        .fetch_optional(&mut *tx)
        .await
        .db()?;
        let Some(head) = head else {
            return Ok(None);
        };

        sqlx::query(&format!(
            "UPDATE {table} SET running_instances = running_instances + 1, last_run_at = $2 WHERE id = $1"
        ))
        .bind(target.id)
        .bind(now)
        .execute(&mut *tx)
        .await
        .db()?;
        tx.commit().await.db()?;
        QueueEntry::try_from(head).map(Some)
    }

    async fn queue_depth(&self, target: TaskRef) -> Result<u32> {
        let depth: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM task_queue WHERE task_type = $1 AND task_id = $2")
            .bind(target.kind.as_str())
            .bind(target.id)
            .fetch_one(&self.pool)
            .await
            .db()?;
        Ok(to_u32(depth))
    }

    async fn queue_head(&self, target: TaskRef, limit: u32) -> Result<Vec<QueueEntry>> {
        let rows = sqlx::query_as::<_, QueueRow>(&format!(
            r#"
            SELECT {QUEUE_COLUMNS} FROM task_queue
            WHERE task_type = $1 AND task_id = $2
            ORDER BY priority DESC, queued_at ASC, seq ASC
            LIMIT $3
            "#
        ))
        .bind(target.kind.as_str())
        .bind(target.id)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await
        .db()?;
        rows.into_iter().map(QueueEntry::try_from).collect()
    }

    async fn clear_queue(&self, target: TaskRef) -> Result<u32> {
        let result = sqlx::query("DELETE FROM task_queue WHERE task_type = $1 AND task_id = $2")
            .bind(target.kind.as_str())
            .bind(target.id)
            .execute(&self.pool)
            .await
            .db()?;
        Ok(result.rows_affected() as u32)
    }

    async fn increment_workspace_counter(&self, workspace_id: Uuid, counter: WorkspaceCounter) -> Result<()> {
        let column = match counter {
            WorkspaceCounter::ExecutionsSkipped => "executions_skipped",
            WorkspaceCounter::ExecutionsQueued => "executions_queued",
        };
        sqlx::query(&format!(
            "INSERT INTO workspaces (id, {column}) VALUES ($1, 1)
             ON CONFLICT (id) DO UPDATE SET {column} = workspaces.{column} + 1"
        ))
        .bind(workspace_id)
        .execute(&self.pool)
        .await
        .db()?;
        Ok(())
    }

    async fn workspace_stats(&self, workspace_id: Uuid) -> Result<WorkspaceStats> {
        let row: Option<(bool, i64, i64)> = sqlx::query_as(
            "SELECT is_blocked, executions_skipped, executions_queued FROM workspaces WHERE id = $1",
        )
        .bind(workspace_id)
        .fetch_optional(&self.pool)
        .await
        .db()?;
        let (is_blocked, skipped, queued) = row.unwrap_or((false, 0, 0));
        Ok(WorkspaceStats {
            workspace_id,
            is_blocked,
            executions_skipped: codec::to_u64(skipped),
            executions_queued: codec::to_u64(queued),
        })
    }

    async fn record_outcome(&self, target: TaskRef, success: bool) -> Result<OutcomeUpdate> {
        let table = owner_table(target);
        let mut tx = self.pool.begin().await.db()?;
        let previous: i32 = sqlx::query_scalar(&format!("SELECT consecutive_failures FROM {table} WHERE id = $1 FOR UPDATE"))
            .bind(target.id)
            .fetch_optional(&mut *tx)
            .await
            .db()?
            .ok_or_else(|| codec::not_found(target))?;
        let current = if success { 0 } else { previous.saturating_add(1) };
        sqlx::query(&format!("UPDATE {table} SET consecutive_failures = $2 WHERE id = $1"))
            .bind(target.id)
            .bind(current)
            .execute(&mut *tx)
            .await
            .db()?;
        tx.commit().await.db()?;
        Ok(OutcomeUpdate {
            previous_failures: to_u32(previous.into()),
            consecutive_failures: to_u32(current.into()),
        })
    }
}

impl PgStore {
    async fn overlap_row(&self, target: TaskRef) -> Result<OverlapRow> {
        let table = owner_table(target);
        sqlx::query_as::<_, OverlapRow>(&format!(
            "SELECT overlap_policy, max_instances, max_queue_size, execution_timeout, running_instances
             FROM {table} WHERE id = $1"
        ))
        .bind(target.id)
        .fetch_optional(&self.pool)
        .await
        .db()?
        .ok_or_else(|| codec::not_found(target))
    }
}

#[async_trait]
impl TenantGate for PgStore {
    async fn is_blocked(&self, workspace_id: Uuid) -> Result<bool> {
        let blocked: Option<bool> = sqlx::query_scalar("SELECT is_blocked FROM workspaces WHERE id = $1")
            .bind(workspace_id)
            .fetch_optional(&self.pool)
            .await
            .db()?;
        Ok(blocked.unwrap_or(false))
    }
}

// ─── ExecutionLog ──────────────────────────────────────

#[derive(sqlx::FromRow)]
struct TaskExecRow {
    id: Uuid,
    task_id: Uuid,
    kind: String,
    workspace_id: Uuid,
    status: String,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    status_code: Option<i32>,
    duration_ms: Option<i64>,
    response_body: Option<String>,
    error_message: Option<String>,
    error_type: Option<String>,
    retry_attempt: i32,
    worker_id: Option<Uuid>,
}

impl TryFrom<TaskExecRow> for TaskExecutionRecord {
    type Error = TaskClawError;

    fn try_from(row: TaskExecRow) -> Result<Self> {
        Ok(TaskExecutionRecord {
            id: row.id,
            task_id: row.task_id,
            kind: codec::kind(&row.kind)?,
            workspace_id: row.workspace_id,
            status: codec::execution_status(&row.status)?,
            started_at: row.started_at,
            finished_at: row.finished_at,
            status_code: row.status_code.and_then(|c| u16::try_from(c).ok()),
            duration_ms: row.duration_ms.map(codec::to_u64),
            response_body: row.response_body,
            error_message: row.error_message,
            error_type: row.error_type,
            retry_attempt: to_u32(row.retry_attempt.into()),
            worker_id: row.worker_id,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ChainExecRow {
    id: Uuid,
    chain_id: Uuid,
    workspace_id: Uuid,
    status: String,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    total_steps: i32,
    completed_steps: i32,
    failed_steps: i32,
    skipped_steps: i32,
    variables: Json<Variables>,
    skipped_reason: Option<String>,
    error_message: Option<String>,
    worker_id: Option<Uuid>,
}

impl TryFrom<ChainExecRow> for ChainExecutionRecord {
    type Error = TaskClawError;

    fn try_from(row: ChainExecRow) -> Result<Self> {
        Ok(ChainExecutionRecord {
            id: row.id,
            chain_id: row.chain_id,
            workspace_id: row.workspace_id,
            status: codec::chain_status(&row.status)?,
            started_at: row.started_at,
            finished_at: row.finished_at,
            total_steps: to_u32(row.total_steps.into()),
            completed_steps: to_u32(row.completed_steps.into()),
            failed_steps: to_u32(row.failed_steps.into()),
            skipped_steps: to_u32(row.skipped_steps.into()),
            variables: row.variables.0,
            skipped_reason: row.skipped_reason,
            error_message: row.error_message,
            worker_id: row.worker_id,
        })
    }
}

#[derive(sqlx::FromRow)]
struct StepExecRow {
    id: Uuid,
    chain_execution_id: Uuid,
    step_id: Uuid,
    step_order: i32,
    status: String,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    request_snapshot: Option<serde_json::Value>,
    response_snapshot: Option<serde_json::Value>,
    extracted_variables: Json<Variables>,
    condition_met: Option<bool>,
    retry_attempt: i32,
    duration_ms: Option<i64>,
    error_message: Option<String>,
    error_type: Option<String>,
}

impl TryFrom<StepExecRow> for StepExecutionRecord {
    type Error = TaskClawError;

    fn try_from(row: StepExecRow) -> Result<Self> {
        Ok(StepExecutionRecord {
            id: row.id,
            chain_execution_id: row.chain_execution_id,
            step_id: row.step_id,
            step_order: row.step_order,
            status: codec::step_status(&row.status)?,
            started_at: row.started_at,
            finished_at: row.finished_at,
            request_snapshot: row.request_snapshot,
            response_snapshot: row.response_snapshot,
            extracted_variables: row.extracted_variables.0,
            condition_met: row.condition_met,
            retry_attempt: to_u32(row.retry_attempt.into()),
            duration_ms: row.duration_ms.map(codec::to_u64),
            error_message: row.error_message,
            error_type: row.error_type,
        })
    }
}

#[async_trait]
impl ExecutionLog for PgStore {
    async fn insert_task_execution(&self, r: &TaskExecutionRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO task_executions
                (id, task_id, kind, workspace_id, status, started_at, finished_at, status_code,
                 duration_ms, response_body, error_message, error_type, retry_attempt, worker_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(r.id)
        .bind(r.task_id)
        .bind(r.kind.as_str())
        .bind(r.workspace_id)
        .bind(r.status.as_str())
        .bind(r.started_at)
        .bind(r.finished_at)
        .bind(r.status_code.map(i32::from))
        .bind(r.duration_ms.map(|d| d as i64))
        .bind(&r.response_body)
        .bind(&r.error_message)
        .bind(&r.error_type)
        .bind(to_i32(r.retry_attempt))
        .bind(r.worker_id)
        .execute(&self.pool)
        .await
        .db()?;
        Ok(())
    }

    async fn finish_task_execution(&self, r: &TaskExecutionRecord) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE task_executions
            SET status = $2, finished_at = $3, status_code = $4, duration_ms = $5,
                response_body = $6, error_message = $7, error_type = $8, retry_attempt = $9
            WHERE id = $1
            "#,
        )
        .bind(r.id)
        .bind(r.status.as_str())
        .bind(r.finished_at)
        .bind(r.status_code.map(i32::from))
        .bind(r.duration_ms.map(|d| d as i64))
        .bind(&r.response_body)
        .bind(&r.error_message)
        .bind(&r.error_type)
        .bind(to_i32(r.retry_attempt))
        .execute(&self.pool)
        .await
        .db()?;
        Ok(())
    }

    async fn get_task_execution(&self, id: Uuid) -> Result<Option<TaskExecutionRecord>> {
        sqlx::query_as::<_, TaskExecRow>(
            r#"
            SELECT id, task_id, kind, workspace_id, status, started_at, finished_at, status_code,
                   duration_ms, response_body, error_message, error_type, retry_attempt, worker_id
            FROM task_executions WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .db()?
        .map(TaskExecutionRecord::try_from)
        .transpose()
    }

    async fn insert_chain_execution(&self, r: &ChainExecutionRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO chain_executions
                (id, chain_id, workspace_id, status, started_at, finished_at, total_steps, completed_steps,
                 failed_steps, skipped_steps, variables, skipped_reason, error_message, worker_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(r.id)
        .bind(r.chain_id)
        .bind(r.workspace_id)
        .bind(r.status.as_str())
        .bind(r.started_at)
        .bind(r.finished_at)
        .bind(to_i32(r.total_steps))
        .bind(to_i32(r.completed_steps))
        .bind(to_i32(r.failed_steps))
        .bind(to_i32(r.skipped_steps))
        .bind(Json(&r.variables))
        .bind(&r.skipped_reason)
        .bind(&r.error_message)
        .bind(r.worker_id)
        .execute(&self.pool)
        .await
        .db()?;
        Ok(())
    }

    async fn finish_chain_execution(&self, r: &ChainExecutionRecord) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE chain_executions
            SET status = $2, finished_at = $3, total_steps = $4, completed_steps = $5, failed_steps = $6,
                skipped_steps = $7, variables = $8, skipped_reason = $9, error_message = $10
            WHERE id = $1
            "#,
        )
        .bind(r.id)
        .bind(r.status.as_str())
        .bind(r.finished_at)
        .bind(to_i32(r.total_steps))
        .bind(to_i32(r.completed_steps))
        .bind(to_i32(r.failed_steps))
        .bind(to_i32(r.skipped_steps))
        .bind(Json(&r.variables))
        .bind(&r.skipped_reason)
        .bind(&r.error_message)
        .execute(&self.pool)
        .await
        .db()?;
        Ok(())
    }

    async fn get_chain_execution(&self, id: Uuid) -> Result<Option<ChainExecutionRecord>> {
        sqlx::query_as::<_, ChainExecRow>(
            r#"
            SELECT id, chain_id, workspace_id, status, started_at, finished_at, total_steps, completed_steps,
                   failed_steps, skipped_steps, variables, skipped_reason, error_message, worker_id
            FROM chain_executions WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .db()?
        .map(ChainExecutionRecord::try_from)
        .transpose()
    }

    async fn insert_step_execution(&self, r: &StepExecutionRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO step_executions
                (id, chain_execution_id, step_id, step_order, status, started_at, finished_at,
                 request_snapshot, response_snapshot, extracted_variables, condition_met, retry_attempt,
                 duration_ms, error_message, error_type)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            "#,
        )
        .bind(r.id)
        .bind(r.chain_execution_id)
        .bind(r.step_id)
        .bind(r.step_order)
        .bind(r.status.as_str())
        .bind(r.started_at)
        .bind(r.finished_at)
        .bind(&r.request_snapshot)
        .bind(&r.response_snapshot)
        .bind(Json(&r.extracted_variables))
        .bind(r.condition_met)
        .bind(to_i32(r.retry_attempt))
        .bind(r.duration_ms.map(|d| d as i64))
        .bind(&r.error_message)
        .bind(&r.error_type)
        .execute(&self.pool)
        .await
        .db()?;
        Ok(())
    }

    async fn finish_step_execution(&self, r: &StepExecutionRecord) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE step_executions
            SET status = $2, finished_at = $3, request_snapshot = $4, response_snapshot = $5,
                extracted_variables = $6, condition_met = $7, retry_attempt = $8, duration_ms = $9,
                error_message = $10, error_type = $11
            WHERE id = $1
            "#,
        )
        .bind(r.id)
        .bind(r.status.as_str())
        .bind(r.finished_at)
        .bind(&r.request_snapshot)
        .bind(&r.response_snapshot)
        .bind(Json(&r.extracted_variables))
        .bind(r.condition_met)
        .bind(to_i32(r.retry_attempt))
        .bind(r.duration_ms.map(|d| d as i64))
        .bind(&r.error_message)
        .bind(&r.error_type)
        .execute(&self.pool)
        .await
        .db()?;
        Ok(())
    }

    async fn list_step_executions(&self, chain_execution_id: Uuid) -> Result<Vec<StepExecutionRecord>> {
        let rows = sqlx::query_as::<_, StepExecRow>(
            r#"
            SELECT id, chain_execution_id, step_id, step_order, status, started_at, finished_at,
                   request_snapshot, response_snapshot, extracted_variables, condition_met, retry_attempt,
                   duration_ms, error_message, error_type
            FROM step_executions WHERE chain_execution_id = $1
            ORDER BY step_order
            "#,
        )
        .bind(chain_execution_id)
        .fetch_all(&self.pool)
        .await
        .db()?;
        rows.into_iter().map(StepExecutionRecord::try_from).collect()
    }
}

// ─── WorkerQueue ──────────────────────────────────────

/// Durable pull queue so any replica can serve a worker's poll.
#[async_trait]
impl WorkerQueue for PgStore {
    async fn enqueue(&self, worker_id: Uuid, unit: &WorkUnit) -> Result<()> {
        sqlx::query(
            "INSERT INTO worker_units (id, worker_id, unit, enqueued_at, target_kind, target_id)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(unit.id)
        .bind(worker_id)
        .bind(Json(unit))
        .bind(unit.enqueued_at)
        .bind(unit.target.kind.as_str())
        .bind(unit.target.id)
        .execute(&self.pool)
        .await
        .db()?;
        Ok(())
    }

    async fn poll(&self, worker_id: Uuid, max: usize) -> Result<Vec<WorkUnit>> {
        let mut rows: Vec<(i64, Json<WorkUnit>)> = sqlx::query_as(
            r#"
            UPDATE worker_units SET polled_at = NOW()
            WHERE id IN (
                SELECT id FROM worker_units
                WHERE worker_id = $1 AND polled_at IS NULL
                ORDER BY seq
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            RETURNING seq, unit
            "#,
        )
        .bind(worker_id)
        .bind(i64::try_from(max).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .db()?;
        rows.sort_by_key(|(seq, _)| *seq);
        Ok(rows.into_iter().map(|(_, unit)| unit.0).collect())
    }

    async fn take(&self, worker_id: Uuid, unit_id: Uuid) -> Result<Option<WorkUnit>> {
        let unit: Option<Json<WorkUnit>> =
            sqlx::query_scalar("DELETE FROM worker_units WHERE id = $1 AND worker_id = $2 RETURNING unit")
                .bind(unit_id)
                .bind(worker_id)
                .fetch_optional(&self.pool)
                .await
                .db()?;
        Ok(unit.map(|u| u.0))
    }

    async fn drain_target(&self, target: TaskRef) -> Result<Vec<WorkUnit>> {
        let units: Vec<Json<WorkUnit>> =
            sqlx::query_scalar("DELETE FROM worker_units WHERE target_id = $1 AND target_kind = $2 RETURNING unit")
                .bind(target.id)
                .bind(target.kind.as_str())
                .fetch_all(&self.pool)
                .await
                .db()?;
        Ok(units.into_iter().map(|u| u.0).collect())
    }

    async fn pending(&self, worker_id: Uuid) -> Result<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM worker_units WHERE worker_id = $1 AND polled_at IS NULL")
            .bind(worker_id)
            .fetch_one(&self.pool)
            .await
            .db()?;
        Ok(usize::try_from(count).unwrap_or(0))
    }
}
