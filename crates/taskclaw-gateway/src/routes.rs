//! API route handlers for the gateway.

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

use taskclaw_core::error::TaskClawError;
use taskclaw_core::types::{TaskKind, TaskRef, Variables, WorkerReport};
use taskclaw_scheduler::ChainRunOutcome;

use crate::server::AppState;

const DEFAULT_POLL_BATCH: usize = 10;
const MAX_POLL_BATCH: usize = 100;
const DEFAULT_QUEUE_PEEK: u32 = 20;

/// `{"ok": false, ...}` response with an explicit status.
pub(crate) fn error_body(status: StatusCode, kind: &str, message: &str) -> Response {
    (
        status,
        Json(serde_json::json!({"ok": false, "error": message, "kind": kind})),
    )
        .into_response()
}

/// Handler error mapped onto an HTTP status.
pub struct ApiError {
    status: StatusCode,
    kind: &'static str,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            kind: "bad_request",
            message: message.into(),
        }
    }
}

impl From<TaskClawError> for ApiError {
    fn from(e: TaskClawError) -> Self {
        let status = match &e {
            TaskClawError::NotFound(_) => StatusCode::NOT_FOUND,
            TaskClawError::AdmissionDenied(_) => StatusCode::CONFLICT,
            TaskClawError::InvalidSchedule(_)
            | TaskClawError::VariableSubstitution { .. }
            | TaskClawError::ConditionEvaluation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!("❌ Gateway request failed: {}", e);
        }
        Self {
            status,
            kind: e.kind(),
            message: e.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        error_body(self.status, self.kind, &self.message)
    }
}

type ApiResult = Result<Json<serde_json::Value>, ApiError>;

fn parse_target(kind: &str, id: Uuid) -> Result<TaskRef, ApiError> {
    TaskKind::parse(kind)
        .map(|kind| TaskRef::new(kind, id))
        .ok_or_else(|| ApiError::bad_request(format!("unknown task kind '{kind}'")))
}

/// Health check endpoint.
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": "taskclaw-gateway",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.start_time.elapsed().as_secs(),
        "in_flight": state.engine.dispatcher().in_flight(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct PollQuery {
    pub max: Option<usize>,
}

/// Hand a worker its next batch of units.
pub async fn poll_units(
    State(state): State<Arc<AppState>>,
    Path(worker_id): Path<Uuid>,
    Query(query): Query<PollQuery>,
) -> ApiResult {
    let max = query.max.unwrap_or(DEFAULT_POLL_BATCH).clamp(1, MAX_POLL_BATCH);
    let units = state.engine.dispatcher().poll(worker_id, max).await?;
    if !units.is_empty() {
        tracing::debug!("📤 Worker {} polled {} unit(s)", worker_id, units.len());
    }
    Ok(Json(serde_json::json!({"ok": true, "count": units.len(), "units": units})))
}

/// Accept a worker's result for a unit it polled.
pub async fn report_result(
    State(state): State<Arc<AppState>>,
    Path((worker_id, unit_id)): Path<(Uuid, Uuid)>,
    Json(report): Json<WorkerReport>,
) -> ApiResult {
    let success = report.is_success();
    let unit = state.engine.dispatcher().report_result(worker_id, unit_id, report).await?;
    Ok(Json(serde_json::json!({
        "ok": true,
        "unit_id": unit.id,
        "target": unit.target,
        "execution_id": unit.execution_id,
        "success": success,
    })))
}

#[derive(Debug, Deserialize)]
pub struct QueueQuery {
    pub limit: Option<u32>,
}

/// Running instances, depth and head of one target's queue.
pub async fn queue_status(
    State(state): State<Arc<AppState>>,
    Path((kind, id)): Path<(String, Uuid)>,
    Query(query): Query<QueueQuery>,
) -> ApiResult {
    let target = parse_target(&kind, id)?;
    let running = state.store.running_instances(target).await?;
    let depth = state.store.queue_depth(target).await?;
    let head = state
        .store
        .queue_head(target, query.limit.unwrap_or(DEFAULT_QUEUE_PEEK))
        .await?;
    Ok(Json(serde_json::json!({
        "ok": true,
        "target": target,
        "running_instances": running,
        "depth": depth,
        "head": head,
    })))
}

/// Drop every waiting entry for a target.
pub async fn clear_queue(
    State(state): State<Arc<AppState>>,
    Path((kind, id)): Path<(String, Uuid)>,
) -> ApiResult {
    let target = parse_target(&kind, id)?;
    let cleared = state.store.clear_queue(target).await?;
    tracing::info!("🧹 Cleared {} queued run(s) of {}", cleared, target);
    Ok(Json(serde_json::json!({"ok": true, "cleared": cleared})))
}

pub async fn workspace_stats(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> ApiResult {
    let stats = state.store.workspace_stats(id).await?;
    Ok(Json(serde_json::json!({"ok": true, "stats": stats})))
}

#[derive(Debug, Default, Deserialize)]
pub struct RunChainRequest {
    #[serde(default)]
    pub variables: Variables,
    #[serde(default)]
    pub priority: i32,
}

/// Run a chain now, subject to its overlap policy.
pub async fn run_chain(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(body): Json<RunChainRequest>,
) -> Result<Response, ApiError> {
    let outcome = state.engine.run_chain_now(id, body.variables, body.priority).await?;
    Ok(match outcome {
        ChainRunOutcome::Completed(execution) => {
            Json(serde_json::json!({"ok": true, "outcome": "completed", "execution": execution})).into_response()
        }
        ChainRunOutcome::Queued { position } => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({"ok": true, "outcome": "queued", "position": position})),
        )
            .into_response(),
        ChainRunOutcome::Denied(execution) => (
            StatusCode::CONFLICT,
            Json(serde_json::json!({
                "ok": false,
                "outcome": "denied",
                "error": execution.error_message,
                "execution": execution,
            })),
        )
            .into_response(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::build_router;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use chrono::Utc;
    use taskclaw_core::config::{GatewayConfig, SchedulerConfig};
    use taskclaw_core::traits::TaskStore;
    use taskclaw_core::types::{
        ChainDefinition, HttpRequest, OverlapPolicy, ProbeSettings, Protocol, StepResult, TaskDefinition,
    };
    use taskclaw_db::SqliteStore;
    use taskclaw_scheduler::{EngineServices, LogNotifier, MemoryWorkerQueue, SchedulerEngine, StepRunner};
    use tower::ServiceExt;

    struct AlwaysOk;

    #[async_trait]
    impl StepRunner for AlwaysOk {
        async fn run(&self, _protocol: &Protocol, _settings: &ProbeSettings) -> StepResult {
            StepResult {
                status_code: Some(200),
                body: r#"{"token":"abc"}"#.into(),
                duration_ms: 3,
                ..Default::default()
            }
        }
    }

    fn setup(token: Option<&str>) -> (Arc<SqliteStore>, AppState) {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let services = EngineServices {
            tasks: store.clone(),
            executions: store.clone(),
            tenants: store.clone(),
            workers: Arc::new(MemoryWorkerQueue::new()),
            runner: Arc::new(AlwaysOk),
            notifier: Arc::new(LogNotifier),
            record_body_limit: taskclaw_scheduler::DEFAULT_BODY_LIMIT,
        };
        let engine = Arc::new(SchedulerEngine::new(&SchedulerConfig::default(), 3, services));
        let config = GatewayConfig {
            worker_token: token.map(str::to_string),
            ..Default::default()
        };
        (store, AppState::new(engine, &config))
    }

    async fn call(state: &AppState, req: Request<Body>) -> (StatusCode, serde_json::Value) {
        let resp = build_router(state.clone()).oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn cron_task(name: &str) -> TaskDefinition {
        TaskDefinition::cron(
            Uuid::new_v4(),
            name,
            "* * * * *",
            Protocol::Http(HttpRequest::get(&format!("http://localhost/{name}"))),
        )
    }

    #[tokio::test]
    async fn test_health_check() {
        let (_, state) = setup(Some("s3cret"));
        let (status, json) = call(&state, get("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "ok");
        assert_eq!(json["in_flight"], 0);
    }

    #[tokio::test]
    async fn test_worker_token_required() {
        let (_, state) = setup(Some("s3cret"));
        let uri = format!("/api/v1/workspaces/{}/stats", Uuid::new_v4());

        let (status, json) = call(&state, get(&uri)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(json["ok"], false);

        let req = Request::builder()
            .uri(&uri)
            .header("X-Worker-Token", "s3cret")
            .body(Body::empty())
            .unwrap();
        let (status, json) = call(&state, req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["stats"]["executions_skipped"], 0);
    }

    #[tokio::test]
    async fn test_worker_poll_and_report() {
        let (store, state) = setup(None);
        let worker = Uuid::new_v4();
        let mut task = cron_task("remote");
        task.worker_id = Some(worker);
        task.next_run_at = Some(Utc::now() - chrono::Duration::seconds(1));
        store.save_task(&task).await.unwrap();

        let report = state.engine.tick().await.unwrap();
        assert_eq!(report.dispatched, 1);
        assert_eq!(store.running_instances(task.task_ref()).await.unwrap(), 1);

        let (status, json) = call(&state, get(&format!("/api/v1/workers/{worker}/poll?max=5"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["count"], 1);
        let unit_id = json["units"][0]["id"].as_str().unwrap().to_string();

        let body = serde_json::json!({"status_code": 200, "duration_ms": 12});
        let other = Uuid::new_v4();
        let (status, _) = call(
            &state,
            post_json(&format!("/api/v1/workers/{other}/units/{unit_id}/result"), body.clone()),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(store.running_instances(task.task_ref()).await.unwrap(), 1);

        let uri = format!("/api/v1/workers/{worker}/units/{unit_id}/result");
        let (status, json) = call(&state, post_json(&uri, body.clone())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["success"], true);
        assert_eq!(store.running_instances(task.task_ref()).await.unwrap(), 0);

        let (status, json) = call(&state, post_json(&uri, body)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json["kind"], "not_found");
    }

    #[tokio::test]
    async fn test_queue_inspect_and_clear() {
        let (store, state) = setup(None);
        let mut task = cron_task("queued");
        task.overlap.policy = OverlapPolicy::Queue;
        task.overlap.max_instances = 1;
        task.overlap.max_queue_size = 5;
        store.save_task(&task).await.unwrap();

        let guard = state.engine.dispatcher().guard();
        let vars = Variables::new();
        guard.admit(task.task_ref(), task.workspace_id, 0, &vars).await.unwrap();
        guard.admit(task.task_ref(), task.workspace_id, 5, &vars).await.unwrap();

        let uri = format!("/api/v1/queues/cron/{}", task.id);
        let (status, json) = call(&state, get(&uri)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["running_instances"], 1);
        assert_eq!(json["depth"], 1);
        assert_eq!(json["head"][0]["priority"], 5);

        let req = Request::builder().method("DELETE").uri(&uri).body(Body::empty()).unwrap();
        let (_, json) = call(&state, req).await;
        assert_eq!(json["cleared"], 1);
        assert_eq!(store.queue_depth(task.task_ref()).await.unwrap(), 0);

        let (status, _) = call(&state, get(&format!("/api/v1/queues/bogus/{}", task.id))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_run_chain_now() {
        let (store, state) = setup(None);
        let mut chain = ChainDefinition::new(Uuid::new_v4(), "login-flow");
        chain.push_step("login", HttpRequest::get("http://localhost/login"));
        store.save_chain(&chain).await.unwrap();

        let uri = format!("/api/v1/chains/{}/run", chain.id);
        let body = serde_json::json!({"variables": {"user": "ops"}, "priority": 1});
        let (status, json) = call(&state, post_json(&uri, body)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["outcome"], "completed");
        assert_eq!(json["execution"]["status"], "success");
        assert_eq!(json["execution"]["completed_steps"], 1);

        let missing = format!("/api/v1/chains/{}/run", Uuid::new_v4());
        let (status, _) = call(&state, post_json(&missing, serde_json::json!({}))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
