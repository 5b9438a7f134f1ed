//! HTTP server implementation using Axum.

use axum::{
    Router,
    extract::State,
    routing::{get, post},
};
use std::sync::Arc;
use taskclaw_core::config::GatewayConfig;
use taskclaw_core::traits::TaskStore;
use taskclaw_scheduler::SchedulerEngine;
use tokio::sync::watch;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Shared state for the gateway server.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<SchedulerEngine>,
    pub store: Arc<dyn TaskStore>,
    /// Expected `X-Worker-Token`; `None` leaves the API open.
    pub worker_token: Option<String>,
    pub start_time: std::time::Instant,
}

impl AppState {
    pub fn new(engine: Arc<SchedulerEngine>, config: &GatewayConfig) -> Self {
        Self {
            store: engine.store().clone(),
            engine,
            worker_token: config.worker_token.clone().filter(|t| !t.is_empty()),
            start_time: std::time::Instant::now(),
        }
    }
}

/// Worker token middleware: validates the X-Worker-Token header.
async fn require_worker_token(
    State(state): State<Arc<AppState>>,
    req: axum::http::Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> axum::response::Response {
    let Some(expected) = &state.worker_token else {
        return next.run(req).await;
    };

    let presented = req
        .headers()
        .get("X-Worker-Token")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if presented == expected {
        return next.run(req).await;
    }

    tracing::warn!("🔒 Rejected {} {}: bad worker token", req.method(), req.uri().path());
    super::routes::error_body(
        axum::http::StatusCode::UNAUTHORIZED,
        "unauthorized",
        "invalid or missing worker token",
    )
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    build_router_from_arc(Arc::new(state))
}

pub fn build_router_from_arc(shared: Arc<AppState>) -> Router {
    use super::routes;

    let protected = Router::new()
        .route("/api/v1/workers/{worker_id}/poll", get(routes::poll_units))
        .route(
            "/api/v1/workers/{worker_id}/units/{unit_id}/result",
            post(routes::report_result),
        )
        .route(
            "/api/v1/queues/{kind}/{id}",
            get(routes::queue_status).delete(routes::clear_queue),
        )
        .route("/api/v1/workspaces/{id}/stats", get(routes::workspace_stats))
        .route("/api/v1/chains/{id}/run", post(routes::run_chain))
        .route_layer(axum::middleware::from_fn_with_state(
            shared.clone(),
            require_worker_token,
        ));

    let public = Router::new().route("/health", get(routes::health_check));

    protected
        .merge(public)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any)),
        )
        .with_state(shared)
}

/// Serve until `shutdown` flips to true.
pub async fn start(
    config: &GatewayConfig,
    state: AppState,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("🌐 Gateway listening on http://{}", addr);
    if state.worker_token.is_none() {
        tracing::warn!("⚠️ No gateway.worker_token set, worker API is open");
    }

    let app = build_router(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            while !*shutdown.borrow() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
        })
        .await?;
    tracing::info!("🌐 Gateway stopped");
    Ok(())
}
