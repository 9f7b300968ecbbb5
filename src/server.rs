//! HTTP trigger and search surface.
//!
//! `filesync serve` runs this router alongside the [`Scheduler`] loop. The
//! router only starts work and reads results; runs themselves execute on
//! the scheduler's pool, so a request never waits on a sync pass.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check (returns version) |
//! | `POST` | `/scopes/{id}/sync` | Start a sync pass; `202` with the run id, `409` if one is in flight |
//! | `POST` | `/scopes/{id}/prune` | Start a prune; `202`, or `409` if one is in flight |
//! | `GET`  | `/search?q=&size=&scope=` | Ranked document results |
//! | `GET`  | `/stats` | Document, index, and per-scope counts |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "not_found", "message": "scope 'x' not found" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `conflict` (409),
//! `internal` (500).

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use filesync_core::search::SearchResponse;
use filesync_core::store::ScopeStore;

use crate::config::Config;
use crate::context::AppContext;
use crate::scheduler::Scheduler;
use crate::search::build_request;
use crate::stats::{self, Overview};

/// Shared state for every handler.
#[derive(Clone)]
pub struct AppState {
    ctx: Arc<AppContext>,
    scheduler: Arc<Scheduler>,
}

impl AppState {
    pub fn new(ctx: Arc<AppContext>, scheduler: Arc<Scheduler>) -> Self {
        Self { ctx, scheduler }
    }
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/scopes/{id}/sync", post(handle_sync))
        .route("/scopes/{id}/prune", post(handle_prune))
        .route("/search", get(handle_search))
        .route("/stats", get(handle_stats))
        .layer(cors)
        .with_state(state)
}

/// Serve the API and run the scheduler until Ctrl-C.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let ctx = Arc::new(AppContext::open(config).await?);
    let scheduler = Arc::new(Scheduler::new(
        ctx.orchestrator.clone(),
        config.scheduler.clone(),
    ));

    let (stop_tx, mut stop_rx) = tokio::sync::watch::channel(false);
    let scheduler_task = tokio::spawn(scheduler.clone().run_until(async move {
        let _ = stop_rx.changed().await;
    }));

    let app = router(AppState::new(ctx.clone(), scheduler));
    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    info!(bind = %config.server.bind, "listening");
    println!("filesync listening on http://{}", config.server.bind);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            let _ = stop_tx.send(true);
        })
        .await?;

    if let Err(e) = scheduler_task.await {
        warn!(error = %e, "scheduler task ended abnormally");
    }
    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl AppError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: "bad_request",
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            code: "not_found",
            message: message.into(),
        }
    }

    fn conflict(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::CONFLICT,
            code: "conflict",
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: "internal",
            message: message.into(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<filesync_core::SyncError> for AppError {
    fn from(e: filesync_core::SyncError) -> Self {
        Self::internal(e.to_string())
    }
}

impl From<anyhow::Error> for AppError {
    fn from(e: anyhow::Error) -> Self {
        Self::internal(e.to_string())
    }
}

async fn require_scope(state: &AppState, scope_id: &str) -> Result<(), AppError> {
    match state.ctx.store.get_scope(scope_id).await? {
        Some(_) => Ok(()),
        None => Err(AppError::not_found(format!("scope '{}' not found", scope_id))),
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

// ============ POST /scopes/{id}/sync ============

#[derive(Serialize)]
struct TriggerResponse {
    scope_id: String,
    run_id: Option<String>,
    status: &'static str,
}

async fn handle_sync(
    State(state): State<AppState>,
    Path(scope_id): Path<String>,
) -> Result<(StatusCode, Json<TriggerResponse>), AppError> {
    require_scope(&state, &scope_id).await?;
    match state.scheduler.trigger_sync(&scope_id).await? {
        Some((run, _)) => Ok((
            StatusCode::ACCEPTED,
            Json(TriggerResponse {
                scope_id,
                run_id: Some(run.id),
                status: run.status.as_str(),
            }),
        )),
        None => Err(AppError::conflict(format!(
            "a sync for scope '{}' is already in flight",
            scope_id
        ))),
    }
}

// ============ POST /scopes/{id}/prune ============

async fn handle_prune(
    State(state): State<AppState>,
    Path(scope_id): Path<String>,
) -> Result<(StatusCode, Json<TriggerResponse>), AppError> {
    require_scope(&state, &scope_id).await?;
    match state.scheduler.trigger_prune(&scope_id) {
        Some(_) => Ok((
            StatusCode::ACCEPTED,
            Json(TriggerResponse {
                scope_id,
                run_id: None,
                status: "ACCEPTED",
            }),
        )),
        None => Err(AppError::conflict(format!(
            "a prune for scope '{}' is already in flight",
            scope_id
        ))),
    }
}

// ============ GET /search ============

#[derive(Deserialize)]
struct SearchParams {
    q: Option<String>,
    size: Option<usize>,
    scope: Option<String>,
}

async fn handle_search(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> Result<Json<SearchResponse>, AppError> {
    let query = params.q.unwrap_or_default();
    if query.trim().is_empty() {
        return Err(AppError::bad_request("q must not be empty"));
    }
    if let Some(scope_id) = &params.scope {
        require_scope(&state, scope_id).await?;
    }
    let request = build_request(&state.ctx, &query, params.size, params.scope.as_deref()).await?;
    Ok(Json(state.ctx.index.search(&request).await?))
}

// ============ GET /stats ============

async fn handle_stats(State(state): State<AppState>) -> Result<Json<Overview>, AppError> {
    Ok(Json(stats::collect(&state.ctx).await?))
}
