//! HTTP surface.
//!
//! Every endpoint answers the `{code, message, data}` envelope; `code = 0`
//! means success and the documented error codes ride on matching HTTP
//! statuses. Long-running work never blocks a handler — triggers return an
//! execution id and progress is read back through the status endpoints.

pub mod arena;
pub mod datasource;

use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Serialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::arena::manager::ArenaManager;
use crate::clock::Clock;
use crate::config::Config;
use crate::error::{PlatformError, CODE_OK};
use crate::plugins::PluginRegistry;
use crate::scheduler::missing::MissingDataDetector;
use crate::scheduler::Scheduler;
use crate::store::execution::ExecutionStore;
use crate::store::ods::OdsStore;

/// Shared application state behind every handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: Arc<PluginRegistry>,
    pub scheduler: Scheduler,
    pub executions: Arc<ExecutionStore>,
    pub ods: Arc<OdsStore>,
    pub missing: Arc<MissingDataDetector>,
    pub arenas: ArenaManager,
    pub clock: Arc<dyn Clock>,
}

/// The response envelope.
#[derive(Debug, Serialize)]
pub struct Envelope<T: Serialize> {
    pub code: i32,
    pub message: String,
    pub data: Option<T>,
}

impl<T: Serialize> Envelope<T> {
    pub fn ok(data: T) -> Json<Self> {
        Json(Self {
            code: CODE_OK,
            message: "ok".to_string(),
            data: Some(data),
        })
    }
}

/// Handler-level error: a `PlatformError` rendered as the envelope with a
/// matching HTTP status.
pub struct ApiError(pub PlatformError);

impl<E: Into<PlatformError>> From<E> for ApiError {
    fn from(e: E) -> Self {
        Self(e.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let code = self.0.code();
        let status = match code {
            crate::error::CODE_INVALID_ARGS => StatusCode::BAD_REQUEST,
            crate::error::CODE_NOT_FOUND => StatusCode::NOT_FOUND,
            crate::error::CODE_UNAUTHORIZED => StatusCode::UNAUTHORIZED,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(Envelope::<serde_json::Value> {
            code,
            message: self.0.to_string(),
            data: None,
        });
        (status, body).into_response()
    }
}

pub type ApiResult<T> = std::result::Result<Json<Envelope<T>>, ApiError>;

pub fn router(state: AppState) -> Router {
    let api = Router::new()
        // Ingestion
        .route("/datasource/plugins", get(datasource::list_plugins))
        .route(
            "/datasource/plugins/:name/schedule",
            post(datasource::set_schedule_enabled),
        )
        .route("/datasource/sync", post(datasource::sync))
        .route(
            "/datasource/group/:group_id/trigger",
            post(datasource::trigger_group),
        )
        .route("/datasource/executions", get(datasource::list_executions))
        .route(
            "/datasource/executions/:execution_id",
            get(datasource::execution_detail).delete(datasource::delete_execution),
        )
        .route(
            "/datasource/executions/:execution_id/stop",
            post(datasource::stop_execution),
        )
        .route(
            "/datasource/executions/:execution_id/retry",
            post(datasource::retry_execution),
        )
        .route("/datasource/missing", get(datasource::missing))
        // Arena
        .route("/arena/create", post(arena::create))
        .route("/arena/:arena_id/start", post(arena::start))
        .route("/arena/:arena_id/pause", post(arena::pause))
        .route("/arena/:arena_id/resume", post(arena::resume))
        .route("/arena/:arena_id", delete(arena::delete))
        .route("/arena/:arena_id/status", get(arena::status))
        .route("/arena/:arena_id/strategies", get(arena::strategies))
        .route("/arena/:arena_id/leaderboard", get(arena::leaderboard))
        .route("/arena/:arena_id/evaluate", post(arena::evaluate))
        .route(
            "/arena/:arena_id/discussion/start",
            post(arena::start_discussion),
        )
        .route(
            "/arena/:arena_id/discussion/intervention",
            post(arena::intervention),
        )
        .route("/arena/:arena_id/thinking-stream", get(arena::thinking_stream));

    Router::new()
        .route("/health", get(health))
        .nest("/api", api)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> &'static str {
    "stockdata backend operational"
}
