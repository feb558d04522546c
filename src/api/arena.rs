//! Arena endpoints, including the SSE thinking stream.

use std::convert::Infallible;

use axum::extract::{Path, Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use futures_util::stream::Stream;
use futures_util::StreamExt;
use serde::Deserialize;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;

use crate::api::{ApiResult, AppState, Envelope};
use crate::arena::manager::ArenaStatus;
use crate::arena::{ArenaConfig, EvalPeriod, Strategy};
use crate::error::PlatformError;

#[derive(Debug, Deserialize)]
pub struct CreateRequest {
    pub name: String,
    #[serde(default)]
    pub config: Option<ArenaConfig>,
}

pub async fn create(
    State(state): State<AppState>,
    axum::Json(body): axum::Json<CreateRequest>,
) -> ApiResult<ArenaStatus> {
    let config = body.config.unwrap_or_default();
    let status = state.arenas.create(&body.name, config)?;
    Ok(Envelope::ok(status))
}

pub async fn start(
    State(state): State<AppState>,
    Path(arena_id): Path<String>,
) -> ApiResult<serde_json::Value> {
    state.arenas.start(&arena_id).await?;
    Ok(Envelope::ok(serde_json::json!({"ok": true})))
}

pub async fn pause(
    State(state): State<AppState>,
    Path(arena_id): Path<String>,
) -> ApiResult<serde_json::Value> {
    state.arenas.pause(&arena_id).await?;
    Ok(Envelope::ok(serde_json::json!({"ok": true})))
}

pub async fn resume(
    State(state): State<AppState>,
    Path(arena_id): Path<String>,
) -> ApiResult<serde_json::Value> {
    state.arenas.resume(&arena_id).await?;
    Ok(Envelope::ok(serde_json::json!({"ok": true})))
}

pub async fn delete(
    State(state): State<AppState>,
    Path(arena_id): Path<String>,
) -> ApiResult<serde_json::Value> {
    state.arenas.delete(&arena_id).await?;
    Ok(Envelope::ok(serde_json::json!({"ok": true})))
}

pub async fn status(
    State(state): State<AppState>,
    Path(arena_id): Path<String>,
) -> ApiResult<ArenaStatus> {
    Ok(Envelope::ok(state.arenas.status(&arena_id).await?))
}

#[derive(Debug, Deserialize)]
pub struct StrategiesQuery {
    #[serde(default)]
    pub active_only: bool,
}

pub async fn strategies(
    State(state): State<AppState>,
    Path(arena_id): Path<String>,
    Query(query): Query<StrategiesQuery>,
) -> ApiResult<Vec<Strategy>> {
    let strategies = state
        .arenas
        .strategies(&arena_id, query.active_only)
        .await?;
    Ok(Envelope::ok(strategies))
}

pub async fn leaderboard(
    State(state): State<AppState>,
    Path(arena_id): Path<String>,
) -> ApiResult<Vec<Strategy>> {
    Ok(Envelope::ok(state.arenas.leaderboard(&arena_id).await?))
}

#[derive(Debug, Deserialize)]
pub struct EvaluateRequest {
    pub period: String,
}

pub async fn evaluate(
    State(state): State<AppState>,
    Path(arena_id): Path<String>,
    axum::Json(body): axum::Json<EvaluateRequest>,
) -> ApiResult<crate::arena::evaluator::EvaluationOutcome> {
    let period = EvalPeriod::parse(&body.period)
        .ok_or_else(|| PlatformError::State(format!("unknown period '{}'", body.period)))?;
    let outcome = state.arenas.evaluate(&arena_id, period).await?;
    Ok(Envelope::ok(outcome))
}

pub async fn start_discussion(
    State(state): State<AppState>,
    Path(arena_id): Path<String>,
) -> ApiResult<serde_json::Value> {
    let round = state.arenas.start_discussion(&arena_id).await?;
    Ok(Envelope::ok(serde_json::json!({"round_number": round})))
}

/// Human intervention controls, discriminated by `action`.
#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum InterventionRequest {
    Inject {
        content: String,
    },
    AdjustScore {
        strategy_id: String,
        delta: f64,
    },
    Eliminate {
        strategy_id: String,
        #[serde(default)]
        reason: Option<String>,
    },
}

pub async fn intervention(
    State(state): State<AppState>,
    Path(arena_id): Path<String>,
    axum::Json(body): axum::Json<InterventionRequest>,
) -> ApiResult<serde_json::Value> {
    match body {
        InterventionRequest::Inject { content } => {
            state.arenas.inject_message(&arena_id, &content).await?;
            Ok(Envelope::ok(serde_json::json!({"ok": true})))
        }
        InterventionRequest::AdjustScore { strategy_id, delta } => {
            let score = state
                .arenas
                .adjust_score(&arena_id, &strategy_id, delta)
                .await?;
            Ok(Envelope::ok(
                serde_json::json!({"strategy_id": strategy_id, "current_score": score}),
            ))
        }
        InterventionRequest::Eliminate {
            strategy_id,
            reason,
        } => {
            state
                .arenas
                .eliminate_strategy(&arena_id, &strategy_id, reason.as_deref())
                .await?;
            Ok(Envelope::ok(serde_json::json!({"strategy_id": strategy_id, "is_active": false})))
        }
    }
}

fn done_event() -> Event {
    Event::default().data(r#"{"type":"done"}"#)
}

/// Live SSE stream of an arena's thinking messages: one message per event,
/// `data: <json>\n\n` framing, terminated by a `done` event. A subscriber
/// that lags past the channel capacity is dropped after the overflow is
/// recorded.
pub async fn thinking_stream(
    State(state): State<AppState>,
    Path(arena_id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, crate::api::ApiError> {
    let rx = state.arenas.subscribe_stream(&arena_id)?;
    let processor = state.arenas.stream();

    let stream = futures_util::stream::unfold(
        Some(BroadcastStream::new(rx)),
        move |rx| {
            let processor = processor.clone();
            let arena_id = arena_id.clone();
            async move {
                let mut rx = rx?;
                match rx.next().await {
                    Some(Ok(msg)) => {
                        let payload =
                            serde_json::to_string(&msg).unwrap_or_else(|_| "{}".to_string());
                        Some((Ok(Event::default().data(payload)), Some(rx)))
                    }
                    Some(Err(BroadcastStreamRecvError::Lagged(skipped))) => {
                        processor.note_subscriber_overflow(&arena_id, skipped);
                        Some((Ok(done_event()), None))
                    }
                    // Channel closed: the arena was deleted.
                    None => Some((Ok(done_event()), None)),
                }
            }
        },
    );

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
