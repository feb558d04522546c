//! Router-level tests: envelope shape, error codes, and endpoint wiring.

mod common;

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use common::{test_plugin, Harness, MockProvider};
use serde_json::{json, Value};
use tower::ServiceExt;

use stockdata_backend::api::{router, AppState};
use stockdata_backend::arena::competition::CompetitionEngine;
use stockdata_backend::arena::llm::ScriptedLlm;
use stockdata_backend::arena::manager::{ArenaManager, EvaluatorPeriods};
use stockdata_backend::arena::repo::ArenaRepo;
use stockdata_backend::arena::stream::StreamProcessor;
use stockdata_backend::clock::Clock;
use stockdata_backend::config::{Config, PluginGroup};
use stockdata_backend::models::TaskType;
use stockdata_backend::scheduler::calendar::TradingCalendar;
use stockdata_backend::scheduler::missing::MissingDataDetector;

fn test_config() -> Config {
    let mut groups = HashMap::new();
    groups.insert(
        "pair".to_string(),
        PluginGroup {
            plugins: vec!["bar".to_string()],
            task_type: TaskType::Incremental,
            description: "test pair".to_string(),
        },
    );
    Config {
        database_path: ":memory:".to_string(),
        port: 0,
        provider_base_url: "http://localhost:1".to_string(),
        provider_token: String::new(),
        extract_timeout_secs: 30,
        rate_limited_retry_budget: 3,
        worker_concurrency: 3,
        inner_concurrency_cap: 4,
        retention_days: 30,
        missing_window_days: 30,
        tz_offset_hours: 8,
        llm_base_url: "http://localhost:1".to_string(),
        llm_api_key: None,
        llm_model: "test".to_string(),
        evaluator_daily_secs: 86_400,
        evaluator_weekly_secs: 7 * 86_400,
        evaluator_monthly_secs: 30 * 86_400,
        groups,
    }
}

fn app() -> (axum::Router, Harness) {
    let provider = Arc::new(MockProvider::new(5));
    let harness = Harness::new(vec![test_plugin("bar", 600, vec![])], provider);
    let clock: Arc<dyn Clock> = harness.clock.clone();

    let registry = harness.registry.clone();
    let calendar = Arc::new(TradingCalendar::new(harness.db.clone()));
    let missing = Arc::new(MissingDataDetector::new(
        registry.clone(),
        calendar,
        harness.ods.clone(),
    ));

    let repo = Arc::new(ArenaRepo::new(harness.db.clone()));
    let stream = Arc::new(StreamProcessor::new(repo.clone(), clock.clone()));
    let arenas = ArenaManager::new(
        repo,
        stream,
        Arc::new(ScriptedLlm::new(vec![])),
        CompetitionEngine::new(harness.ods.clone(), clock.clone()),
        clock.clone(),
        EvaluatorPeriods::default(),
    );

    let state = AppState {
        config: Arc::new(test_config()),
        registry,
        scheduler: harness.scheduler.clone(),
        executions: harness.executions.clone(),
        ods: harness.ods.clone(),
        missing,
        arenas,
        clock,
    };
    (router(state), harness)
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn health_and_plugin_listing() {
    let (app, _harness) = app();

    let response = app.clone().oneshot(get("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app.oneshot(get("/api/datasource/plugins")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["code"], 0);
    assert_eq!(body["message"], "ok");
    let plugins = body["data"].as_array().unwrap();
    assert_eq!(plugins.len(), 1);
    assert_eq!(plugins[0]["name"], "bar");
    assert_eq!(plugins[0]["schedule_enabled"], true);
    assert_eq!(plugins[0]["role"], "primary");
}

#[tokio::test]
async fn unknown_plugin_sync_is_40002() {
    let (app, _harness) = app();
    let response = app
        .oneshot(post_json(
            "/api/datasource/sync",
            json!({"plugin_name": "ghost", "task_type": "incremental"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = body_json(response).await;
    assert_eq!(body["code"], 40002);
    assert!(body["data"].is_null());
}

#[tokio::test]
async fn sync_roundtrip_and_execution_detail() {
    let (app, harness) = app();

    let response = app
        .clone()
        .oneshot(post_json(
            "/api/datasource/sync",
            json!({
                "plugin_name": "bar",
                "task_type": "backfill",
                "trade_dates": ["20260109"],
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["code"], 0);
    let execution_id = body["data"]["execution_id"].as_str().unwrap().to_string();

    harness
        .wait_terminal(&execution_id, std::time::Duration::from_secs(20))
        .await;

    let response = app
        .clone()
        .oneshot(get(&format!("/api/datasource/executions/{execution_id}")))
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["data"]["status"], "completed");
    assert_eq!(body["data"]["subtasks"].as_array().unwrap().len(), 1);

    // History listing with filters.
    let response = app
        .clone()
        .oneshot(get("/api/datasource/executions?status=completed&limit=5"))
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["data"].as_array().unwrap().len(), 1);

    let response = app
        .oneshot(get("/api/datasource/executions?status=bogus"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["code"], 40001);
}

#[tokio::test]
async fn group_trigger_unknown_group_is_40002() {
    let (app, _harness) = app();
    let response = app
        .oneshot(post_json("/api/datasource/group/ghost/trigger", json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn schedule_override_toggles() {
    let (app, _harness) = app();
    let response = app
        .clone()
        .oneshot(post_json(
            "/api/datasource/plugins/bar/schedule",
            json!({"enabled": false}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .clone()
        .oneshot(get("/api/datasource/plugins"))
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["data"][0]["schedule_enabled"], false);

    let response = app
        .oneshot(post_json(
            "/api/datasource/plugins/ghost/schedule",
            json!({"enabled": true}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn arena_create_validation_and_lifecycle() {
    let (app, _harness) = app();

    // agent_count out of bounds -> 40001.
    let response = app
        .clone()
        .oneshot(post_json(
            "/api/arena/create",
            json!({"name": "tiny", "config": {"agent_count": 2}}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["code"], 40001);

    let response = app
        .clone()
        .oneshot(post_json("/api/arena/create", json!({"name": "alpha"})))
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["code"], 0);
    let arena_id = body["data"]["arena_id"].as_str().unwrap().to_string();
    assert_eq!(body["data"]["state"], "created");

    // Pause before start is an invalid transition.
    let response = app
        .clone()
        .oneshot(post_json(&format!("/api/arena/{arena_id}/pause"), json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app
        .clone()
        .oneshot(post_json(&format!("/api/arena/{arena_id}/start"), json!({})))
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["code"], 0);

    let response = app
        .clone()
        .oneshot(get(&format!("/api/arena/{arena_id}/status")))
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["data"]["arena_id"], arena_id.as_str());

    let response = app
        .clone()
        .oneshot(post_json(
            &format!("/api/arena/{arena_id}/evaluate"),
            json!({"period": "hourly"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri(format!("/api/arena/{arena_id}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["code"], 0);
}
