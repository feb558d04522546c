//! Ingestion endpoints.

use axum::extract::{Path, Query, State};
use serde::{Deserialize, Serialize};

use crate::api::{ApiResult, AppState, Envelope};
use crate::error::PlatformError;
use crate::models::{
    format_trade_date, ExecutionStatus, GroupTriggerRequest, SyncRequest, TriggerType,
};

#[derive(Debug, Serialize)]
pub struct PluginView {
    pub name: String,
    pub table: String,
    pub role: &'static str,
    pub category: String,
    pub rate_limit_per_minute: u32,
    pub schedule_frequency: &'static str,
    pub schedule_time: String,
    pub schedule_enabled: bool,
    pub dependencies: Vec<String>,
    pub latest_date: Option<String>,
    pub missing_count: u64,
}

pub async fn list_plugins(State(state): State<AppState>) -> ApiResult<Vec<PluginView>> {
    let today = state.clock.now().date_naive();
    let window = state.config.missing_window_days;

    let mut views = Vec::new();
    for plugin in state.registry.list() {
        let date_col = plugin
            .schema
            .partition_key
            .as_deref()
            .unwrap_or("trade_date");
        let latest = state.ods.latest_date(&plugin.table, date_col)?;
        let missing_count = if plugin.has_date_param() {
            state.missing.missing_count(today, window, &plugin.name)?
        } else {
            0
        };
        views.push(PluginView {
            name: plugin.name.clone(),
            table: plugin.table.clone(),
            role: plugin.role.as_str(),
            category: plugin.category.clone(),
            rate_limit_per_minute: plugin.rate_limit_per_minute,
            schedule_frequency: plugin.schedule.frequency.as_str(),
            schedule_time: plugin.schedule.time.clone(),
            schedule_enabled: state.registry.effective_schedule_enabled(&plugin.name)?,
            dependencies: plugin.dependencies.clone(),
            latest_date: latest.map(format_trade_date),
            missing_count,
        });
    }
    Ok(Envelope::ok(views))
}

#[derive(Debug, Deserialize)]
pub struct ScheduleToggle {
    pub enabled: bool,
}

pub async fn set_schedule_enabled(
    State(state): State<AppState>,
    Path(name): Path<String>,
    axum::Json(body): axum::Json<ScheduleToggle>,
) -> ApiResult<serde_json::Value> {
    state
        .registry
        .set_schedule_enabled(&name, body.enabled, state.clock.now())?;
    Ok(Envelope::ok(
        serde_json::json!({"plugin": name, "schedule_enabled": body.enabled}),
    ))
}

#[derive(Debug, Serialize)]
pub struct TriggerAck {
    pub execution_id: String,
}

pub async fn sync(
    State(state): State<AppState>,
    axum::Json(body): axum::Json<SyncRequest>,
) -> ApiResult<TriggerAck> {
    let execution_id = state.scheduler.trigger_manual(body).await?;
    Ok(Envelope::ok(TriggerAck { execution_id }))
}

pub async fn trigger_group(
    State(state): State<AppState>,
    Path(group_id): Path<String>,
    axum::Json(body): axum::Json<GroupTriggerRequest>,
) -> ApiResult<TriggerAck> {
    let group = state
        .config
        .groups
        .get(&group_id)
        .ok_or_else(|| PlatformError::NotFound(format!("plugin group '{group_id}'")))?;
    let execution_id = state
        .scheduler
        .trigger_group(&group_id, group, &body)
        .await?;
    Ok(Envelope::ok(TriggerAck { execution_id }))
}

#[derive(Debug, Deserialize)]
pub struct ExecutionListQuery {
    pub status: Option<String>,
    pub trigger_type: Option<String>,
    pub limit: Option<usize>,
}

pub async fn list_executions(
    State(state): State<AppState>,
    Query(query): Query<ExecutionListQuery>,
) -> ApiResult<Vec<crate::models::BatchExecution>> {
    let status = match query.status.as_deref() {
        Some(raw) => Some(
            ExecutionStatus::parse(raw)
                .ok_or_else(|| PlatformError::State(format!("unknown status '{raw}'")))?,
        ),
        None => None,
    };
    let trigger_type = match query.trigger_type.as_deref() {
        Some(raw) => Some(
            TriggerType::parse(raw)
                .ok_or_else(|| PlatformError::State(format!("unknown trigger type '{raw}'")))?,
        ),
        None => None,
    };
    let executions =
        state
            .executions
            .list_executions(status, trigger_type, query.limit.unwrap_or(20))?;
    Ok(Envelope::ok(executions))
}

#[derive(Debug, Serialize)]
pub struct ExecutionDetail {
    #[serde(flatten)]
    pub execution: crate::models::BatchExecution,
    pub subtasks: Vec<crate::models::SubTask>,
}

pub async fn execution_detail(
    State(state): State<AppState>,
    Path(execution_id): Path<String>,
) -> ApiResult<ExecutionDetail> {
    let execution = state.executions.require_execution(&execution_id)?;
    let subtasks = state.executions.get_subtasks(&execution_id)?;
    Ok(Envelope::ok(ExecutionDetail {
        execution,
        subtasks,
    }))
}

pub async fn stop_execution(
    State(state): State<AppState>,
    Path(execution_id): Path<String>,
) -> ApiResult<serde_json::Value> {
    state.scheduler.stop(&execution_id).await?;
    Ok(Envelope::ok(serde_json::json!({"ok": true})))
}

#[derive(Debug, Deserialize)]
pub struct RetryQuery {
    /// "full" clones everything into a new execution; default is in-place
    /// retry of failed/cancelled sub-tasks.
    pub mode: Option<String>,
}

pub async fn retry_execution(
    State(state): State<AppState>,
    Path(execution_id): Path<String>,
    Query(query): Query<RetryQuery>,
) -> ApiResult<TriggerAck> {
    let full = query.mode.as_deref() == Some("full");
    let execution_id = state.scheduler.retry(&execution_id, full).await?;
    Ok(Envelope::ok(TriggerAck { execution_id }))
}

pub async fn delete_execution(
    State(state): State<AppState>,
    Path(execution_id): Path<String>,
) -> ApiResult<serde_json::Value> {
    state.scheduler.delete(&execution_id)?;
    Ok(Envelope::ok(serde_json::json!({"ok": true})))
}

#[derive(Debug, Deserialize)]
pub struct MissingQuery {
    pub window_days: Option<i64>,
    pub plugin: Option<String>,
}

pub async fn missing(
    State(state): State<AppState>,
    Query(query): Query<MissingQuery>,
) -> ApiResult<std::collections::BTreeMap<String, Vec<String>>> {
    let today = state.clock.now().date_naive();
    let window = query.window_days.unwrap_or(state.config.missing_window_days);
    let report = state
        .missing
        .scan(today, window, query.plugin.as_deref())?;
    let rendered = report
        .into_iter()
        .map(|(plugin, dates)| {
            (
                plugin,
                dates.into_iter().map(format_trade_date).collect(),
            )
        })
        .collect();
    Ok(Envelope::ok(rendered))
}
