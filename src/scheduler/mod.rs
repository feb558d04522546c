//! Ingestion scheduler.
//!
//! Turns triggers (cron, manual, group, retry) into one `BatchExecution`
//! decomposed into `SubTask`s, and drives them through a bounded worker
//! pool. Dependency order is honored per trade date, the rate governor
//! gates every provider call, and cancellation is cooperative at batch
//! boundaries.

pub mod calendar;
pub mod missing;
pub mod rate;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{Datelike, NaiveDate, Timelike};
use futures_util::stream::{FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::PluginGroup;
use crate::error::{PlatformError, Result};
use crate::models::{
    format_trade_date, parse_trade_date, BatchExecution, ExecutionStatus, GroupTriggerRequest,
    SubTask, SubTaskStatus, SyncRequest, TaskType, TriggerType,
};
use crate::plugins::{ExtractParams, Plugin, PluginRegistry, ScheduleFrequency};
use crate::provider::session::ProviderSession;
use crate::provider::ProviderClient;
use crate::scheduler::calendar::TradingCalendar;
use crate::scheduler::rate::RateGovernor;
use crate::store::execution::ExecutionStore;
use crate::store::ods::OdsStore;
use crate::store::schema_sync::SchemaSynchronizer;

const CRON_TICK_SECS: u64 = 30;
const RETENTION_SWEEP_SECS: u64 = 6 * 3600;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub worker_concurrency: usize,
    pub inner_concurrency_cap: usize,
    pub extract_timeout_secs: u64,
    pub rate_limited_retry_budget: u32,
    pub retention_days: i64,
    pub tz_offset_hours: i64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_concurrency: 3,
            inner_concurrency_cap: 4,
            extract_timeout_secs: 30,
            rate_limited_retry_budget: 3,
            retention_days: 30,
            tz_offset_hours: 8,
        }
    }
}

struct ActiveRun {
    cancel: CancellationToken,
}

struct Inner {
    registry: Arc<PluginRegistry>,
    governor: Arc<RateGovernor>,
    provider: Arc<dyn ProviderClient>,
    executions: Arc<ExecutionStore>,
    ods: Arc<OdsStore>,
    schema: Arc<SchemaSynchronizer>,
    calendar: Arc<TradingCalendar>,
    clock: Arc<dyn Clock>,
    config: SchedulerConfig,
    workers: Arc<Semaphore>,
    active: Mutex<HashMap<String, ActiveRun>>,
}

#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

struct PluginRequest {
    plugin: Arc<Plugin>,
    task_type: TaskType,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<PluginRegistry>,
        governor: Arc<RateGovernor>,
        provider: Arc<dyn ProviderClient>,
        executions: Arc<ExecutionStore>,
        ods: Arc<OdsStore>,
        schema: Arc<SchemaSynchronizer>,
        calendar: Arc<TradingCalendar>,
        clock: Arc<dyn Clock>,
        config: SchedulerConfig,
    ) -> Self {
        for plugin in registry.list() {
            governor.register(&plugin.name, plugin.rate_limit_per_minute);
        }
        let workers = Arc::new(Semaphore::new(config.worker_concurrency.max(1)));
        Self {
            inner: Arc::new(Inner {
                registry,
                governor,
                provider,
                executions,
                ods,
                schema,
                calendar,
                clock,
                config,
                workers,
                active: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Startup recovery for executions a previous process left running.
    pub fn recover_interrupted(&self) -> Result<u32> {
        self.inner.executions.mark_interrupted(self.inner.clock.now())
    }

    pub fn is_running(&self, execution_id: &str) -> bool {
        self.inner.active.lock().contains_key(execution_id)
    }

    // ---- triggers -------------------------------------------------------

    pub async fn trigger_manual(&self, req: SyncRequest) -> Result<String> {
        let plugin = self.inner.registry.get(&req.plugin_name)?;
        let dates = self.resolve_dates(&plugin, req.task_type, req.trade_dates.as_deref())?;
        self.submit(
            TriggerType::Manual,
            None,
            vec![PluginRequest {
                plugin,
                task_type: req.task_type,
            }],
            dates,
            req.force_overwrite,
        )
        .await
    }

    pub async fn trigger_group(
        &self,
        group_name: &str,
        group: &PluginGroup,
        req: &GroupTriggerRequest,
    ) -> Result<String> {
        let task_type = req.task_type.unwrap_or(group.task_type);
        let mut requests = Vec::new();
        for name in &group.plugins {
            let plugin = self.inner.registry.get(name)?;
            // Effectively disabled plugins are excluded from group runs but
            // stay manually invokable.
            if !self.inner.registry.effective_schedule_enabled(name)? {
                info!(plugin = %name, group = group_name, "skipping disabled plugin in group");
                continue;
            }
            requests.push(PluginRequest { plugin, task_type });
        }
        if requests.is_empty() {
            return Err(PlatformError::State(format!(
                "group '{group_name}' has no enabled plugins"
            )));
        }

        let dates = match requests
            .iter()
            .find(|r| r.plugin.has_date_param())
            .map(|r| r.plugin.clone())
        {
            Some(plugin) => self.resolve_dates(&plugin, task_type, req.trade_dates.as_deref())?,
            None => None,
        };
        self.submit(
            TriggerType::Group,
            Some(group_name.to_string()),
            requests,
            dates,
            req.force_overwrite,
        )
        .await
    }

    /// Cron entry: incremental run over the given plugins.
    async fn trigger_scheduled(&self, plugins: Vec<Arc<Plugin>>) -> Result<String> {
        let requests: Vec<PluginRequest> = plugins
            .into_iter()
            .map(|plugin| PluginRequest {
                plugin,
                task_type: TaskType::Incremental,
            })
            .collect();
        let dates = match requests.iter().find(|r| r.plugin.has_date_param()) {
            Some(r) => self.resolve_dates(&r.plugin, TaskType::Incremental, None)?,
            None => None,
        };
        self.submit(TriggerType::Scheduled, None, requests, dates, false)
            .await
    }

    fn today_local(&self) -> NaiveDate {
        (self.inner.clock.now() + chrono::Duration::hours(self.inner.config.tz_offset_hours))
            .date_naive()
    }

    fn resolve_dates(
        &self,
        plugin: &Plugin,
        task_type: TaskType,
        requested: Option<&[String]>,
    ) -> Result<Option<Vec<NaiveDate>>> {
        if !plugin.has_date_param() {
            return Ok(None);
        }
        match task_type {
            TaskType::Incremental => {
                let latest = self
                    .inner
                    .calendar
                    .latest_trading_day(self.today_local())?
                    .ok_or_else(|| {
                        PlatformError::State("no trading day in the last 30 days".to_string())
                    })?;
                Ok(Some(vec![latest]))
            }
            TaskType::Backfill => {
                let requested = requested.ok_or_else(|| {
                    PlatformError::State("backfill requires trade_dates".to_string())
                })?;
                let mut dates = Vec::new();
                for raw in requested {
                    let date = parse_trade_date(raw).ok_or_else(|| {
                        PlatformError::State(format!("invalid trade date '{raw}'"))
                    })?;
                    if self.inner.calendar.is_trading_day(date)? {
                        dates.push(date);
                    }
                }
                if dates.is_empty() {
                    return Err(PlatformError::State(
                        "no trading days in requested backfill range".to_string(),
                    ));
                }
                dates.sort_unstable();
                dates.dedup();
                Ok(Some(dates))
            }
            // Full fans dates out inside one sub-task.
            TaskType::Full => Ok(None),
        }
    }

    async fn submit(
        &self,
        trigger_type: TriggerType,
        group_name: Option<String>,
        requests: Vec<PluginRequest>,
        dates: Option<Vec<NaiveDate>>,
        force_overwrite: bool,
    ) -> Result<String> {
        let execution_id = Uuid::new_v4().to_string();
        let now = self.inner.clock.now();

        let mut subtasks = Vec::new();
        for req in &requests {
            let make_task = |parameters: serde_json::Value| SubTask {
                task_id: Uuid::new_v4().to_string(),
                execution_id: execution_id.clone(),
                plugin_name: req.plugin.name.clone(),
                task_type: req.task_type,
                parameters,
                status: SubTaskStatus::Pending,
                progress: 0,
                records_processed: 0,
                records_failed: 0,
                started_at: None,
                completed_at: None,
                error_message: None,
            };

            match (&dates, req.plugin.has_date_param(), req.task_type) {
                (Some(dates), true, TaskType::Incremental | TaskType::Backfill) => {
                    for date in dates {
                        subtasks.push(make_task(json!({
                            "trade_date": format_trade_date(*date),
                            "force_overwrite": force_overwrite,
                        })));
                    }
                }
                _ => {
                    subtasks.push(make_task(json!({
                        "force_overwrite": force_overwrite,
                    })));
                }
            }
        }

        let date_range = dates.as_ref().and_then(|d| {
            let first = d.first()?;
            let last = d.last()?;
            Some(format!(
                "{}-{}",
                format_trade_date(*first),
                format_trade_date(*last)
            ))
        });

        let empty = subtasks.is_empty();
        let execution = BatchExecution {
            execution_id: execution_id.clone(),
            trigger_type,
            group_name,
            date_range,
            status: if empty {
                ExecutionStatus::Skipped
            } else {
                ExecutionStatus::Pending
            },
            started_at: now,
            completed_at: empty.then_some(now),
            total_plugins: subtasks.len() as u32,
            completed_plugins: 0,
            failed_plugins: 0,
            cancelled_plugins: 0,
            skipped_plugins: 0,
            error_summary: None,
            can_retry: false,
            version: 0,
        };
        self.inner.executions.create_execution(&execution, &subtasks)?;

        if !empty {
            self.spawn_driver(&execution_id);
        }
        Ok(execution_id)
    }

    fn spawn_driver(&self, execution_id: &str) {
        let cancel = CancellationToken::new();
        self.inner.active.lock().insert(
            execution_id.to_string(),
            ActiveRun {
                cancel: cancel.clone(),
            },
        );
        let inner = self.inner.clone();
        let execution_id = execution_id.to_string();
        tokio::spawn(async move {
            if let Err(e) = drive_execution(inner.clone(), &execution_id, cancel).await {
                error!(execution = %execution_id, error = %e, "execution driver failed");
                let _ = inner.executions.cas_update_execution(&execution_id, |exec| {
                    exec.status = ExecutionStatus::Failed;
                    exec.completed_at = Some(inner.clock.now());
                    exec.error_summary = Some(format!("driver error: {e}"));
                    exec.can_retry = true;
                });
            }
            inner.active.lock().remove(&execution_id);
        });
    }

    // ---- control --------------------------------------------------------

    /// Request a stop: pending sub-tasks cancel immediately, in-flight ones
    /// exit at the next batch boundary.
    pub async fn stop(&self, execution_id: &str) -> Result<()> {
        let exec = self.inner.executions.require_execution(execution_id)?;
        if exec.status.is_terminal() {
            return Err(PlatformError::State(format!(
                "execution '{execution_id}' already {}",
                exec.status.as_str()
            )));
        }
        self.inner
            .executions
            .cas_update_execution(execution_id, |e| e.status = ExecutionStatus::Stopping)?;

        let cancel = self
            .inner
            .active
            .lock()
            .get(execution_id)
            .map(|run| run.cancel.clone());
        match cancel {
            Some(token) => token.cancel(),
            None => {
                // No live driver for this execution (crash recovery edge):
                // cancel its open sub-tasks and finalize directly.
                let now = self.inner.clock.now();
                for task in self.inner.executions.get_subtasks(execution_id)? {
                    if !task.status.is_terminal() {
                        let mut cancelled = task;
                        cancelled.status = SubTaskStatus::Cancelled;
                        cancelled.completed_at = Some(now);
                        cancelled.error_message = Some("stopped by user".to_string());
                        self.inner.executions.update_subtask(&cancelled)?;
                    }
                }
                self.inner.executions.recompute_counters(execution_id)?;
                self.inner.executions.cas_update_execution(execution_id, |e| {
                    e.status = ExecutionStatus::Stopped;
                    e.completed_at = Some(now);
                    e.can_retry = true;
                })?;
            }
        }
        info!(execution = execution_id, "stop requested");
        Ok(())
    }

    /// In-place partial retry (`full = false`): requeue only the
    /// failed/cancelled children inside the original execution. Full retry
    /// clones every sub-task into a brand new execution.
    pub async fn retry(&self, execution_id: &str, full: bool) -> Result<String> {
        let exec = self.inner.executions.require_execution(execution_id)?;
        if !exec.status.is_terminal() {
            return Err(PlatformError::State(format!(
                "execution '{execution_id}' is still {}",
                exec.status.as_str()
            )));
        }
        let subtasks = self.inner.executions.get_subtasks(execution_id)?;

        if full {
            let mut requests = Vec::new();
            let mut dates: Vec<NaiveDate> = Vec::new();
            let mut seen_plugins = HashSet::new();
            let mut force = false;
            for task in &subtasks {
                if let Some(d) = task.trade_date() {
                    dates.push(d);
                }
                force |= task
                    .parameters
                    .get("force_overwrite")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false);
                if seen_plugins.insert(task.plugin_name.clone()) {
                    requests.push(PluginRequest {
                        plugin: self.inner.registry.get(&task.plugin_name)?,
                        task_type: task.task_type,
                    });
                }
            }
            dates.sort_unstable();
            dates.dedup();
            let dates = (!dates.is_empty()).then_some(dates);
            return self
                .submit(TriggerType::Retry, exec.group_name.clone(), requests, dates, force)
                .await;
        }

        if !subtasks.iter().any(|t| t.status.is_retryable()) {
            return Err(PlatformError::State(format!(
                "execution '{execution_id}' has nothing to retry"
            )));
        }

        let reset = self.inner.executions.reset_retryable_subtasks(execution_id)?;
        self.inner.executions.cas_update_execution(execution_id, |e| {
            e.status = ExecutionStatus::Pending;
            e.completed_at = None;
            e.error_summary = None;
            e.can_retry = false;
        })?;
        self.inner.executions.recompute_counters(execution_id)?;
        info!(
            execution = execution_id,
            requeued = reset.len(),
            "partial retry requeued"
        );
        self.spawn_driver(execution_id);
        Ok(execution_id.to_string())
    }

    pub fn delete(&self, execution_id: &str) -> Result<()> {
        let exec = self.inner.executions.require_execution(execution_id)?;
        if !exec.status.is_terminal() {
            return Err(PlatformError::State(format!(
                "cannot delete execution '{execution_id}' while {}",
                exec.status.as_str()
            )));
        }
        self.inner.executions.delete_execution(execution_id)
    }

    // ---- background loops -----------------------------------------------

    /// Cron loop: fire daily/weekly plugins at their configured wall-clock
    /// minute, once per local day, skipping non-trading days for
    /// calendar-bound plugins.
    pub fn spawn_cron(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        let scheduler = self.clone();
        tokio::spawn(async move {
            let mut last_fired: HashMap<String, NaiveDate> = HashMap::new();
            let mut tick = tokio::time::interval(Duration::from_secs(CRON_TICK_SECS));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tick.tick() => {
                        if let Err(e) = scheduler.cron_tick(&mut last_fired).await {
                            warn!(error = %e, "cron tick failed");
                        }
                    }
                }
            }
        })
    }

    async fn cron_tick(&self, last_fired: &mut HashMap<String, NaiveDate>) -> Result<()> {
        let local =
            self.inner.clock.now() + chrono::Duration::hours(self.inner.config.tz_offset_hours);
        let today = local.date_naive();
        let minute_now = (local.hour(), local.minute());

        let mut due = Vec::new();
        for plugin in self.inner.registry.list() {
            let Some(hhmm) = plugin.schedule.hhmm() else {
                continue;
            };
            match plugin.schedule.frequency {
                ScheduleFrequency::Manual => continue,
                ScheduleFrequency::Daily => {}
                ScheduleFrequency::Weekly => {
                    if plugin.schedule.day_of_week != Some(today.weekday()) {
                        continue;
                    }
                }
            }
            if hhmm != minute_now {
                continue;
            }
            if last_fired.get(&plugin.name) == Some(&today) {
                continue;
            }
            if !self.inner.registry.effective_schedule_enabled(&plugin.name)? {
                continue;
            }
            if plugin.calendar_bound && !self.inner.calendar.is_trading_day(today)? {
                info!(plugin = %plugin.name, date = %today, "non-trading day, cron skip");
                last_fired.insert(plugin.name.clone(), today);
                continue;
            }
            last_fired.insert(plugin.name.clone(), today);
            due.push(plugin.clone());
        }

        if !due.is_empty() {
            let names: Vec<&str> = due.iter().map(|p| p.name.as_str()).collect();
            info!(plugins = ?names, "cron trigger");
            self.trigger_scheduled(due).await?;
        }
        Ok(())
    }

    /// Daily-class sweep dropping execution history past the retention
    /// window.
    pub fn spawn_retention_sweep(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(RETENTION_SWEEP_SECS));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tick.tick() => {
                        let cutoff =
                            inner.clock.now() - chrono::Duration::days(inner.config.retention_days);
                        if let Err(e) = inner.executions.prune_older_than(cutoff) {
                            warn!(error = %e, "retention sweep failed");
                        }
                    }
                }
            }
        })
    }
}

// ---- execution driver ----------------------------------------------------

async fn drive_execution(
    inner: Arc<Inner>,
    execution_id: &str,
    cancel: CancellationToken,
) -> Result<()> {
    inner.executions.cas_update_execution(execution_id, |e| {
        e.status = ExecutionStatus::Running;
        e.can_retry = false;
    })?;

    let tasks = inner.executions.get_subtasks(execution_id)?;
    let mut statuses: HashMap<String, SubTaskStatus> =
        tasks.iter().map(|t| (t.task_id.clone(), t.status)).collect();
    let mut spawned: HashSet<String> = HashSet::new();
    let mut join_set: JoinSet<(String, SubTaskStatus)> = JoinSet::new();
    let mut stop_requested = false;

    loop {
        if cancel.is_cancelled() && !stop_requested {
            stop_requested = true;
            cancel_pending(&inner, &tasks, &mut statuses, &spawned)?;
            inner.executions.recompute_counters(execution_id)?;
        }

        if !stop_requested {
            for task in &tasks {
                if statuses[&task.task_id] != SubTaskStatus::Pending
                    || spawned.contains(&task.task_id)
                {
                    continue;
                }
                match dependency_state(&inner, task, &tasks, &statuses) {
                    DepState::Ready => {
                        spawned.insert(task.task_id.clone());
                        let inner = inner.clone();
                        let task = task.clone();
                        let cancel = cancel.clone();
                        join_set.spawn(async move {
                            let task_id = task.task_id.clone();
                            let status = run_subtask(inner, task, cancel).await;
                            (task_id, status)
                        });
                    }
                    DepState::Doomed(reason) => {
                        let mut doomed = task.clone();
                        doomed.status = SubTaskStatus::Cancelled;
                        doomed.completed_at = Some(inner.clock.now());
                        doomed.error_message = Some(reason);
                        inner.executions.update_subtask(&doomed)?;
                        statuses.insert(task.task_id.clone(), SubTaskStatus::Cancelled);
                        inner.executions.recompute_counters(execution_id)?;
                    }
                    DepState::Waiting => {}
                }
            }
        }

        let next_joined = tokio::select! {
            _ = cancel.cancelled(), if !stop_requested => continue,
            joined = join_set.join_next() => joined,
        };
        match next_joined {
            Some(joined) => {
                let (task_id, status) = joined.context("sub-task worker panicked")?;
                statuses.insert(task_id, status);
                inner.executions.recompute_counters(execution_id)?;
            }
            None => {
                let pending_left = statuses
                    .values()
                    .any(|s| matches!(s, SubTaskStatus::Pending | SubTaskStatus::Running));
                if !pending_left || stop_requested {
                    break;
                }
                // Pending tasks but nothing runnable: every remaining task is
                // waiting on a dependency that can no longer complete.
                let stuck: Vec<&SubTask> = tasks
                    .iter()
                    .filter(|t| statuses[&t.task_id] == SubTaskStatus::Pending)
                    .collect();
                if stuck.is_empty() {
                    break;
                }
                for task in stuck {
                    let mut doomed = task.clone();
                    doomed.status = SubTaskStatus::Cancelled;
                    doomed.completed_at = Some(inner.clock.now());
                    doomed.error_message =
                        Some("dependency never became runnable".to_string());
                    inner.executions.update_subtask(&doomed)?;
                    statuses.insert(task.task_id.clone(), SubTaskStatus::Cancelled);
                }
                inner.executions.recompute_counters(execution_id)?;
                break;
            }
        }
    }

    finalize_execution(&inner, execution_id, stop_requested)
}

fn cancel_pending(
    inner: &Inner,
    tasks: &[SubTask],
    statuses: &mut HashMap<String, SubTaskStatus>,
    spawned: &HashSet<String>,
) -> Result<()> {
    for task in tasks {
        if statuses[&task.task_id] == SubTaskStatus::Pending && !spawned.contains(&task.task_id) {
            let mut cancelled = task.clone();
            cancelled.status = SubTaskStatus::Cancelled;
            cancelled.completed_at = Some(inner.clock.now());
            cancelled.error_message = Some("stopped by user".to_string());
            inner.executions.update_subtask(&cancelled)?;
            statuses.insert(task.task_id.clone(), SubTaskStatus::Cancelled);
        }
    }
    Ok(())
}

enum DepState {
    Ready,
    Waiting,
    Doomed(String),
}

/// For a given date, a dependent plugin's sub-task runs only after every
/// dependency's sub-task for the same date is completed or skipped.
fn dependency_state(
    inner: &Inner,
    task: &SubTask,
    tasks: &[SubTask],
    statuses: &HashMap<String, SubTaskStatus>,
) -> DepState {
    let Ok(plugin) = inner.registry.get(&task.plugin_name) else {
        return DepState::Ready; // surfaced as a failure by the worker
    };
    let date = task.trade_date();

    for dep in &plugin.dependencies {
        for dep_task in tasks.iter().filter(|t| &t.plugin_name == dep) {
            if date.is_some() && dep_task.trade_date().is_some() && dep_task.trade_date() != date {
                continue;
            }
            match statuses[&dep_task.task_id] {
                SubTaskStatus::Completed | SubTaskStatus::Skipped => {}
                SubTaskStatus::Failed | SubTaskStatus::Cancelled => {
                    return DepState::Doomed(format!(
                        "dependency '{}' {}",
                        dep,
                        statuses[&dep_task.task_id].as_str()
                    ));
                }
                SubTaskStatus::Pending | SubTaskStatus::Running => return DepState::Waiting,
            }
        }
    }
    DepState::Ready
}

fn finalize_execution(inner: &Inner, execution_id: &str, stop_requested: bool) -> Result<()> {
    let subtasks = inner.executions.get_subtasks(execution_id)?;
    let failed: Vec<&SubTask> = subtasks
        .iter()
        .filter(|t| t.status == SubTaskStatus::Failed)
        .collect();
    let cancelled = subtasks
        .iter()
        .filter(|t| t.status == SubTaskStatus::Cancelled)
        .count();

    let error_summary = if failed.is_empty() {
        None
    } else {
        let mut lines: Vec<String> = failed
            .iter()
            .map(|t| {
                format!(
                    "{}{}: {}",
                    t.plugin_name,
                    t.trade_date()
                        .map(|d| format!("@{}", format_trade_date(d)))
                        .unwrap_or_default(),
                    t.error_message.as_deref().unwrap_or("unknown error")
                )
            })
            .collect();
        lines.truncate(20);
        Some(lines.join("\n"))
    };

    let status = if stop_requested {
        ExecutionStatus::Stopped
    } else if !failed.is_empty() {
        ExecutionStatus::Failed
    } else {
        ExecutionStatus::Completed
    };
    let can_retry = !failed.is_empty() || cancelled > 0;
    let now = inner.clock.now();

    let exec = inner.executions.cas_update_execution(execution_id, |e| {
        e.status = status;
        e.completed_at = Some(now);
        e.error_summary = error_summary.clone();
        e.can_retry = can_retry;
    })?;
    info!(
        execution = execution_id,
        status = exec.status.as_str(),
        completed = exec.completed_plugins,
        failed = exec.failed_plugins,
        cancelled = exec.cancelled_plugins,
        skipped = exec.skipped_plugins,
        "execution finished"
    );
    Ok(())
}

// ---- sub-task worker -----------------------------------------------------

async fn run_subtask(inner: Arc<Inner>, mut task: SubTask, cancel: CancellationToken) -> SubTaskStatus {
    // A queued worker that never got a pool slot cancels right away.
    let _permit = tokio::select! {
        _ = cancel.cancelled() => {
            finish_subtask(&inner, &mut task, SubTaskStatus::Cancelled, Some("stopped by user"));
            return SubTaskStatus::Cancelled;
        }
        permit = inner.workers.clone().acquire_owned() => match permit {
            Ok(p) => p,
            Err(_) => return SubTaskStatus::Cancelled,
        },
    };

    if cancel.is_cancelled() {
        finish_subtask(&inner, &mut task, SubTaskStatus::Cancelled, Some("stopped by user"));
        return SubTaskStatus::Cancelled;
    }

    task.status = SubTaskStatus::Running;
    task.started_at = Some(inner.clock.now());
    if let Err(e) = inner.executions.update_subtask(&task) {
        error!(task = %task.task_id, error = %e, "failed to mark sub-task running");
    }

    match execute_subtask(&inner, &mut task, &cancel).await {
        Ok(status) => {
            finish_subtask(&inner, &mut task, status, None);
            status
        }
        Err(e) => {
            let message = format!("{e:#}");
            warn!(
                task = %task.task_id,
                plugin = %task.plugin_name,
                error = %message,
                "sub-task failed"
            );
            finish_subtask(&inner, &mut task, SubTaskStatus::Failed, Some(&message));
            SubTaskStatus::Failed
        }
    }
}

fn finish_subtask(
    inner: &Inner,
    task: &mut SubTask,
    status: SubTaskStatus,
    error_message: Option<&str>,
) {
    task.status = status;
    task.completed_at = Some(inner.clock.now());
    if let Some(msg) = error_message {
        task.error_message = Some(msg.to_string());
    }
    if status == SubTaskStatus::Completed {
        task.progress = 100;
    }
    if let Err(e) = inner.executions.update_subtask(task) {
        error!(task = %task.task_id, error = %e, "failed to persist sub-task result");
    }
}

async fn execute_subtask(
    inner: &Arc<Inner>,
    task: &mut SubTask,
    cancel: &CancellationToken,
) -> anyhow::Result<SubTaskStatus> {
    let plugin = inner
        .registry
        .get(&task.plugin_name)
        .with_context(|| format!("plugin '{}' not registered", task.plugin_name))?;

    let force_overwrite = task
        .parameters
        .get("force_overwrite")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    let date_col = plugin
        .schema
        .partition_key
        .as_deref()
        .unwrap_or("trade_date");

    let timeout = Duration::from_secs(
        plugin
            .extract_timeout_secs
            .unwrap_or(inner.config.extract_timeout_secs),
    );
    let session = Arc::new(ProviderSession::new(
        inner.provider.clone(),
        inner.governor.clone(),
        &plugin.name,
        timeout,
        inner.config.rate_limited_retry_budget,
    ));

    if task.task_type == TaskType::Full && plugin.has_date_param() {
        return run_full_fanout(inner, task, &plugin, session, cancel, force_overwrite, date_col)
            .await;
    }

    // Skip policy: a present (plugin, date) bucket short-circuits unless
    // the caller asked to overwrite.
    if let Some(date) = task.trade_date() {
        if !force_overwrite && inner.ods.has_date(&plugin.table, date_col, date)? {
            info!(plugin = %plugin.name, date = %date, "already present, skipping");
            return Ok(SubTaskStatus::Skipped);
        }
    }

    let params = match task.trade_date() {
        Some(date) => ExtractParams::for_date(date),
        None => ExtractParams::default(),
    };
    let outcome = plugin.extractor.extract(&session, &params).await?;

    inner
        .schema
        .reconcile(&plugin, outcome.sample())
        .await
        .map_err(anyhow::Error::from)?;

    let total_batches = outcome.batches.len().max(1);
    for (i, batch) in outcome.batches.iter().enumerate() {
        if cancel.is_cancelled() {
            return Ok(SubTaskStatus::Cancelled);
        }
        let written = inner.ods.upsert_batch(&plugin.table, batch)?;
        task.records_processed += written;
        task.progress = (((i + 1) * 100) / total_batches) as u8;
        inner.executions.update_subtask(task)?;
    }

    // Zero rows with no error is the "no data" outcome.
    Ok(SubTaskStatus::Completed)
}

/// A `full` ingest fans its date range out inside the one sub-task, with
/// concurrency bounded by what the plugin's rate budget can sustain.
async fn run_full_fanout(
    inner: &Arc<Inner>,
    task: &mut SubTask,
    plugin: &Arc<Plugin>,
    session: Arc<ProviderSession>,
    cancel: &CancellationToken,
    force_overwrite: bool,
    date_col: &str,
) -> anyhow::Result<SubTaskStatus> {
    let today = (inner.clock.now() + chrono::Duration::hours(inner.config.tz_offset_hours))
        .date_naive();
    let all_dates = inner.calendar.trading_days(plugin.history_start, today)?;
    let dates: Vec<NaiveDate> = if force_overwrite {
        all_dates
    } else {
        let present = inner.ods.present_dates(&plugin.table, date_col)?;
        all_dates
            .into_iter()
            .filter(|d| !present.contains(d))
            .collect()
    };
    if dates.is_empty() {
        return Ok(SubTaskStatus::Skipped);
    }

    let inner_concurrency = (plugin.rate_limit_per_minute
        / plugin.expected_calls_per_date.max(1))
    .clamp(1, inner.config.inner_concurrency_cap as u32) as usize;
    info!(
        plugin = %plugin.name,
        dates = dates.len(),
        inner_concurrency,
        "full ingest fan-out"
    );

    // Make sure the destination table exists before concurrent writers race.
    inner
        .schema
        .reconcile(plugin, &[])
        .await
        .map_err(anyhow::Error::from)?;

    let total = dates.len();
    let mut done = 0usize;
    let mut fetches = FuturesUnordered::new();
    let mut remaining = dates.into_iter();

    loop {
        while fetches.len() < inner_concurrency {
            if cancel.is_cancelled() {
                break;
            }
            let Some(date) = remaining.next() else {
                break;
            };
            let session = session.clone();
            let extractor = plugin.extractor.clone();
            fetches.push(async move {
                let outcome = extractor
                    .extract(&session, &ExtractParams::for_date(date))
                    .await;
                (date, outcome)
            });
        }

        let Some((date, outcome)) = fetches.next().await else {
            break;
        };
        let outcome =
            outcome.with_context(|| format!("extracting {}", format_trade_date(date)))?;
        inner
            .schema
            .reconcile(plugin, outcome.sample())
            .await
            .map_err(anyhow::Error::from)?;
        for batch in &outcome.batches {
            task.records_processed += inner.ods.upsert_batch(&plugin.table, batch)?;
        }
        done += 1;
        task.progress = ((done * 100) / total) as u8;
        inner.executions.update_subtask(task)?;

        if cancel.is_cancelled() && fetches.is_empty() {
            return Ok(SubTaskStatus::Cancelled);
        }
    }

    if cancel.is_cancelled() && done < total {
        return Ok(SubTaskStatus::Cancelled);
    }
    Ok(SubTaskStatus::Completed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::plugins::builtin::test_support::stub_plugin;
    use crate::plugins::Schedule;
    use crate::store::MetaDb;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use serde_json::Value;

    struct EmptyProvider;

    #[async_trait]
    impl ProviderClient for EmptyProvider {
        async fn call(
            &self,
            _api_name: &str,
            _params: &Value,
            _fields: &[&str],
        ) -> std::result::Result<crate::provider::ProviderPayload, crate::error::ExtractError>
        {
            Ok(crate::provider::ProviderPayload::default())
        }
    }

    fn scheduler_with(plugins: Vec<crate::plugins::Plugin>, clock: Arc<ManualClock>) -> Scheduler {
        let db = MetaDb::open_in_memory().unwrap();
        let registry = Arc::new(PluginRegistry::discover(plugins, db.clone()).unwrap());
        let clock: Arc<dyn Clock> = clock;
        Scheduler::new(
            registry,
            Arc::new(RateGovernor::new()),
            Arc::new(EmptyProvider),
            Arc::new(ExecutionStore::new(db.clone())),
            Arc::new(OdsStore::new(db.clone(), clock.clone())),
            Arc::new(SchemaSynchronizer::new(db.clone(), clock.clone())),
            Arc::new(TradingCalendar::new(db)),
            clock,
            SchedulerConfig::default(),
        )
    }

    fn manual_clock() -> Arc<ManualClock> {
        // 2026-01-09 09:10 UTC = 17:10 exchange-local at +8.
        Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 1, 9, 9, 10, 0).unwrap(),
        ))
    }

    #[tokio::test]
    async fn backfill_decomposes_per_date() {
        let clock = manual_clock();
        let scheduler = scheduler_with(vec![stub_plugin("bar")], clock);

        let id = scheduler
            .trigger_manual(SyncRequest {
                plugin_name: "bar".to_string(),
                task_type: TaskType::Backfill,
                trade_dates: Some(vec!["20260105".into(), "20260106".into(), "20260107".into()]),
                force_overwrite: false,
            })
            .await
            .unwrap();

        let subtasks = scheduler.inner.executions.get_subtasks(&id).unwrap();
        assert_eq!(subtasks.len(), 3);
        let exec = scheduler.inner.executions.require_execution(&id).unwrap();
        assert_eq!(exec.total_plugins, 3);
        assert_eq!(exec.date_range.as_deref(), Some("20260105-20260107"));
    }

    #[tokio::test]
    async fn backfill_without_dates_is_rejected() {
        let clock = manual_clock();
        let scheduler = scheduler_with(vec![stub_plugin("bar")], clock);
        let err = scheduler
            .trigger_manual(SyncRequest {
                plugin_name: "bar".to_string(),
                task_type: TaskType::Backfill,
                trade_dates: None,
                force_overwrite: false,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, PlatformError::State(_)));
    }

    #[tokio::test]
    async fn weekend_dates_fall_out_of_backfill() {
        let clock = manual_clock();
        let scheduler = scheduler_with(vec![stub_plugin("bar")], clock);
        // 2026-01-10/11 are a weekend.
        let err = scheduler
            .trigger_manual(SyncRequest {
                plugin_name: "bar".to_string(),
                task_type: TaskType::Backfill,
                trade_dates: Some(vec!["20260110".into(), "20260111".into()]),
                force_overwrite: false,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, PlatformError::State(_)));
    }

    #[tokio::test]
    async fn cron_fires_once_per_day_at_declared_minute() {
        let clock = manual_clock();
        let mut plugin = stub_plugin("bar");
        plugin.schedule = Schedule::daily("17:10");
        plugin.schedule_enabled = true;
        let scheduler = scheduler_with(vec![plugin], clock.clone());

        let mut last_fired = HashMap::new();
        scheduler.cron_tick(&mut last_fired).await.unwrap();
        let fired = scheduler
            .inner
            .executions
            .list_executions(None, Some(TriggerType::Scheduled), 10)
            .unwrap();
        assert_eq!(fired.len(), 1);

        // Same minute again: deduplicated.
        scheduler.cron_tick(&mut last_fired).await.unwrap();
        let fired = scheduler
            .inner
            .executions
            .list_executions(None, Some(TriggerType::Scheduled), 10)
            .unwrap();
        assert_eq!(fired.len(), 1);
    }

    #[tokio::test]
    async fn cron_skips_disabled_plugin() {
        let clock = manual_clock();
        let mut plugin = stub_plugin("bar");
        plugin.schedule = Schedule::daily("17:10");
        plugin.schedule_enabled = false;
        let scheduler = scheduler_with(vec![plugin], clock);

        let mut last_fired = HashMap::new();
        scheduler.cron_tick(&mut last_fired).await.unwrap();
        assert!(scheduler
            .inner
            .executions
            .list_executions(None, None, 10)
            .unwrap()
            .is_empty());
    }
}
