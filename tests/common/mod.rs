//! Shared fixtures for the end-to-end scenarios: a deterministic mock
//! provider with failure injection, and a fully wired scheduler over a
//! scratch database.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDate, TimeZone, Utc};
use parking_lot::Mutex;
use serde_json::{json, Value};

use stockdata_backend::clock::{Clock, ManualClock};
use stockdata_backend::error::ExtractError;
use stockdata_backend::models::parse_trade_date;
use stockdata_backend::plugins::builtin::ApiExtractor;
use stockdata_backend::plugins::{
    ColumnDef, ColumnType, Plugin, PluginRegistry, PluginRole, Schedule, TableSchema,
};
use stockdata_backend::provider::{ProviderClient, ProviderPayload};
use stockdata_backend::scheduler::calendar::TradingCalendar;
use stockdata_backend::scheduler::rate::RateGovernor;
use stockdata_backend::scheduler::{Scheduler, SchedulerConfig};
use stockdata_backend::store::execution::ExecutionStore;
use stockdata_backend::store::ods::OdsStore;
use stockdata_backend::store::schema_sync::SchemaSynchronizer;
use stockdata_backend::store::MetaDb;

#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub api_name: String,
    pub trade_date: Option<String>,
    pub at: std::time::Instant,
}

#[derive(Default)]
struct FailurePlan {
    /// Remaining 429 responses per (api, trade_date).
    rate_limited: HashMap<(String, String), u32>,
    /// Hard provider errors per (api, trade_date).
    errors: HashMap<(String, String), String>,
}

/// Deterministic provider double: N rows per (api, date), optional latency,
/// and scripted throttle/error responses.
pub struct MockProvider {
    rows_per_date: usize,
    latency: Mutex<Option<Duration>>,
    calls: Mutex<Vec<RecordedCall>>,
    plan: Mutex<FailurePlan>,
}

impl MockProvider {
    pub fn new(rows_per_date: usize) -> Self {
        Self {
            rows_per_date,
            latency: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
            plan: Mutex::new(FailurePlan::default()),
        }
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = Some(latency);
    }

    pub fn rate_limit_once(&self, api: &str, date: &str, times: u32) {
        self.plan
            .lock()
            .rate_limited
            .insert((api.to_string(), date.to_string()), times);
    }

    pub fn fail_with_error(&self, api: &str, date: &str, message: &str) {
        self.plan
            .lock()
            .errors
            .insert((api.to_string(), date.to_string()), message.to_string());
    }

    pub fn clear_errors(&self) {
        self.plan.lock().errors.clear();
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    pub fn calls_for(&self, api: &str, date: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.api_name == api && c.trade_date.as_deref() == Some(date))
            .count()
    }
}

#[async_trait]
impl ProviderClient for MockProvider {
    async fn call(
        &self,
        api_name: &str,
        params: &Value,
        fields: &[&str],
    ) -> Result<ProviderPayload, ExtractError> {
        let trade_date = params
            .get("trade_date")
            .and_then(|v| v.as_str())
            .map(String::from);
        self.calls.lock().push(RecordedCall {
            api_name: api_name.to_string(),
            trade_date: trade_date.clone(),
            at: std::time::Instant::now(),
        });

        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        if let Some(date) = &trade_date {
            let key = (api_name.to_string(), date.clone());
            {
                let mut plan = self.plan.lock();
                if let Some(remaining) = plan.rate_limited.get_mut(&key) {
                    if *remaining > 0 {
                        *remaining -= 1;
                        return Err(ExtractError::RateLimited {
                            retry_after_secs: 1,
                        });
                    }
                }
                if let Some(message) = plan.errors.get(&key) {
                    return Err(ExtractError::Provider {
                        code: -1,
                        message: message.clone(),
                    });
                }
            }
        }

        let items = (0..self.rows_per_date)
            .map(|i| {
                fields
                    .iter()
                    .map(|f| match *f {
                        "ts_code" => json!(format!("{:06}.SZ", i + 1)),
                        "trade_date" => json!(trade_date.clone().unwrap_or_default()),
                        "close" => json!(10.0 + i as f64),
                        other => json!(format!("{other}-{i}")),
                    })
                    .collect()
            })
            .collect();
        Ok(ProviderPayload {
            fields: fields.iter().map(|f| f.to_string()).collect(),
            items,
            has_more: false,
        })
    }
}

fn bar_schema() -> TableSchema {
    TableSchema {
        columns: vec![
            ColumnDef::required("ts_code", ColumnType::Str),
            ColumnDef::required("trade_date", ColumnType::Date),
            ColumnDef::new("close", ColumnType::Float),
        ],
        order_key: vec!["ts_code".to_string(), "trade_date".to_string()],
        partition_key: Some("trade_date".to_string()),
    }
}

/// Manually-invoked daily plugin backed by the mock provider's `{name}_api`
/// dataset.
pub fn test_plugin(name: &str, rate_limit: u32, dependencies: Vec<String>) -> Plugin {
    Plugin {
        name: name.to_string(),
        table: format!("ods_{name}"),
        role: PluginRole::Primary,
        category: "stock".to_string(),
        enabled: true,
        rate_limit_per_minute: rate_limit,
        // Group operations include only effectively-enabled plugins; the
        // harness never spawns the cron loop, so this cannot self-trigger.
        schedule: Schedule::daily("17:10"),
        schedule_enabled: true,
        calendar_bound: true,
        dependencies,
        date_param: Some("trade_date".to_string()),
        expected_calls_per_date: 1,
        extract_timeout_secs: None,
        history_start: NaiveDate::from_ymd_opt(2025, 1, 1).expect("static date"),
        schema: bar_schema(),
        extractor: Arc::new(
            ApiExtractor::new(&format!("{name}_api"), vec!["ts_code", "trade_date", "close"])
                .with_date_param("trade_date"),
        ),
    }
}

pub struct Harness {
    pub scheduler: Scheduler,
    pub registry: Arc<PluginRegistry>,
    pub executions: Arc<ExecutionStore>,
    pub ods: Arc<OdsStore>,
    pub provider: Arc<MockProvider>,
    pub clock: Arc<ManualClock>,
    pub db: MetaDb,
}

impl Harness {
    /// Friday 2026-01-09, 17:30 exchange-local.
    pub fn start_time() -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 9, 9, 30, 0).unwrap()
    }

    pub fn new(plugins: Vec<Plugin>, provider: Arc<MockProvider>) -> Self {
        let db = MetaDb::open_in_memory().unwrap();
        let clock = Arc::new(ManualClock::new(Self::start_time()));
        let clock_dyn: Arc<dyn Clock> = clock.clone();

        let registry = Arc::new(PluginRegistry::discover(plugins, db.clone()).unwrap());
        let executions = Arc::new(ExecutionStore::new(db.clone()));
        let ods = Arc::new(OdsStore::new(db.clone(), clock_dyn.clone()));
        let scheduler = Scheduler::new(
            registry.clone(),
            Arc::new(RateGovernor::new()),
            provider.clone(),
            executions.clone(),
            ods.clone(),
            Arc::new(SchemaSynchronizer::new(db.clone(), clock_dyn.clone())),
            Arc::new(TradingCalendar::new(db.clone())),
            clock_dyn,
            SchedulerConfig::default(),
        );
        Self {
            scheduler,
            registry,
            executions,
            ods,
            provider,
            clock,
            db,
        }
    }

    /// Poll until the execution reaches a terminal status.
    pub async fn wait_terminal(
        &self,
        execution_id: &str,
        timeout: Duration,
    ) -> stockdata_backend::models::BatchExecution {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            let exec = self.executions.require_execution(execution_id).unwrap();
            if exec.status.is_terminal() {
                return exec;
            }
            assert!(
                std::time::Instant::now() < deadline,
                "execution {execution_id} stuck in {:?}",
                exec.status
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

pub fn date(s: &str) -> NaiveDate {
    parse_trade_date(s).unwrap()
}
