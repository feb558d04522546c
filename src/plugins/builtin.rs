//! Built-in data source plugins.
//!
//! Coverage mirrors the platform's upstream: A-share daily bars and
//! adjunct datasets, index / ETF / HK dailies, the security master and the
//! trading calendar. Each plugin is one declaration plus an extractor over
//! the shared provider session.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, NaiveDate, Utc, Weekday};
use serde_json::{json, Map, Value};

use crate::error::ExtractError;
use crate::models::format_trade_date;
use crate::plugins::{
    ColumnDef, ColumnType, Extract, ExtractOutcome, ExtractParams, Plugin, PluginRole, Schedule,
    TableSchema,
};
use crate::provider::session::ProviderSession;

/// Generic single-API extractor: one provider dataset, optional trade-date
/// parameter, offset/limit pagination when the provider signals more pages.
pub struct ApiExtractor {
    api_name: String,
    fields: Vec<&'static str>,
    date_param: Option<&'static str>,
    static_params: Map<String, Value>,
    page_limit: Option<u64>,
}

impl ApiExtractor {
    pub fn new(api_name: &str, fields: Vec<&'static str>) -> Self {
        Self {
            api_name: api_name.to_string(),
            fields,
            date_param: None,
            static_params: Map::new(),
            page_limit: None,
        }
    }

    pub fn with_date_param(mut self, name: &'static str) -> Self {
        self.date_param = Some(name);
        self
    }

    pub fn with_static_param(mut self, key: &str, value: Value) -> Self {
        self.static_params.insert(key.to_string(), value);
        self
    }

    pub fn paginated(mut self, limit: u64) -> Self {
        self.page_limit = Some(limit);
        self
    }
}

#[async_trait]
impl Extract for ApiExtractor {
    async fn extract(
        &self,
        session: &ProviderSession,
        params: &ExtractParams,
    ) -> Result<ExtractOutcome, ExtractError> {
        let mut call_params = self.static_params.clone();
        if let (Some(name), Some(date)) = (self.date_param, params.trade_date) {
            call_params.insert(name.to_string(), json!(format_trade_date(date)));
        }
        if let Value::Object(extra) = &params.extra {
            for (k, v) in extra {
                call_params.insert(k.clone(), v.clone());
            }
        }

        let mut outcome = ExtractOutcome::default();
        let mut offset = 0u64;
        loop {
            if let Some(limit) = self.page_limit {
                call_params.insert("offset".to_string(), json!(offset));
                call_params.insert("limit".to_string(), json!(limit));
            }

            let page = session
                .call(&self.api_name, &Value::Object(call_params.clone()), &self.fields)
                .await?;

            if outcome.fields.is_empty() && !page.fields.is_empty() {
                outcome.fields = page.fields.clone();
            }
            let n = page.items.len() as u64;
            if n > 0 {
                outcome.batches.push(page.rows());
            }
            if self.page_limit.is_none() || !page.has_more || n == 0 {
                break;
            }
            offset += n;
        }
        Ok(outcome)
    }
}

/// Trading-calendar refresh: always pulls a rolling window ending next year
/// so upcoming holidays are known ahead of the cron that needs them.
pub struct CalendarRangeExtractor {
    window_days: i64,
}

impl CalendarRangeExtractor {
    pub fn new(window_days: i64) -> Self {
        Self { window_days }
    }
}

#[async_trait]
impl Extract for CalendarRangeExtractor {
    async fn extract(
        &self,
        session: &ProviderSession,
        _params: &ExtractParams,
    ) -> Result<ExtractOutcome, ExtractError> {
        let today = Utc::now().date_naive();
        let start = today - Duration::days(self.window_days);
        let end = today + Duration::days(370);
        let params = json!({
            "exchange": "SSE",
            "start_date": format_trade_date(start),
            "end_date": format_trade_date(end),
        });

        let fields = ["exchange", "cal_date", "is_open", "pretrade_date"];
        let page = session.call("trade_cal", &params, &fields).await?;

        let mut outcome = ExtractOutcome {
            fields: page.fields.clone(),
            batches: Vec::new(),
        };
        if !page.is_empty() {
            outcome.batches.push(page.rows());
        }
        Ok(outcome)
    }
}

fn bar_columns() -> Vec<ColumnDef> {
    vec![
        ColumnDef::required("ts_code", ColumnType::Str),
        ColumnDef::required("trade_date", ColumnType::Date),
        ColumnDef::new("open", ColumnType::Float),
        ColumnDef::new("high", ColumnType::Float),
        ColumnDef::new("low", ColumnType::Float),
        ColumnDef::new("close", ColumnType::Float),
        ColumnDef::new("pre_close", ColumnType::Float),
        ColumnDef::new("change", ColumnType::Float),
        ColumnDef::new("pct_chg", ColumnType::Float),
        ColumnDef::new("vol", ColumnType::Float),
        ColumnDef::new("amount", ColumnType::Float),
    ]
}

fn daily_bar_schema() -> TableSchema {
    TableSchema {
        columns: bar_columns(),
        order_key: vec!["ts_code".to_string(), "trade_date".to_string()],
        partition_key: Some("trade_date".to_string()),
    }
}

const BAR_FIELDS: [&str; 11] = [
    "ts_code", "trade_date", "open", "high", "low", "close", "pre_close", "change", "pct_chg",
    "vol", "amount",
];

fn history_start() -> NaiveDate {
    NaiveDate::from_ymd_opt(2018, 1, 1).expect("static date")
}

/// The full built-in plugin set.
pub fn builtin_plugins() -> Vec<Plugin> {
    let mut plugins = Vec::new();

    plugins.push(Plugin {
        name: "trade_cal".to_string(),
        table: "ods_trade_cal".to_string(),
        role: PluginRole::Basic,
        category: "calendar".to_string(),
        enabled: true,
        rate_limit_per_minute: 100,
        schedule: Schedule::weekly("08:00", Weekday::Mon),
        schedule_enabled: true,
        calendar_bound: false,
        dependencies: vec![],
        date_param: None,
        expected_calls_per_date: 1,
        extract_timeout_secs: None,
        history_start: history_start(),
        schema: TableSchema {
            columns: vec![
                ColumnDef::required("exchange", ColumnType::Str),
                ColumnDef::required("cal_date", ColumnType::Date),
                ColumnDef::required("is_open", ColumnType::Int),
                ColumnDef::new("pretrade_date", ColumnType::Date),
            ],
            order_key: vec!["exchange".to_string(), "cal_date".to_string()],
            partition_key: Some("cal_date".to_string()),
        },
        extractor: Arc::new(CalendarRangeExtractor::new(3650)),
    });

    plugins.push(Plugin {
        name: "stock_basic".to_string(),
        table: "ods_stock_basic".to_string(),
        role: PluginRole::Basic,
        category: "stock".to_string(),
        enabled: true,
        rate_limit_per_minute: 100,
        schedule: Schedule::daily("17:00"),
        schedule_enabled: true,
        calendar_bound: true,
        dependencies: vec![],
        date_param: None,
        expected_calls_per_date: 2,
        extract_timeout_secs: None,
        history_start: history_start(),
        schema: TableSchema {
            columns: vec![
                ColumnDef::required("ts_code", ColumnType::Str),
                ColumnDef::new("symbol", ColumnType::Str),
                ColumnDef::new("name", ColumnType::Str),
                ColumnDef::new("area", ColumnType::Str),
                ColumnDef::new("industry", ColumnType::Str),
                ColumnDef::new("market", ColumnType::Str),
                ColumnDef::new("list_status", ColumnType::Str),
                ColumnDef::new("list_date", ColumnType::Date),
            ],
            order_key: vec!["ts_code".to_string()],
            partition_key: None,
        },
        extractor: Arc::new(
            ApiExtractor::new(
                "stock_basic",
                vec![
                    "ts_code",
                    "symbol",
                    "name",
                    "area",
                    "industry",
                    "market",
                    "list_status",
                    "list_date",
                ],
            )
            .with_static_param("list_status", json!("L"))
            .paginated(5000),
        ),
    });

    plugins.push(Plugin {
        name: "daily_bar".to_string(),
        table: "ods_daily_bar".to_string(),
        role: PluginRole::Primary,
        category: "stock".to_string(),
        enabled: true,
        rate_limit_per_minute: 500,
        schedule: Schedule::daily("17:10"),
        schedule_enabled: true,
        calendar_bound: true,
        dependencies: vec!["trade_cal".to_string()],
        date_param: Some("trade_date".to_string()),
        expected_calls_per_date: 2,
        extract_timeout_secs: None,
        history_start: history_start(),
        schema: daily_bar_schema(),
        extractor: Arc::new(
            ApiExtractor::new("daily", BAR_FIELDS.to_vec())
                .with_date_param("trade_date")
                .paginated(6000),
        ),
    });

    plugins.push(Plugin {
        name: "adj_factor".to_string(),
        table: "ods_adj_factor".to_string(),
        role: PluginRole::Primary,
        category: "stock".to_string(),
        enabled: true,
        rate_limit_per_minute: 500,
        schedule: Schedule::daily("17:10"),
        schedule_enabled: true,
        calendar_bound: true,
        dependencies: vec!["daily_bar".to_string()],
        date_param: Some("trade_date".to_string()),
        expected_calls_per_date: 1,
        extract_timeout_secs: None,
        history_start: history_start(),
        schema: TableSchema {
            columns: vec![
                ColumnDef::required("ts_code", ColumnType::Str),
                ColumnDef::required("trade_date", ColumnType::Date),
                ColumnDef::new("adj_factor", ColumnType::Float),
            ],
            order_key: vec!["ts_code".to_string(), "trade_date".to_string()],
            partition_key: Some("trade_date".to_string()),
        },
        extractor: Arc::new(
            ApiExtractor::new("adj_factor", vec!["ts_code", "trade_date", "adj_factor"])
                .with_date_param("trade_date")
                .paginated(6000),
        ),
    });

    plugins.push(Plugin {
        name: "daily_basic".to_string(),
        table: "ods_daily_basic".to_string(),
        role: PluginRole::Derived,
        category: "stock".to_string(),
        enabled: true,
        rate_limit_per_minute: 200,
        schedule: Schedule::daily("17:20"),
        schedule_enabled: true,
        calendar_bound: true,
        dependencies: vec!["daily_bar".to_string()],
        date_param: Some("trade_date".to_string()),
        expected_calls_per_date: 1,
        extract_timeout_secs: None,
        history_start: history_start(),
        schema: TableSchema {
            columns: vec![
                ColumnDef::required("ts_code", ColumnType::Str),
                ColumnDef::required("trade_date", ColumnType::Date),
                ColumnDef::new("turnover_rate", ColumnType::Float),
                ColumnDef::new("volume_ratio", ColumnType::Float),
                ColumnDef::new("pe", ColumnType::Float),
                ColumnDef::new("pb", ColumnType::Float),
                ColumnDef::new("ps", ColumnType::Float),
                ColumnDef::new("total_mv", ColumnType::Float),
                ColumnDef::new("circ_mv", ColumnType::Float),
            ],
            order_key: vec!["ts_code".to_string(), "trade_date".to_string()],
            partition_key: Some("trade_date".to_string()),
        },
        extractor: Arc::new(
            ApiExtractor::new(
                "daily_basic",
                vec![
                    "ts_code",
                    "trade_date",
                    "turnover_rate",
                    "volume_ratio",
                    "pe",
                    "pb",
                    "ps",
                    "total_mv",
                    "circ_mv",
                ],
            )
            .with_date_param("trade_date")
            .paginated(6000),
        ),
    });

    plugins.push(Plugin {
        name: "moneyflow".to_string(),
        table: "ods_moneyflow".to_string(),
        role: PluginRole::Auxiliary,
        category: "stock".to_string(),
        enabled: true,
        rate_limit_per_minute: 200,
        schedule: Schedule::daily("17:30"),
        schedule_enabled: true,
        calendar_bound: true,
        dependencies: vec!["daily_bar".to_string()],
        date_param: Some("trade_date".to_string()),
        expected_calls_per_date: 1,
        extract_timeout_secs: None,
        history_start: history_start(),
        schema: TableSchema {
            columns: vec![
                ColumnDef::required("ts_code", ColumnType::Str),
                ColumnDef::required("trade_date", ColumnType::Date),
                ColumnDef::new("buy_sm_amount", ColumnType::Float),
                ColumnDef::new("sell_sm_amount", ColumnType::Float),
                ColumnDef::new("buy_lg_amount", ColumnType::Float),
                ColumnDef::new("sell_lg_amount", ColumnType::Float),
                ColumnDef::new("net_mf_amount", ColumnType::Float),
            ],
            order_key: vec!["ts_code".to_string(), "trade_date".to_string()],
            partition_key: Some("trade_date".to_string()),
        },
        extractor: Arc::new(
            ApiExtractor::new(
                "moneyflow",
                vec![
                    "ts_code",
                    "trade_date",
                    "buy_sm_amount",
                    "sell_sm_amount",
                    "buy_lg_amount",
                    "sell_lg_amount",
                    "net_mf_amount",
                ],
            )
            .with_date_param("trade_date")
            .paginated(6000),
        ),
    });

    plugins.push(Plugin {
        name: "index_daily".to_string(),
        table: "ods_index_daily".to_string(),
        role: PluginRole::Primary,
        category: "index".to_string(),
        enabled: true,
        rate_limit_per_minute: 300,
        schedule: Schedule::daily("17:15"),
        schedule_enabled: true,
        calendar_bound: true,
        dependencies: vec!["trade_cal".to_string()],
        date_param: Some("trade_date".to_string()),
        expected_calls_per_date: 1,
        extract_timeout_secs: None,
        history_start: history_start(),
        schema: daily_bar_schema(),
        extractor: Arc::new(
            ApiExtractor::new("index_daily", BAR_FIELDS.to_vec())
                .with_date_param("trade_date")
                .paginated(6000),
        ),
    });

    plugins.push(Plugin {
        name: "etf_daily".to_string(),
        table: "ods_etf_daily".to_string(),
        role: PluginRole::Primary,
        category: "etf".to_string(),
        enabled: true,
        rate_limit_per_minute: 300,
        schedule: Schedule::daily("17:15"),
        schedule_enabled: true,
        calendar_bound: true,
        dependencies: vec!["trade_cal".to_string()],
        date_param: Some("trade_date".to_string()),
        expected_calls_per_date: 1,
        extract_timeout_secs: None,
        history_start: history_start(),
        schema: daily_bar_schema(),
        extractor: Arc::new(
            ApiExtractor::new("fund_daily", BAR_FIELDS.to_vec())
                .with_date_param("trade_date")
                .paginated(6000),
        ),
    });

    plugins.push(Plugin {
        name: "hk_daily".to_string(),
        table: "ods_hk_daily".to_string(),
        role: PluginRole::Primary,
        category: "hk".to_string(),
        enabled: true,
        rate_limit_per_minute: 120,
        schedule: Schedule::daily("17:40"),
        schedule_enabled: true,
        // HK session differs from the A-share calendar; let the cron fire
        // and the extractor return no data on HK holidays instead.
        calendar_bound: false,
        dependencies: vec![],
        date_param: Some("trade_date".to_string()),
        expected_calls_per_date: 1,
        extract_timeout_secs: Some(45),
        history_start: history_start(),
        schema: daily_bar_schema(),
        extractor: Arc::new(
            ApiExtractor::new("hk_daily", BAR_FIELDS.to_vec())
                .with_date_param("trade_date")
                .paginated(6000),
        ),
    });

    plugins
}

#[doc(hidden)]
pub mod test_support {
    //! Plugin construction helpers shared by unit and integration tests.

    use super::*;

    pub struct NoopExtract;

    #[async_trait]
    impl Extract for NoopExtract {
        async fn extract(
            &self,
            _session: &ProviderSession,
            _params: &ExtractParams,
        ) -> Result<ExtractOutcome, ExtractError> {
            Ok(ExtractOutcome::default())
        }
    }

    /// Minimal enabled plugin used to exercise registry and scheduler paths.
    pub fn stub_plugin(name: &str) -> Plugin {
        Plugin {
            name: name.to_string(),
            table: format!("ods_{name}"),
            role: PluginRole::Primary,
            category: "stock".to_string(),
            enabled: true,
            rate_limit_per_minute: 600,
            schedule: Schedule::manual(),
            schedule_enabled: false,
            calendar_bound: false,
            dependencies: vec![],
            date_param: Some("trade_date".to_string()),
            expected_calls_per_date: 1,
            extract_timeout_secs: None,
            history_start: NaiveDate::from_ymd_opt(2024, 1, 1).expect("static date"),
            schema: TableSchema {
                columns: vec![
                    ColumnDef::required("ts_code", ColumnType::Str),
                    ColumnDef::required("trade_date", ColumnType::Date),
                    ColumnDef::new("close", ColumnType::Float),
                ],
                order_key: vec!["ts_code".to_string(), "trade_date".to_string()],
                partition_key: Some("trade_date".to_string()),
            },
            extractor: Arc::new(NoopExtract),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::ScheduleFrequency;

    #[test]
    fn builtin_set_is_registrable() {
        let db = crate::store::MetaDb::open_in_memory().unwrap();
        let registry = crate::plugins::PluginRegistry::discover(builtin_plugins(), db).unwrap();
        assert_eq!(registry.list().len(), 9);

        let adj = registry.get("adj_factor").unwrap();
        assert_eq!(adj.dependencies, vec!["daily_bar".to_string()]);
        assert!(adj.has_date_param());

        let cal = registry.get("trade_cal").unwrap();
        assert!(!cal.has_date_param());
        assert_eq!(cal.schedule.day_of_week, Some(Weekday::Mon));
    }

    #[test]
    fn schedules_parse() {
        for p in builtin_plugins() {
            if p.schedule.frequency != ScheduleFrequency::Manual {
                assert!(p.schedule.hhmm().is_some(), "plugin {}", p.name);
            }
        }
    }
}
