//! Application configuration.
//!
//! Everything comes from the environment with sane defaults; plugin groups
//! can additionally be overridden from a TOML file.

use std::collections::HashMap;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::models::TaskType;

/// A named bundle of plugins triggered together.
#[derive(Debug, Clone, Deserialize)]
pub struct PluginGroup {
    pub plugins: Vec<String>,
    #[serde(default = "default_group_task_type")]
    pub task_type: TaskType,
    #[serde(default)]
    pub description: String,
}

fn default_group_task_type() -> TaskType {
    TaskType::Incremental
}

#[derive(Debug, Clone, Deserialize, Default)]
struct GroupsFile {
    #[serde(default)]
    groups: HashMap<String, PluginGroup>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: String,
    pub port: u16,

    // Upstream market-data provider
    pub provider_base_url: String,
    pub provider_token: String,
    pub extract_timeout_secs: u64,
    pub rate_limited_retry_budget: u32,

    // Scheduler tuning
    pub worker_concurrency: usize,
    pub inner_concurrency_cap: usize,
    pub retention_days: i64,
    pub missing_window_days: i64,
    /// Wall-clock offset for plugin schedule times (exchange local time).
    pub tz_offset_hours: i64,

    // Arena / LLM
    pub llm_base_url: String,
    pub llm_api_key: Option<String>,
    pub llm_model: String,
    pub evaluator_daily_secs: u64,
    pub evaluator_weekly_secs: u64,
    pub evaluator_monthly_secs: u64,

    pub groups: HashMap<String, PluginGroup>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let database_path =
            std::env::var("DATABASE_PATH").unwrap_or_else(|_| "./stockdata.db".to_string());

        let port = env_parse("PORT", 8080u16);

        let provider_base_url = std::env::var("PROVIDER_BASE_URL")
            .unwrap_or_else(|_| "http://api.tushare.pro".to_string());
        let provider_token = std::env::var("PROVIDER_TOKEN").unwrap_or_default();

        let groups_file = std::env::var("PLUGIN_GROUPS_FILE").ok();
        let mut groups = default_groups();
        if let Some(path) = groups_file {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("reading plugin groups file {path}"))?;
            let parsed: GroupsFile =
                toml::from_str(&raw).with_context(|| format!("parsing {path}"))?;
            groups.extend(parsed.groups);
        }

        Ok(Self {
            database_path,
            port,
            provider_base_url,
            provider_token,
            extract_timeout_secs: env_parse("EXTRACT_TIMEOUT_SECS", 30),
            rate_limited_retry_budget: env_parse("RATE_LIMITED_RETRY_BUDGET", 3),
            worker_concurrency: env_parse("WORKER_CONCURRENCY", 3),
            inner_concurrency_cap: env_parse("INNER_CONCURRENCY_CAP", 4),
            retention_days: env_parse("EXECUTION_RETENTION_DAYS", 30),
            missing_window_days: env_parse("MISSING_WINDOW_DAYS", 1825),
            tz_offset_hours: env_parse("TZ_OFFSET_HOURS", 8),
            llm_base_url: std::env::var("LLM_BASE_URL")
                .unwrap_or_else(|_| "https://openrouter.ai/api/v1".to_string()),
            llm_api_key: std::env::var("LLM_API_KEY").ok(),
            llm_model: std::env::var("LLM_MODEL")
                .unwrap_or_else(|_| "deepseek/deepseek-chat".to_string()),
            evaluator_daily_secs: env_parse("EVALUATOR_DAILY_SECS", 86_400),
            evaluator_weekly_secs: env_parse("EVALUATOR_WEEKLY_SECS", 7 * 86_400),
            evaluator_monthly_secs: env_parse("EVALUATOR_MONTHLY_SECS", 30 * 86_400),
            groups,
        })
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

/// Built-in plugin groups; a TOML groups file can add to or shadow these.
fn default_groups() -> HashMap<String, PluginGroup> {
    let mut groups = HashMap::new();
    groups.insert(
        "daily_core".to_string(),
        PluginGroup {
            plugins: vec![
                "daily_bar".to_string(),
                "adj_factor".to_string(),
                "daily_basic".to_string(),
            ],
            task_type: TaskType::Incremental,
            description: "A-share end-of-day core set".to_string(),
        },
    );
    groups.insert(
        "market_breadth".to_string(),
        PluginGroup {
            plugins: vec![
                "index_daily".to_string(),
                "etf_daily".to_string(),
                "hk_daily".to_string(),
            ],
            task_type: TaskType::Incremental,
            description: "Index / ETF / HK daily bars".to_string(),
        },
    );
    groups.insert(
        "reference".to_string(),
        PluginGroup {
            plugins: vec!["trade_cal".to_string(), "stock_basic".to_string()],
            task_type: TaskType::Full,
            description: "Calendar and security master".to_string(),
        },
    );
    groups
}
