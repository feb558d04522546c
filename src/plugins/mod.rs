//! Plugin descriptors and the frozen registry.
//!
//! A plugin is a typed value: declaration, destination schema and an
//! extractor function object. There is no trait hierarchy to subclass;
//! variants of behavior are data on the descriptor.

pub mod builtin;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{NaiveDate, Weekday};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ExtractError, PlatformError, Result};
use crate::provider::session::ProviderSession;
use crate::store::MetaDb;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginRole {
    Primary,
    Basic,
    Derived,
    Auxiliary,
}

impl PluginRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            PluginRole::Primary => "primary",
            PluginRole::Basic => "basic",
            PluginRole::Derived => "derived",
            PluginRole::Auxiliary => "auxiliary",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleFrequency {
    Daily,
    Weekly,
    Manual,
}

impl ScheduleFrequency {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduleFrequency::Daily => "daily",
            ScheduleFrequency::Weekly => "weekly",
            ScheduleFrequency::Manual => "manual",
        }
    }
}

/// Cron declaration: a wall-clock minute, optionally pinned to a weekday.
#[derive(Debug, Clone)]
pub struct Schedule {
    pub frequency: ScheduleFrequency,
    /// "HH:MM" in exchange-local time.
    pub time: String,
    pub day_of_week: Option<Weekday>,
}

impl Schedule {
    pub fn daily(time: &str) -> Self {
        Self {
            frequency: ScheduleFrequency::Daily,
            time: time.to_string(),
            day_of_week: None,
        }
    }

    pub fn weekly(time: &str, day: Weekday) -> Self {
        Self {
            frequency: ScheduleFrequency::Weekly,
            time: time.to_string(),
            day_of_week: Some(day),
        }
    }

    pub fn manual() -> Self {
        Self {
            frequency: ScheduleFrequency::Manual,
            time: String::new(),
            day_of_week: None,
        }
    }

    /// Parsed (hour, minute); `None` for manual-only plugins.
    pub fn hhmm(&self) -> Option<(u32, u32)> {
        let (h, m) = self.time.split_once(':')?;
        Some((h.parse().ok()?, m.parse().ok()?))
    }
}

/// Declared column types, ordered narrow to wide for numerics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Int,
    Float,
    Str,
    Date,
}

impl ColumnType {
    pub fn sql(&self) -> &'static str {
        match self {
            ColumnType::Int => "INTEGER",
            ColumnType::Float => "REAL",
            // Dates ride as compact YYYYMMDD text on the provider wire.
            ColumnType::Str | ColumnType::Date => "TEXT",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ColumnType::Int => "int",
            ColumnType::Float => "float",
            ColumnType::Str => "str",
            ColumnType::Date => "date",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "int" => Some(ColumnType::Int),
            "float" => Some(ColumnType::Float),
            "str" => Some(ColumnType::Str),
            "date" => Some(ColumnType::Date),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ColumnDef {
    pub name: String,
    pub ty: ColumnType,
    pub nullable: bool,
}

impl ColumnDef {
    pub fn new(name: &str, ty: ColumnType) -> Self {
        Self {
            name: name.to_string(),
            ty,
            nullable: true,
        }
    }

    pub fn required(name: &str, ty: ColumnType) -> Self {
        Self {
            name: name.to_string(),
            ty,
            nullable: false,
        }
    }
}

/// Destination table declaration for one plugin.
#[derive(Debug, Clone)]
pub struct TableSchema {
    pub columns: Vec<ColumnDef>,
    /// Upsert identity; "last version wins" deduplicates on these columns.
    pub order_key: Vec<String>,
    /// Date-bucket column, when the table is date-partitioned.
    pub partition_key: Option<String>,
}

impl TableSchema {
    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }
}

/// Parameters handed to one extractor invocation.
#[derive(Debug, Clone, Default)]
pub struct ExtractParams {
    pub trade_date: Option<NaiveDate>,
    pub extra: Value,
}

impl ExtractParams {
    pub fn for_date(d: NaiveDate) -> Self {
        Self {
            trade_date: Some(d),
            ..Default::default()
        }
    }
}

/// One extraction's output: the provider's field list plus row batches.
/// Zero batches is the "no data" outcome, not an error.
#[derive(Debug, Default)]
pub struct ExtractOutcome {
    pub fields: Vec<String>,
    pub batches: Vec<Vec<serde_json::Map<String, Value>>>,
}

impl ExtractOutcome {
    pub fn row_count(&self) -> u64 {
        self.batches.iter().map(|b| b.len() as u64).sum()
    }

    /// A small sample for schema inference.
    pub fn sample(&self) -> &[serde_json::Map<String, Value>] {
        self.batches.first().map(|b| b.as_slice()).unwrap_or(&[])
    }
}

/// The per-plugin extraction capability, registered as a function value.
#[async_trait]
pub trait Extract: Send + Sync {
    async fn extract(
        &self,
        session: &ProviderSession,
        params: &ExtractParams,
    ) -> Result<ExtractOutcome, ExtractError>;
}

/// Static plugin declaration plus its extractor.
pub struct Plugin {
    pub name: String,
    pub table: String,
    pub role: PluginRole,
    pub category: String,
    pub enabled: bool,
    pub rate_limit_per_minute: u32,
    pub schedule: Schedule,
    pub schedule_enabled: bool,
    /// Skip cron firing on non-trading days.
    pub calendar_bound: bool,
    pub dependencies: Vec<String>,
    /// Name of the iterated date parameter; `None` for plugin-only tasks.
    pub date_param: Option<String>,
    pub expected_calls_per_date: u32,
    /// Per-call timeout override, seconds.
    pub extract_timeout_secs: Option<u64>,
    /// First date a `full` ingest reaches back to.
    pub history_start: NaiveDate,
    pub schema: TableSchema,
    pub extractor: Arc<dyn Extract>,
}

impl Plugin {
    pub fn has_date_param(&self) -> bool {
        self.date_param.is_some()
    }
}

impl std::fmt::Debug for Plugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Plugin")
            .field("name", &self.name)
            .field("table", &self.table)
            .field("role", &self.role)
            .field("rate_limit_per_minute", &self.rate_limit_per_minute)
            .field("dependencies", &self.dependencies)
            .finish()
    }
}

/// Frozen plugin registry.
///
/// Built once at startup; the only mutable part is the persisted
/// `schedule_enabled` override map, which wins over the static flag at
/// dispatch time.
#[derive(Debug)]
pub struct PluginRegistry {
    plugins: Vec<Arc<Plugin>>,
    by_name: HashMap<String, usize>,
    overrides: RwLock<HashMap<String, bool>>,
    db: MetaDb,
}

impl PluginRegistry {
    /// Validate declarations and freeze the registry.
    ///
    /// Disabled plugins are dropped from the registry, but a dependency
    /// pointing at one (or at an unknown name) fails registration outright.
    pub fn discover(declarations: Vec<Plugin>, db: MetaDb) -> Result<Self> {
        let mut seen = HashSet::new();
        for p in &declarations {
            if !seen.insert(p.name.clone()) {
                return Err(PlatformError::Config(format!(
                    "duplicate plugin name '{}'",
                    p.name
                )));
            }
        }

        let enabled: HashSet<&str> = declarations
            .iter()
            .filter(|p| p.enabled)
            .map(|p| p.name.as_str())
            .collect();
        let known: HashSet<&str> = declarations.iter().map(|p| p.name.as_str()).collect();

        for p in declarations.iter().filter(|p| p.enabled) {
            for dep in &p.dependencies {
                if !known.contains(dep.as_str()) {
                    return Err(PlatformError::Config(format!(
                        "plugin '{}' depends on unknown plugin '{dep}'",
                        p.name
                    )));
                }
                if !enabled.contains(dep.as_str()) {
                    return Err(PlatformError::Config(format!(
                        "plugin '{}' depends on disabled plugin '{dep}'",
                        p.name
                    )));
                }
            }
        }

        let plugins: Vec<Arc<Plugin>> = declarations
            .into_iter()
            .filter(|p| p.enabled)
            .map(Arc::new)
            .collect();

        Self::check_cycles(&plugins)?;

        let by_name = plugins
            .iter()
            .enumerate()
            .map(|(i, p)| (p.name.clone(), i))
            .collect();

        let overrides = Self::load_overrides(&db)?;

        Ok(Self {
            plugins,
            by_name,
            overrides: RwLock::new(overrides),
            db,
        })
    }

    fn check_cycles(plugins: &[Arc<Plugin>]) -> Result<()> {
        let index: HashMap<&str, &Arc<Plugin>> =
            plugins.iter().map(|p| (p.name.as_str(), p)).collect();
        // 0 = unvisited, 1 = on stack, 2 = done
        let mut state: HashMap<&str, u8> = HashMap::new();

        fn visit<'a>(
            name: &'a str,
            index: &HashMap<&'a str, &'a Arc<Plugin>>,
            state: &mut HashMap<&'a str, u8>,
        ) -> Result<()> {
            match state.get(name) {
                Some(1) => {
                    return Err(PlatformError::Config(format!(
                        "dependency cycle through plugin '{name}'"
                    )))
                }
                Some(2) => return Ok(()),
                _ => {}
            }
            state.insert(name, 1);
            if let Some(p) = index.get(name) {
                for dep in &p.dependencies {
                    visit(dep.as_str(), index, state)?;
                }
            }
            state.insert(name, 2);
            Ok(())
        }

        for p in plugins {
            visit(p.name.as_str(), &index, &mut state)?;
        }
        Ok(())
    }

    fn load_overrides(db: &MetaDb) -> Result<HashMap<String, bool>> {
        let conn = db.conn();
        let mut stmt = conn.prepare("SELECT plugin_name, schedule_enabled FROM plugin_override")?;
        let rows = stmt.query_map([], |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)? != 0))
        })?;
        let mut map = HashMap::new();
        for row in rows {
            let (name, enabled) = row?;
            map.insert(name, enabled);
        }
        Ok(map)
    }

    pub fn list(&self) -> &[Arc<Plugin>] {
        &self.plugins
    }

    pub fn get(&self, name: &str) -> Result<Arc<Plugin>> {
        self.by_name
            .get(name)
            .map(|&i| self.plugins[i].clone())
            .ok_or_else(|| PlatformError::NotFound(format!("plugin '{name}'")))
    }

    /// Runtime override wins over the static declaration.
    pub fn effective_schedule_enabled(&self, name: &str) -> Result<bool> {
        let plugin = self.get(name)?;
        Ok(self
            .overrides
            .read()
            .get(name)
            .copied()
            .unwrap_or(plugin.schedule_enabled))
    }

    /// Persist a runtime `schedule_enabled` override.
    pub fn set_schedule_enabled(
        &self,
        name: &str,
        enabled: bool,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<()> {
        // Reject unknown plugins before touching state.
        self.get(name)?;
        self.db.conn().execute(
            "INSERT INTO plugin_override (plugin_name, schedule_enabled, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(plugin_name) DO UPDATE
                SET schedule_enabled = ?2, updated_at = ?3",
            rusqlite::params![name, enabled as i64, now.to_rfc3339()],
        )?;
        self.overrides.write().insert(name.to_string(), enabled);
        Ok(())
    }
}
