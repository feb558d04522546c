//! Data-gap detection over the trading calendar.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::NaiveDate;
use tracing::debug;

use crate::error::Result;
use crate::plugins::{PluginRegistry, ScheduleFrequency};
use crate::scheduler::calendar::TradingCalendar;
use crate::store::ods::OdsStore;

pub struct MissingDataDetector {
    registry: Arc<PluginRegistry>,
    calendar: Arc<TradingCalendar>,
    ods: Arc<OdsStore>,
}

impl MissingDataDetector {
    pub fn new(
        registry: Arc<PluginRegistry>,
        calendar: Arc<TradingCalendar>,
        ods: Arc<OdsStore>,
    ) -> Self {
        Self {
            registry,
            calendar,
            ods,
        }
    }

    /// Missing trade dates per plugin over `[today - window_days, today]`.
    ///
    /// Only daily-frequency plugins with an effective `schedule_enabled`
    /// and a date parameter participate; everything else has no meaningful
    /// notion of a per-day gap.
    pub fn scan(
        &self,
        today: NaiveDate,
        window_days: i64,
        plugin_filter: Option<&str>,
    ) -> Result<BTreeMap<String, Vec<NaiveDate>>> {
        let start = today - chrono::Duration::days(window_days);
        let trading_days = self.calendar.trading_days(start, today)?;

        let mut report = BTreeMap::new();
        for plugin in self.registry.list() {
            if let Some(filter) = plugin_filter {
                if plugin.name != filter {
                    continue;
                }
            }
            if plugin.schedule.frequency != ScheduleFrequency::Daily
                || !plugin.has_date_param()
                || !self.registry.effective_schedule_enabled(&plugin.name)?
            {
                continue;
            }

            let date_col = plugin
                .schema
                .partition_key
                .as_deref()
                .unwrap_or("trade_date");
            let present = self.ods.present_dates(&plugin.table, date_col)?;
            let missing: Vec<NaiveDate> = trading_days
                .iter()
                .copied()
                .filter(|d| !present.contains(d))
                .collect();
            debug!(plugin = %plugin.name, missing = missing.len(), "gap scan");
            report.insert(plugin.name.clone(), missing);
        }
        Ok(report)
    }

    /// Convenience count used by the plugin listing endpoint.
    pub fn missing_count(&self, today: NaiveDate, window_days: i64, plugin: &str) -> Result<u64> {
        let report = self.scan(today, window_days, Some(plugin))?;
        Ok(report.get(plugin).map(|v| v.len() as u64).unwrap_or(0))
    }
}
