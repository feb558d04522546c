//! Per-plugin ODS tables with version-based upsert semantics.
//!
//! Every write stamps `_version` with a strictly monotone microsecond
//! timestamp; reads collapse duplicates by taking the highest version per
//! order key. Overwrites never delete, they out-version.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use chrono::NaiveDate;
use rusqlite::types::Value as SqlValue;
use serde_json::Value;
use tracing::debug;

use crate::clock::Clock;
use crate::error::{PlatformError, Result};
use crate::models::{format_trade_date, parse_trade_date};
use crate::store::MetaDb;

pub struct OdsStore {
    db: MetaDb,
    clock: Arc<dyn Clock>,
    version_hwm: AtomicI64,
}

impl OdsStore {
    pub fn new(db: MetaDb, clock: Arc<dyn Clock>) -> Self {
        Self {
            db,
            clock,
            version_hwm: AtomicI64::new(0),
        }
    }

    /// Monotone write version, clock-derived.
    fn next_version(&self) -> i64 {
        let now_micros = self.clock.now().timestamp_micros();
        self.version_hwm
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |hwm| {
                Some(now_micros.max(hwm + 1))
            })
            .map(|prev| now_micros.max(prev + 1))
            .unwrap_or(now_micros)
    }

    pub fn table_exists(&self, table: &str) -> Result<bool> {
        let n: i64 = self.db.conn().query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [table],
            |r| r.get(0),
        )?;
        Ok(n > 0)
    }

    fn table_columns(&self, table: &str) -> Result<Vec<String>> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
        let cols = stmt
            .query_map([], |r| r.get::<_, String>(1))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(cols)
    }

    /// Write one extractor batch. Columns unknown to the table are dropped
    /// (the schema synchronizer runs before the first batch, so this only
    /// happens for columns it deliberately refused).
    pub fn upsert_batch(
        &self,
        table: &str,
        rows: &[serde_json::Map<String, Value>],
    ) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        let columns: Vec<String> = self
            .table_columns(table)?
            .into_iter()
            .filter(|c| c != "_version")
            .collect();
        if columns.is_empty() {
            return Err(PlatformError::Store(format!(
                "ods table '{table}' does not exist"
            )));
        }

        let placeholders: Vec<String> = (1..=columns.len() + 1).map(|i| format!("?{i}")).collect();
        let sql = format!(
            "INSERT INTO {table} ({}, _version) VALUES ({})",
            columns.join(", "),
            placeholders.join(", "),
        );

        let version = self.next_version();
        let mut conn = self.db.conn();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(&sql)?;
            for row in rows {
                let mut bound: Vec<SqlValue> = Vec::with_capacity(columns.len() + 1);
                for col in &columns {
                    bound.push(json_to_sql(row.get(col.as_str())));
                }
                bound.push(SqlValue::Integer(version));
                stmt.execute(rusqlite::params_from_iter(bound))?;
            }
        }
        tx.commit()?;
        debug!(table, rows = rows.len(), version, "ods batch written");
        Ok(rows.len() as u64)
    }

    pub fn present_dates(&self, table: &str, date_col: &str) -> Result<BTreeSet<NaiveDate>> {
        if !self.table_exists(table)? {
            return Ok(BTreeSet::new());
        }
        let conn = self.db.conn();
        let mut stmt = conn.prepare(&format!("SELECT DISTINCT {date_col} FROM {table}"))?;
        let dates = stmt
            .query_map([], |r| r.get::<_, String>(0))?
            .filter_map(|r| r.ok())
            .filter_map(|s| parse_trade_date(&s))
            .collect();
        Ok(dates)
    }

    pub fn has_date(&self, table: &str, date_col: &str, date: NaiveDate) -> Result<bool> {
        if !self.table_exists(table)? {
            return Ok(false);
        }
        let n: i64 = self.db.conn().query_row(
            &format!("SELECT COUNT(*) FROM {table} WHERE {date_col} = ?1 LIMIT 1"),
            [format_trade_date(date)],
            |r| r.get(0),
        )?;
        Ok(n > 0)
    }

    pub fn latest_date(&self, table: &str, date_col: &str) -> Result<Option<NaiveDate>> {
        if !self.table_exists(table)? {
            return Ok(None);
        }
        let latest: Option<String> = self.db.conn().query_row(
            &format!("SELECT MAX({date_col}) FROM {table}"),
            [],
            |r| r.get(0),
        )?;
        Ok(latest.as_deref().and_then(parse_trade_date))
    }

    /// Deduplicated row count for one date bucket ("last version wins").
    pub fn rows_for_date(
        &self,
        table: &str,
        date_col: &str,
        date: NaiveDate,
        order_key: &[String],
    ) -> Result<u64> {
        if !self.table_exists(table)? {
            return Ok(0);
        }
        let partition = if order_key.is_empty() {
            "rowid".to_string()
        } else {
            order_key.join(", ")
        };
        let n: i64 = self.db.conn().query_row(
            &format!(
                "SELECT COUNT(*) FROM (
                     SELECT ROW_NUMBER() OVER (PARTITION BY {partition} ORDER BY _version DESC) AS rn
                     FROM {table} WHERE {date_col} = ?1
                 ) WHERE rn = 1"
            ),
            [format_trade_date(date)],
            |r| r.get(0),
        )?;
        Ok(n as u64)
    }

    /// Deduplicated close series per instrument over a date window.
    pub fn daily_closes(
        &self,
        table: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<HashMap<String, Vec<(NaiveDate, f64)>>> {
        if !self.table_exists(table)? {
            return Ok(HashMap::new());
        }
        let conn = self.db.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT ts_code, trade_date, close FROM (
                 SELECT ts_code, trade_date, close,
                        ROW_NUMBER() OVER (
                            PARTITION BY ts_code, trade_date
                            ORDER BY _version DESC
                        ) AS rn
                 FROM {table}
                 WHERE trade_date >= ?1 AND trade_date <= ?2 AND close IS NOT NULL
             ) WHERE rn = 1
             ORDER BY ts_code, trade_date"
        ))?;
        let rows = stmt.query_map(
            [format_trade_date(start), format_trade_date(end)],
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, f64>(2)?,
                ))
            },
        )?;

        let mut series: HashMap<String, Vec<(NaiveDate, f64)>> = HashMap::new();
        for row in rows {
            let (code, date, close) = row?;
            if let Some(d) = parse_trade_date(&date) {
                series.entry(code).or_default().push((d, close));
            }
        }
        Ok(series)
    }
}

fn json_to_sql(value: Option<&Value>) -> SqlValue {
    match value {
        None | Some(Value::Null) => SqlValue::Null,
        Some(Value::Bool(b)) => SqlValue::Integer(i64::from(*b)),
        Some(Value::Number(n)) => {
            if let Some(i) = n.as_i64() {
                SqlValue::Integer(i)
            } else {
                SqlValue::Real(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        Some(Value::String(s)) => SqlValue::Text(s.clone()),
        // Nested structures ride as JSON text.
        Some(other) => SqlValue::Text(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use serde_json::json;

    fn store() -> OdsStore {
        let db = MetaDb::open_in_memory().unwrap();
        db.conn()
            .execute_batch(
                "CREATE TABLE ods_t (
                     ts_code TEXT, trade_date TEXT, close REAL, _version INTEGER
                 );",
            )
            .unwrap();
        OdsStore::new(db, Arc::new(SystemClock))
    }

    fn row(code: &str, date: &str, close: f64) -> serde_json::Map<String, Value> {
        let mut m = serde_json::Map::new();
        m.insert("ts_code".into(), json!(code));
        m.insert("trade_date".into(), json!(date));
        m.insert("close".into(), json!(close));
        m
    }

    #[test]
    fn last_version_wins_on_overwrite() {
        let ods = store();
        let d = NaiveDate::from_ymd_opt(2026, 1, 9).unwrap();

        ods.upsert_batch("ods_t", &[row("600519.SH", "20260109", 1700.0)])
            .unwrap();
        ods.upsert_batch("ods_t", &[row("600519.SH", "20260109", 1712.5)])
            .unwrap();

        let key = vec!["ts_code".to_string(), "trade_date".to_string()];
        assert_eq!(
            ods.rows_for_date("ods_t", "trade_date", d, &key).unwrap(),
            1
        );
        let series = ods
            .daily_closes("ods_t", d, d)
            .unwrap()
            .remove("600519.SH")
            .unwrap();
        assert_eq!(series, vec![(d, 1712.5)]);
    }

    #[test]
    fn versions_are_strictly_monotone() {
        let ods = store();
        let a = ods.next_version();
        let b = ods.next_version();
        let c = ods.next_version();
        assert!(a < b && b < c);
    }

    #[test]
    fn present_dates_and_latest() {
        let ods = store();
        ods.upsert_batch(
            "ods_t",
            &[
                row("a", "20260108", 1.0),
                row("a", "20260109", 2.0),
                row("b", "20260109", 3.0),
            ],
        )
        .unwrap();

        let dates = ods.present_dates("ods_t", "trade_date").unwrap();
        assert_eq!(dates.len(), 2);
        assert_eq!(
            ods.latest_date("ods_t", "trade_date").unwrap(),
            NaiveDate::from_ymd_opt(2026, 1, 9)
        );
        assert!(ods
            .has_date("ods_t", "trade_date", NaiveDate::from_ymd_opt(2026, 1, 8).unwrap())
            .unwrap());
        assert!(!ods
            .has_date("ods_t", "trade_date", NaiveDate::from_ymd_opt(2026, 1, 7).unwrap())
            .unwrap());
    }

    #[test]
    fn missing_table_reads_are_empty() {
        let ods = store();
        assert!(ods.present_dates("ods_ghost", "trade_date").unwrap().is_empty());
        assert_eq!(ods.latest_date("ods_ghost", "trade_date").unwrap(), None);
    }
}
