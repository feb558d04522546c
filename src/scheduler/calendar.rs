//! Trading-calendar view.
//!
//! Backed by the `trade_cal` ODS table when it has been ingested; before
//! that (fresh deployments, tests) Monday-Friday is the working
//! approximation so the scheduler is never wedged on its own bootstrap.

use chrono::{Datelike, NaiveDate, Weekday};

use crate::error::Result;
use crate::models::{format_trade_date, parse_trade_date};
use crate::store::MetaDb;

pub const CALENDAR_TABLE: &str = "ods_trade_cal";

pub struct TradingCalendar {
    db: MetaDb,
}

impl TradingCalendar {
    pub fn new(db: MetaDb) -> Self {
        Self { db }
    }

    fn table_ready(&self) -> Result<bool> {
        let n: i64 = self.db.conn().query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [CALENDAR_TABLE],
            |r| r.get(0),
        )?;
        if n == 0 {
            return Ok(false);
        }
        let rows: i64 = self
            .db
            .conn()
            .query_row(&format!("SELECT COUNT(*) FROM {CALENDAR_TABLE}"), [], |r| {
                r.get(0)
            })?;
        Ok(rows > 0)
    }

    /// Open trading days in `[start, end]`, ascending.
    pub fn trading_days(&self, start: NaiveDate, end: NaiveDate) -> Result<Vec<NaiveDate>> {
        if start > end {
            return Ok(Vec::new());
        }
        if !self.table_ready()? {
            return Ok(weekdays(start, end));
        }

        let conn = self.db.conn();

        // A window the ingested calendar does not reach falls back to the
        // weekday rule; a covered window with zero open days stays empty.
        let covered: i64 = conn.query_row(
            &format!(
                "SELECT COUNT(*) FROM {CALENDAR_TABLE}
                 WHERE cal_date >= ?1 AND cal_date <= ?2"
            ),
            [format_trade_date(start), format_trade_date(end)],
            |r| r.get(0),
        )?;
        if covered == 0 {
            return Ok(weekdays(start, end));
        }

        // Last version wins per (exchange, cal_date); a day is open if its
        // latest calendar row says so.
        let mut stmt = conn.prepare(&format!(
            "SELECT cal_date FROM (
                 SELECT cal_date, is_open,
                        ROW_NUMBER() OVER (
                            PARTITION BY exchange, cal_date ORDER BY _version DESC
                        ) AS rn
                 FROM {CALENDAR_TABLE}
                 WHERE cal_date >= ?1 AND cal_date <= ?2
             ) WHERE rn = 1 AND is_open = 1
             ORDER BY cal_date"
        ))?;
        let rows = stmt.query_map(
            [format_trade_date(start), format_trade_date(end)],
            |r| r.get::<_, String>(0),
        )?;

        Ok(rows
            .filter_map(|r| r.ok())
            .filter_map(|s| parse_trade_date(&s))
            .collect())
    }

    pub fn is_trading_day(&self, date: NaiveDate) -> Result<bool> {
        Ok(self.trading_days(date, date)?.first() == Some(&date))
    }

    /// The most recent trading day at or before `date`.
    pub fn latest_trading_day(&self, date: NaiveDate) -> Result<Option<NaiveDate>> {
        let start = date - chrono::Duration::days(30);
        Ok(self.trading_days(start, date)?.last().copied())
    }
}

fn weekdays(start: NaiveDate, end: NaiveDate) -> Vec<NaiveDate> {
    let mut days = Vec::new();
    let mut d = start;
    while d <= end {
        if !matches!(d.weekday(), Weekday::Sat | Weekday::Sun) {
            days.push(d);
        }
        d += chrono::Duration::days(1);
    }
    days
}
