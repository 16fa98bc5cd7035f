//! Local price history: daily closes in SQLite, imported from CSV
//!
//! Serves [`MarketData`] for the outcome tracker without any network access.

use crate::error::{EngineError, Result};
use crate::outcome::MarketData;
use crate::types::Horizon;
use chrono::{Days, NaiveDate};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, info};

/// Latest calendar day after a window start that still counts as its entry
/// close (weekends and market holidays)
pub const ENTRY_TOLERANCE_DAYS: u64 = 5;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS prices (
    subject_id TEXT NOT NULL,
    date TEXT NOT NULL,             -- YYYY-MM-DD
    close REAL NOT NULL,
    PRIMARY KEY (subject_id, date)
);
"#;

pub struct PriceHistory {
    conn: Mutex<Connection>,
}

impl PriceHistory {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Insert or replace closes for one subject
    pub fn upsert_closes(&self, subject_id: &str, closes: &[(NaiveDate, f64)]) -> Result<usize> {
        let conn = self.conn();
        let tx = conn.unchecked_transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO prices (subject_id, date, close) VALUES (?1, ?2, ?3)",
            )?;
            for (date, close) in closes {
                stmt.execute(params![subject_id, date.format("%Y-%m-%d").to_string(), close])?;
            }
        }
        tx.commit()?;
        Ok(closes.len())
    }

    /// Import a `date,close` CSV (header optional) for one subject.
    pub fn import_csv(&self, subject_id: &str, csv: &str) -> Result<usize> {
        let closes = parse_closes(csv)?;
        let n = self.upsert_closes(subject_id, &closes)?;
        info!(subject = subject_id, rows = n, "prices imported");
        Ok(n)
    }

    pub fn import_csv_file(&self, subject_id: &str, path: &Path) -> Result<usize> {
        let text = std::fs::read_to_string(path)?;
        self.import_csv(subject_id, &text)
    }

    /// Percent change from the first close on/after `start` to the last close
    /// on/before `end`.
    ///
    /// `None` unless the series covers the whole window: it must reach `end`
    /// and have an entry close within [`ENTRY_TOLERANCE_DAYS`] of `start`.
    pub fn return_between(&self, subject_id: &str, start: NaiveDate, end: NaiveDate) -> Result<Option<f64>> {
        let conn = self.conn();
        let start_s = start.format("%Y-%m-%d").to_string();
        let end_s = end.format("%Y-%m-%d").to_string();

        let latest: Option<String> = conn.query_row(
            "SELECT MAX(date) FROM prices WHERE subject_id = ?1",
            [subject_id],
            |row| row.get(0),
        )?;
        match latest {
            Some(ref d) if d.as_str() >= end_s.as_str() => {}
            _ => {
                debug!(subject = subject_id, %end, "price series does not reach window end");
                return Ok(None);
            }
        }

        let entry_limit = start
            .checked_add_days(Days::new(ENTRY_TOLERANCE_DAYS))
            .map_or(end, |d| d.min(end));
        let entry: Option<f64> = conn
            .query_row(
                "SELECT close FROM prices WHERE subject_id = ?1 AND date >= ?2 AND date <= ?3
                 ORDER BY date ASC LIMIT 1",
                params![subject_id, start_s, entry_limit.format("%Y-%m-%d").to_string()],
                |row| row.get(0),
            )
            .optional()?;
        if entry.is_none() {
            debug!(subject = subject_id, %start, "no entry close near window start");
            return Ok(None);
        }
        let exit: Option<f64> = conn
            .query_row(
                "SELECT close FROM prices WHERE subject_id = ?1 AND date >= ?2 AND date <= ?3
                 ORDER BY date DESC LIMIT 1",
                params![subject_id, start_s, end_s],
                |row| row.get(0),
            )
            .optional()?;

        match (entry, exit) {
            (Some(entry), Some(exit)) if entry > 0.0 => Ok(Some((exit / entry - 1.0) * 100.0)),
            _ => Ok(None),
        }
    }

    pub fn count_closes(&self, subject_id: &str) -> Result<usize> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM prices WHERE subject_id = ?1",
            [subject_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}

impl MarketData for PriceHistory {
    fn return_over_horizon(
        &self,
        subject_id: &str,
        start: NaiveDate,
        horizon: Horizon,
    ) -> anyhow::Result<Option<f64>> {
        let Some(end) = horizon.window_end(start) else {
            return Ok(None);
        };
        Ok(self.return_between(subject_id, start, end)?)
    }
}

fn parse_closes(csv: &str) -> Result<Vec<(NaiveDate, f64)>> {
    let mut closes = Vec::new();
    for (lineno, line) in csv.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut fields = line.split(',').map(str::trim);
        let (Some(date), Some(close)) = (fields.next(), fields.next()) else {
            return Err(EngineError::InvalidRecord(format!(
                "line {}: expected date,close",
                lineno + 1
            )));
        };

        let Ok(date) = NaiveDate::parse_from_str(date, "%Y-%m-%d") else {
            if lineno == 0 {
                continue; // header
            }
            return Err(EngineError::InvalidRecord(format!(
                "line {}: bad date '{}'",
                lineno + 1,
                date
            )));
        };
        let close: f64 = close.parse().map_err(|_| {
            EngineError::InvalidRecord(format!("line {}: bad close '{}'", lineno + 1, close))
        })?;
        closes.push((date, close));
    }
    Ok(closes)
}
