//! SQLite daily bar store (`prices.sqlite`)
//!
//! Bars are keyed by `(date, sid)`. The calendar the bars were written
//! against is persisted in `properties` and every reader-side notion of
//! "sessions" is derived from it.

use crate::calendar::{get_calendar, TradingCalendar};
use crate::data::bar_reader::SessionBarReader;
use crate::error::{PipelineError, Result};
use crate::sql::{configure_connection, table_exists, DEFAULT_MAX_COLUMNS};
use crate::types::{fmt_date, parse_date, DailyBar, PriceField, Sid};
use chrono::NaiveDate;
use hashbrown::{HashMap, HashSet};
use ndarray::Array2;
use polars::prelude::{DataFrame, DataType};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS properties (
    key TEXT PRIMARY KEY,
    value TEXT
);
CREATE TABLE IF NOT EXISTS prices (
    date TEXT NOT NULL,
    sid INTEGER NOT NULL,
    open REAL,
    high REAL,
    low REAL,
    close REAL,
    volume REAL,
    PRIMARY KEY (date, sid)
);
CREATE INDEX IF NOT EXISTS ix_prices_sid_date ON prices (sid, date);
"#;

const CALENDAR_KEY: &str = "calendar_name";

/// Writer for daily OHLCV bars
pub struct SQLiteDailyBarWriter {
    conn: Connection,
    calendar: Arc<dyn TradingCalendar>,
    start_session: NaiveDate,
    end_session: NaiveDate,
}

impl SQLiteDailyBarWriter {
    /// Open (creating if needed) a bar store that accepts sessions in
    /// `[start_session, end_session]`
    pub fn new(
        path: &Path,
        calendar: Arc<dyn TradingCalendar>,
        start_session: NaiveDate,
        end_session: NaiveDate,
    ) -> Result<Self> {
        let conn = Connection::open(path)?;
        configure_connection(&conn)?;
        Self::from_connection(conn, calendar, start_session, end_session)
    }

    pub fn from_connection(
        conn: Connection,
        calendar: Arc<dyn TradingCalendar>,
        start_session: NaiveDate,
        end_session: NaiveDate,
    ) -> Result<Self> {
        if start_session != end_session {
            for (label, session) in [("Start", start_session), ("End", end_session)] {
                if !calendar.is_session(session) {
                    return Err(PipelineError::InvalidBarData(format!(
                        "{} session {} is not a {} session",
                        label,
                        session,
                        calendar.name()
                    )));
                }
            }
        }
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn,
            calendar,
            start_session,
            end_session,
        })
    }

    pub fn into_connection(self) -> Connection {
        self.conn
    }

    /// Write a frame with columns `date, sid, open, high, low, close, volume`
    ///
    /// The frame is validated as a whole before anything is written: missing
    /// columns, null keys, duplicated `(date, sid)` pairs and dates that are
    /// not sessions reject the write.
    pub fn write(&mut self, data: &DataFrame) -> Result<usize> {
        let bars = frame_to_bars(data)?;
        self.write_bars(&bars)
    }

    /// Upsert typed bars
    pub fn write_bars(&mut self, bars: &[DailyBar]) -> Result<usize> {
        self.validate(bars)?;

        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT OR REPLACE INTO properties (key, value) VALUES (?1, ?2)",
            params![CALENDAR_KEY, self.calendar.name()],
        )?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO prices (date, sid, open, high, low, close, volume)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;
            for bar in bars {
                stmt.execute(params![
                    fmt_date(bar.date),
                    bar.sid as i64,
                    bar.open,
                    bar.high,
                    bar.low,
                    bar.close,
                    bar.volume,
                ])?;
            }
        }
        tx.commit()?;
        log::info!("Inserted {} daily bars", bars.len());
        Ok(bars.len())
    }

    fn validate(&self, bars: &[DailyBar]) -> Result<()> {
        let mut seen = HashSet::with_capacity(bars.len());
        for bar in bars {
            if !seen.insert((bar.date, bar.sid)) {
                return Err(PipelineError::InvalidBarData(format!(
                    "duplicate (date, sid) = ({}, {})",
                    bar.date, bar.sid
                )));
            }
            if !self.calendar.is_session(bar.date) {
                return Err(PipelineError::InvalidBarData(format!(
                    "{} is not a {} session (sid {})",
                    bar.date,
                    self.calendar.name(),
                    bar.sid
                )));
            }
            if bar.date < self.start_session || bar.date > self.end_session {
                return Err(PipelineError::InvalidBarData(format!(
                    "{} is outside [{}, {}] (sid {})",
                    bar.date, self.start_session, self.end_session, bar.sid
                )));
            }
            if !bar.is_consistent() {
                log::warn!(
                    "Inconsistent OHLCV for sid {} on {}: {:?}",
                    bar.sid,
                    bar.date,
                    bar
                );
            }
        }
        Ok(())
    }
}

/// Convert a `(date, sid)`-keyed polars frame into bars
pub fn frame_to_bars(data: &DataFrame) -> Result<Vec<DailyBar>> {
    for name in ["date", "sid", "open", "high", "low", "close", "volume"] {
        if data.column(name).is_err() {
            return Err(PipelineError::InvalidBarData(format!(
                "frame must have columns [date, sid, open, high, low, close, volume]; missing '{}'",
                name
            )));
        }
    }
    for key in ["date", "sid"] {
        if data.column(key)?.null_count() > 0 {
            return Err(PipelineError::InvalidBarData(format!(
                "index column '{}' contains nulls",
                key
            )));
        }
    }

    let dates = data.column("date")?.cast(&DataType::String)?;
    let dates = dates.str()?;
    let sids = data.column("sid")?.cast(&DataType::Int64)?;
    let sids = sids.i64()?;
    let mut values = Vec::with_capacity(5);
    for field in PriceField::ALL {
        values.push(data.column(field.column())?.cast(&DataType::Float64)?);
    }
    let columns = values
        .iter()
        .map(|s| s.f64())
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut bars = Vec::with_capacity(data.height());
    for i in 0..data.height() {
        let date = dates
            .get(i)
            .ok_or_else(|| PipelineError::InvalidBarData(format!("null date in row {}", i)))?;
        let sid = sids
            .get(i)
            .ok_or_else(|| PipelineError::InvalidBarData(format!("null sid in row {}", i)))?;
        if sid < 0 {
            return Err(PipelineError::InvalidBarData(format!("negative sid {} in row {}", sid, i)));
        }
        let field = |k: usize| columns[k].get(i).unwrap_or(f64::NAN);
        bars.push(DailyBar::new(
            parse_date(date)?,
            sid as Sid,
            field(0),
            field(1),
            field(2),
            field(3),
            field(4),
        ));
    }
    Ok(bars)
}

/// Ingestion-time gap filling.
///
/// For every sid, sessions between its first and last bar that have no bar
/// get one carrying the previous close in all price fields and zero volume.
pub fn fill_missing_sessions(bars: &[DailyBar], calendar: &dyn TradingCalendar) -> Vec<DailyBar> {
    let mut by_sid: HashMap<Sid, Vec<DailyBar>> = HashMap::new();
    for bar in bars {
        by_sid.entry(bar.sid).or_insert_with(Vec::new).push(*bar);
    }
    let mut sids: Vec<Sid> = by_sid.keys().copied().collect();
    sids.sort_unstable();

    let mut out = Vec::with_capacity(bars.len());
    for sid in sids {
        let Some(mut rows) = by_sid.remove(&sid) else { continue };
        rows.sort_by_key(|b| b.date);
        let (first, last) = (rows[0].date, rows[rows.len() - 1].date);
        let mut cursor = 0;
        let mut prev: Option<DailyBar> = None;
        for &session in calendar.sessions_in_range(first, last) {
            while cursor < rows.len() && rows[cursor].date < session {
                cursor += 1;
            }
            if cursor < rows.len() && rows[cursor].date == session {
                prev = Some(rows[cursor]);
                out.push(rows[cursor]);
            } else if let Some(p) = prev {
                log::debug!("Forward filling sid {} on {}", sid, session);
                out.push(DailyBar::new(session, sid, p.close, p.close, p.close, p.close, 0.0));
            }
        }
    }
    out
}

/// Reader for bars written by [`SQLiteDailyBarWriter`]
pub struct SQLiteDailyBarReader {
    conn: Mutex<Connection>,
    calendar: Arc<dyn TradingCalendar>,
    max_columns: usize,
}

impl SQLiteDailyBarReader {
    /// Open a store; the calendar is resolved from `properties` unless given
    pub fn open(path: &Path, calendar: Option<Arc<dyn TradingCalendar>>) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn, calendar)
    }

    pub fn from_connection(conn: Connection, calendar: Option<Arc<dyn TradingCalendar>>) -> Result<Self> {
        let calendar = match calendar {
            Some(calendar) => calendar,
            None => {
                let name = stored_calendar_name(&conn)?.ok_or_else(|| {
                    PipelineError::CalendarError("No trading calendar defined.".to_string())
                })?;
                get_calendar(&name)?
            }
        };
        Ok(Self {
            conn: Mutex::new(conn),
            calendar,
            max_columns: DEFAULT_MAX_COLUMNS,
        })
    }

    /// Limit the number of result columns of a single pivot query
    pub fn with_max_columns(mut self, max_columns: usize) -> Self {
        self.max_columns = max_columns.max(1);
        self
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| PipelineError::LockPoisoned("daily bar connection"))
    }

    fn first_date_of(&self, conn: &Connection, sid: Sid) -> Result<Option<NaiveDate>> {
        let first: Option<String> = conn.query_row(
            "SELECT MIN(date) FROM prices WHERE sid = ?1",
            [sid as i64],
            |row| row.get(0),
        )?;
        first.map(|d| parse_date(&d)).transpose()
    }

    /// Fingerprint of the stored bars, mixed into term cache keys
    pub fn data_stamp(&self) -> Result<String> {
        let conn = self.conn()?;
        let (count, last): (i64, Option<String>) = conn.query_row(
            "SELECT COUNT(*), MAX(date) FROM prices",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok(format!("bars={}:{}", count, last.unwrap_or_default()))
    }
}

fn stored_calendar_name(conn: &Connection) -> Result<Option<String>> {
    if !table_exists(conn, "properties")? {
        return Ok(None);
    }
    let name = conn
        .query_row(
            "SELECT value FROM properties WHERE key = ?1",
            [CALENDAR_KEY],
            |row| row.get(0),
        )
        .optional()?;
    Ok(name)
}

impl SessionBarReader for SQLiteDailyBarReader {
    fn trading_calendar(&self) -> Arc<dyn TradingCalendar> {
        Arc::clone(&self.calendar)
    }

    fn load_raw_arrays(
        &self,
        fields: &[PriceField],
        start: NaiveDate,
        end: NaiveDate,
        sids: &[Sid],
    ) -> Result<Vec<Array2<f64>>> {
        let sessions = self.calendar.sessions_in_range(start, end);
        let mut out: Vec<Array2<f64>> = fields
            .iter()
            .map(|_| Array2::from_elem((sessions.len(), sids.len()), f64::NAN))
            .collect();
        if sessions.is_empty() || sids.is_empty() || fields.is_empty() {
            return Ok(out);
        }
        let row_of: HashMap<String, usize> = sessions
            .iter()
            .enumerate()
            .map(|(i, d)| (fmt_date(*d), i))
            .collect();

        // Each pivot query yields fields × chunk columns
        let per_query = (self.max_columns / fields.len()).max(1);
        let conn = self.conn()?;
        for (chunk_idx, chunk) in sids.chunks(per_query).enumerate() {
            let offset = chunk_idx * per_query;
            let mut projection = Vec::with_capacity(fields.len() * chunk.len());
            for field in fields {
                for sid in chunk {
                    projection.push(format!(
                        "MAX(CASE WHEN sid = {} THEN {} END)",
                        sid,
                        field.column()
                    ));
                }
            }
            let id_list = chunk
                .iter()
                .map(|s| s.to_string())
                .collect::<Vec<_>>()
                .join(",");
            let sql = format!(
                "SELECT date, {} FROM prices WHERE date >= ?1 AND date <= ?2 AND sid IN ({}) GROUP BY date",
                projection.join(", "),
                id_list
            );
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query(params![fmt_date(sessions[0]), fmt_date(sessions[sessions.len() - 1])])?;
            while let Some(row) = rows.next()? {
                let date: String = row.get(0)?;
                let Some(&i) = row_of.get(date.get(..10).unwrap_or(&date)) else {
                    continue;
                };
                for (f, _) in fields.iter().enumerate() {
                    for (k, _) in chunk.iter().enumerate() {
                        let v: Option<f64> = row.get(1 + f * chunk.len() + k)?;
                        if let Some(v) = v {
                            out[f][[i, offset + k]] = v;
                        }
                    }
                }
            }
        }
        Ok(out)
    }

    fn get_value(&self, sid: Sid, date: NaiveDate, field: PriceField) -> Result<f64> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM prices WHERE sid = ?1 AND date = ?2",
            field.column()
        );
        let found: Option<Option<f64>> = conn
            .query_row(&sql, params![sid as i64, fmt_date(date)], |row| row.get(0))
            .optional()?;
        if let Some(value) = found {
            return Ok(value.unwrap_or(f64::NAN));
        }
        match self.first_date_of(&conn, sid)? {
            None => Err(PipelineError::SidNotFound(sid)),
            Some(first) if first > date => Err(PipelineError::NoDataBeforeDate { sid, date }),
            Some(_) => Err(PipelineError::NoDataOnDate { sid, date }),
        }
    }

    fn get_last_traded_dt(&self, sid: Sid, date: NaiveDate) -> Result<Option<NaiveDate>> {
        let conn = self.conn()?;
        let last: Option<String> = conn.query_row(
            "SELECT MAX(date) FROM prices WHERE sid = ?1 AND date <= ?2",
            params![sid as i64, fmt_date(date)],
            |row| row.get(0),
        )?;
        match last {
            Some(last) => Ok(Some(parse_date(&last)?)),
            None if self.first_date_of(&conn, sid)?.is_some() => Ok(None),
            None => Err(PipelineError::SidNotFound(sid)),
        }
    }

    fn last_available_dt(&self) -> Result<Option<NaiveDate>> {
        let conn = self.conn()?;
        let last: Option<String> = conn.query_row("SELECT MAX(date) FROM prices", [], |row| row.get(0))?;
        last.map(|d| parse_date(&d)).transpose()
    }

    fn first_trading_day(&self) -> Result<Option<NaiveDate>> {
        let conn = self.conn()?;
        let first: Option<String> = conn.query_row("SELECT MIN(date) FROM prices", [], |row| row.get(0))?;
        first.map(|d| parse_date(&d)).transpose()
    }
}
