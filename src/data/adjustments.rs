//! Data adjustments for corporate actions (splits, dividends, mergers)
//!
//! Raw bars are never rewritten. Instead every action is stored as a
//! backward multiplicative ratio effective on a session; readers turn the
//! ratios that fall inside a query window into [`Adjustment`]s that an
//! `AdjustedArray` applies lazily per window.
//!
//! Ratios follow the usual convention: a 2-for-1 split on day D is stored as
//! `0.5`, and prices before D are multiplied by it. Volume is only adjusted
//! for splits, by the inverse ratio.

use crate::calendar::TradingCalendar;
use crate::data::bar_reader::SessionBarReader;
use crate::error::{PipelineError, Result};
use crate::sql::{configure_connection, placeholders};
use crate::types::{fmt_date, parse_date, PriceField, Sid};
use chrono::NaiveDate;
use hashbrown::HashMap;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Mutex;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS splits (
    effective_date TEXT NOT NULL,
    ratio REAL NOT NULL,
    sid INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS ix_splits_sid ON splits (sid);
CREATE INDEX IF NOT EXISTS ix_splits_effective_date ON splits (effective_date);

CREATE TABLE IF NOT EXISTS mergers (
    effective_date TEXT NOT NULL,
    ratio REAL NOT NULL,
    sid INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS ix_mergers_sid ON mergers (sid);
CREATE INDEX IF NOT EXISTS ix_mergers_effective_date ON mergers (effective_date);

CREATE TABLE IF NOT EXISTS dividends (
    effective_date TEXT NOT NULL,
    ratio REAL NOT NULL,
    sid INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS ix_dividends_sid ON dividends (sid);
CREATE INDEX IF NOT EXISTS ix_dividends_effective_date ON dividends (effective_date);

CREATE TABLE IF NOT EXISTS dividend_payouts (
    sid INTEGER NOT NULL,
    ex_date TEXT NOT NULL,
    declared_date TEXT,
    record_date TEXT,
    pay_date TEXT,
    amount REAL NOT NULL
);
CREATE INDEX IF NOT EXISTS ix_dividend_payouts_sid ON dividend_payouts (sid);

CREATE TABLE IF NOT EXISTS stock_dividend_payouts (
    sid INTEGER NOT NULL,
    ex_date TEXT NOT NULL,
    declared_date TEXT,
    record_date TEXT,
    pay_date TEXT,
    payment_sid INTEGER NOT NULL,
    ratio REAL NOT NULL
);
CREATE INDEX IF NOT EXISTS ix_stock_dividend_payouts_sid ON stock_dividend_payouts (sid);
"#;

/// Kind of ratio adjustment, one table each
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AdjustmentKind {
    Split,
    Merger,
    Dividend,
}

impl AdjustmentKind {
    pub const ALL: [AdjustmentKind; 3] = [
        AdjustmentKind::Split,
        AdjustmentKind::Merger,
        AdjustmentKind::Dividend,
    ];

    fn table(&self) -> &'static str {
        match self {
            AdjustmentKind::Split => "splits",
            AdjustmentKind::Merger => "mergers",
            AdjustmentKind::Dividend => "dividends",
        }
    }
}

/// Backward ratio effective on a session
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RatioAdjustment {
    pub sid: Sid,
    pub effective_date: NaiveDate,
    pub ratio: f64,
}

impl RatioAdjustment {
    pub fn new(sid: Sid, effective_date: NaiveDate, ratio: f64) -> Self {
        Self {
            sid,
            effective_date,
            ratio,
        }
    }
}

/// Cash dividend as announced
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CashDividend {
    pub sid: Sid,
    pub ex_date: NaiveDate,
    pub declared_date: Option<NaiveDate>,
    pub record_date: Option<NaiveDate>,
    pub pay_date: Option<NaiveDate>,
    pub amount: f64,
}

impl CashDividend {
    pub fn new(sid: Sid, ex_date: NaiveDate, amount: f64) -> Self {
        Self {
            sid,
            ex_date,
            declared_date: None,
            record_date: None,
            pay_date: None,
            amount,
        }
    }
}

/// Dividend paid in shares of `payment_sid`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StockDividend {
    pub sid: Sid,
    pub ex_date: NaiveDate,
    pub declared_date: Option<NaiveDate>,
    pub record_date: Option<NaiveDate>,
    pub pay_date: Option<NaiveDate>,
    pub payment_sid: Sid,
    pub ratio: f64,
}

/// A dividend whose ratio could not be trusted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlaggedDividend {
    pub dividend: CashDividend,
    pub previous_close: f64,
    pub ratio: f64,
}

/// Outcome of [`calc_dividend_ratios`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DividendRatios {
    /// Usable ratios, one per `(sid, ex_date)`
    pub ratios: Vec<RatioAdjustment>,
    /// Non-positive ratios; usually the dividend exceeds the price
    pub flagged: Vec<FlaggedDividend>,
    /// Dividends without a usable previous close
    pub skipped: Vec<CashDividend>,
}

/// Backward ratio per dividend: `1 - amount / previous_close`, where the
/// previous close is the close of the session before the ex date.
///
/// A zero, NaN or missing previous close is logged and the dividend skipped.
/// Non-positive ratios are logged as errors and returned in `flagged`
/// rather than written.
pub fn calc_dividend_ratios(
    dividends: &[CashDividend],
    bars: &dyn SessionBarReader,
) -> Result<DividendRatios> {
    let calendar = bars.trading_calendar();
    let mut out = DividendRatios::default();
    for dividend in dividends {
        let previous_close = previous_close(dividend, calendar.as_ref(), bars)?;
        let Some(previous_close) = previous_close.filter(|c| !c.is_nan() && *c != 0.0) else {
            log::warn!(
                "Couldn't compute ratio for dividend sid={}, ex_date={}, amount={}: no previous close",
                dividend.sid,
                dividend.ex_date,
                dividend.amount
            );
            out.skipped.push(*dividend);
            continue;
        };
        let ratio = 1.0 - dividend.amount / previous_close;
        if ratio <= 0.0 {
            log::error!(
                "Dividend ratio <= 0 for sid={}, ex_date={}, amount={}, previous_close={}",
                dividend.sid,
                dividend.ex_date,
                dividend.amount,
                previous_close
            );
            out.flagged.push(FlaggedDividend {
                dividend: *dividend,
                previous_close,
                ratio,
            });
            continue;
        }
        out.ratios
            .push(RatioAdjustment::new(dividend.sid, dividend.ex_date, ratio));
    }
    Ok(out)
}

fn previous_close(
    dividend: &CashDividend,
    calendar: &dyn TradingCalendar,
    bars: &dyn SessionBarReader,
) -> Result<Option<f64>> {
    let Ok(session) = calendar.previous_session(dividend.ex_date) else {
        return Ok(None);
    };
    match bars.get_value(dividend.sid, session, PriceField::Close) {
        Ok(close) => Ok(Some(close)),
        Err(PipelineError::SidNotFound(_))
        | Err(PipelineError::NoDataBeforeDate { .. })
        | Err(PipelineError::NoDataOnDate { .. }) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Writer for `adjustments.sqlite`
pub struct SQLiteAdjustmentWriter {
    conn: Connection,
}

impl SQLiteAdjustmentWriter {
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        configure_connection(&conn)?;
        Self::from_connection(conn)
    }

    pub fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    pub fn into_connection(self) -> Connection {
        self.conn
    }

    /// Write every kind of action. Cash dividends are converted to ratios
    /// against `bars`; the returned summary lists the flagged ones.
    pub fn write(
        &mut self,
        splits: &[RatioAdjustment],
        mergers: &[RatioAdjustment],
        dividends: &[CashDividend],
        stock_dividends: &[StockDividend],
        bars: &dyn SessionBarReader,
    ) -> Result<DividendRatios> {
        let dividend_ratios = calc_dividend_ratios(dividends, bars)?;
        let tx = self.conn.transaction()?;
        for (kind, rows) in [
            (AdjustmentKind::Split, splits),
            (AdjustmentKind::Merger, mergers),
            (AdjustmentKind::Dividend, dividend_ratios.ratios.as_slice()),
        ] {
            let sql = format!(
                "INSERT INTO {} (effective_date, ratio, sid) VALUES (?1, ?2, ?3)",
                kind.table()
            );
            let mut stmt = tx.prepare(&sql)?;
            for row in rows {
                if row.ratio.is_nan() || row.ratio <= 0.0 {
                    log::warn!(
                        "Skipping {:?} with non-positive ratio {} for sid {} on {}",
                        kind,
                        row.ratio,
                        row.sid,
                        row.effective_date
                    );
                    continue;
                }
                stmt.execute(params![fmt_date(row.effective_date), row.ratio, row.sid as i64])?;
            }
        }
        {
            let mut stmt = tx.prepare(
                "INSERT INTO dividend_payouts (sid, ex_date, declared_date, record_date, pay_date, amount)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for d in dividends {
                stmt.execute(params![
                    d.sid as i64,
                    fmt_date(d.ex_date),
                    d.declared_date.map(fmt_date),
                    d.record_date.map(fmt_date),
                    d.pay_date.map(fmt_date),
                    d.amount,
                ])?;
            }
            let mut stmt = tx.prepare(
                "INSERT INTO stock_dividend_payouts
                 (sid, ex_date, declared_date, record_date, pay_date, payment_sid, ratio)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;
            for d in stock_dividends {
                stmt.execute(params![
                    d.sid as i64,
                    fmt_date(d.ex_date),
                    d.declared_date.map(fmt_date),
                    d.record_date.map(fmt_date),
                    d.pay_date.map(fmt_date),
                    d.payment_sid as i64,
                    d.ratio,
                ])?;
            }
        }
        tx.commit()?;
        log::info!(
            "Wrote {} splits, {} mergers, {} dividend ratios ({} flagged, {} skipped)",
            splits.len(),
            mergers.len(),
            dividend_ratios.ratios.len(),
            dividend_ratios.flagged.len(),
            dividend_ratios.skipped.len()
        );
        Ok(dividend_ratios)
    }
}

/// Multiply rows `[0, row)` of column `col` by `value`, visible only to
/// windows whose last row is at or after `row`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Adjustment {
    pub row: usize,
    pub col: usize,
    pub value: f64,
}

/// Adjustments for one query window, split by what they apply to
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WindowAdjustments {
    pub prices: Vec<Adjustment>,
    pub volume: Vec<Adjustment>,
}

impl WindowAdjustments {
    pub fn for_field(&self, field: PriceField) -> &[Adjustment] {
        if field.is_price() {
            &self.prices
        } else {
            &self.volume
        }
    }
}

/// Reader for `adjustments.sqlite`
pub struct SQLiteAdjustmentReader {
    conn: Mutex<Connection>,
}

impl SQLiteAdjustmentReader {
    pub fn open(path: &Path) -> Result<Self> {
        Self::from_connection(Connection::open(path)?)
    }

    pub fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| PipelineError::LockPoisoned("adjustment connection"))
    }

    /// All stored ratios of one kind for `sid`, by effective date
    pub fn get_adjustments_for_sid(&self, kind: AdjustmentKind, sid: Sid) -> Result<Vec<(NaiveDate, f64)>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT effective_date, ratio FROM {} WHERE sid = ?1 ORDER BY effective_date",
            kind.table()
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([sid as i64], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (date, ratio) = row?;
            out.push((parse_date(&date)?, ratio));
        }
        Ok(out)
    }

    /// Cash dividends going ex on `date`
    pub fn get_dividends_with_ex_date(&self, date: NaiveDate) -> Result<Vec<CashDividend>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT sid, amount, declared_date, record_date, pay_date FROM dividend_payouts WHERE ex_date = ?1",
        )?;
        let rows = stmt.query_map([fmt_date(date)], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, f64>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, Option<String>>(4)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (sid, amount, declared, record, pay) = row?;
            let mut dividend = CashDividend::new(sid as Sid, date, amount);
            dividend.declared_date = declared.map(|d| parse_date(&d)).transpose()?;
            dividend.record_date = record.map(|d| parse_date(&d)).transpose()?;
            dividend.pay_date = pay.map(|d| parse_date(&d)).transpose()?;
            out.push(dividend);
        }
        Ok(out)
    }

    /// Adjustments that take effect strictly inside `dates` for the given
    /// sids. An action effective on a non-session applies from the next
    /// session; one effective on or before `dates[0]` has no earlier row in
    /// the window and is dropped.
    pub fn load_adjustments(
        &self,
        dates: &[NaiveDate],
        sids: &[Sid],
        include_splits: bool,
        include_mergers: bool,
        include_dividends: bool,
    ) -> Result<WindowAdjustments> {
        let mut out = WindowAdjustments::default();
        let (Some(first), Some(last)) = (dates.first(), dates.last()) else {
            return Ok(out);
        };
        if sids.is_empty() {
            return Ok(out);
        }
        let col_of: HashMap<Sid, usize> = sids.iter().enumerate().map(|(i, s)| (*s, i)).collect();
        let conn = self.conn()?;
        for kind in AdjustmentKind::ALL {
            let wanted = match kind {
                AdjustmentKind::Split => include_splits,
                AdjustmentKind::Merger => include_mergers,
                AdjustmentKind::Dividend => include_dividends,
            };
            if !wanted {
                continue;
            }
            for chunk in sids.chunks(crate::sql::MAX_SQL_PARAMS) {
                let sql = format!(
                    "SELECT sid, effective_date, ratio FROM {}
                     WHERE effective_date > ? AND effective_date <= ? AND sid IN ({})
                     ORDER BY effective_date",
                    kind.table(),
                    placeholders(chunk.len())
                );
                let mut bind = vec![Value::Text(fmt_date(*first)), Value::Text(fmt_date(*last))];
                bind.extend(chunk.iter().map(|s| Value::Integer(*s as i64)));
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map(params_from_iter(bind.iter()), |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, f64>(2)?,
                    ))
                })?;
                for row in rows {
                    let (sid, date, ratio) = row?;
                    let effective = parse_date(&date)?;
                    let row_idx = dates.partition_point(|d| *d < effective);
                    let Some(&col) = col_of.get(&(sid as Sid)) else { continue };
                    if row_idx == 0 || row_idx >= dates.len() {
                        continue;
                    }
                    out.prices.push(Adjustment {
                        row: row_idx,
                        col,
                        value: ratio,
                    });
                    if kind == AdjustmentKind::Split {
                        out.volume.push(Adjustment {
                            row: row_idx,
                            col,
                            value: 1.0 / ratio,
                        });
                    }
                }
            }
        }
        out.prices.sort_by_key(|a| (a.row, a.col));
        out.volume.sort_by_key(|a| (a.row, a.col));
        Ok(out)
    }

    /// Fingerprint of the stored actions, mixed into term cache keys
    pub fn data_stamp(&self) -> Result<String> {
        let conn = self.conn()?;
        let mut parts = Vec::with_capacity(3);
        for kind in AdjustmentKind::ALL {
            let (count, last): (i64, Option<String>) = conn.query_row(
                &format!("SELECT COUNT(*), MAX(effective_date) FROM {}", kind.table()),
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            parts.push(format!("{}={}:{}", kind.table(), count, last.unwrap_or_default()));
        }
        Ok(parts.join(";"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::NYSECalendar;
    use crate::data::daily_bars::{SQLiteDailyBarReader, SQLiteDailyBarWriter};
    use crate::types::DailyBar;
    use approx::assert_relative_eq;
    use std::sync::Arc;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn bars(closes: &[(Sid, NaiveDate, f64)]) -> SQLiteDailyBarReader {
        let mut writer = SQLiteDailyBarWriter::from_connection(
            Connection::open_in_memory().unwrap(),
            Arc::new(NYSECalendar::new()),
            d(2021, 1, 4),
            d(2021, 1, 29),
        )
        .unwrap();
        let rows: Vec<DailyBar> = closes
            .iter()
            .map(|&(sid, date, c)| DailyBar::new(date, sid, c, c, c, c, 100.0))
            .collect();
        writer.write_bars(&rows).unwrap();
        SQLiteDailyBarReader::from_connection(writer.into_connection(), None).unwrap()
    }

    #[test]
    fn test_dividend_ratio_uses_previous_session_close() {
        let reader = bars(&[(1, d(2021, 1, 8), 50.0), (1, d(2021, 1, 11), 49.0)]);
        // ex date Monday: previous session is Friday
        let result = calc_dividend_ratios(&[CashDividend::new(1, d(2021, 1, 11), 1.0)], &reader).unwrap();
        assert_eq!(result.ratios.len(), 1);
        assert_relative_eq!(result.ratios[0].ratio, 0.98);
    }

    #[test]
    fn test_dividend_ratio_edge_cases() {
        let reader = bars(&[(1, d(2021, 1, 8), 0.0), (2, d(2021, 1, 8), 0.5)]);
        let dividends = [
            CashDividend::new(1, d(2021, 1, 11), 1.0), // zero close
            CashDividend::new(2, d(2021, 1, 11), 1.0), // dividend above price
            CashDividend::new(3, d(2021, 1, 11), 1.0), // unknown sid
        ];
        let result = calc_dividend_ratios(&dividends, &reader).unwrap();
        assert!(result.ratios.is_empty());
        assert_eq!(result.flagged.len(), 1);
        assert_eq!(result.flagged[0].dividend.sid, 2);
        assert_relative_eq!(result.flagged[0].ratio, -1.0);
        assert_eq!(result.skipped.len(), 2);
    }

    #[test]
    fn test_load_adjustments_positions() {
        let reader = bars(&[(1, d(2021, 1, 8), 50.0)]);
        let mut writer = SQLiteAdjustmentWriter::from_connection(Connection::open_in_memory().unwrap()).unwrap();
        writer
            .write(
                &[
                    RatioAdjustment::new(1, d(2021, 1, 6), 0.5),
                    // on the first window row: nothing earlier to adjust
                    RatioAdjustment::new(1, d(2021, 1, 4), 0.25),
                ],
                &[RatioAdjustment::new(2, d(2021, 1, 9), 0.9)],
                &[],
                &[],
                &reader,
            )
            .unwrap();
        let adjustments = SQLiteAdjustmentReader::from_connection(writer.into_connection()).unwrap();

        let dates = [d(2021, 1, 4), d(2021, 1, 5), d(2021, 1, 6), d(2021, 1, 7), d(2021, 1, 8), d(2021, 1, 11)];
        let loaded = adjustments.load_adjustments(&dates, &[2, 1], true, true, true).unwrap();
        assert_eq!(
            loaded.prices,
            vec![
                Adjustment { row: 2, col: 1, value: 0.5 },
                // Saturday merger applies from Monday
                Adjustment { row: 5, col: 0, value: 0.9 },
            ]
        );
        assert_eq!(loaded.volume, vec![Adjustment { row: 2, col: 1, value: 2.0 }]);

        let no_splits = adjustments.load_adjustments(&dates, &[2, 1], false, true, true).unwrap();
        assert_eq!(no_splits.prices.len(), 1);
        assert!(no_splits.volume.is_empty());
        assert_eq!(adjustments.get_adjustments_for_sid(AdjustmentKind::Split, 1).unwrap().len(), 2);
    }
}
