//! Asset Finder - Symbol lookup and point-in-time fact retrieval
//!
//! Provides:
//! - Symbol → asset resolution honouring ticker reuse
//! - SID-based retrieval and lifetime matrices for the pipeline root mask
//! - Point-in-time queries over `equity_supplementary_mappings`
//!
//! Every point-in-time query compiles to a single statement that ranks each
//! sid's qualifying rows with `ROW_NUMBER() OVER (PARTITION BY sid ORDER BY
//! start_date DESC)`, so "the n-th most recent row on or before the as-of
//! date" is resolved inside SQLite. Rows dated after the as-of date are never
//! candidates. Results are per-sid in request order; a sid without a
//! qualifying row gets NaN (numeric) or `"NA"` (labels).

use crate::asset::Asset;
use crate::assets::query_cache::{CacheStats, CachedValue, QueryCache, QueryKey, QueryKind};
use crate::calendar::TradingCalendar;
use crate::config::FundamentalsConfig;
use crate::error::{PipelineError, Result};
use crate::sql::{configure_connection, placeholders, MAX_SQL_PARAMS};
use crate::types::{fmt_date, parse_date, Sid};
use chrono::{Duration, NaiveDate};
use hashbrown::{HashMap, HashSet};
use ndarray::Array2;
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection};
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};

/// Sentinel for missing labels
pub const MISSING_LABEL: &str = "NA";

/// In-memory view of the `equities` table
#[derive(Debug, Default)]
struct AssetIndex {
    by_sid: HashMap<Sid, Asset>,
    /// symbol → sids ordered by start date
    by_symbol: HashMap<String, Vec<Sid>>,
}

impl AssetIndex {
    fn build(assets: Vec<Asset>) -> Self {
        let mut index = AssetIndex::default();
        for asset in assets {
            index
                .by_symbol
                .entry(asset.symbol.to_uppercase())
                .or_insert_with(Vec::new)
                .push(asset.sid);
            index.by_sid.insert(asset.sid, asset);
        }
        let by_sid = &index.by_sid;
        for sids in index.by_symbol.values_mut() {
            sids.sort_by_key(|sid| by_sid.get(sid).map(|a| a.start_date));
        }
        index
    }
}

/// Existence matrix of assets over a set of sessions
#[derive(Debug, Clone)]
pub struct Lifetimes {
    pub sids: Vec<Sid>,
    /// `(dates, sids)`: true where the asset existed on the date
    pub mask: Array2<bool>,
}

/// AssetFinder - Central asset lookup and point-in-time store reader
pub struct AssetFinder {
    conn: Mutex<Connection>,
    calendar: Arc<dyn TradingCalendar>,
    settings: FundamentalsConfig,
    index: RwLock<AssetIndex>,
    cache: QueryCache,
    /// Fields already reported for holding non-numeric text
    unparsable_fields: Mutex<HashSet<String>>,
}

impl AssetFinder {
    /// Open the asset database at `path`
    pub fn open(
        path: &Path,
        calendar: Arc<dyn TradingCalendar>,
        settings: FundamentalsConfig,
    ) -> Result<Self> {
        let conn = Connection::open(path)?;
        configure_connection(&conn)?;
        Self::from_connection(conn, calendar, settings)
    }

    /// Wrap an already-open connection (e.g. one handed over by `AssetDB`)
    pub fn from_connection(
        conn: Connection,
        calendar: Arc<dyn TradingCalendar>,
        settings: FundamentalsConfig,
    ) -> Result<Self> {
        let finder = Self {
            conn: Mutex::new(conn),
            calendar,
            cache: QueryCache::new(settings.query_cache_capacity),
            settings,
            index: RwLock::new(AssetIndex::default()),
            unparsable_fields: Mutex::new(HashSet::new()),
        };
        finder.reload()?;
        Ok(finder)
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| PipelineError::LockPoisoned("asset finder connection"))
    }

    /// Re-read equity metadata and drop memoized queries
    pub fn reload(&self) -> Result<usize> {
        let assets = {
            let conn = self.conn()?;
            let mut stmt = conn.prepare(
                "SELECT sid, symbol, asset_name, exchange, start_date, end_date, auto_close_date
                 FROM equities ORDER BY sid",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, Option<String>>(6)?,
                ))
            })?;
            let mut assets = Vec::new();
            for row in rows {
                let (sid, symbol, name, exchange, start, end, auto_close) = row?;
                let mut asset = Asset::new(
                    sid as Sid,
                    symbol,
                    exchange,
                    parse_date(&start)?,
                    parse_date(&end)?,
                );
                asset.name = name;
                if let Some(auto_close) = auto_close {
                    asset.auto_close_date = Some(parse_date(&auto_close)?);
                }
                assets.push(asset);
            }
            assets
        };
        let count = assets.len();
        *self
            .index
            .write()
            .map_err(|_| PipelineError::LockPoisoned("asset index"))? = AssetIndex::build(assets);
        self.cache.invalidate()?;
        log::debug!("Loaded {} equities", count);
        Ok(count)
    }

    pub fn calendar(&self) -> &Arc<dyn TradingCalendar> {
        &self.calendar
    }

    pub fn settings(&self) -> &FundamentalsConfig {
        &self.settings
    }

    fn with_index<T>(&self, f: impl FnOnce(&AssetIndex) -> T) -> Result<T> {
        let index = self
            .index
            .read()
            .map_err(|_| PipelineError::LockPoisoned("asset index"))?;
        Ok(f(&index))
    }

    /// Look up a symbol at a specific point in time
    ///
    /// With `as_of_date`, the asset alive on that date wins, falling back to
    /// the most recent one that started before it. Without a date the asset
    /// with the latest start date is returned.
    pub fn lookup_symbol(&self, symbol: &str, as_of_date: Option<NaiveDate>) -> Result<Asset> {
        let symbol_upper = symbol.to_uppercase();
        self.with_index(|index| {
            let sids = index.by_symbol.get(&symbol_upper)?;
            let candidates = sids.iter().filter_map(|sid| index.by_sid.get(sid));
            let found = match as_of_date {
                None => candidates.last(),
                Some(date) => {
                    let started: Vec<&Asset> =
                        candidates.filter(|a| a.start_date <= date).collect();
                    started
                        .iter()
                        .rev()
                        .find(|a| a.is_alive(date))
                        .or_else(|| started.last())
                        .copied()
                }
            };
            found.cloned()
        })?
        .ok_or_else(|| PipelineError::SymbolNotFound {
            symbol: symbol.to_string(),
        })
    }

    /// Batch symbol lookup
    pub fn lookup_symbols(&self, symbols: &[&str], as_of_date: Option<NaiveDate>) -> Result<Vec<Asset>> {
        symbols
            .iter()
            .map(|s| self.lookup_symbol(s, as_of_date))
            .collect()
    }

    /// Retrieve asset by SID
    pub fn retrieve_asset(&self, sid: Sid) -> Result<Asset> {
        self.with_index(|index| index.by_sid.get(&sid).cloned())?
            .ok_or(PipelineError::SidNotFound(sid))
    }

    /// Retrieve several assets, failing on the first unknown sid
    pub fn retrieve_all(&self, sids: &[Sid]) -> Result<Vec<Asset>> {
        sids.iter().map(|sid| self.retrieve_asset(*sid)).collect()
    }

    /// All known sids, ascending
    pub fn sids(&self) -> Result<Vec<Sid>> {
        let mut sids = self.with_index(|index| index.by_sid.keys().copied().collect::<Vec<_>>())?;
        sids.sort_unstable();
        Ok(sids)
    }

    /// Existence matrix of every known asset over `dates`
    ///
    /// With `include_start_date = false` an asset is not considered alive on
    /// its first day, matching the convention that a pipeline on day D only
    /// sees data known before D's open.
    pub fn lifetimes(&self, dates: &[NaiveDate], include_start_date: bool) -> Result<Lifetimes> {
        self.with_index(|index| {
            let mut sids: Vec<Sid> = index.by_sid.keys().copied().collect();
            sids.sort_unstable();
            let mask = Array2::from_shape_fn((dates.len(), sids.len()), |(i, j)| {
                let asset = &index.by_sid[&sids[j]];
                let date = dates[i];
                let started = if include_start_date {
                    asset.start_date <= date
                } else {
                    asset.start_date < date
                };
                started && date <= asset.end_date
            });
            Lifetimes { sids, mask }
        })
    }

    /// Live-trading mode: push the end of every asset still trading on
    /// `last_bar_date` out to `horizon`, so that assets keep existing while
    /// bar ingestion lags behind the wall clock
    pub fn extend_lifetimes(&self, last_bar_date: NaiveDate, horizon: NaiveDate) -> Result<usize> {
        let mut index = self
            .index
            .write()
            .map_err(|_| PipelineError::LockPoisoned("asset index"))?;
        let mut extended = 0;
        for asset in index.by_sid.values_mut() {
            if asset.end_date >= last_bar_date && asset.end_date < horizon {
                asset.end_date = horizon;
                asset.auto_close_date = Some(horizon);
                extended += 1;
            }
        }
        log::info!("Extended lifetimes of {} assets to {}", extended, horizon);
        Ok(extended)
    }

    fn staleness(&self, quarters: usize) -> Duration {
        Duration::days(self.settings.staleness_days_per_quarter * quarters as i64)
    }

    /// Run a ranked point-in-time query and return `(sid, payload)` rows.
    ///
    /// `select` is the outer projection over the ranked rows `t(sid,
    /// start_date, value, rown)`; `tail` is appended after the outer WHERE.
    fn ranked_query(
        &self,
        sids: &[Sid],
        field: &str,
        as_of: NaiveDate,
        min_start: Option<NaiveDate>,
        select: &str,
        rank_filter: &str,
        rank_params: &[i64],
    ) -> Result<Vec<(Sid, Vec<Value>)>> {
        let conn = self.conn()?;
        let mut out = Vec::new();
        let width = select.split(',').count();
        for chunk in sids.chunks(MAX_SQL_PARAMS) {
            let date_filter = if min_start.is_some() {
                "AND start_date >= ?"
            } else {
                ""
            };
            let sql = format!(
                "SELECT {select} FROM (
                    SELECT sid, start_date, value,
                           ROW_NUMBER() OVER (PARTITION BY sid ORDER BY start_date DESC) AS rown
                    FROM equity_supplementary_mappings
                    WHERE sid IN ({ph}) AND field = ? AND start_date <= ? {date_filter}
                 ) t WHERE {rank_filter}",
                select = select,
                ph = placeholders(chunk.len()),
                date_filter = date_filter,
                rank_filter = rank_filter,
            );
            let mut bind: Vec<Value> = chunk.iter().map(|s| Value::Integer(*s as i64)).collect();
            bind.push(Value::Text(field.to_string()));
            bind.push(Value::Text(fmt_date(as_of)));
            if let Some(min_start) = min_start {
                bind.push(Value::Text(fmt_date(min_start)));
            }
            bind.extend(rank_params.iter().map(|p| Value::Integer(*p)));

            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(bind.iter()), |row| {
                let sid: i64 = row.get(0)?;
                let mut payload = Vec::with_capacity(width - 1);
                for i in 1..width {
                    payload.push(row.get::<_, Value>(i)?);
                }
                Ok((sid as Sid, payload))
            })?;
            for row in rows {
                out.push(row?);
            }
        }
        Ok(out)
    }

    fn memoized(
        &self,
        key: QueryKey,
        compute: impl FnOnce() -> Result<CachedValue>,
    ) -> Result<CachedValue> {
        if let Some(hit) = self.cache.get(&key)? {
            return Ok(hit);
        }
        let value = compute()?;
        self.cache.insert(key, value.clone())?;
        Ok(value)
    }

    fn scatter_numbers(&self, sids: &[Sid], field: &str, rows: Vec<(Sid, Vec<Value>)>) -> Vec<f64> {
        let positions = sid_positions(sids);
        let mut out = vec![f64::NAN; sids.len()];
        for (sid, payload) in rows {
            if let (Some(idx), Some(v)) = (positions.get(&sid), payload.first()) {
                out[*idx] = self.fact_number(field, v);
            }
        }
        out
    }

    /// Numeric value of a stored fact. Values that are not numbers are
    /// missing; each field is reported once.
    fn fact_number(&self, field: &str, value: &Value) -> f64 {
        value_to_f64(value).unwrap_or_else(|| {
            if let Ok(mut seen) = self.unparsable_fields.lock() {
                if seen.insert(field.to_string()) {
                    log::warn!(
                        "Field {} holds non-numeric value {:?}; treating it as missing",
                        field,
                        value
                    );
                }
            }
            f64::NAN
        })
    }

    /// Value of the `n`-th most recent fact (n = 1 is the latest) on or
    /// before `as_of`. Facts older than `n` staleness windows are ignored.
    pub fn get_fundamentals(&self, sids: &[Sid], field: &str, as_of: NaiveDate, n: usize) -> Result<Vec<f64>> {
        if sids.is_empty() {
            return Ok(Vec::new());
        }
        let n = n.max(1);
        let key = QueryKey {
            kind: QueryKind::Fundamentals,
            sids: sids.to_vec(),
            field: field.to_string(),
            as_of,
            n,
        };
        let value = self.memoized(key, || {
            let rows = self.ranked_query(
                sids,
                field,
                as_of,
                Some(as_of - self.staleness(n)),
                "sid, value",
                "rown = ?",
                &[n as i64],
            )?;
            Ok(CachedValue::Numbers(self.scatter_numbers(sids, field, rows)))
        })?;
        expect_numbers(value)
    }

    /// Trailing-twelve-month sum: the four facts ranked `4k-3..=4k`.
    ///
    /// A sid with fewer than four qualifying facts in that window gets NaN.
    pub fn get_fundamentals_ttm(&self, sids: &[Sid], field: &str, as_of: NaiveDate, k: usize) -> Result<Vec<f64>> {
        if sids.is_empty() {
            return Ok(Vec::new());
        }
        let k = k.max(1);
        let last = 4 * k;
        let first = last - 3;
        let key = QueryKey {
            kind: QueryKind::FundamentalsTtm,
            sids: sids.to_vec(),
            field: field.to_string(),
            as_of,
            n: k,
        };
        let value = self.memoized(key, || {
            let rows = self.ranked_query(
                sids,
                field,
                as_of,
                Some(as_of - self.staleness(last)),
                "sid, SUM(value)",
                "rown >= ? AND rown <= ? GROUP BY sid HAVING COUNT(*) = 4",
                &[first as i64, last as i64],
            )?;
            Ok(CachedValue::Numbers(self.scatter_numbers(sids, field, rows)))
        })?;
        expect_numbers(value)
    }

    /// Dense `(window_length, sids)` history of `field` over the
    /// `window_length` sessions ending at `as_of`.
    ///
    /// Each cell holds the latest fact visible on that session, forward
    /// filled per sid. Facts older than one staleness window per 20 sessions
    /// of lookback are not considered.
    pub fn get_fundamentals_df_window_length(
        &self,
        sids: &[Sid],
        field: &str,
        as_of: NaiveDate,
        window_length: usize,
    ) -> Result<Array2<f64>> {
        let window_length = window_length.max(1);
        if sids.is_empty() {
            return Ok(Array2::from_elem((window_length, 0), f64::NAN));
        }
        let key = QueryKey {
            kind: QueryKind::WindowLength,
            sids: sids.to_vec(),
            field: field.to_string(),
            as_of,
            n: window_length,
        };
        let value = self.memoized(key, || {
            let sessions = self.calendar.sessions_window(as_of, window_length)?.to_vec();
            let periods = (window_length + 19) / 20;
            let min_start = as_of - self.staleness(periods);

            let mut history: HashMap<Sid, Vec<(NaiveDate, f64)>> = HashMap::new();
            {
                let conn = self.conn()?;
                for chunk in sids.chunks(MAX_SQL_PARAMS) {
                    let sql = format!(
                        "SELECT sid, start_date, value FROM equity_supplementary_mappings
                         WHERE sid IN ({}) AND field = ? AND start_date <= ? AND start_date >= ?
                         ORDER BY sid, start_date",
                        placeholders(chunk.len())
                    );
                    let mut bind: Vec<Value> =
                        chunk.iter().map(|s| Value::Integer(*s as i64)).collect();
                    bind.push(Value::Text(field.to_string()));
                    bind.push(Value::Text(fmt_date(as_of)));
                    bind.push(Value::Text(fmt_date(min_start)));
                    let mut stmt = conn.prepare(&sql)?;
                    let rows = stmt.query_map(params_from_iter(bind.iter()), |row| {
                        Ok((
                            row.get::<_, i64>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, Value>(2)?,
                        ))
                    })?;
                    for row in rows {
                        let (sid, start, value) = row?;
                        history
                            .entry(sid as Sid)
                            .or_insert_with(Vec::new)
                            .push((parse_date(&start)?, self.fact_number(field, &value)));
                    }
                }
            }

            let mut grid = Array2::from_elem((window_length, sids.len()), f64::NAN);
            for (j, sid) in sids.iter().enumerate() {
                let Some(rows) = history.get(sid) else { continue };
                let mut cursor = 0;
                let mut current = f64::NAN;
                for (i, session) in sessions.iter().enumerate() {
                    while cursor < rows.len() && rows[cursor].0 <= *session {
                        current = rows[cursor].1;
                        cursor += 1;
                    }
                    grid[[i, j]] = current;
                }
            }
            Ok(CachedValue::Grid {
                rows: window_length,
                values: grid.iter().copied().collect(),
            })
        })?;
        match value {
            CachedValue::Grid { rows, values } => {
                Ok(Array2::from_shape_vec((rows, sids.len()), values)?)
            }
            other => Err(PipelineError::TypeMismatch(format!(
                "expected a grid from the query cache, got {:?}",
                other
            ))),
        }
    }

    /// Latest label of `field` on or before `as_of`, without a staleness
    /// bound; missing values are [`MISSING_LABEL`]
    pub fn get_info(&self, sids: &[Sid], field: &str, as_of: NaiveDate) -> Result<Vec<String>> {
        if sids.is_empty() {
            return Ok(Vec::new());
        }
        let key = QueryKey {
            kind: QueryKind::Info,
            sids: sids.to_vec(),
            field: field.to_string(),
            as_of,
            n: 1,
        };
        let value = self.memoized(key, || {
            let rows = self.ranked_query(sids, field, as_of, None, "sid, value", "rown = ?", &[1])?;
            let positions = sid_positions(sids);
            let mut out = vec![MISSING_LABEL.to_string(); sids.len()];
            for (sid, payload) in rows {
                if let (Some(idx), Some(v)) = (positions.get(&sid), payload.first()) {
                    if let Some(label) = value_to_label(v) {
                        out[*idx] = label;
                    }
                }
            }
            Ok(CachedValue::Labels(out))
        })?;
        match value {
            CachedValue::Labels(labels) => Ok(labels),
            other => Err(PipelineError::TypeMismatch(format!(
                "expected labels from the query cache, got {:?}",
                other
            ))),
        }
    }

    /// Daily-frequency metric as of the `n`-th most recent session on or
    /// before `as_of` (n = 1 is that session itself). The value must have
    /// been recorded within `daily_metric_max_lag_sessions` sessions of the
    /// target session.
    pub fn get_daily_metrics(&self, sids: &[Sid], field: &str, as_of: NaiveDate, n: usize) -> Result<Vec<f64>> {
        if sids.is_empty() {
            return Ok(Vec::new());
        }
        let n = n.max(1);
        let key = QueryKey {
            kind: QueryKind::DailyMetrics,
            sids: sids.to_vec(),
            field: field.to_string(),
            as_of,
            n,
        };
        let value = self.memoized(key, || {
            let target = self.calendar.sessions_window(as_of, n)?[0];
            let max_lag = self.settings.daily_metric_max_lag_sessions;
            let sessions = self.calendar.sessions_in_range(
                self.calendar.first_session().unwrap_or(target),
                target,
            );
            let min_start = sessions[sessions.len().saturating_sub(max_lag + 1)..]
                .first()
                .copied()
                .unwrap_or(target);
            let rows = self.ranked_query(sids, field, target, Some(min_start), "sid, value", "rown = ?", &[1])?;
            Ok(CachedValue::Numbers(self.scatter_numbers(sids, field, rows)))
        })?;
        expect_numbers(value)
    }

    /// Date from which the `n`-th most recent `field` fact was visible
    pub fn get_datekey(&self, sids: &[Sid], field: &str, as_of: NaiveDate, n: usize) -> Result<Vec<Option<NaiveDate>>> {
        if sids.is_empty() {
            return Ok(Vec::new());
        }
        let n = n.max(1);
        let key = QueryKey {
            kind: QueryKind::DateKey,
            sids: sids.to_vec(),
            field: field.to_string(),
            as_of,
            n,
        };
        let value = self.memoized(key, || {
            let rows = self.ranked_query(sids, field, as_of, None, "sid, start_date", "rown = ?", &[n as i64])?;
            let positions = sid_positions(sids);
            let mut out = vec![None; sids.len()];
            for (sid, payload) in rows {
                if let (Some(idx), Some(Value::Text(date))) = (positions.get(&sid), payload.first()) {
                    out[*idx] = Some(parse_date(date)?);
                }
            }
            Ok(CachedValue::Dates(out))
        })?;
        match value {
            CachedValue::Dates(dates) => Ok(dates),
            other => Err(PipelineError::TypeMismatch(format!(
                "expected dates from the query cache, got {:?}",
                other
            ))),
        }
    }

    /// Latest date any sid has a value for the daily metric `field`
    pub fn last_available_daily_metrics_dt(&self, field: &str) -> Result<Option<NaiveDate>> {
        let conn = self.conn()?;
        let max: Option<String> = conn.query_row(
            "SELECT MAX(start_date) FROM equity_supplementary_mappings WHERE field = ?1",
            [field],
            |row| row.get(0),
        )?;
        max.map(|s| parse_date(&s)).transpose()
    }

    /// Fingerprint of the fact store contents, mixed into term cache keys
    pub fn data_stamp(&self) -> Result<String> {
        let conn = self.conn()?;
        let (count, max_start): (i64, Option<String>) = conn.query_row(
            "SELECT COUNT(*), MAX(start_date) FROM equity_supplementary_mappings",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        let assets: i64 = conn.query_row("SELECT COUNT(*) FROM equities", [], |row| row.get(0))?;
        Ok(format!(
            "facts={}:{};equities={}",
            count,
            max_start.unwrap_or_default(),
            assets
        ))
    }

    pub fn query_cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Drop memoized point-in-time results (call after writing facts)
    pub fn invalidate_query_cache(&self) -> Result<()> {
        self.cache.invalidate()
    }
}

fn sid_positions(sids: &[Sid]) -> HashMap<Sid, usize> {
    sids.iter().enumerate().map(|(i, s)| (*s, i)).collect()
}

fn expect_numbers(value: CachedValue) -> Result<Vec<f64>> {
    match value {
        CachedValue::Numbers(v) => Ok(v),
        other => Err(PipelineError::TypeMismatch(format!(
            "expected numbers from the query cache, got {:?}",
            other
        ))),
    }
}

/// `None` for values that cannot be read as a number; NULL is NaN
fn value_to_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Real(v) => Some(*v),
        Value::Integer(v) => Some(*v as f64),
        Value::Text(s) => s.trim().parse().ok(),
        Value::Null => Some(f64::NAN),
        Value::Blob(_) => None,
    }
}

fn value_to_label(value: &Value) -> Option<String> {
    match value {
        Value::Text(s) => Some(s.clone()),
        Value::Integer(v) => Some(v.to_string()),
        Value::Real(v) => Some(v.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assets::asset_db::{AssetDB, SupplementaryFact};
    use crate::calendar::NYSECalendar;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn finder_with(assets: &[Asset], facts: &[SupplementaryFact]) -> AssetFinder {
        let mut db = AssetDB::new_in_memory().unwrap();
        db.write_equities(assets).unwrap();
        db.insert_facts(facts).unwrap();
        AssetFinder::from_connection(
            db.into_connection(),
            Arc::new(NYSECalendar::new()),
            FundamentalsConfig::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_lookup_symbol_resolves_ticker_reuse() {
        let finder = finder_with(
            &[
                Asset::new(1, "ABC", "NYSE", d(2000, 1, 3), d(2010, 6, 30)),
                Asset::new(2, "ABC", "NASDAQ", d(2012, 1, 3), d(2030, 1, 1)),
            ],
            &[],
        );
        assert_eq!(finder.lookup_symbol("abc", Some(d(2005, 1, 3))).unwrap().sid, 1);
        assert_eq!(finder.lookup_symbol("ABC", Some(d(2015, 1, 2))).unwrap().sid, 2);
        // between lifetimes the most recently started asset wins
        assert_eq!(finder.lookup_symbol("ABC", Some(d(2011, 1, 3))).unwrap().sid, 1);
        assert_eq!(finder.lookup_symbol("ABC", None).unwrap().sid, 2);
        assert!(matches!(
            finder.lookup_symbol("ABC", Some(d(1999, 1, 4))),
            Err(PipelineError::SymbolNotFound { .. })
        ));
        assert!(matches!(finder.retrieve_asset(99), Err(PipelineError::SidNotFound(99))));
    }

    #[test]
    fn test_get_fundamentals_ranks_by_recency() {
        let finder = finder_with(
            &[],
            &[
                SupplementaryFact::new(42, "revenue_arq", d(2020, 1, 15), 100.0),
                SupplementaryFact::new(42, "revenue_arq", d(2019, 10, 15), 90.0),
                SupplementaryFact::new(42, "revenue_arq", d(2020, 4, 16), 110.0),
            ],
        );
        let as_of = d(2020, 4, 15);
        assert_eq!(finder.get_fundamentals(&[42], "revenue_arq", as_of, 1).unwrap(), vec![100.0]);
        assert_eq!(finder.get_fundamentals(&[42], "revenue_arq", as_of, 2).unwrap(), vec![90.0]);
        let missing = finder.get_fundamentals(&[42, 43], "revenue_arq", as_of, 3).unwrap();
        assert!(missing[0].is_nan() && missing[1].is_nan());
        assert!(finder.get_fundamentals(&[], "revenue_arq", as_of, 1).unwrap().is_empty());
    }

    #[test]
    fn test_query_results_are_memoized() {
        let finder = finder_with(&[], &[SupplementaryFact::new(1, "eps_arq", d(2020, 1, 15), 1.5)]);
        let as_of = d(2020, 2, 3);
        finder.get_fundamentals(&[1], "eps_arq", as_of, 1).unwrap();
        finder.get_fundamentals(&[1], "eps_arq", as_of, 1).unwrap();
        let stats = finder.query_cache_stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn test_non_numeric_facts_are_missing() {
        let finder = finder_with(
            &[],
            &[
                SupplementaryFact::new(1, "eps_arq", d(2020, 1, 15), "n/a"),
                SupplementaryFact::new(2, "eps_arq", d(2020, 1, 15), " 2.5 "),
                SupplementaryFact::new(3, "eps_arq", d(2020, 1, 15), 1.5),
            ],
        );
        let values = finder.get_fundamentals(&[1, 2, 3], "eps_arq", d(2020, 2, 3), 1).unwrap();
        assert!(values[0].is_nan());
        assert_eq!(&values[1..], &[2.5, 1.5]);
        let seen = finder.unparsable_fields.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert!(seen.contains("eps_arq"));
    }

    #[test]
    fn test_get_info_uses_na_sentinel() {
        let finder = finder_with(
            &[],
            &[SupplementaryFact::new(5, "sector", d(2001, 1, 2), "Technology")],
        );
        let info = finder.get_info(&[5, 6], "sector", d(2020, 1, 2)).unwrap();
        assert_eq!(info, vec!["Technology".to_string(), "NA".to_string()]);
        let before = finder.get_info(&[5], "sector", d(2000, 1, 3)).unwrap();
        assert_eq!(before, vec!["NA".to_string()]);
    }

    #[test]
    fn test_lifetimes_and_live_extension() {
        let finder = finder_with(
            &[
                Asset::new(1, "A", "NYSE", d(2021, 1, 4), d(2021, 1, 5)),
                Asset::new(2, "B", "NYSE", d(2021, 1, 5), d(2021, 1, 6)),
            ],
            &[],
        );
        let dates = [d(2021, 1, 4), d(2021, 1, 5), d(2021, 1, 6)];
        let lifetimes = finder.lifetimes(&dates, true).unwrap();
        assert_eq!(lifetimes.sids, vec![1, 2]);
        assert_eq!(lifetimes.mask.column(0).to_vec(), vec![true, true, false]);
        assert_eq!(lifetimes.mask.column(1).to_vec(), vec![false, true, true]);

        let strict = finder.lifetimes(&dates, false).unwrap();
        assert_eq!(strict.mask.column(1).to_vec(), vec![false, false, true]);

        assert_eq!(finder.extend_lifetimes(d(2021, 1, 6), d(2021, 12, 31)).unwrap(), 1);
        assert_eq!(finder.retrieve_asset(2).unwrap().end_date, d(2021, 12, 31));
        assert_eq!(finder.retrieve_asset(1).unwrap().end_date, d(2021, 1, 5));
    }
}
