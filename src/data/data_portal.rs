//! Data Portal - adjusted history access
//!
//! The DataPortal sits on top of a session bar reader and the adjustment
//! store and answers trailing-window questions ("the last N closes of these
//! assets as of D") with split, merger and dividend adjustments applied as
//! of the window's last session.

use crate::data::adjustments::SQLiteAdjustmentReader;
use crate::data::bar_reader::SessionBarReader;
use crate::error::{PipelineError, Result};
use crate::pipeline::array::AdjustedArray;
use crate::types::{PriceField, Sid};
use chrono::NaiveDate;
use ndarray::{s, Array2, ArrayView1};
use polars::prelude::{DataFrame, DateChunked, IntoSeries, NamedFrom, Series};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Bar frequency of a history request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HistoryFrequency {
    /// One bar per session
    Daily,
}

impl FromStr for HistoryFrequency {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "daily" | "d" | "1d" => Ok(HistoryFrequency::Daily),
            other => Err(PipelineError::InvalidInput(format!(
                "Unsupported history frequency: {} (only daily bars are stored)",
                other
            ))),
        }
    }
}

impl fmt::Display for HistoryFrequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HistoryFrequency::Daily => write!(f, "1d"),
        }
    }
}

/// A `(sessions, sids)` block of values
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryWindow {
    pub sessions: Vec<NaiveDate>,
    pub sids: Vec<Sid>,
    pub values: Array2<f64>,
}

impl HistoryWindow {
    /// Values of one asset, if it was requested
    pub fn column(&self, sid: Sid) -> Option<ArrayView1<'_, f64>> {
        let col = self.sids.iter().position(|s| *s == sid)?;
        Some(self.values.column(col))
    }

    /// Wide frame: a `date` column plus one column per sid
    pub fn to_frame(&self) -> Result<DataFrame> {
        let mut columns = Vec::with_capacity(self.sids.len() + 1);
        columns.push(DateChunked::from_naive_date("date", self.sessions.iter().copied()).into_series());
        for (col, sid) in self.sids.iter().enumerate() {
            let values: Vec<f64> = self.values.column(col).to_vec();
            columns.push(Series::new(&sid.to_string(), values));
        }
        Ok(DataFrame::new(columns)?)
    }
}

/// Data Portal - adjusted history over the bar and adjustment stores
pub struct DataPortal {
    bars: Arc<dyn SessionBarReader>,
    adjustments: Option<Arc<SQLiteAdjustmentReader>>,
}

impl fmt::Debug for DataPortal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataPortal")
            .field("calendar", &self.bars.trading_calendar().name())
            .field("adjustments", &self.adjustments.is_some())
            .finish()
    }
}

impl DataPortal {
    pub fn new(bars: Arc<dyn SessionBarReader>, adjustments: Option<Arc<SQLiteAdjustmentReader>>) -> Self {
        Self { bars, adjustments }
    }

    pub fn bar_reader(&self) -> &Arc<dyn SessionBarReader> {
        &self.bars
    }

    /// The last `bar_count` bars of `field` ending at `end_date`, adjusted as
    /// of the window's last session
    ///
    /// With `ffill`, gaps in price fields carry the previous value forward
    /// and missing volume reads as zero.
    pub fn get_history_window(
        &self,
        sids: &[Sid],
        end_date: NaiveDate,
        bar_count: usize,
        frequency: HistoryFrequency,
        field: PriceField,
        ffill: bool,
    ) -> Result<HistoryWindow> {
        let HistoryFrequency::Daily = frequency;
        if bar_count == 0 {
            return Err(PipelineError::InvalidInput("bar_count must be positive".to_string()));
        }
        let calendar = self.bars.trading_calendar();
        let sessions = calendar.sessions_window(end_date, bar_count)?.to_vec();
        let mut window = self.adjusted_block(sids, &sessions, field)?;

        if ffill {
            if field.is_price() {
                forward_fill(&mut window.values);
            } else {
                window.values.mapv_inplace(|v| if v.is_nan() { 0.0 } else { v });
            }
        }
        Ok(window)
    }

    /// Adjusted closes over `[start, end]`
    pub fn prices(&self, sids: &[Sid], start: NaiveDate, end: NaiveDate) -> Result<HistoryWindow> {
        let sessions = self.bars.trading_calendar().sessions_in_range(start, end).to_vec();
        if sessions.is_empty() {
            return Err(PipelineError::CalendarError(format!(
                "No sessions between {} and {}",
                start, end
            )));
        }
        self.adjusted_block(sids, &sessions, PriceField::Close)
    }

    /// Simple daily returns of adjusted closes over `[start, end]`; the first
    /// session has no prior close and is NaN
    pub fn returns(&self, sids: &[Sid], start: NaiveDate, end: NaiveDate) -> Result<HistoryWindow> {
        let prices = self.prices(sids, start, end)?;
        let mut values = Array2::from_elem(prices.values.dim(), f64::NAN);
        if prices.values.nrows() > 1 {
            let prev = prices.values.slice(s![..-1, ..]);
            let next = prices.values.slice(s![1.., ..]);
            let changes = &next / &prev - 1.0;
            values.slice_mut(s![1.., ..]).assign(&changes);
        }
        Ok(HistoryWindow {
            sessions: prices.sessions,
            sids: prices.sids,
            values,
        })
    }

    /// Unadjusted value on one session
    pub fn get_spot_value(&self, sid: Sid, field: PriceField, date: NaiveDate) -> Result<f64> {
        self.bars.get_value(sid, date, field)
    }

    pub fn get_last_traded_dt(&self, sid: Sid, date: NaiveDate) -> Result<Option<NaiveDate>> {
        self.bars.get_last_traded_dt(sid, date)
    }

    fn adjusted_block(&self, sids: &[Sid], sessions: &[NaiveDate], field: PriceField) -> Result<HistoryWindow> {
        let (first, last) = match (sessions.first(), sessions.last()) {
            (Some(f), Some(l)) => (*f, *l),
            _ => {
                return Ok(HistoryWindow {
                    sessions: Vec::new(),
                    sids: sids.to_vec(),
                    values: Array2::zeros((0, sids.len())),
                })
            }
        };
        let raw = self
            .bars
            .load_raw_arrays(&[field], first, last, sids)?
            .into_iter()
            .next()
            .unwrap_or_else(|| Array2::zeros((sessions.len(), sids.len())));

        let values = match &self.adjustments {
            Some(reader) => {
                let adjustments = reader.load_adjustments(sessions, sids, true, true, true)?;
                let adjusted = AdjustedArray::new(raw, adjustments.for_field(field).to_vec());
                adjusted.window(sessions.len() - 1, sessions.len(), None)?.into_owned()
            }
            None => raw,
        };
        Ok(HistoryWindow {
            sessions: sessions.to_vec(),
            sids: sids.to_vec(),
            values,
        })
    }
}

fn forward_fill(values: &mut Array2<f64>) {
    for mut column in values.columns_mut() {
        let mut last = f64::NAN;
        for v in column.iter_mut() {
            if v.is_nan() {
                *v = last;
            } else {
                last = *v;
            }
        }
    }
}
