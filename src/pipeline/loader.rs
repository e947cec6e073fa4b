//! Pipeline loaders
//!
//! Loadable terms are grouped by loader and served in one store round trip
//! per group.

use crate::calendar::TradingCalendar;
use crate::data::adjustments::SQLiteAdjustmentReader;
use crate::data::bar_reader::SessionBarReader;
use crate::error::{PipelineError, Result};
use crate::pipeline::array::{AdjustedArray, TermArray};
use crate::pipeline::term::BoundColumn;
use crate::types::{PriceField, Sid};
use chrono::NaiveDate;
use hashbrown::HashMap;
use ndarray::{concatenate, Array2, ArrayView2, Axis};
use std::sync::Arc;

/// Dataset name of the daily pricing columns
pub const PRICING_DATASET: &str = "EquityPricing";

/// Source of loadable term data
pub trait PipelineLoader: Send + Sync {
    fn name(&self) -> &str;

    /// One array of shape `(dates, sids)` per requested column, in order
    fn load_adjusted_array(
        &self,
        columns: &[BoundColumn],
        dates: &[NaiveDate],
        sids: &[Sid],
        mask: ArrayView2<'_, bool>,
    ) -> Result<Vec<TermArray>>;
}

/// Daily OHLCV loader over a bar reader and optional adjustments
///
/// The value for session D is the bar of the session before D: a pipeline
/// runs before the open and may only see closed bars.
pub struct EquityPricingLoader {
    bars: Arc<dyn SessionBarReader>,
    adjustments: Option<Arc<SQLiteAdjustmentReader>>,
}

impl EquityPricingLoader {
    pub fn new(bars: Arc<dyn SessionBarReader>, adjustments: Option<Arc<SQLiteAdjustmentReader>>) -> Self {
        Self { bars, adjustments }
    }

    fn shifted_sessions(&self, calendar: &dyn TradingCalendar, dates: &[NaiveDate]) -> Result<Vec<NaiveDate>> {
        let (Some(first), Some(last)) = (dates.first(), dates.last()) else {
            return Ok(Vec::new());
        };
        let end = match calendar.previous_session(*last) {
            Ok(d) => d,
            // Every date is on or before the calendar start; all rows are padding
            Err(_) => return Ok(Vec::new()),
        };
        let start = match calendar.previous_session(*first) {
            Ok(d) => d,
            // No session before the calendar start; pad the first row
            Err(_) => *first,
        };
        Ok(calendar.sessions_in_range(start, end).to_vec())
    }
}

impl PipelineLoader for EquityPricingLoader {
    fn name(&self) -> &str {
        "EquityPricingLoader"
    }

    fn load_adjusted_array(
        &self,
        columns: &[BoundColumn],
        dates: &[NaiveDate],
        sids: &[Sid],
        _mask: ArrayView2<'_, bool>,
    ) -> Result<Vec<TermArray>> {
        let fields = columns
            .iter()
            .map(|c| c.column.parse::<PriceField>())
            .collect::<Result<Vec<_>>>()?;
        if dates.is_empty() {
            return Ok(fields
                .iter()
                .map(|_| TermArray::Adjusted(AdjustedArray::new(Array2::zeros((0, sids.len())), Vec::new())))
                .collect());
        }

        let calendar = self.bars.trading_calendar();
        let shifted = self.shifted_sessions(calendar.as_ref(), dates)?;
        let padding = dates.len().saturating_sub(shifted.len());

        let raw = match (shifted.first(), shifted.last()) {
            (Some(first), Some(last)) => self.bars.load_raw_arrays(&fields, *first, *last, sids)?,
            _ => fields.iter().map(|_| Array2::zeros((0, sids.len()))).collect(),
        };
        let adjustments = match &self.adjustments {
            Some(reader) if !shifted.is_empty() => Some(reader.load_adjustments(&shifted, sids, true, true, true)?),
            _ => None,
        };

        let mut out = Vec::with_capacity(fields.len());
        for (field, data) in fields.iter().zip(raw) {
            let data = if padding > 0 {
                let pad = Array2::from_elem((padding, sids.len()), f64::NAN);
                concatenate(Axis(0), &[pad.view(), data.view()])?
            } else {
                data
            };
            let field_adjustments = adjustments
                .as_ref()
                .map(|a| {
                    a.for_field(*field)
                        .iter()
                        .map(|adj| crate::data::adjustments::Adjustment {
                            row: adj.row + padding,
                            ..*adj
                        })
                        .collect()
                })
                .unwrap_or_default();
            out.push(TermArray::Adjusted(AdjustedArray::new(data, field_adjustments)));
        }
        Ok(out)
    }
}

/// Maps datasets to the loaders that serve them
#[derive(Default, Clone)]
pub struct LoaderRegistry {
    loaders: HashMap<String, Arc<dyn PipelineLoader>>,
}

impl LoaderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, dataset: impl Into<String>, loader: Arc<dyn PipelineLoader>) -> &mut Self {
        self.loaders.insert(dataset.into(), loader);
        self
    }

    pub fn get(&self, column: &BoundColumn) -> Result<Arc<dyn PipelineLoader>> {
        self.loaders
            .get(&column.dataset)
            .cloned()
            .ok_or_else(|| PipelineError::MissingLoader(column.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::{TradingCalendar, WeekdayCalendar};
    use crate::data::daily_bars::{SQLiteDailyBarReader, SQLiteDailyBarWriter};
    use crate::types::DailyBar;
    use rusqlite::Connection;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn reader() -> Arc<dyn SessionBarReader> {
        let calendar: Arc<dyn TradingCalendar> = Arc::new(WeekdayCalendar::new());
        let mut writer =
            SQLiteDailyBarWriter::from_connection(Connection::open_in_memory().unwrap(), calendar.clone(), d(2021, 1, 4), d(2021, 1, 8))
                .unwrap();
        let bars: Vec<DailyBar> = (4..=8)
            .map(|day| {
                let close = 10.0 * day as f64;
                DailyBar::new(d(2021, 1, day), 1, close, close, close, close, 100.0)
            })
            .collect();
        writer.write_bars(&bars).unwrap();
        Arc::new(SQLiteDailyBarReader::from_connection(writer.into_connection(), Some(calendar)).unwrap())
    }

    #[test]
    fn test_pricing_loader_shifts_by_one_session() {
        let loader = EquityPricingLoader::new(reader(), None);
        let dates = vec![d(2021, 1, 6), d(2021, 1, 7), d(2021, 1, 8)];
        let mask = Array2::from_elem((3, 1), true);
        let arrays = loader
            .load_adjusted_array(&[BoundColumn::new(PRICING_DATASET, "close")], &dates, &[1], mask.view())
            .unwrap();
        let close = arrays[0].as_numeric().unwrap();
        assert_eq!(close.column(0).to_vec(), vec![50.0, 60.0, 70.0]);
    }

    #[test]
    fn test_registry_reports_missing_loader() {
        let registry = LoaderRegistry::new();
        let err = registry.get(&BoundColumn::new("Nope", "x")).err().unwrap();
        assert!(matches!(err, PipelineError::MissingLoader(_)));
    }

    #[test]
    fn test_unknown_price_column_is_rejected() {
        let loader = EquityPricingLoader::new(reader(), None);
        let mask = Array2::from_elem((1, 1), true);
        let result = loader.load_adjusted_array(
            &[BoundColumn::new(PRICING_DATASET, "vwap")],
            &[d(2021, 1, 6)],
            &[1],
            mask.view(),
        );
        assert!(result.is_err());
    }
}
