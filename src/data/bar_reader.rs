//! Bar Readers - daily OHLCV data access

use crate::calendar::TradingCalendar;
use crate::error::Result;
use crate::types::{PriceField, Sid};
use chrono::NaiveDate;
use ndarray::Array2;
use std::sync::Arc;

/// Reader for session-aligned (daily) bars
pub trait SessionBarReader: Send + Sync {
    /// Calendar the bars are aligned to
    fn trading_calendar(&self) -> Arc<dyn TradingCalendar>;

    /// One `(sessions, sids)` matrix per field over the sessions in
    /// `[start, end]`. Cells without a stored bar are NaN; unknown sids yield
    /// all-NaN columns.
    fn load_raw_arrays(
        &self,
        fields: &[PriceField],
        start: NaiveDate,
        end: NaiveDate,
        sids: &[Sid],
    ) -> Result<Vec<Array2<f64>>>;

    /// Single value on `date`
    ///
    /// Fails with `SidNotFound` for sids the store has never seen,
    /// `NoDataBeforeDate` when the first bar is after `date` and
    /// `NoDataOnDate` when there is history but no bar on `date` itself.
    fn get_value(&self, sid: Sid, date: NaiveDate, field: PriceField) -> Result<f64>;

    /// Latest session on or before `date` with a bar for `sid`
    fn get_last_traded_dt(&self, sid: Sid, date: NaiveDate) -> Result<Option<NaiveDate>>;

    /// Last session with any stored bar
    fn last_available_dt(&self) -> Result<Option<NaiveDate>>;

    /// First session with any stored bar
    fn first_trading_day(&self) -> Result<Option<NaiveDate>>;

    /// Calendar sessions spanned by the stored bars
    fn sessions(&self) -> Result<Vec<NaiveDate>> {
        match (self.first_trading_day()?, self.last_available_dt()?) {
            (Some(first), Some(last)) => Ok(self
                .trading_calendar()
                .sessions_in_range(first, last)
                .to_vec()),
            _ => Ok(Vec::new()),
        }
    }
}
