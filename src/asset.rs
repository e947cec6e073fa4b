//! Asset representations

use crate::types::Sid;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Equity with a time-bounded identity.
///
/// `sid` is the only stable key: the same `symbol` may be reused by
/// different assets over time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Asset {
    /// Unique asset identifier
    pub sid: Sid,
    /// Trading symbol
    pub symbol: String,
    /// Asset name
    pub name: Option<String>,
    /// Exchange where asset is traded
    pub exchange: String,
    /// First day the asset existed
    pub start_date: NaiveDate,
    /// Last day the asset existed
    pub end_date: NaiveDate,
    /// Date positions are force-closed
    pub auto_close_date: Option<NaiveDate>,
}

impl Asset {
    /// Create a new asset
    pub fn new(
        sid: Sid,
        symbol: impl Into<String>,
        exchange: impl Into<String>,
        start_date: NaiveDate,
        end_date: NaiveDate,
    ) -> Self {
        Self {
            sid,
            symbol: symbol.into(),
            name: None,
            exchange: exchange.into(),
            start_date,
            end_date,
            auto_close_date: None,
        }
    }

    /// Create a new asset with a name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_auto_close_date(mut self, date: NaiveDate) -> Self {
        self.auto_close_date = Some(date);
        self
    }

    /// Whether the asset existed on `date`
    pub fn is_alive(&self, date: NaiveDate) -> bool {
        self.start_date <= date && date <= self.end_date
    }

    /// Get the full identifier (symbol@exchange)
    pub fn full_id(&self) -> String {
        format!("{}@{}", self.symbol, self.exchange)
    }
}

impl fmt::Display for Asset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Equity({} [{}])", self.sid, self.symbol)
    }
}
