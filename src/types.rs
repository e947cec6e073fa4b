//! Core types and constants

use crate::error::{PipelineError, Result};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Stable integer identifier of an asset
pub type Sid = u64;

/// Trading session label (midnight, calendar-local)
pub type Session = NaiveDate;

/// Date format used by every SQLite store
pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// Format a session for storage
pub fn fmt_date(date: NaiveDate) -> String {
    date.format(DATE_FORMAT).to_string()
}

/// Parse a stored session label
pub fn parse_date(s: &str) -> Result<NaiveDate> {
    // Older bundles carry a midnight time suffix
    let day = s.get(..10).unwrap_or(s);
    NaiveDate::parse_from_str(day, DATE_FORMAT)
        .map_err(|e| PipelineError::InvalidInput(format!("Invalid date '{}': {}", s, e)))
}

/// OHLCV column of the daily bar store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PriceField {
    Open,
    High,
    Low,
    Close,
    Volume,
}

impl PriceField {
    pub const ALL: [PriceField; 5] = [
        PriceField::Open,
        PriceField::High,
        PriceField::Low,
        PriceField::Close,
        PriceField::Volume,
    ];

    /// Column name in the `prices` table
    pub fn column(&self) -> &'static str {
        match self {
            PriceField::Open => "open",
            PriceField::High => "high",
            PriceField::Low => "low",
            PriceField::Close => "close",
            PriceField::Volume => "volume",
        }
    }

    pub fn is_price(&self) -> bool {
        !matches!(self, PriceField::Volume)
    }
}

impl fmt::Display for PriceField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.column())
    }
}

impl FromStr for PriceField {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "open" => Ok(PriceField::Open),
            "high" => Ok(PriceField::High),
            "low" => Ok(PriceField::Low),
            "close" | "price" => Ok(PriceField::Close),
            "volume" => Ok(PriceField::Volume),
            other => Err(PipelineError::InvalidInput(format!(
                "Unknown price field: {}",
                other
            ))),
        }
    }
}

/// One daily OHLCV row keyed by `(date, sid)`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DailyBar {
    pub date: NaiveDate,
    pub sid: Sid,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl DailyBar {
    pub fn new(date: NaiveDate, sid: Sid, open: f64, high: f64, low: f64, close: f64, volume: f64) -> Self {
        Self {
            date,
            sid,
            open,
            high,
            low,
            close,
            volume,
        }
    }

    /// Check OHLC relationships
    pub fn is_consistent(&self) -> bool {
        self.high >= self.low
            && self.high >= self.open
            && self.high >= self.close
            && self.low <= self.open
            && self.low <= self.close
            && self.volume >= 0.0
    }

    /// Value of a single field
    pub fn field(&self, field: PriceField) -> f64 {
        match field {
            PriceField::Open => self.open,
            PriceField::High => self.high,
            PriceField::Low => self.low,
            PriceField::Close => self.close,
            PriceField::Volume => self.volume,
        }
    }
}
