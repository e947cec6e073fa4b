//! Error types for the pipeline engine and its stores

use crate::types::Sid;
use chrono::NaiveDate;
use thiserror::Error;

/// Main error type for rusty-pipeline
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Asset not found: sid {0}")]
    SidNotFound(Sid),

    #[error("Symbol not found: {symbol}")]
    SymbolNotFound { symbol: String },

    #[error("No data on or before {date} for sid {sid}")]
    NoDataBeforeDate { sid: Sid, date: NaiveDate },

    #[error("No data on {date} for sid {sid}")]
    NoDataOnDate { sid: Sid, date: NaiveDate },

    #[error(
        "Insufficient history: start {requested_start} needs {extra_rows} extra sessions \
         but the calendar begins at {first_session} (earliest satisfiable start: {earliest_start:?})"
    )]
    InsufficientHistory {
        requested_start: NaiveDate,
        extra_rows: usize,
        first_session: NaiveDate,
        earliest_start: Option<NaiveDate>,
    },

    #[error("The shape {actual:?} of term '{term}' does not match the shape {expected:?} of the mask")]
    ShapeMismatch {
        term: String,
        expected: (usize, usize),
        actual: (usize, usize),
    },

    #[error("No PipelineLoader registered for column {0}")]
    MissingLoader(String),

    #[error("Invalid term graph: {0}")]
    InvalidGraph(String),

    #[error("Invalid bar data: {0}")]
    InvalidBarData(String),

    #[error("Invalid SQL identifier: {0}")]
    InvalidIdentifier(String),

    #[error("Type mismatch: {0}")]
    TypeMismatch(String),

    #[error("Calendar error: {0}")]
    CalendarError(String),

    #[error("Cache error: {0}")]
    CacheError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Lock poisoned: {0}")]
    LockPoisoned(&'static str),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Serialization error: {0}")]
    SerdeError(#[from] serde_json::Error),

    #[error("Config parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Array shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),

    #[error("DataFrame error: {0}")]
    Polars(#[from] polars::prelude::PolarsError),
}

impl PipelineError {
    /// Whether the chunked driver may recover from this error by moving the start date
    pub fn is_insufficient_history(&self) -> bool {
        matches!(self, PipelineError::InsufficientHistory { .. })
    }
}

/// Result type alias for rusty-pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;
