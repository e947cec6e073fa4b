//! # Rusty-Pipeline
//!
//! A point-in-time factor research engine over a local equity data bundle.
//!
//! A bundle holds daily OHLCV bars, split/merger/dividend adjustments and an
//! asset database whose supplementary facts (fundamentals, daily metrics,
//! sector/exchange info) are versioned by the date they became visible.
//! Pipelines of factors, filters and classifiers are evaluated over a range
//! of trading sessions without look-ahead.
//!
//! ## Example
//!
//! ```rust,no_run
//! use rusty_pipeline::prelude::*;
//! use std::sync::Arc;
//!
//! # fn main() -> rusty_pipeline::error::Result<()> {
//! let config = EngineConfig::load(None)?;
//! let context = Arc::new(BundleContext::open(&config.bundle, &config.fundamentals)?);
//! let engine = SimplePipelineEngine::from_config(context, &config)?;
//!
//! let mut pipeline = Pipeline::new();
//! pipeline.add("sma_20", Arc::new(SimpleMovingAverage::new(PriceColumn::close(), 20)));
//! pipeline.add("revenue", Arc::new(Fundamentals::new("revenue")));
//! pipeline.set_screen(NumericComparison::gt(PriceColumn::close(), 5.0));
//!
//! let start = chrono::NaiveDate::from_ymd_opt(2021, 1, 4).unwrap();
//! let end = chrono::NaiveDate::from_ymd_opt(2021, 6, 30).unwrap();
//! let output = engine.run_pipeline(&pipeline, start, end, None)?;
//! println!("{} rows", output.len());
//! # Ok(())
//! # }
//! ```

pub mod asset;
pub mod assets;
pub mod calendar;
pub mod config;
pub mod context;
pub mod data;
pub mod error;
pub mod pipeline;
pub mod sql;
pub mod types;
pub mod universe;

pub mod prelude {
    //! Commonly used types and traits
    pub use crate::asset::Asset;
    pub use crate::assets::{AssetDB, AssetFinder, SupplementaryFact};
    pub use crate::calendar::{get_calendar, NYSECalendar, TradingCalendar, WeekdayCalendar};
    pub use crate::config::{EngineConfig, HistoryPolicy, PipelineConfig};
    pub use crate::context::BundleContext;
    pub use crate::data::{SQLiteAdjustmentReader, SQLiteDailyBarReader, SQLiteDailyBarWriter};
    pub use crate::error::{PipelineError, Result};
    pub use crate::pipeline::{
        ElementOf, Fundamentals, FundamentalsTTM, InfoClassifier, NotMissing, NumericComparison,
        Pipeline, PipelineOutput, PriceColumn, SimpleMovingAverage, SimplePipelineEngine, Term,
    };
    pub use crate::types::*;
    pub use crate::universe::UniverseStore;
}
