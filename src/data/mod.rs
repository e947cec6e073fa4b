//! Data storage and access: daily bars, adjustments and the data portal

pub mod adjustments;
pub mod bar_reader;
pub mod daily_bars;
pub mod data_portal;

pub use adjustments::{
    calc_dividend_ratios, Adjustment, AdjustmentKind, CashDividend, DividendRatios, RatioAdjustment,
    SQLiteAdjustmentReader, SQLiteAdjustmentWriter, StockDividend, WindowAdjustments,
};
pub use bar_reader::SessionBarReader;
pub use daily_bars::{fill_missing_sessions, frame_to_bars, SQLiteDailyBarReader, SQLiteDailyBarWriter};
pub use data_portal::{DataPortal, HistoryFrequency};
