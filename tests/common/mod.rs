//! Shared on-disk bundle fixture for the integration tests
//!
//! Weekday calendar. Sessions start 2021-01-04.
//!
//! | sid | symbol | lifetime              | bars                                          | facts |
//! |-----|--------|-----------------------|-----------------------------------------------|-------|
//! | 1   | AAA    | 2021-01-04..06-30     | close = 10 + session index, Jan-Mar           | revenue, sector Technology |
//! | 2   | BBB    | 2021-01-04..06-30     | close 100, 50 after a 2:1 split on 02-01      | sector Energy from 02-01 |
//! | 3   | CCC    | 2021-02-01..06-30     | close 3                                       | none |
//! | 7   | GAP    | 2021-01-04..01-06     | 01-04 = 50, 01-06 = 52                        | none |
//! | 42  | FFF    | 2019-01-02..06-30     | none                                          | revenue 90 (2019-10-15), 100 (2020-01-15) |

#![allow(dead_code)]

use chrono::NaiveDate;
use rusty_pipeline::asset::Asset;
use rusty_pipeline::assets::{AssetDB, SupplementaryFact};
use rusty_pipeline::calendar::{TradingCalendar, WeekdayCalendar};
use rusty_pipeline::config::EngineConfig;
use rusty_pipeline::context::BundleContext;
use rusty_pipeline::data::{RatioAdjustment, SQLiteAdjustmentWriter, SQLiteDailyBarReader, SQLiteDailyBarWriter};
use rusty_pipeline::pipeline::{PipelineOutput, SimplePipelineEngine};
use rusty_pipeline::types::DailyBar;
use std::sync::Arc;
use tempfile::TempDir;

pub fn d(y: i32, m: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, day).unwrap()
}

pub fn split_date() -> NaiveDate {
    d(2021, 2, 1)
}

pub struct Bundle {
    pub dir: TempDir,
    pub config: EngineConfig,
}

impl Bundle {
    pub fn context(&self) -> Arc<BundleContext> {
        Arc::new(BundleContext::open(&self.config.bundle, &self.config.fundamentals).unwrap())
    }

    pub fn engine(&self) -> SimplePipelineEngine {
        SimplePipelineEngine::from_config(self.context(), &self.config).unwrap()
    }
}

fn sessions(calendar: &dyn TradingCalendar) -> Vec<NaiveDate> {
    calendar.sessions_in_range(d(2021, 1, 4), d(2021, 3, 31)).to_vec()
}

/// Close of sid 1 on its `i`-th session
pub fn aaa_close(i: usize) -> f64 {
    10.0 + i as f64
}

pub fn build_bundle() -> Bundle {
    let dir = TempDir::new().unwrap();
    let mut config = EngineConfig::default();
    config.bundle.root = dir.path().join("bundle");
    config.cache.dir = dir.path().join("cache");
    config.ensure_dirs().unwrap();

    let calendar: Arc<dyn TradingCalendar> = Arc::new(WeekdayCalendar::new());
    let end = d(2021, 6, 30);

    let mut db = AssetDB::new(&config.bundle.assets_path()).unwrap();
    db.write_equities(&[
        Asset::new(1, "AAA", "NYSE", d(2021, 1, 4), end),
        Asset::new(2, "BBB", "NASDAQ", d(2021, 1, 4), end),
        Asset::new(3, "CCC", "NYSE", d(2021, 2, 1), end),
        Asset::new(7, "GAP", "NYSE", d(2021, 1, 4), d(2021, 1, 6)),
        Asset::new(42, "FFF", "NYSE", d(2019, 1, 2), end),
    ])
    .unwrap();
    db.insert_facts(&[
        SupplementaryFact::filing(1, "revenue_arq", d(2020, 9, 15), 180.0),
        SupplementaryFact::filing(1, "revenue_arq", d(2020, 12, 15), 200.0),
        SupplementaryFact::new(1, "sector", d(2020, 1, 1), "Technology"),
        SupplementaryFact::new(2, "sector", split_date(), "Energy"),
        SupplementaryFact::new(42, "revenue_arq", d(2019, 10, 15), 90.0),
        SupplementaryFact::new(42, "revenue_arq", d(2020, 1, 15), 100.0),
    ])
    .unwrap();
    drop(db);

    let mut bars = Vec::new();
    for (i, session) in sessions(calendar.as_ref()).into_iter().enumerate() {
        let a = aaa_close(i);
        bars.push(DailyBar::new(session, 1, a, a, a, a, 1000.0));
        let (b, volume) = if session < split_date() { (100.0, 1000.0) } else { (50.0, 2000.0) };
        bars.push(DailyBar::new(session, 2, b, b, b, b, volume));
        if session >= split_date() {
            bars.push(DailyBar::new(session, 3, 3.0, 3.0, 3.0, 3.0, 10.0));
        }
    }
    bars.push(DailyBar::new(d(2021, 1, 4), 7, 50.0, 50.0, 50.0, 50.0, 100.0));
    bars.push(DailyBar::new(d(2021, 1, 6), 7, 52.0, 52.0, 52.0, 52.0, 100.0));

    let prices = config.bundle.prices_path();
    let mut writer = SQLiteDailyBarWriter::new(&prices, calendar.clone(), d(2021, 1, 4), end).unwrap();
    writer.write_bars(&bars).unwrap();
    drop(writer);

    let reader = SQLiteDailyBarReader::open(&prices, Some(calendar)).unwrap();
    let mut adjustments = SQLiteAdjustmentWriter::new(&config.bundle.adjustments_path()).unwrap();
    adjustments
        .write(&[RatioAdjustment::new(2, split_date(), 0.5)], &[], &[], &[], &reader)
        .unwrap();

    Bundle { dir, config }
}

/// Whole output as CSV text, so NaN cells compare equal
pub fn csv(out: &PipelineOutput) -> String {
    let mut buf = Vec::new();
    out.to_csv(&mut buf).unwrap();
    String::from_utf8(buf).unwrap()
}
