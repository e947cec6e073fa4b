//! End-to-end pipeline runs over an on-disk bundle

mod common;

use approx::assert_relative_eq;
use common::{aaa_close, build_bundle, csv, d, Bundle};
use rusty_pipeline::assets::AssetFinder;
use rusty_pipeline::calendar::{TradingCalendar, WeekdayCalendar};
use rusty_pipeline::config::{HistoryPolicy, PipelineConfig};
use rusty_pipeline::context::BundleContext;
use rusty_pipeline::data::{SQLiteAdjustmentReader, SQLiteDailyBarReader};
use rusty_pipeline::error::PipelineError;
use rusty_pipeline::pipeline::{
    DailyMetric, ElementOf, Fundamentals, FundamentalsTrend, InfoClassifier, Latest, Not, NotMissing, NumericComparison, OutputColumn, Pipeline,
    PipelineHooks, PriceColumn, SimpleMovingAverage, SimplePipelineEngine, Term,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn research_pipeline() -> Pipeline {
    let mut pipeline = Pipeline::new();
    pipeline
        .add("close", Arc::new(Latest::new(PriceColumn::close())))
        .add("sma_5", Arc::new(SimpleMovingAverage::new(PriceColumn::close(), 5)))
        .add("revenue", Arc::new(Fundamentals::new("revenue")))
        .add("sector", Arc::new(InfoClassifier::new("sector")));
    pipeline
}

#[derive(Default)]
struct CacheHits(AtomicUsize);

impl PipelineHooks for CacheHits {
    fn on_cache_hit(&self, _term: &str) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }
}

#[test]
fn test_prices_are_known_before_the_open() {
    let bundle = build_bundle();
    let out = bundle
        .engine()
        .run_pipeline(&research_pipeline(), d(2021, 1, 11), d(2021, 1, 15), None)
        .unwrap();

    // 01-11 is the 6th session; it sees the close of the 5th
    assert_eq!(out.get_f64(d(2021, 1, 11), 1, "close"), Some(aaa_close(4)));
    assert_eq!(out.get_f64(d(2021, 1, 15), 1, "close"), Some(aaa_close(8)));
    assert_relative_eq!(
        out.get_f64(d(2021, 1, 15), 1, "sma_5").unwrap(),
        (4..=8).map(aaa_close).sum::<f64>() / 5.0
    );
    assert_eq!(out.get_f64(d(2021, 1, 15), 1, "revenue"), Some(200.0));
}

#[test]
fn test_split_is_not_seen_before_it_happens() {
    let bundle = build_bundle();
    let out = bundle
        .engine()
        .run_pipeline(&research_pipeline(), d(2021, 1, 29), d(2021, 2, 3), None)
        .unwrap();

    // the window ending 01-29 predates the split
    assert_relative_eq!(out.get_f64(d(2021, 2, 1), 2, "sma_5").unwrap(), 100.0);
    // afterwards the whole window is split-adjusted
    assert_relative_eq!(out.get_f64(d(2021, 2, 2), 2, "sma_5").unwrap(), 50.0);
    assert_relative_eq!(out.get_f64(d(2021, 2, 3), 2, "sma_5").unwrap(), 50.0);
    assert_relative_eq!(out.get_f64(d(2021, 2, 3), 2, "close").unwrap(), 50.0);
}

#[test]
fn test_chunking_does_not_change_results() {
    let bundle = build_bundle();
    let engine = bundle.engine();
    let pipeline = research_pipeline();
    let (start, end) = (d(2021, 1, 11), d(2021, 3, 5));

    let single = engine.run_pipeline(&pipeline, start, end, Some(1)).unwrap();
    let weekly = engine.run_pipeline(&pipeline, start, end, Some(5)).unwrap();
    let odd = engine.run_pipeline(&pipeline, start, end, Some(7)).unwrap();
    let whole = engine.run_pipeline(&pipeline, start, end, Some(10_000_000)).unwrap();

    assert!(!single.is_empty());
    assert_eq!(csv(&single), csv(&weekly));
    assert_eq!(csv(&single), csv(&odd));
    assert_eq!(csv(&single), csv(&whole));
}

#[test]
fn test_categories_are_unified_across_chunks() {
    let bundle = build_bundle();
    let out = bundle
        .engine()
        .run_pipeline(&research_pipeline(), d(2021, 1, 11), d(2021, 2, 26), Some(5))
        .unwrap();

    match out.column("sector") {
        Some(OutputColumn::Categorical { categories, .. }) => {
            assert_eq!(categories, &vec!["NA".to_string(), "Energy".to_string(), "Technology".to_string()]);
        }
        other => panic!("unexpected sector column {:?}", other),
    }
    assert_eq!(out.get_label(d(2021, 1, 15), 1, "sector"), Some("Technology"));
    assert_eq!(out.get_label(d(2021, 1, 15), 2, "sector"), Some("NA"));
    assert_eq!(out.get_label(d(2021, 2, 2), 2, "sector"), Some("Energy"));
}

#[test]
fn test_cached_rerun_is_identical() {
    let bundle = build_bundle();
    let pipeline = research_pipeline();
    let (start, end) = (d(2021, 1, 11), d(2021, 2, 26));

    let first = bundle.engine().run_pipeline(&pipeline, start, end, Some(10)).unwrap();
    assert!(std::fs::read_dir(&bundle.config.cache.dir).unwrap().count() > 0);

    let hits = Arc::new(CacheHits::default());
    let engine = bundle.engine().with_hook(hits.clone());
    let second = engine.run_pipeline(&pipeline, start, end, Some(10)).unwrap();

    assert!(hits.0.load(Ordering::Relaxed) > 0);
    assert_eq!(csv(&first), csv(&second));
}

#[test]
fn test_screens_exclude_missing_values() {
    let bundle = build_bundle();
    let engine = bundle.engine();
    let (start, end) = (d(2021, 2, 2), d(2021, 2, 5));
    let day = d(2021, 2, 3);
    let revenue: Arc<dyn Term> = Arc::new(Fundamentals::new("revenue"));
    let sector: Arc<dyn Term> = Arc::new(InfoClassifier::sector());
    let known_sector: Arc<dyn Term> = Arc::new(ElementOf::new(sector, &["Technology", "Energy"]).unwrap());
    let no_revenue: Arc<dyn Term> = Arc::new(Not::new(Arc::new(NotMissing::new(revenue.clone()))));

    let screens: Vec<(Arc<dyn Term>, Vec<u64>)> = vec![
        (NumericComparison::gt(revenue, 0.0), vec![1]),
        (known_sector, vec![1, 2]),
        (NumericComparison::lt(PriceColumn::close(), 1000.0), vec![1, 2, 3]),
        (no_revenue, vec![2, 3, 42]),
    ];
    for (screen, expected) in screens {
        let identity = screen.identity();
        let mut pipeline = Pipeline::new();
        pipeline.set_screen(screen);
        let out = engine.run_pipeline(&pipeline, start, end, None).unwrap();
        assert_eq!(out.sids_on(day), &expected[..], "{}", identity);
    }
}

/// The fixture bundle on a calendar that starts with the first bar
fn bounded_context(bundle: &Bundle) -> Arc<BundleContext> {
    let calendar: Arc<dyn TradingCalendar> = Arc::new(WeekdayCalendar::with_bounds(d(2021, 1, 4), d(2021, 6, 30)));
    let paths = &bundle.config.bundle;
    let finder = AssetFinder::open(&paths.assets_path(), calendar.clone(), bundle.config.fundamentals.clone()).unwrap();
    let bars = SQLiteDailyBarReader::open(&paths.prices_path(), Some(calendar)).unwrap();
    let adjustments = SQLiteAdjustmentReader::open(&paths.adjustments_path()).unwrap();
    Arc::new(BundleContext::new(Arc::new(finder), Arc::new(bars)).with_adjustments(Arc::new(adjustments)))
}

#[test]
fn test_insufficient_history_policies() {
    let bundle = build_bundle();
    let context = bounded_context(&bundle);

    let mut pipeline = Pipeline::new();
    pipeline.add("sma_10", Arc::new(SimpleMovingAverage::new(PriceColumn::close(), 10)));

    let strict = SimplePipelineEngine::new(
        context.clone(),
        context.default_loaders(),
        PipelineConfig {
            history_policy: HistoryPolicy::Fail,
            ..PipelineConfig::default()
        },
    );
    match strict.run_pipeline(&pipeline, d(2021, 1, 4), d(2021, 1, 29), None) {
        Err(PipelineError::InsufficientHistory { extra_rows, earliest_start, .. }) => {
            assert_eq!(extra_rows, 9);
            assert_eq!(earliest_start, Some(d(2021, 1, 15)));
        }
        other => panic!("expected insufficient history, got {:?}", other.map(|o| o.len())),
    }

    let lenient = SimplePipelineEngine::new(context.clone(), context.default_loaders(), PipelineConfig::default());
    let out = lenient.run_pipeline(&pipeline, d(2021, 1, 4), d(2021, 1, 29), None).unwrap();
    assert_eq!(out.unique_dates().first(), Some(&d(2021, 1, 15)));
    assert_eq!(out.unique_dates().last(), Some(&d(2021, 1, 29)));
}

#[test]
fn test_store_lookbacks_count_as_history() {
    let bundle = build_bundle();
    let context = bounded_context(&bundle);
    let mut pipeline = Pipeline::new();
    pipeline.add("marketcap_4d_ago", Arc::new(DailyMetric::sessions_back("marketcap", 5)));

    let strict = SimplePipelineEngine::new(
        context.clone(),
        context.default_loaders(),
        PipelineConfig {
            history_policy: HistoryPolicy::Fail,
            ..PipelineConfig::default()
        },
    );
    match strict.run_pipeline(&pipeline, d(2021, 1, 4), d(2021, 1, 15), None) {
        Err(PipelineError::InsufficientHistory { extra_rows, earliest_start, .. }) => {
            assert_eq!(extra_rows, 4);
            assert_eq!(earliest_start, Some(d(2021, 1, 8)));
        }
        other => panic!("expected insufficient history, got {:?}", other.map(|o| o.len())),
    }

    let lenient = SimplePipelineEngine::new(context.clone(), context.default_loaders(), PipelineConfig::default());
    let out = lenient.run_pipeline(&pipeline, d(2021, 1, 4), d(2021, 1, 15), None).unwrap();
    assert_eq!(out.unique_dates().first(), Some(&d(2021, 1, 8)));

    // prices on the very first session have no earlier close to show
    let mut prices = Pipeline::new();
    prices.add("close", Arc::new(Latest::new(PriceColumn::close())));
    let out = lenient.run_pipeline(&prices, d(2021, 1, 4), d(2021, 1, 5), None).unwrap();
    assert!(out.get_f64(d(2021, 1, 4), 1, "close").unwrap().is_nan());
    assert_eq!(out.get_f64(d(2021, 1, 5), 1, "close"), Some(aaa_close(0)));
}

#[test]
fn test_fundamentals_trend_follows_filings() {
    let bundle = build_bundle();
    let mut pipeline = Pipeline::new();
    pipeline.add("revenue_trend", Arc::new(FundamentalsTrend::new("revenue", 40)));
    let out = bundle
        .engine()
        .run_pipeline(&pipeline, d(2021, 1, 11), d(2021, 1, 15), Some(5))
        .unwrap();

    // the 40-session window straddles the 180 -> 200 step visible from 2020-12-16
    let slope = out.get_f64(d(2021, 1, 11), 1, "revenue_trend").unwrap();
    assert!(slope > 0.0);
    assert!(out.get_f64(d(2021, 1, 11), 2, "revenue_trend").unwrap().is_nan());
}
