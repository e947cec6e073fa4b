use chrono::NaiveDate;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use rusqlite::Connection;
use rusty_pipeline::asset::Asset;
use rusty_pipeline::assets::{AssetDB, AssetFinder, SupplementaryFact};
use rusty_pipeline::calendar::{TradingCalendar, WeekdayCalendar};
use rusty_pipeline::config::{FundamentalsConfig, PipelineConfig};
use rusty_pipeline::context::BundleContext;
use rusty_pipeline::data::{SQLiteDailyBarReader, SQLiteDailyBarWriter};
use rusty_pipeline::pipeline::{
    time_trend, Fundamentals, NumericComparison, Pipeline, PriceColumn, Returns, SimpleMovingAverage,
    SimplePipelineEngine,
};
use rusty_pipeline::types::{DailyBar, Sid};
use std::sync::Arc;

const N_SIDS: Sid = 100;

fn d(y: i32, m: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, day).unwrap()
}

/// One year of synthetic bars and quarterly revenue for `N_SIDS` assets
fn context() -> Arc<BundleContext> {
    let (start, end) = (d(2020, 1, 1), d(2020, 12, 31));
    let calendar: Arc<dyn TradingCalendar> = Arc::new(WeekdayCalendar::with_bounds(start, end));
    let sessions = calendar.sessions_in_range(start, end).to_vec();

    let mut db = AssetDB::new_in_memory().unwrap();
    let assets: Vec<Asset> = (1..=N_SIDS)
        .map(|sid| Asset::new(sid, &format!("S{}", sid), "NYSE", start, end))
        .collect();
    db.write_equities(&assets).unwrap();
    let mut facts = Vec::new();
    for sid in 1..=N_SIDS {
        for (q, month) in [1u32, 4, 7, 10].iter().enumerate() {
            facts.push(SupplementaryFact::filing(sid, "revenue_arq", d(2020, *month, 15), (sid * 10 + q as Sid) as f64));
        }
    }
    db.insert_facts(&facts).unwrap();
    let finder =
        AssetFinder::from_connection(db.into_connection(), calendar.clone(), FundamentalsConfig::default()).unwrap();

    let mut writer = SQLiteDailyBarWriter::from_connection(
        Connection::open_in_memory().unwrap(),
        calendar.clone(),
        sessions[0],
        sessions[sessions.len() - 1],
    )
    .unwrap();
    let mut bars = Vec::with_capacity(sessions.len() * N_SIDS as usize);
    for (i, session) in sessions.iter().enumerate() {
        for sid in 1..=N_SIDS {
            let close = 10.0 + sid as f64 + (i as f64 * 0.1).sin();
            bars.push(DailyBar::new(*session, sid, close, close, close, close, 1000.0));
        }
    }
    writer.write_bars(&bars).unwrap();
    let reader = SQLiteDailyBarReader::from_connection(writer.into_connection(), Some(calendar)).unwrap();
    Arc::new(BundleContext::new(Arc::new(finder), Arc::new(reader)))
}

fn benchmark_pipeline(c: &mut Criterion) {
    let ctx = context();
    let mut pipeline = Pipeline::new();
    pipeline
        .add("sma_20", Arc::new(SimpleMovingAverage::new(PriceColumn::close(), 20)))
        .add("returns_5", Arc::new(Returns::new(5).unwrap()))
        .add("revenue", Arc::new(Fundamentals::new("revenue")))
        .set_screen(NumericComparison::gt(PriceColumn::close(), 20.0));

    let mut group = c.benchmark_group("run_pipeline_100_sids_3_months");
    group.sample_size(10);
    for chunksize in [1usize, 21, 63] {
        let engine = SimplePipelineEngine::new(
            ctx.clone(),
            ctx.default_loaders(),
            PipelineConfig {
                chunksize,
                ..PipelineConfig::default()
            },
        );
        group.bench_function(format!("chunksize_{}", chunksize), |b| {
            b.iter(|| {
                engine
                    .run_pipeline(black_box(&pipeline), d(2020, 4, 1), d(2020, 6, 30), None)
                    .unwrap()
            })
        });
    }
    group.finish();
}

fn benchmark_point_in_time(c: &mut Criterion) {
    let ctx = context();
    let sids: Vec<Sid> = (1..=N_SIDS).collect();
    let finder = ctx.asset_finder();

    c.bench_function("get_fundamentals_window_60", |b| {
        b.iter(|| {
            finder.invalidate_query_cache().unwrap();
            finder
                .get_fundamentals_df_window_length(black_box(&sids), "revenue_arq", d(2020, 11, 30), 60)
                .unwrap()
        })
    });
}

fn benchmark_time_trend(c: &mut Criterion) {
    let y: Vec<f64> = (0..252).map(|i| i as f64 * 0.5 + (i as f64).cos()).collect();
    c.bench_function("time_trend_252", |b| b.iter(|| time_trend(black_box(&y))));
}

criterion_group!(
    benches,
    benchmark_pipeline,
    benchmark_point_in_time,
    benchmark_time_trend
);
criterion_main!(benches);
