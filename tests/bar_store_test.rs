//! Daily bar store and pricing adjustments read back from disk

mod common;

use approx::assert_relative_eq;
use common::{build_bundle, d};
use rusty_pipeline::data::SessionBarReader;
use rusty_pipeline::error::PipelineError;
use rusty_pipeline::types::PriceField;

#[test]
fn test_gap_is_nan_not_filled() {
    let bundle = build_bundle();
    let context = bundle.context();
    let arrays = context
        .bar_reader()
        .load_raw_arrays(&[PriceField::Close], d(2021, 1, 4), d(2021, 1, 6), &[7])
        .unwrap();

    let close = &arrays[0];
    assert_eq!(close.dim(), (3, 1));
    assert_eq!(close[[0, 0]], 50.0);
    assert!(close[[1, 0]].is_nan());
    assert_eq!(close[[2, 0]], 52.0);
}

#[test]
fn test_unknown_sid_column_is_nan() {
    let bundle = build_bundle();
    let context = bundle.context();
    let arrays = context
        .bar_reader()
        .load_raw_arrays(&[PriceField::Close, PriceField::Volume], d(2021, 1, 4), d(2021, 1, 8), &[1, 9999])
        .unwrap();
    assert_eq!(arrays.len(), 2);
    assert_eq!(arrays[0][[0, 0]], 10.0);
    assert!(arrays[0].column(1).iter().all(|v| v.is_nan()));
    assert_eq!(arrays[1][[4, 0]], 1000.0);
}

#[test]
fn test_spot_value_errors() {
    let bundle = build_bundle();
    let context = bundle.context();
    let bars = context.bar_reader();

    assert_eq!(bars.get_value(7, d(2021, 1, 6), PriceField::Close).unwrap(), 52.0);
    assert!(matches!(
        bars.get_value(7, d(2021, 1, 5), PriceField::Close),
        Err(PipelineError::NoDataOnDate { sid: 7, .. })
    ));
    assert!(matches!(
        bars.get_value(3, d(2021, 1, 5), PriceField::Close),
        Err(PipelineError::NoDataBeforeDate { sid: 3, .. })
    ));
    assert!(matches!(
        bars.get_value(9999, d(2021, 1, 5), PriceField::Close),
        Err(PipelineError::SidNotFound(9999))
    ));
    assert_eq!(bars.get_last_traded_dt(7, d(2021, 2, 1)).unwrap(), Some(d(2021, 1, 6)));
}

#[test]
fn test_history_window_applies_split() {
    let bundle = build_bundle();
    let context = bundle.context();
    let portal = context.data_portal();

    let window = portal.prices(&[2], d(2021, 1, 27), d(2021, 2, 2)).unwrap();
    let column = window.column(2).unwrap();
    // the 2:1 split on 02-01 halves every earlier price in the window
    for value in column.iter() {
        assert_relative_eq!(*value, 50.0);
    }

    let before = portal.prices(&[2], d(2021, 1, 27), d(2021, 1, 29)).unwrap();
    assert!(before.column(2).unwrap().iter().all(|v| *v == 100.0));
}
