//! Numeric pipeline terms
//!
//! Price columns are loadable terms served by the pricing loader. The
//! fundamentals family reads the point-in-time store through the bundle's
//! [`AssetFinder`](crate::assets::AssetFinder) once per session, for the
//! assets alive that day. Everything else computes over trailing windows of
//! its inputs.

use crate::context::BundleContext;
use crate::error::{PipelineError, Result};
use crate::pipeline::array::Window;
use crate::pipeline::loader::PRICING_DATASET;
use crate::pipeline::term::{term_identity, BoundColumn, NDim, OutRow, OutputKind, Term};
use crate::types::{PriceField, Sid};
use chrono::NaiveDate;
use ndarray::ArrayView1;
use std::fmt;
use std::sync::Arc;

/// Quarterly fields default to the as-reported-quarterly dimension
fn quarterly_field(field: &str) -> String {
    if field.contains('_') {
        field.to_string()
    } else {
        format!("{}_arq", field)
    }
}

fn nan_mean<'a>(values: impl IntoIterator<Item = &'a f64>) -> f64 {
    let (sum, count) = values
        .into_iter()
        .filter(|v| !v.is_nan())
        .fold((0.0, 0usize), |(s, c), v| (s + v, c + 1));
    if count == 0 {
        f64::NAN
    } else {
        sum / count as f64
    }
}

fn broadcast_at(row: ArrayView1<'_, f64>, j: usize) -> f64 {
    if row.len() == 1 {
        row[0]
    } else {
        row[j]
    }
}

/// Daily OHLCV column; the value on D is the bar of the session before D
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriceColumn {
    field: PriceField,
}

impl PriceColumn {
    pub fn new(field: PriceField) -> Self {
        Self { field }
    }

    pub fn open() -> Arc<dyn Term> {
        Arc::new(Self::new(PriceField::Open))
    }

    pub fn high() -> Arc<dyn Term> {
        Arc::new(Self::new(PriceField::High))
    }

    pub fn low() -> Arc<dyn Term> {
        Arc::new(Self::new(PriceField::Low))
    }

    pub fn close() -> Arc<dyn Term> {
        Arc::new(Self::new(PriceField::Close))
    }

    pub fn volume() -> Arc<dyn Term> {
        Arc::new(Self::new(PriceField::Volume))
    }

    pub fn field(&self) -> PriceField {
        self.field
    }
}

impl Term for PriceColumn {
    fn identity(&self) -> String {
        format!("{}.{}", PRICING_DATASET, self.field.column())
    }

    fn output_kind(&self) -> OutputKind {
        OutputKind::Numeric
    }

    fn bound_column(&self) -> Option<BoundColumn> {
        Some(BoundColumn::new(PRICING_DATASET, self.field.column()))
    }
}

/// Most recent value of a numeric input
pub struct Latest {
    input: Arc<dyn Term>,
}

impl Latest {
    pub fn new(input: Arc<dyn Term>) -> Self {
        Self { input }
    }
}

impl Term for Latest {
    fn identity(&self) -> String {
        term_identity("Latest", &[], &self.inputs(), None)
    }

    fn output_kind(&self) -> OutputKind {
        OutputKind::Numeric
    }

    fn inputs(&self) -> Vec<Arc<dyn Term>> {
        vec![self.input.clone()]
    }

    fn compute(
        &self,
        _ctx: &BundleContext,
        _today: NaiveDate,
        _assets: &[Sid],
        windows: &[Window<'_>],
        out: &mut OutRow<'_>,
    ) -> Result<()> {
        let window = windows[0].numeric()?;
        let last = window.nrows() - 1;
        for (slot, value) in out.numeric()?.iter_mut().zip(window.row(last)) {
            *slot = *value;
        }
        Ok(())
    }
}

/// Mean of the trailing window, ignoring NaN
pub struct SimpleMovingAverage {
    input: Arc<dyn Term>,
    window_length: usize,
}

impl SimpleMovingAverage {
    pub fn new(input: Arc<dyn Term>, window_length: usize) -> Self {
        Self { input, window_length }
    }
}

impl Term for SimpleMovingAverage {
    fn identity(&self) -> String {
        term_identity(
            "SimpleMovingAverage",
            &[("window_length", self.window_length.to_string())],
            &self.inputs(),
            None,
        )
    }

    fn output_kind(&self) -> OutputKind {
        OutputKind::Numeric
    }

    fn inputs(&self) -> Vec<Arc<dyn Term>> {
        vec![self.input.clone()]
    }

    fn window_length(&self) -> usize {
        self.window_length
    }

    fn compute(
        &self,
        _ctx: &BundleContext,
        _today: NaiveDate,
        _assets: &[Sid],
        windows: &[Window<'_>],
        out: &mut OutRow<'_>,
    ) -> Result<()> {
        let window = windows[0].numeric()?;
        for (slot, column) in out.numeric()?.iter_mut().zip(window.columns()) {
            *slot = nan_mean(column);
        }
        Ok(())
    }
}

/// Percent change of the close over `window_length` sessions
pub struct Returns {
    window_length: usize,
}

impl Returns {
    pub fn new(window_length: usize) -> Result<Self> {
        if window_length < 2 {
            return Err(PipelineError::InvalidInput(
                "Returns needs a window_length of at least 2".to_string(),
            ));
        }
        Ok(Self { window_length })
    }
}

impl Term for Returns {
    fn identity(&self) -> String {
        term_identity(
            "Returns",
            &[("window_length", self.window_length.to_string())],
            &self.inputs(),
            None,
        )
    }

    fn output_kind(&self) -> OutputKind {
        OutputKind::Numeric
    }

    fn inputs(&self) -> Vec<Arc<dyn Term>> {
        vec![PriceColumn::close()]
    }

    fn window_length(&self) -> usize {
        self.window_length
    }

    fn compute(
        &self,
        _ctx: &BundleContext,
        _today: NaiveDate,
        _assets: &[Sid],
        windows: &[Window<'_>],
        out: &mut OutRow<'_>,
    ) -> Result<()> {
        let window = windows[0].numeric()?;
        let last = window.nrows() - 1;
        for (j, slot) in out.numeric()?.iter_mut().enumerate() {
            let (first, latest) = (window[[0, j]], window[[last, j]]);
            *slot = if first == 0.0 { f64::NAN } else { (latest - first) / first };
        }
        Ok(())
    }
}

/// Signature of a [`CustomFactor`] body: fills one output slot per asset
pub type FactorFn =
    dyn Fn(&BundleContext, NaiveDate, &[Sid], &[Window<'_>], &mut [f64]) -> Result<()> + Send + Sync;

/// Factor whose body is a closure
///
/// Terms are identified structurally, so `name` must be unique per closure:
/// two custom factors with the same name, inputs and window length share a
/// graph node and cache entries.
#[derive(Clone)]
pub struct CustomFactor {
    name: String,
    inputs: Vec<Arc<dyn Term>>,
    window_length: usize,
    mask: Option<Arc<dyn Term>>,
    func: Arc<FactorFn>,
}

impl CustomFactor {
    pub fn new<F>(name: impl Into<String>, inputs: Vec<Arc<dyn Term>>, window_length: usize, func: F) -> Self
    where
        F: Fn(&BundleContext, NaiveDate, &[Sid], &[Window<'_>], &mut [f64]) -> Result<()> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            inputs,
            window_length,
            mask: None,
            func: Arc::new(func),
        }
    }

    pub fn with_mask(mut self, mask: Arc<dyn Term>) -> Self {
        self.mask = Some(mask);
        self
    }
}

impl fmt::Debug for CustomFactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.identity())
    }
}

impl Term for CustomFactor {
    fn identity(&self) -> String {
        term_identity(
            "CustomFactor",
            &[
                ("name", self.name.clone()),
                ("window_length", self.window_length.to_string()),
            ],
            &self.inputs,
            self.mask.as_ref(),
        )
    }

    fn output_kind(&self) -> OutputKind {
        OutputKind::Numeric
    }

    fn inputs(&self) -> Vec<Arc<dyn Term>> {
        self.inputs.clone()
    }

    fn window_length(&self) -> usize {
        self.window_length
    }

    fn mask(&self) -> Option<Arc<dyn Term>> {
        self.mask.clone()
    }

    fn compute(
        &self,
        ctx: &BundleContext,
        today: NaiveDate,
        assets: &[Sid],
        windows: &[Window<'_>],
        out: &mut OutRow<'_>,
    ) -> Result<()> {
        (self.func)(ctx, today, assets, windows, out.numeric()?)
    }
}

/// Binary arithmetic between two numeric terms
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithmeticOp {
    Add,
    Sub,
    Mul,
    Div,
}

impl ArithmeticOp {
    fn symbol(&self) -> &'static str {
        match self {
            ArithmeticOp::Add => "+",
            ArithmeticOp::Sub => "-",
            ArithmeticOp::Mul => "*",
            ArithmeticOp::Div => "/",
        }
    }

    fn apply(&self, a: f64, b: f64) -> f64 {
        match self {
            ArithmeticOp::Add => a + b,
            ArithmeticOp::Sub => a - b,
            ArithmeticOp::Mul => a * b,
            ArithmeticOp::Div => {
                if b == 0.0 {
                    f64::NAN
                } else {
                    a / b
                }
            }
        }
    }
}

/// `left <op> right` on the latest row; a 1-D operand is broadcast across
/// assets
pub struct Arithmetic {
    op: ArithmeticOp,
    left: Arc<dyn Term>,
    right: Arc<dyn Term>,
}

impl Arithmetic {
    pub fn new(op: ArithmeticOp, left: Arc<dyn Term>, right: Arc<dyn Term>) -> Self {
        Self { op, left, right }
    }

    pub fn add(left: Arc<dyn Term>, right: Arc<dyn Term>) -> Arc<dyn Term> {
        Arc::new(Self::new(ArithmeticOp::Add, left, right))
    }

    pub fn sub(left: Arc<dyn Term>, right: Arc<dyn Term>) -> Arc<dyn Term> {
        Arc::new(Self::new(ArithmeticOp::Sub, left, right))
    }

    pub fn mul(left: Arc<dyn Term>, right: Arc<dyn Term>) -> Arc<dyn Term> {
        Arc::new(Self::new(ArithmeticOp::Mul, left, right))
    }

    pub fn div(left: Arc<dyn Term>, right: Arc<dyn Term>) -> Arc<dyn Term> {
        Arc::new(Self::new(ArithmeticOp::Div, left, right))
    }
}

impl Term for Arithmetic {
    fn identity(&self) -> String {
        term_identity("Arithmetic", &[("op", self.op.symbol().to_string())], &self.inputs(), None)
    }

    fn output_kind(&self) -> OutputKind {
        OutputKind::Numeric
    }

    fn ndim(&self) -> NDim {
        if self.left.ndim() == NDim::Array1D && self.right.ndim() == NDim::Array1D {
            NDim::Array1D
        } else {
            NDim::Array2D
        }
    }

    fn inputs(&self) -> Vec<Arc<dyn Term>> {
        vec![self.left.clone(), self.right.clone()]
    }

    fn compute(
        &self,
        _ctx: &BundleContext,
        _today: NaiveDate,
        _assets: &[Sid],
        windows: &[Window<'_>],
        out: &mut OutRow<'_>,
    ) -> Result<()> {
        let left = windows[0].numeric()?;
        let right = windows[1].numeric()?;
        let (left, right) = (left.row(left.nrows() - 1), right.row(right.nrows() - 1));
        for (j, slot) in out.numeric()?.iter_mut().enumerate() {
            *slot = self.op.apply(broadcast_at(left, j), broadcast_at(right, j));
        }
        Ok(())
    }
}

/// One asset's column of a 2-D term, as a 1-D term
pub struct Slice {
    input: Arc<dyn Term>,
    sid: Sid,
}

impl Slice {
    pub fn new(input: Arc<dyn Term>, sid: Sid) -> Self {
        Self { input, sid }
    }
}

impl Term for Slice {
    fn identity(&self) -> String {
        term_identity("Slice", &[("sid", self.sid.to_string())], &self.inputs(), None)
    }

    fn output_kind(&self) -> OutputKind {
        OutputKind::Numeric
    }

    fn ndim(&self) -> NDim {
        NDim::Array1D
    }

    fn inputs(&self) -> Vec<Arc<dyn Term>> {
        vec![self.input.clone()]
    }

    fn compute(
        &self,
        _ctx: &BundleContext,
        _today: NaiveDate,
        assets: &[Sid],
        windows: &[Window<'_>],
        out: &mut OutRow<'_>,
    ) -> Result<()> {
        let window = windows[0].numeric()?;
        if let Some(j) = assets.iter().position(|s| *s == self.sid) {
            out.numeric()?[0] = window[[window.nrows() - 1, j]];
        }
        Ok(())
    }
}

/// Latest quarterly fact (`n = 1`) or the `n`-th most recent one
pub struct Fundamentals {
    field: String,
    n: usize,
}

impl Fundamentals {
    /// `field` without a dimension suffix reads the `_arq` dimension
    pub fn new(field: &str) -> Self {
        Self::nth(field, 1)
    }

    pub fn nth(field: &str, n: usize) -> Self {
        Self {
            field: quarterly_field(field),
            n: n.max(1),
        }
    }

    pub fn field(&self) -> &str {
        &self.field
    }
}

impl Term for Fundamentals {
    fn identity(&self) -> String {
        term_identity(
            "Fundamentals",
            &[("field", self.field.clone()), ("n", self.n.to_string())],
            &[],
            None,
        )
    }

    fn output_kind(&self) -> OutputKind {
        OutputKind::Numeric
    }

    fn compute(
        &self,
        ctx: &BundleContext,
        today: NaiveDate,
        assets: &[Sid],
        _windows: &[Window<'_>],
        out: &mut OutRow<'_>,
    ) -> Result<()> {
        let values = ctx.asset_finder().get_fundamentals(assets, &self.field, today, self.n)?;
        out.numeric()?.copy_from_slice(&values);
        Ok(())
    }
}

/// Trailing-twelve-month sum of a quarterly flow field, `k` years back
pub struct FundamentalsTTM {
    field: String,
    k: usize,
}

impl FundamentalsTTM {
    pub fn new(field: &str) -> Self {
        Self::years_back(field, 1)
    }

    pub fn years_back(field: &str, k: usize) -> Self {
        Self {
            field: quarterly_field(field),
            k: k.max(1),
        }
    }
}

impl Term for FundamentalsTTM {
    fn identity(&self) -> String {
        term_identity(
            "FundamentalsTTM",
            &[("field", self.field.clone()), ("k", self.k.to_string())],
            &[],
            None,
        )
    }

    fn output_kind(&self) -> OutputKind {
        OutputKind::Numeric
    }

    fn compute(
        &self,
        ctx: &BundleContext,
        today: NaiveDate,
        assets: &[Sid],
        _windows: &[Window<'_>],
        out: &mut OutRow<'_>,
    ) -> Result<()> {
        let values = ctx.asset_finder().get_fundamentals_ttm(assets, &self.field, today, self.k)?;
        out.numeric()?.copy_from_slice(&values);
        Ok(())
    }
}

/// Which statistic of the trend regression a [`FundamentalsTrend`] emits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrendOutput {
    Slope,
    StdErr,
}

/// Least-squares slope per session of a quarterly field over the last
/// `window_length` sessions
pub struct FundamentalsTrend {
    field: String,
    window_length: usize,
    output: TrendOutput,
}

impl FundamentalsTrend {
    pub fn new(field: &str, window_length: usize) -> Self {
        Self {
            field: quarterly_field(field),
            window_length: window_length.max(2),
            output: TrendOutput::Slope,
        }
    }

    pub fn std_err(mut self) -> Self {
        self.output = TrendOutput::StdErr;
        self
    }
}

/// Slope and its standard error of `y` against `0..y.len()`, skipping NaN.
/// Fewer than two points give NaN; two points give a NaN standard error.
pub fn time_trend(y: &[f64]) -> (f64, f64) {
    let points: Vec<(f64, f64)> = y
        .iter()
        .enumerate()
        .filter(|(_, v)| !v.is_nan())
        .map(|(x, v)| (x as f64, *v))
        .collect();
    let n = points.len() as f64;
    if points.len() < 2 {
        return (f64::NAN, f64::NAN);
    }
    let x_mean = points.iter().map(|(x, _)| x).sum::<f64>() / n;
    let y_mean = points.iter().map(|(_, y)| y).sum::<f64>() / n;
    let sxx: f64 = points.iter().map(|(x, _)| (x - x_mean).powi(2)).sum();
    let sxy: f64 = points.iter().map(|(x, y)| (x - x_mean) * (y - y_mean)).sum();
    let slope = sxy / sxx;
    if points.len() < 3 {
        return (slope, f64::NAN);
    }
    let intercept = y_mean - slope * x_mean;
    let residuals: f64 = points.iter().map(|(x, y)| (y - intercept - slope * x).powi(2)).sum();
    let std_err = (residuals / (n - 2.0) / sxx).sqrt();
    (slope, std_err)
}

impl Term for FundamentalsTrend {
    fn identity(&self) -> String {
        let output = match self.output {
            TrendOutput::Slope => "slope",
            TrendOutput::StdErr => "std_err",
        };
        term_identity(
            "FundamentalsTrend",
            &[
                ("field", self.field.clone()),
                ("window_length", self.window_length.to_string()),
                ("output", output.to_string()),
            ],
            &[],
            None,
        )
    }

    fn output_kind(&self) -> OutputKind {
        OutputKind::Numeric
    }

    fn lookback(&self) -> usize {
        self.window_length - 1
    }

    fn compute(
        &self,
        ctx: &BundleContext,
        today: NaiveDate,
        assets: &[Sid],
        _windows: &[Window<'_>],
        out: &mut OutRow<'_>,
    ) -> Result<()> {
        let history =
            ctx.asset_finder()
                .get_fundamentals_df_window_length(assets, &self.field, today, self.window_length)?;
        for (slot, column) in out.numeric()?.iter_mut().zip(history.columns()) {
            let values: Vec<f64> = column.to_vec();
            let (slope, std_err) = time_trend(&values);
            *slot = match self.output {
                TrendOutput::Slope => slope,
                TrendOutput::StdErr => std_err,
            };
        }
        Ok(())
    }
}

/// Daily-frequency metric (valuation ratios and the like)
pub struct DailyMetric {
    field: String,
    n: usize,
}

impl DailyMetric {
    pub fn new(field: impl Into<String>) -> Self {
        Self::sessions_back(field, 1)
    }

    /// Value as of the `n`-th most recent session (1 = today)
    pub fn sessions_back(field: impl Into<String>, n: usize) -> Self {
        Self {
            field: field.into(),
            n: n.max(1),
        }
    }
}

impl Term for DailyMetric {
    fn identity(&self) -> String {
        term_identity(
            "DailyMetric",
            &[("field", self.field.clone()), ("n", self.n.to_string())],
            &[],
            None,
        )
    }

    fn output_kind(&self) -> OutputKind {
        OutputKind::Numeric
    }

    fn lookback(&self) -> usize {
        self.n - 1
    }

    fn compute(
        &self,
        ctx: &BundleContext,
        today: NaiveDate,
        assets: &[Sid],
        _windows: &[Window<'_>],
        out: &mut OutRow<'_>,
    ) -> Result<()> {
        let values = ctx.asset_finder().get_daily_metrics(assets, &self.field, today, self.n)?;
        out.numeric()?.copy_from_slice(&values);
        Ok(())
    }
}

/// Calendar days since the `n`-th most recent `field` fact became visible
pub struct DaysSinceFiling {
    field: String,
    n: usize,
}

impl DaysSinceFiling {
    pub fn new(field: &str) -> Self {
        Self {
            field: quarterly_field(field),
            n: 1,
        }
    }

    pub fn nth(mut self, n: usize) -> Self {
        self.n = n.max(1);
        self
    }
}

impl Default for DaysSinceFiling {
    fn default() -> Self {
        Self::new("revenue_arq")
    }
}

impl Term for DaysSinceFiling {
    fn identity(&self) -> String {
        term_identity(
            "DaysSinceFiling",
            &[("field", self.field.clone()), ("n", self.n.to_string())],
            &[],
            None,
        )
    }

    fn output_kind(&self) -> OutputKind {
        OutputKind::Numeric
    }

    fn compute(
        &self,
        ctx: &BundleContext,
        today: NaiveDate,
        assets: &[Sid],
        _windows: &[Window<'_>],
        out: &mut OutRow<'_>,
    ) -> Result<()> {
        let datekeys = ctx.asset_finder().get_datekey(assets, &self.field, today, self.n)?;
        for (slot, datekey) in out.numeric()?.iter_mut().zip(datekeys) {
            if let Some(datekey) = datekey {
                *slot = (today - datekey).num_days() as f64;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_quarterly_field_suffix() {
        assert_eq!(Fundamentals::new("revenue").field(), "revenue_arq");
        assert_eq!(Fundamentals::new("revenue_mry").field(), "revenue_mry");
    }

    #[test]
    fn test_identities_distinguish_parameters() {
        assert_eq!(PriceColumn::close().identity(), "EquityPricing.close");
        assert_ne!(Fundamentals::new("revenue").identity(), Fundamentals::nth("revenue", 2).identity());
        assert_ne!(
            FundamentalsTrend::new("assets", 60).identity(),
            FundamentalsTrend::new("assets", 60).std_err().identity()
        );
        let sma = SimpleMovingAverage::new(PriceColumn::close(), 10);
        assert_eq!(
            sma.identity(),
            "SimpleMovingAverage(window_length=10, inputs=[EquityPricing.close])"
        );
    }

    #[test]
    fn test_time_trend() {
        let (slope, std_err) = time_trend(&[1.0, 3.0, 5.0, 7.0]);
        assert_relative_eq!(slope, 2.0);
        assert_relative_eq!(std_err, 0.0);

        let (slope, _) = time_trend(&[f64::NAN, 2.0, f64::NAN, 6.0]);
        assert_relative_eq!(slope, 2.0);

        assert!(time_trend(&[f64::NAN, 1.0]).0.is_nan());
        let (slope, std_err) = time_trend(&[1.0, 2.0]);
        assert_relative_eq!(slope, 1.0);
        assert!(std_err.is_nan());
    }

    #[test]
    fn test_arithmetic_ndim() {
        let two_d = Arithmetic::new(ArithmeticOp::Mul, PriceColumn::close(), PriceColumn::volume());
        assert_eq!(two_d.ndim(), NDim::Array2D);
        let sliced: Arc<dyn Term> = Arc::new(Slice::new(PriceColumn::close(), 1));
        let one_d = Arithmetic::new(ArithmeticOp::Sub, sliced.clone(), sliced);
        assert_eq!(one_d.ndim(), NDim::Array1D);
        assert!(ArithmeticOp::Div.apply(1.0, 0.0).is_nan());
    }

    #[test]
    fn test_returns_requires_two_sessions() {
        assert!(Returns::new(1).is_err());
        assert_eq!(Returns::new(2).unwrap().window_length(), 2);
    }
}
