//! Pipeline Filters - boolean terms used as screens and masks
//!
//! Missing inputs never pass: a comparison against NaN is false, so a screen
//! built from comparisons excludes assets without data. [`Not`] inverts
//! whatever its input produced, missing included; combine it with
//! [`NotMissing`] when that matters.

use crate::context::BundleContext;
use crate::error::{PipelineError, Result};
use crate::pipeline::array::Window;
use crate::pipeline::term::{term_identity, OutRow, OutputKind, Term};
use crate::types::Sid;
use chrono::NaiveDate;
use hashbrown::HashSet;
use std::sync::Arc;

/// Comparison operator of a [`NumericComparison`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Gt,
    Ge,
    Lt,
    Le,
    Eq,
    Ne,
}

impl Comparison {
    fn symbol(&self) -> &'static str {
        match self {
            Comparison::Gt => ">",
            Comparison::Ge => ">=",
            Comparison::Lt => "<",
            Comparison::Le => "<=",
            Comparison::Eq => "==",
            Comparison::Ne => "!=",
        }
    }

    /// False whenever `value` is NaN, `Ne` included
    pub fn holds(&self, value: f64, threshold: f64) -> bool {
        if value.is_nan() {
            return false;
        }
        match self {
            Comparison::Gt => value > threshold,
            Comparison::Ge => value >= threshold,
            Comparison::Lt => value < threshold,
            Comparison::Le => value <= threshold,
            Comparison::Eq => value == threshold,
            Comparison::Ne => value != threshold,
        }
    }
}

/// Latest value of a numeric term compared against a constant
pub struct NumericComparison {
    input: Arc<dyn Term>,
    op: Comparison,
    threshold: f64,
}

impl NumericComparison {
    pub fn new(input: Arc<dyn Term>, op: Comparison, threshold: f64) -> Self {
        Self { input, op, threshold }
    }

    pub fn gt(input: Arc<dyn Term>, threshold: f64) -> Arc<dyn Term> {
        Arc::new(Self::new(input, Comparison::Gt, threshold))
    }

    pub fn lt(input: Arc<dyn Term>, threshold: f64) -> Arc<dyn Term> {
        Arc::new(Self::new(input, Comparison::Lt, threshold))
    }

    pub fn eq(input: Arc<dyn Term>, threshold: f64) -> Arc<dyn Term> {
        Arc::new(Self::new(input, Comparison::Eq, threshold))
    }
}

impl Term for NumericComparison {
    fn identity(&self) -> String {
        term_identity(
            "NumericComparison",
            &[("op", self.op.symbol().to_string()), ("threshold", self.threshold.to_string())],
            &self.inputs(),
            None,
        )
    }

    fn output_kind(&self) -> OutputKind {
        OutputKind::Boolean
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
        let row = window.row(window.nrows() - 1);
        let out = out.boolean()?;
        for (j, slot) in out.iter_mut().enumerate() {
            let value = if row.len() == 1 { row[0] } else { row[j] };
            *slot = self.op.holds(value, self.threshold);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Combinator {
    And,
    Or,
}

/// Conjunction or disjunction of two or more filters
pub struct BooleanCombination {
    combinator: Combinator,
    terms: Vec<Arc<dyn Term>>,
}

impl BooleanCombination {
    fn build(combinator: Combinator, terms: Vec<Arc<dyn Term>>) -> Result<Arc<dyn Term>> {
        if terms.len() < 2 {
            return Err(PipelineError::InvalidGraph(format!(
                "{:?} needs at least two filters",
                combinator
            )));
        }
        if let Some(bad) = terms.iter().find(|t| t.output_kind() != OutputKind::Boolean) {
            return Err(PipelineError::InvalidGraph(format!("{} is not a filter", bad.identity())));
        }
        Ok(Arc::new(Self { combinator, terms }))
    }

    pub fn all(terms: Vec<Arc<dyn Term>>) -> Result<Arc<dyn Term>> {
        Self::build(Combinator::And, terms)
    }

    pub fn any(terms: Vec<Arc<dyn Term>>) -> Result<Arc<dyn Term>> {
        Self::build(Combinator::Or, terms)
    }
}

/// `a & b`
pub fn and(a: Arc<dyn Term>, b: Arc<dyn Term>) -> Result<Arc<dyn Term>> {
    BooleanCombination::all(vec![a, b])
}

/// `a | b`
pub fn or(a: Arc<dyn Term>, b: Arc<dyn Term>) -> Result<Arc<dyn Term>> {
    BooleanCombination::any(vec![a, b])
}

impl Term for BooleanCombination {
    fn identity(&self) -> String {
        let kind = match self.combinator {
            Combinator::And => "And",
            Combinator::Or => "Or",
        };
        term_identity(kind, &[], &self.terms, None)
    }

    fn output_kind(&self) -> OutputKind {
        OutputKind::Boolean
    }

    fn inputs(&self) -> Vec<Arc<dyn Term>> {
        self.terms.clone()
    }

    fn compute(
        &self,
        _ctx: &BundleContext,
        _today: NaiveDate,
        _assets: &[Sid],
        windows: &[Window<'_>],
        out: &mut OutRow<'_>,
    ) -> Result<()> {
        let rows = windows
            .iter()
            .map(|w| w.boolean().map(|a| a.row(a.nrows() - 1).to_vec()))
            .collect::<Result<Vec<_>>>()?;
        for (j, slot) in out.boolean()?.iter_mut().enumerate() {
            let mut values = rows.iter().map(|row| if row.len() == 1 { row[0] } else { row[j] });
            *slot = match self.combinator {
                Combinator::And => values.all(|v| v),
                Combinator::Or => values.any(|v| v),
            };
        }
        Ok(())
    }
}

/// Inverse of a filter
pub struct Not {
    input: Arc<dyn Term>,
}

impl Not {
    pub fn new(input: Arc<dyn Term>) -> Self {
        Self { input }
    }
}

impl Term for Not {
    fn identity(&self) -> String {
        term_identity("Not", &[], &self.inputs(), None)
    }

    fn output_kind(&self) -> OutputKind {
        OutputKind::Boolean
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
        let window = windows[0].boolean()?;
        for (slot, value) in out.boolean()?.iter_mut().zip(window.row(window.nrows() - 1)) {
            *slot = !*value;
        }
        Ok(())
    }
}

/// True where the latest value of a factor or classifier is present
pub struct NotMissing {
    input: Arc<dyn Term>,
}

impl NotMissing {
    pub fn new(input: Arc<dyn Term>) -> Self {
        Self { input }
    }
}

impl Term for NotMissing {
    fn identity(&self) -> String {
        term_identity("NotMissing", &[], &self.inputs(), None)
    }

    fn output_kind(&self) -> OutputKind {
        OutputKind::Boolean
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
        let out = out.boolean()?;
        match &windows[0] {
            Window::Numeric(values) => {
                for (slot, value) in out.iter_mut().zip(values.row(values.nrows() - 1)) {
                    *slot = !value.is_nan();
                }
            }
            Window::Boolean(values) => {
                for (slot, value) in out.iter_mut().zip(values.row(values.nrows() - 1)) {
                    *slot = *value;
                }
            }
            Window::Categorical(labels) => {
                let (rows, _) = labels.shape();
                for (j, slot) in out.iter_mut().enumerate() {
                    *slot = labels.codes()[[rows - 1, j]] != 0;
                }
            }
        }
        Ok(())
    }
}

/// Fixed set of assets
pub struct StaticSids {
    sids: Vec<Sid>,
}

impl StaticSids {
    pub fn new(sids: impl IntoIterator<Item = Sid>) -> Self {
        let mut sids: Vec<Sid> = sids.into_iter().collect();
        sids.sort_unstable();
        sids.dedup();
        Self { sids }
    }
}

impl Term for StaticSids {
    fn identity(&self) -> String {
        let sids: Vec<String> = self.sids.iter().map(|s| s.to_string()).collect();
        term_identity("StaticSids", &[("sids", format!("[{}]", sids.join(",")))], &[], None)
    }

    fn output_kind(&self) -> OutputKind {
        OutputKind::Boolean
    }

    fn compute(
        &self,
        _ctx: &BundleContext,
        _today: NaiveDate,
        assets: &[Sid],
        _windows: &[Window<'_>],
        out: &mut OutRow<'_>,
    ) -> Result<()> {
        for (slot, sid) in out.boolean()?.iter_mut().zip(assets) {
            *slot = self.sids.binary_search(sid).is_ok();
        }
        Ok(())
    }
}

/// Membership in a stored named universe on each session
///
/// Not cached, and neither is anything computed from it: the universe
/// store is updated in place.
pub struct NamedUniverse {
    name: String,
}

impl NamedUniverse {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Term for NamedUniverse {
    fn identity(&self) -> String {
        term_identity("NamedUniverse", &[("name", self.name.clone())], &[], None)
    }

    fn output_kind(&self) -> OutputKind {
        OutputKind::Boolean
    }

    fn cacheable(&self) -> bool {
        false
    }

    fn compute(
        &self,
        ctx: &BundleContext,
        today: NaiveDate,
        assets: &[Sid],
        _windows: &[Window<'_>],
        out: &mut OutRow<'_>,
    ) -> Result<()> {
        let members: HashSet<Sid> = ctx.universes()?.get_sid(&self.name, today)?.into_iter().collect();
        for (slot, sid) in out.boolean()?.iter_mut().zip(assets) {
            *slot = members.contains(sid);
        }
        Ok(())
    }
}

/// Linear-interpolated percentile of sorted, NaN-free `values`
fn percentile(sorted: &[f64], pct: f64) -> f64 {
    if sorted.is_empty() {
        return f64::NAN;
    }
    let rank = pct / 100.0 * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    sorted[lo] + (sorted[hi] - sorted[lo]) * (rank - lo as f64)
}

/// Assets whose latest factor value lies between two cross-sectional
/// percentiles (inclusive) of the masked assets
pub struct PercentileBetween {
    input: Arc<dyn Term>,
    min_percentile: f64,
    max_percentile: f64,
    mask: Option<Arc<dyn Term>>,
}

impl PercentileBetween {
    pub fn new(input: Arc<dyn Term>, min_percentile: f64, max_percentile: f64) -> Result<Self> {
        if !(0.0..=100.0).contains(&min_percentile)
            || !(0.0..=100.0).contains(&max_percentile)
            || min_percentile > max_percentile
        {
            return Err(PipelineError::InvalidInput(format!(
                "Invalid percentile bounds [{}, {}]",
                min_percentile, max_percentile
            )));
        }
        Ok(Self {
            input,
            min_percentile,
            max_percentile,
            mask: None,
        })
    }

    pub fn with_mask(mut self, mask: Arc<dyn Term>) -> Self {
        self.mask = Some(mask);
        self
    }
}

impl Term for PercentileBetween {
    fn identity(&self) -> String {
        term_identity(
            "PercentileBetween",
            &[
                ("min", self.min_percentile.to_string()),
                ("max", self.max_percentile.to_string()),
            ],
            &self.inputs(),
            self.mask.as_ref(),
        )
    }

    fn output_kind(&self) -> OutputKind {
        OutputKind::Boolean
    }

    fn inputs(&self) -> Vec<Arc<dyn Term>> {
        vec![self.input.clone()]
    }

    fn mask(&self) -> Option<Arc<dyn Term>> {
        self.mask.clone()
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
        let row = window.row(window.nrows() - 1);
        let mut sorted: Vec<f64> = row.iter().copied().filter(|v| !v.is_nan()).collect();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let low = percentile(&sorted, self.min_percentile);
        let high = percentile(&sorted, self.max_percentile);
        for (slot, value) in out.boolean()?.iter_mut().zip(row) {
            *slot = !value.is_nan() && *value >= low && *value <= high;
        }
        Ok(())
    }
}
