//! Pipeline Term - nodes of the computational graph
//!
//! A term declares its inputs, how many trailing sessions of each input it
//! needs (`window_length`) and what kind of values it produces. Terms that
//! read straight from a store without inputs are *loadable*: they name a
//! [`BoundColumn`] and are served in batches by a
//! [`PipelineLoader`](crate::pipeline::loader::PipelineLoader). Every other
//! term fills one output row per session through [`Term::compute`].

use crate::assets::MISSING_LABEL;
use crate::context::BundleContext;
use crate::error::{PipelineError, Result};
use crate::pipeline::array::{LabelArray, TermArray, Window};
use crate::types::Sid;
use chrono::NaiveDate;
use ndarray::{Array2, ArrayView2};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Index of a term inside a [`TermGraph`](crate::pipeline::graph::TermGraph)
pub type TermId = usize;

/// Kind of values a term produces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OutputKind {
    /// Floating point, NaN when missing
    Numeric,
    /// Filters, false when missing
    Boolean,
    /// Classifier labels over a category set
    Categorical,
}

impl OutputKind {
    pub fn tag(&self) -> &'static str {
        match self {
            OutputKind::Numeric => "numeric",
            OutputKind::Boolean => "boolean",
            OutputKind::Categorical => "categorical",
        }
    }
}

impl fmt::Display for OutputKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.tag())
    }
}

impl FromStr for OutputKind {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "numeric" => Ok(OutputKind::Numeric),
            "boolean" => Ok(OutputKind::Boolean),
            "categorical" => Ok(OutputKind::Categorical),
            other => Err(PipelineError::TypeMismatch(format!("Unknown output kind: {}", other))),
        }
    }
}

/// Dimensionality of term output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NDim {
    /// One value per session (`(days, 1)`)
    Array1D,
    /// One value per session and asset
    Array2D,
}

/// Store column served by a loader, e.g. `EquityPricing.close`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BoundColumn {
    pub dataset: String,
    pub column: String,
}

impl BoundColumn {
    pub fn new(dataset: impl Into<String>, column: impl Into<String>) -> Self {
        Self {
            dataset: dataset.into(),
            column: column.into(),
        }
    }
}

impl fmt::Display for BoundColumn {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}.{}", self.dataset, self.column)
    }
}

/// Output buffer for one session of [`Term::compute`]
///
/// Buffers arrive pre-filled with the missing value and hold one slot per
/// asset passed to `compute` (a single slot for 1-D terms).
pub enum OutRow<'a> {
    Numeric(&'a mut [f64]),
    Boolean(&'a mut [bool]),
    Categorical(&'a mut [String]),
}

impl<'a> OutRow<'a> {
    pub fn len(&self) -> usize {
        match self {
            OutRow::Numeric(v) => v.len(),
            OutRow::Boolean(v) => v.len(),
            OutRow::Categorical(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn numeric(&mut self) -> Result<&mut [f64]> {
        match self {
            OutRow::Numeric(v) => Ok(&mut **v),
            _ => Err(PipelineError::TypeMismatch("Expected a numeric output row".to_string())),
        }
    }

    pub fn boolean(&mut self) -> Result<&mut [bool]> {
        match self {
            OutRow::Boolean(v) => Ok(&mut **v),
            _ => Err(PipelineError::TypeMismatch("Expected a boolean output row".to_string())),
        }
    }

    pub fn labels(&mut self) -> Result<&mut [String]> {
        match self {
            OutRow::Categorical(v) => Ok(&mut **v),
            _ => Err(PipelineError::TypeMismatch("Expected a categorical output row".to_string())),
        }
    }
}

/// An input array as seen by a consuming term
///
/// `offset` is the number of leading rows of `array` that precede the
/// consumer's first window; the window for the consumer's row `i` ends at
/// `offset + i + window_length - 1`.
#[derive(Clone, Copy)]
pub struct TermInput<'a> {
    pub array: &'a TermArray,
    pub offset: usize,
    pub ndim: NDim,
}

/// Trait for all pipeline terms
pub trait Term: Send + Sync {
    /// Structural identity: kind, parameters and the identities of inputs
    /// and mask. Terms with equal identities are the same graph node and
    /// share cache entries.
    fn identity(&self) -> String;

    fn output_kind(&self) -> OutputKind;

    fn ndim(&self) -> NDim {
        NDim::Array2D
    }

    /// Terms whose trailing windows feed `compute`
    fn inputs(&self) -> Vec<Arc<dyn Term>> {
        Vec::new()
    }

    /// Trailing sessions of each input needed per output row
    fn window_length(&self) -> usize {
        1
    }

    /// Sessions before each row that `compute` reads straight from the
    /// stores. The root mask reaches this far back so a short calendar is
    /// reported as insufficient history.
    fn lookback(&self) -> usize {
        0
    }

    /// Boolean term restricting the assets passed to `compute`
    fn mask(&self) -> Option<Arc<dyn Term>> {
        None
    }

    /// Store column for loadable terms
    fn bound_column(&self) -> Option<BoundColumn> {
        None
    }

    /// Declared category set of categorical terms
    fn categories(&self) -> Option<Vec<String>> {
        None
    }

    fn missing_label(&self) -> &str {
        MISSING_LABEL
    }

    /// Whether results may be reused from the term cache. Loadable terms
    /// are rebuilt every run. A computed term returning false keeps every
    /// term that depends on it out of the cache as well.
    fn cacheable(&self) -> bool {
        self.bound_column().is_none()
    }

    /// Fill `out` for `today`. `assets` are the masked assets, in the same
    /// order as the columns of every window.
    fn compute(
        &self,
        _ctx: &BundleContext,
        _today: NaiveDate,
        _assets: &[Sid],
        _windows: &[Window<'_>],
        _out: &mut OutRow<'_>,
    ) -> Result<()> {
        Err(PipelineError::InvalidGraph(format!(
            "{} is not computable",
            self.identity()
        )))
    }

    /// Compute the full `(dates, assets)` block. The default calls
    /// [`Term::compute`] once per session.
    fn compute_chunk(
        &self,
        ctx: &BundleContext,
        dates: &[NaiveDate],
        assets: &[Sid],
        mask: ArrayView2<'_, bool>,
        inputs: &[TermInput<'_>],
    ) -> Result<TermArray> {
        compute_by_session(self, ctx, dates, assets, mask, inputs)
    }
}

impl fmt::Debug for dyn Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.identity())
    }
}

/// Render a structural identity string
pub fn term_identity(
    kind: &str,
    params: &[(&str, String)],
    inputs: &[Arc<dyn Term>],
    mask: Option<&Arc<dyn Term>>,
) -> String {
    let mut parts: Vec<String> = params.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
    if !inputs.is_empty() {
        let inputs: Vec<String> = inputs.iter().map(|t| t.identity()).collect();
        parts.push(format!("inputs=[{}]", inputs.join(", ")));
    }
    if let Some(mask) = mask {
        parts.push(format!("mask={}", mask.identity()));
    }
    format!("{}({})", kind, parts.join(", "))
}

/// Per-session driver behind [`Term::compute_chunk`]
pub fn compute_by_session<T: Term + ?Sized>(
    term: &T,
    ctx: &BundleContext,
    dates: &[NaiveDate],
    assets: &[Sid],
    mask: ArrayView2<'_, bool>,
    inputs: &[TermInput<'_>],
) -> Result<TermArray> {
    let n_days = dates.len();
    let n_assets = assets.len();
    let window_length = term.window_length().max(1);
    let one_dim = term.ndim() == NDim::Array1D;
    let width = if one_dim { 1 } else { n_assets };
    let kind = term.output_kind();

    let mut numeric = Array2::from_elem((n_days, width), f64::NAN);
    let mut boolean = Array2::from_elem((n_days, width), false);
    let mut labels = vec![term.missing_label().to_string(); n_days * width];

    for (i, today) in dates.iter().enumerate() {
        let row_mask = mask.row(i);
        let cols: Vec<usize> = (0..n_assets).filter(|c| row_mask[*c]).collect();
        if cols.is_empty() {
            continue;
        }
        let masked_assets: Vec<Sid> = cols.iter().map(|c| assets[*c]).collect();
        let selection = if cols.len() == n_assets { None } else { Some(&cols[..]) };

        let windows = inputs
            .iter()
            .map(|input| {
                let cols = if input.ndim == NDim::Array1D { None } else { selection };
                input.array.window(input.offset + i + window_length - 1, window_length, cols)
            })
            .collect::<Result<Vec<_>>>()?;

        let slots = if one_dim { 1 } else { cols.len() };
        let targets: Vec<usize> = if one_dim { vec![0] } else { cols.clone() };
        match kind {
            OutputKind::Numeric => {
                let mut buf = vec![f64::NAN; slots];
                term.compute(ctx, *today, &masked_assets, &windows, &mut OutRow::Numeric(&mut buf))?;
                for (value, col) in buf.into_iter().zip(&targets) {
                    numeric[[i, *col]] = value;
                }
            }
            OutputKind::Boolean => {
                let mut buf = vec![false; slots];
                term.compute(ctx, *today, &masked_assets, &windows, &mut OutRow::Boolean(&mut buf))?;
                for (value, col) in buf.into_iter().zip(&targets) {
                    boolean[[i, *col]] = value;
                }
            }
            OutputKind::Categorical => {
                let mut buf = vec![term.missing_label().to_string(); slots];
                term.compute(ctx, *today, &masked_assets, &windows, &mut OutRow::Categorical(&mut buf))?;
                for (value, col) in buf.into_iter().zip(&targets) {
                    labels[i * width + *col] = value;
                }
            }
        }
    }

    Ok(match kind {
        OutputKind::Numeric => TermArray::Numeric(numeric),
        OutputKind::Boolean => TermArray::Boolean(boolean),
        OutputKind::Categorical => {
            let declared = term.categories();
            TermArray::Categorical(LabelArray::from_labels(
                (n_days, width),
                &labels,
                term.missing_label(),
                declared.as_deref(),
            )?)
        }
    })
}
