//! Pipeline arrays
//!
//! Every intermediate result in the engine workspace is a [`TermArray`]:
//! dense numeric or boolean matrices, categorical [`LabelArray`]s, or raw
//! loader output wrapped in an [`AdjustedArray`] that applies price
//! adjustments lazily as windows are taken.

use crate::data::adjustments::Adjustment;
use crate::error::{PipelineError, Result};
use crate::pipeline::term::OutputKind;
use hashbrown::HashMap;
use ndarray::{s, Array2, ArrayView2, Axis, CowArray, Ix2};

/// Categorical matrix stored as codes into a category list
///
/// `categories[0]` is always the missing value.
#[derive(Debug, Clone, PartialEq)]
pub struct LabelArray {
    codes: Array2<u32>,
    categories: Vec<String>,
}

impl LabelArray {
    /// All-missing array with an optional declared category set
    pub fn new(shape: (usize, usize), missing_value: &str, declared: Option<&[String]>) -> Self {
        Self {
            codes: Array2::zeros(shape),
            categories: category_list(missing_value, declared.unwrap_or(&[])),
        }
    }

    /// Build from row-major labels
    ///
    /// With a declared category set, labels outside it are stored as the
    /// missing value and logged. Without one, categories are inferred from the
    /// observed labels.
    pub fn from_labels<S: AsRef<str>>(
        shape: (usize, usize),
        labels: &[S],
        missing_value: &str,
        declared: Option<&[String]>,
    ) -> Result<Self> {
        if labels.len() != shape.0 * shape.1 {
            return Err(PipelineError::ShapeMismatch {
                term: "LabelArray".to_string(),
                expected: shape,
                actual: (labels.len(), 1),
            });
        }

        let mut array = match declared {
            Some(declared) => Self::new(shape, missing_value, Some(declared)),
            None => {
                let mut observed: Vec<String> = labels.iter().map(|l| l.as_ref().to_string()).collect();
                observed.sort();
                observed.dedup();
                Self {
                    codes: Array2::zeros(shape),
                    categories: category_list(missing_value, &observed),
                }
            }
        };

        let lookup = code_lookup(&array.categories);
        let mut unknown = 0usize;
        for (code, label) in array.codes.iter_mut().zip(labels) {
            match lookup.get(label.as_ref()) {
                Some(c) => *code = *c,
                None => {
                    unknown += 1;
                    *code = 0;
                }
            }
        }
        drop(lookup);
        if unknown > 0 {
            log::warn!(
                "{} labels outside the declared categories were stored as '{}'",
                unknown,
                missing_value
            );
        }
        Ok(array)
    }

    pub fn shape(&self) -> (usize, usize) {
        self.codes.dim()
    }

    pub fn missing_value(&self) -> &str {
        &self.categories[0]
    }

    pub fn categories(&self) -> &[String] {
        &self.categories
    }

    pub fn codes(&self) -> &Array2<u32> {
        &self.codes
    }

    pub fn get(&self, row: usize, col: usize) -> &str {
        &self.categories[self.codes[[row, col]] as usize]
    }

    /// Row-major labels
    pub fn to_labels(&self) -> Vec<String> {
        self.codes
            .iter()
            .map(|c| self.categories[*c as usize].clone())
            .collect()
    }

    pub fn is_missing(&self) -> Array2<bool> {
        self.codes.mapv(|c| c == 0)
    }

    /// Cells whose label is one of `choices`; the missing value never matches
    pub fn element_of(&self, choices: &[String]) -> Array2<bool> {
        let hits: Vec<bool> = self
            .categories
            .iter()
            .enumerate()
            .map(|(i, c)| i != 0 && choices.contains(c))
            .collect();
        self.codes.mapv(|c| hits[c as usize])
    }

    /// Drop the first `n` rows
    pub fn skip_rows(&self, n: usize) -> Self {
        Self {
            codes: self.codes.slice(s![n.., ..]).to_owned(),
            categories: self.categories.clone(),
        }
    }

    pub fn select_columns(&self, cols: &[usize]) -> Self {
        Self {
            codes: self.codes.select(Axis(1), cols),
            categories: self.categories.clone(),
        }
    }

    pub fn slice_rows(&self, start: usize, end: usize) -> Self {
        Self {
            codes: self.codes.slice(s![start..end, ..]).to_owned(),
            categories: self.categories.clone(),
        }
    }

    /// Re-express the codes over a superset of the current categories
    pub fn recode(&self, categories: &[String]) -> Result<Self> {
        if categories.first() != self.categories.first() {
            return Err(PipelineError::TypeMismatch(format!(
                "Cannot recode labels with missing value '{}' onto '{}'",
                self.missing_value(),
                categories.first().map(String::as_str).unwrap_or("")
            )));
        }
        let target = code_lookup(categories);
        let mut mapping = Vec::with_capacity(self.categories.len());
        for category in &self.categories {
            let code = target.get(category.as_str()).ok_or_else(|| {
                PipelineError::TypeMismatch(format!("Category '{}' missing from union", category))
            })?;
            mapping.push(*code);
        }
        Ok(Self {
            codes: self.codes.mapv(|c| mapping[c as usize]),
            categories: categories.to_vec(),
        })
    }
}

fn code_lookup(categories: &[String]) -> HashMap<&str, u32> {
    categories
        .iter()
        .enumerate()
        .map(|(i, c)| (c.as_str(), i as u32))
        .collect()
}

fn category_list(missing_value: &str, rest: &[String]) -> Vec<String> {
    let mut categories = Vec::with_capacity(rest.len() + 1);
    categories.push(missing_value.to_string());
    categories.extend(rest.iter().filter(|c| c.as_str() != missing_value).cloned());
    categories
}

/// Union of category sets, missing value first, the rest sorted
pub fn union_categories<'a>(sets: impl IntoIterator<Item = &'a [String]>) -> Result<Vec<String>> {
    let mut missing: Option<&str> = None;
    let mut rest: Vec<&str> = Vec::new();
    for set in sets {
        let Some((first, others)) = set.split_first() else {
            continue;
        };
        match missing {
            None => missing = Some(first.as_str()),
            Some(m) if m != first.as_str() => {
                return Err(PipelineError::TypeMismatch(format!(
                    "Conflicting missing values '{}' and '{}'",
                    m, first
                )))
            }
            _ => {}
        }
        rest.extend(others.iter().map(String::as_str));
    }
    rest.sort_unstable();
    rest.dedup();

    let missing = missing.unwrap_or_default();
    let mut union = vec![missing.to_string()];
    union.extend(rest.into_iter().filter(|c| *c != missing).map(str::to_string));
    Ok(union)
}

/// Raw loader output plus the adjustments that apply to it
///
/// An adjustment at row `r` scales rows `[0, r)` of its column, but only in
/// windows whose last row is at or after `r`. A window therefore never sees
/// an adjustment that was not yet effective on its last day.
#[derive(Debug, Clone, PartialEq)]
pub struct AdjustedArray {
    data: Array2<f64>,
    adjustments: Vec<Adjustment>,
}

impl AdjustedArray {
    pub fn new(data: Array2<f64>, mut adjustments: Vec<Adjustment>) -> Self {
        adjustments.retain(|a| a.row > 0 && a.row < data.nrows() && a.col < data.ncols());
        adjustments.sort_by_key(|a| (a.row, a.col));
        Self { data, adjustments }
    }

    /// Unadjusted values; row `i` is what was known on day `i`
    pub fn data(&self) -> &Array2<f64> {
        &self.data
    }

    pub fn adjustments(&self) -> &[Adjustment] {
        &self.adjustments
    }

    pub fn shape(&self) -> (usize, usize) {
        self.data.dim()
    }

    /// Window of `length` rows ending at `end_row` (inclusive), adjusted as
    /// of `end_row`. Borrows when no adjustment touches the window.
    pub fn window(&self, end_row: usize, length: usize, cols: Option<&[usize]>) -> Result<CowArray<'_, f64, Ix2>> {
        if length == 0 || end_row >= self.data.nrows() || end_row + 1 < length {
            return Err(PipelineError::InvalidInput(format!(
                "Window of {} rows ending at {} exceeds {} rows",
                length,
                end_row,
                self.data.nrows()
            )));
        }
        let start = end_row + 1 - length;
        let view = self.data.slice(s![start..=end_row, ..]);
        let active: Vec<&Adjustment> = self
            .adjustments
            .iter()
            .filter(|a| a.row > start && a.row <= end_row)
            .collect();

        if active.is_empty() {
            return Ok(match cols {
                Some(cols) => CowArray::from(view.select(Axis(1), cols)),
                None => CowArray::from(view),
            });
        }

        let mut window = view.to_owned();
        for adj in active {
            let mut column = window.column_mut(adj.col);
            for value in column.iter_mut().take(adj.row - start) {
                *value *= adj.value;
            }
        }
        Ok(match cols {
            Some(cols) => CowArray::from(window.select(Axis(1), cols)),
            None => CowArray::from(window),
        })
    }

    /// Drop the first `n` rows, shifting the adjustments that still matter
    pub fn skip_rows(&self, n: usize) -> Self {
        let adjustments = self
            .adjustments
            .iter()
            .filter(|a| a.row > n)
            .map(|a| Adjustment {
                row: a.row - n,
                col: a.col,
                value: a.value,
            })
            .collect();
        Self::new(self.data.slice(s![n.., ..]).to_owned(), adjustments)
    }
}

/// A computed or loaded term result
#[derive(Debug, Clone, PartialEq)]
pub enum TermArray {
    Numeric(Array2<f64>),
    Boolean(Array2<bool>),
    Categorical(LabelArray),
    Adjusted(AdjustedArray),
}

impl TermArray {
    pub fn shape(&self) -> (usize, usize) {
        match self {
            TermArray::Numeric(a) => a.dim(),
            TermArray::Boolean(a) => a.dim(),
            TermArray::Categorical(a) => a.shape(),
            TermArray::Adjusted(a) => a.shape(),
        }
    }

    pub fn kind(&self) -> OutputKind {
        match self {
            TermArray::Numeric(_) | TermArray::Adjusted(_) => OutputKind::Numeric,
            TermArray::Boolean(_) => OutputKind::Boolean,
            TermArray::Categorical(_) => OutputKind::Categorical,
        }
    }

    /// Drop leading padding rows
    pub fn skip_rows(&self, n: usize) -> Self {
        match self {
            TermArray::Numeric(a) => TermArray::Numeric(a.slice(s![n.., ..]).to_owned()),
            TermArray::Boolean(a) => TermArray::Boolean(a.slice(s![n.., ..]).to_owned()),
            TermArray::Categorical(a) => TermArray::Categorical(a.skip_rows(n)),
            TermArray::Adjusted(a) => TermArray::Adjusted(a.skip_rows(n)),
        }
    }

    /// Numeric values as known on each row (adjusted arrays yield raw data)
    pub fn as_numeric(&self) -> Result<ArrayView2<'_, f64>> {
        match self {
            TermArray::Numeric(a) => Ok(a.view()),
            TermArray::Adjusted(a) => Ok(a.data().view()),
            other => Err(PipelineError::TypeMismatch(format!(
                "Expected numeric array, found {:?}",
                other.kind()
            ))),
        }
    }

    pub fn as_boolean(&self) -> Result<ArrayView2<'_, bool>> {
        match self {
            TermArray::Boolean(a) => Ok(a.view()),
            other => Err(PipelineError::TypeMismatch(format!(
                "Expected boolean array, found {:?}",
                other.kind()
            ))),
        }
    }

    pub fn as_labels(&self) -> Result<&LabelArray> {
        match self {
            TermArray::Categorical(a) => Ok(a),
            other => Err(PipelineError::TypeMismatch(format!(
                "Expected categorical array, found {:?}",
                other.kind()
            ))),
        }
    }

    /// Window of `length` rows ending at `end_row`, restricted to `cols`
    pub fn window(&self, end_row: usize, length: usize, cols: Option<&[usize]>) -> Result<Window<'_>> {
        let (rows, _) = self.shape();
        if length == 0 || end_row >= rows || end_row + 1 < length {
            return Err(PipelineError::InvalidInput(format!(
                "Window of {} rows ending at {} exceeds {} rows",
                length, end_row, rows
            )));
        }
        let start = end_row + 1 - length;
        Ok(match self {
            TermArray::Adjusted(a) => Window::Numeric(a.window(end_row, length, cols)?),
            TermArray::Numeric(a) => {
                let view = a.slice(s![start..=end_row, ..]);
                Window::Numeric(match cols {
                    Some(cols) => CowArray::from(view.select(Axis(1), cols)),
                    None => CowArray::from(view),
                })
            }
            TermArray::Boolean(a) => {
                let view = a.slice(s![start..=end_row, ..]);
                Window::Boolean(match cols {
                    Some(cols) => view.select(Axis(1), cols),
                    None => view.to_owned(),
                })
            }
            TermArray::Categorical(a) => {
                let rows = a.slice_rows(start, end_row + 1);
                Window::Categorical(match cols {
                    Some(cols) => rows.select_columns(cols),
                    None => rows,
                })
            }
        })
    }
}

/// Trailing input window handed to `Term::compute`
#[derive(Debug)]
pub enum Window<'a> {
    Numeric(CowArray<'a, f64, Ix2>),
    Boolean(Array2<bool>),
    Categorical(LabelArray),
}

impl<'a> Window<'a> {
    pub fn numeric(&self) -> Result<ArrayView2<'_, f64>> {
        match self {
            Window::Numeric(a) => Ok(a.view()),
            _ => Err(PipelineError::TypeMismatch("Expected a numeric window".to_string())),
        }
    }

    pub fn boolean(&self) -> Result<ArrayView2<'_, bool>> {
        match self {
            Window::Boolean(a) => Ok(a.view()),
            _ => Err(PipelineError::TypeMismatch("Expected a boolean window".to_string())),
        }
    }

    pub fn labels(&self) -> Result<&LabelArray> {
        match self {
            Window::Categorical(a) => Ok(a),
            _ => Err(PipelineError::TypeMismatch("Expected a categorical window".to_string())),
        }
    }
}
