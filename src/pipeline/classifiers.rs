//! Pipeline Classifiers - categorical labels per asset
//!
//! Labels come from the point-in-time info facts of the asset database
//! (sector, exchange, ...). Assets without a visible fact carry the
//! missing label, which never matches in [`ElementOf`].

use crate::assets::MISSING_LABEL;
use crate::context::BundleContext;
use crate::error::{PipelineError, Result};
use crate::pipeline::array::Window;
use crate::pipeline::term::{term_identity, OutRow, OutputKind, Term};
use crate::types::Sid;
use chrono::NaiveDate;
use std::sync::Arc;

const SECTORS: [&str; 11] = [
    "Healthcare",
    "Basic Materials",
    "Financial Services",
    "Consumer Cyclical",
    "Technology",
    "Consumer Defensive",
    "Industrials",
    "Real Estate",
    "Energy",
    "Communication Services",
    "Utilities",
];

const EXCHANGES: [&str; 6] = ["NYSE", "NASDAQ", "OTC", "NYSEMKT", "NYSEARCA", "BATS"];

/// Latest value of a string info field
pub struct InfoClassifier {
    field: String,
    categories: Option<Vec<String>>,
}

impl InfoClassifier {
    /// Categories are inferred from the labels seen in each chunk
    pub fn new(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            categories: None,
        }
    }

    /// Labels outside `categories` are stored as missing
    pub fn with_categories(field: impl Into<String>, categories: &[&str]) -> Self {
        Self {
            field: field.into(),
            categories: Some(categories.iter().map(|c| c.to_string()).collect()),
        }
    }

    pub fn sector() -> Self {
        Self::with_categories("sector", &SECTORS)
    }

    pub fn exchange() -> Self {
        Self::with_categories("exchange", &EXCHANGES)
    }

    pub fn field(&self) -> &str {
        &self.field
    }
}

impl Term for InfoClassifier {
    fn identity(&self) -> String {
        let mut params = vec![("field", self.field.clone())];
        if let Some(categories) = &self.categories {
            params.push(("categories", format!("[{}]", categories.join("|"))));
        }
        term_identity("InfoClassifier", &params, &[], None)
    }

    fn output_kind(&self) -> OutputKind {
        OutputKind::Categorical
    }

    fn categories(&self) -> Option<Vec<String>> {
        self.categories.clone()
    }

    fn compute(
        &self,
        ctx: &BundleContext,
        today: NaiveDate,
        assets: &[Sid],
        _windows: &[Window<'_>],
        out: &mut OutRow<'_>,
    ) -> Result<()> {
        let labels = ctx.asset_finder().get_info(assets, &self.field, today)?;
        for (slot, label) in out.labels()?.iter_mut().zip(labels) {
            *slot = label;
        }
        Ok(())
    }
}

/// Filter: latest label of a classifier is one of `choices`
pub struct ElementOf {
    input: Arc<dyn Term>,
    choices: Vec<String>,
}

impl ElementOf {
    pub fn new(input: Arc<dyn Term>, choices: &[&str]) -> Result<Self> {
        if input.output_kind() != OutputKind::Categorical {
            return Err(PipelineError::TypeMismatch(format!(
                "ElementOf needs a classifier, got {}",
                input.identity()
            )));
        }
        let mut choices: Vec<String> = choices.iter().map(|c| c.to_string()).collect();
        choices.sort();
        choices.dedup();
        Ok(Self { input, choices })
    }
}

impl Term for ElementOf {
    fn identity(&self) -> String {
        term_identity(
            "ElementOf",
            &[("choices", format!("[{}]", self.choices.join("|")))],
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
        let labels = windows[0].labels()?;
        let hits = labels.element_of(&self.choices);
        let last = hits.row(hits.nrows() - 1);
        for (slot, hit) in out.boolean()?.iter_mut().zip(last) {
            *slot = *hit;
        }
        Ok(())
    }
}

/// Filter: latest label equals `label`
pub fn label_eq(input: Arc<dyn Term>, label: &str) -> Result<Arc<dyn Term>> {
    if label == MISSING_LABEL {
        log::warn!("Comparing a classifier against the missing label never matches");
    }
    Ok(Arc::new(ElementOf::new(input, &[label])?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::factors::PriceColumn;

    #[test]
    fn test_builtin_categories() {
        let sector = InfoClassifier::sector();
        let categories = sector.categories().unwrap();
        assert_eq!(categories.len(), 11);
        assert!(categories.contains(&"Technology".to_string()));
        assert_eq!(InfoClassifier::exchange().field(), "exchange");
        assert!(InfoClassifier::new("industry").categories().is_none());
    }

    #[test]
    fn test_identity_includes_categories() {
        assert_ne!(
            InfoClassifier::new("sector").identity(),
            InfoClassifier::sector().identity()
        );
        assert_eq!(InfoClassifier::new("sector").identity(), "InfoClassifier(field=sector)");
    }

    #[test]
    fn test_element_of_requires_classifier() {
        assert!(ElementOf::new(PriceColumn::close(), &["x"]).is_err());

        let sector: Arc<dyn Term> = Arc::new(InfoClassifier::sector());
        let a = ElementOf::new(sector.clone(), &["Energy", "Technology"]).unwrap();
        let b = ElementOf::new(sector, &["Technology", "Energy", "Energy"]).unwrap();
        assert_eq!(a.identity(), b.identity());
        assert_eq!(a.output_kind(), OutputKind::Boolean);
    }
}
