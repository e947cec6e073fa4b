//! Pipeline Graph - term dependency resolution
//!
//! Resolves the output terms of a pipeline (and its screen) into a
//! deduplicated DAG, works out how many extra trailing rows each term needs
//! and provides the execution order and reference counts the engine uses to
//! release intermediate results.

use crate::error::{PipelineError, Result};
use crate::pipeline::term::{NDim, OutputKind, Term, TermId};
use hashbrown::{HashMap, HashSet};
use std::collections::VecDeque;
use std::sync::Arc;

/// Computational dependency graph for one pipeline
pub struct TermGraph {
    terms: Vec<Arc<dyn Term>>,
    identities: Vec<String>,
    index: HashMap<String, TermId>,
    /// Windowed inputs of each term, in the term's declared order
    inputs: Vec<Vec<TermId>>,
    masks: Vec<Option<TermId>>,
    dependents: Vec<Vec<TermId>>,
    /// Reads state the data stamp does not cover, directly or through a dependency
    volatile: Vec<bool>,
    outputs: Vec<(String, TermId)>,
    screen: Option<TermId>,
    extra_rows: Vec<usize>,
    execution_order: Vec<TermId>,
}

impl TermGraph {
    /// Build the graph of `columns` plus an optional boolean `screen`
    pub fn build(columns: &[(String, Arc<dyn Term>)], screen: Option<&Arc<dyn Term>>) -> Result<Self> {
        let mut graph = Self {
            terms: Vec::new(),
            identities: Vec::new(),
            index: HashMap::new(),
            inputs: Vec::new(),
            masks: Vec::new(),
            dependents: Vec::new(),
            volatile: Vec::new(),
            outputs: Vec::new(),
            screen: None,
            extra_rows: Vec::new(),
            execution_order: Vec::new(),
        };

        let mut seen_names = HashSet::new();
        for (name, term) in columns {
            if !seen_names.insert(name.as_str()) {
                return Err(PipelineError::InvalidGraph(format!("Duplicate column name: {}", name)));
            }
            let id = graph.add_term(term, &mut Vec::new())?;
            graph.outputs.push((name.clone(), id));
        }
        if let Some(screen) = screen {
            if screen.output_kind() != OutputKind::Boolean {
                return Err(PipelineError::InvalidGraph(format!(
                    "Screen {} is not a filter",
                    screen.identity()
                )));
            }
            graph.screen = Some(graph.add_term(screen, &mut Vec::new())?);
        }

        graph.execution_order = graph.topological_sort()?;
        graph.extra_rows = graph.compute_extra_rows();
        Ok(graph)
    }

    fn add_term(&mut self, term: &Arc<dyn Term>, path: &mut Vec<String>) -> Result<TermId> {
        let identity = term.identity();
        if let Some(id) = self.index.get(&identity) {
            return Ok(*id);
        }
        if path.contains(&identity) {
            return Err(PipelineError::InvalidGraph(format!(
                "Cycle through {}",
                identity
            )));
        }
        validate_term(term.as_ref(), &identity)?;

        path.push(identity.clone());
        let mut input_ids = Vec::new();
        for input in term.inputs() {
            input_ids.push(self.add_term(&input, path)?);
        }
        let mask_id = match term.mask() {
            Some(mask) => {
                if mask.output_kind() != OutputKind::Boolean || mask.ndim() != NDim::Array2D {
                    return Err(PipelineError::InvalidGraph(format!(
                        "Mask of {} is not a 2-D filter",
                        identity
                    )));
                }
                Some(self.add_term(&mask, path)?)
            }
            None => None,
        };
        path.pop();

        let id = self.terms.len();
        self.terms.push(term.clone());
        self.identities.push(identity.clone());
        self.index.insert(identity, id);
        self.dependents.push(Vec::new());
        let mut volatile = !term.cacheable() && term.bound_column().is_none();
        for dep in input_ids.iter().chain(mask_id.iter()) {
            self.dependents[*dep].push(id);
            volatile |= self.volatile[*dep];
        }
        self.volatile.push(volatile);
        self.inputs.push(input_ids);
        self.masks.push(mask_id);
        Ok(id)
    }

    /// Kahn's algorithm; dependencies come before dependents
    fn topological_sort(&self) -> Result<Vec<TermId>> {
        let mut in_degree: Vec<usize> = (0..self.terms.len()).map(|id| self.dependencies(id).count()).collect();
        let mut queue: VecDeque<TermId> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| id)
            .collect();
        let mut order = Vec::with_capacity(self.terms.len());

        while let Some(id) = queue.pop_front() {
            order.push(id);
            for dependent in &self.dependents[id] {
                in_degree[*dependent] -= 1;
                if in_degree[*dependent] == 0 {
                    queue.push_back(*dependent);
                }
            }
        }

        if order.len() != self.terms.len() {
            return Err(PipelineError::InvalidGraph(
                "Graph contains cycles - cannot compute execution order".to_string(),
            ));
        }
        Ok(order)
    }

    /// A term's windowed inputs need `window_length - 1` rows beyond the
    /// term's own extra rows; a mask needs exactly the term's rows.
    fn compute_extra_rows(&self) -> Vec<usize> {
        let mut extra = vec![0usize; self.terms.len()];
        for id in self.execution_order.iter().rev() {
            let own = extra[*id];
            let window = self.terms[*id].window_length().max(1);
            for input in &self.inputs[*id] {
                extra[*input] = extra[*input].max(own + window - 1);
            }
            if let Some(mask) = self.masks[*id] {
                extra[mask] = extra[mask].max(own);
            }
        }
        extra
    }

    pub fn term(&self, id: TermId) -> &Arc<dyn Term> {
        &self.terms[id]
    }

    pub fn identity(&self, id: TermId) -> &str {
        &self.identities[id]
    }

    pub fn inputs_of(&self, id: TermId) -> &[TermId] {
        &self.inputs[id]
    }

    pub fn mask_of(&self, id: TermId) -> Option<TermId> {
        self.masks[id]
    }

    /// Inputs followed by the mask
    pub fn dependencies(&self, id: TermId) -> impl Iterator<Item = TermId> + '_ {
        self.inputs[id].iter().copied().chain(self.masks[id])
    }

    /// Whether `id`'s result may be served from or written to the term cache.
    /// A computed term that opts out of caching (e.g. a stored universe)
    /// keeps every term depending on it out of the cache too.
    pub fn is_cacheable(&self, id: TermId) -> bool {
        self.terms[id].cacheable() && !self.volatile[id]
    }

    pub fn outputs(&self) -> &[(String, TermId)] {
        &self.outputs
    }

    pub fn screen(&self) -> Option<TermId> {
        self.screen
    }

    pub fn extra_rows(&self, id: TermId) -> usize {
        self.extra_rows[id]
    }

    /// Rows the root mask needs before the first output row
    pub fn max_extra_rows(&self) -> usize {
        self.extra_rows
            .iter()
            .zip(&self.terms)
            .map(|(extra, term)| extra + term.lookback())
            .max()
            .unwrap_or(0)
    }

    /// Rows of `input`'s array that precede the first window of `term`
    pub fn offset(&self, term: TermId, input: TermId) -> usize {
        let window = self.terms[term].window_length().max(1);
        self.extra_rows[input] - (self.extra_rows[term] + window - 1)
    }

    /// Rows of `mask`'s array that precede `term`'s first row
    pub fn mask_offset(&self, term: TermId, mask: TermId) -> usize {
        self.extra_rows[mask] - self.extra_rows[term]
    }

    pub fn execution_order(&self) -> &[TermId] {
        &self.execution_order
    }

    pub fn len(&self) -> usize {
        self.terms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    fn is_output(&self, id: TermId) -> bool {
        self.screen == Some(id) || self.outputs.iter().any(|(_, t)| *t == id)
    }

    /// Terms the engine must hold or compute, given terms whose results are
    /// already available (cache hits). Dependencies of available terms are
    /// only needed if some other needed term still uses them.
    pub fn needed_terms(&self, available: &HashSet<TermId>) -> HashSet<TermId> {
        let mut needed = HashSet::new();
        let mut stack: Vec<TermId> = self.outputs.iter().map(|(_, t)| *t).chain(self.screen).collect();
        while let Some(id) = stack.pop() {
            if !needed.insert(id) || available.contains(&id) {
                continue;
            }
            stack.extend(self.dependencies(id));
        }
        needed
    }

    /// Number of pending consumers of each needed term; outputs hold one
    /// extra reference so they survive until the end of the run
    pub fn initial_refcounts(&self, needed: &HashSet<TermId>, available: &HashSet<TermId>) -> Vec<usize> {
        let mut refcounts = vec![0usize; self.terms.len()];
        for id in needed {
            if available.contains(id) {
                continue;
            }
            for dep in self.dependencies(*id) {
                refcounts[dep] += 1;
            }
        }
        for id in needed {
            if self.is_output(*id) {
                refcounts[*id] += 1;
            }
        }
        refcounts
    }

    /// Release `id`'s dependencies; returns the ones nobody needs anymore
    pub fn decref_dependencies(&self, id: TermId, refcounts: &mut [usize]) -> Vec<TermId> {
        let mut garbage = Vec::new();
        for dep in self.dependencies(id) {
            refcounts[dep] = refcounts[dep].saturating_sub(1);
            if refcounts[dep] == 0 {
                garbage.push(dep);
            }
        }
        garbage
    }
}

fn validate_term(term: &dyn Term, identity: &str) -> Result<()> {
    let loadable = term.bound_column().is_some();
    if loadable && (!term.inputs().is_empty() || term.mask().is_some()) {
        return Err(PipelineError::InvalidGraph(format!(
            "Loadable term {} cannot declare inputs or a mask",
            identity
        )));
    }
    if !loadable && term.window_length() == 0 {
        return Err(PipelineError::InvalidGraph(format!(
            "{} has a window length of zero",
            identity
        )));
    }
    Ok(())
}
