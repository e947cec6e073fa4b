//! Pipeline execution engine
//!
//! `SimplePipelineEngine::run_pipeline` splits the requested range into
//! session chunks and evaluates the term graph once per chunk:
//!
//! 1. build the root mask (asset lifetimes over the chunk plus the leading
//!    extra rows the graph needs);
//! 2. look up the term cache from the outputs downward, pruning everything that
//!    only feeds a cache hit;
//! 3. walk the execution order, loading loadable terms in per-loader batches
//!    and computing the rest against windows of their inputs;
//! 4. release intermediates as soon as their last consumer ran;
//! 5. drop the extra rows and emit one row per `(date, sid)` passing the
//!    screen.

use crate::config::{EngineConfig, HistoryPolicy, PipelineConfig};
use crate::context::BundleContext;
use crate::error::{PipelineError, Result};
use crate::pipeline::array::TermArray;
use crate::pipeline::cache::TermCache;
use crate::pipeline::chunks::{compute_date_range_chunks, concat_outputs};
use crate::pipeline::graph::TermGraph;
use crate::pipeline::hooks::PipelineHooks;
use crate::pipeline::loader::{LoaderRegistry, PipelineLoader};
use crate::pipeline::output::{OutputColumn, PipelineOutput};
use crate::pipeline::term::{BoundColumn, NDim, Term, TermId, TermInput};
use crate::types::Sid;
use chrono::NaiveDate;
use hashbrown::HashSet;
use ndarray::{s, Array2, ArrayView2, Axis};
use rayon::prelude::*;
use std::sync::Arc;

/// Named output columns plus an optional screen
#[derive(Default, Clone)]
pub struct Pipeline {
    columns: Vec<(String, Arc<dyn Term>)>,
    screen: Option<Arc<dyn Term>>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add (or replace) an output column
    pub fn add(&mut self, name: impl Into<String>, term: Arc<dyn Term>) -> &mut Self {
        let name = name.into();
        match self.columns.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = term,
            None => self.columns.push((name, term)),
        }
        self
    }

    pub fn set_screen(&mut self, screen: Arc<dyn Term>) -> &mut Self {
        self.screen = Some(screen);
        self
    }

    pub fn columns(&self) -> &[(String, Arc<dyn Term>)] {
        &self.columns
    }

    pub fn screen(&self) -> Option<&Arc<dyn Term>> {
        self.screen.as_ref()
    }
}

/// Asset existence over the dates a chunk evaluates, extra rows included
#[derive(Debug, Clone)]
struct RootMask {
    dates: Vec<NaiveDate>,
    sids: Vec<Sid>,
    mask: Array2<bool>,
}

/// Pipeline engine over one bundle
pub struct SimplePipelineEngine {
    context: Arc<BundleContext>,
    loaders: LoaderRegistry,
    config: PipelineConfig,
    cache: Option<TermCache>,
    hooks: Vec<Arc<dyn PipelineHooks>>,
}

impl SimplePipelineEngine {
    pub fn new(context: Arc<BundleContext>, loaders: LoaderRegistry, config: PipelineConfig) -> Self {
        Self {
            context,
            loaders,
            config,
            cache: None,
            hooks: Vec::new(),
        }
    }

    /// Engine with the bundle's default loaders and the configured cache
    pub fn from_config(context: Arc<BundleContext>, config: &EngineConfig) -> Result<Self> {
        let loaders = context.default_loaders();
        let mut engine = Self::new(context, loaders, config.pipeline.clone());
        if config.cache.enabled {
            let mut cache = TermCache::new(&config.cache.dir)?;
            if config.cache.stamp_data_version {
                cache = cache.with_stamp(&engine.context.data_stamp()?);
            }
            engine = engine.with_cache(cache);
        }
        Ok(engine)
    }

    pub fn with_cache(mut self, cache: TermCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_hook(mut self, hook: Arc<dyn PipelineHooks>) -> Self {
        self.hooks.push(hook);
        self
    }

    pub fn context(&self) -> &Arc<BundleContext> {
        &self.context
    }

    pub fn cache(&self) -> Option<&TermCache> {
        self.cache.as_ref()
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Compute `pipeline` for every session in `[start, end]`
    ///
    /// `chunksize` defaults to the configured value. With `chunksize <= 1`
    /// the whole range is evaluated in one pass without the term cache.
    pub fn run_pipeline(
        &self,
        pipeline: &Pipeline,
        start: NaiveDate,
        end: NaiveDate,
        chunksize: Option<usize>,
    ) -> Result<PipelineOutput> {
        if start > end {
            return Err(PipelineError::InvalidInput(format!(
                "start_date {} must be on or before end_date {}",
                start, end
            )));
        }
        let graph = TermGraph::build(pipeline.columns(), pipeline.screen())?;
        let chunksize = chunksize.unwrap_or(self.config.chunksize);

        match self.run_graph(&graph, start, end, chunksize) {
            Err(PipelineError::InsufficientHistory {
                earliest_start: Some(earliest),
                extra_rows,
                ..
            }) if self.config.history_policy == HistoryPolicy::AdvanceStart && earliest <= end => {
                log::warn!(
                    "Not enough history for {} extra rows before {}; starting at {} instead",
                    extra_rows,
                    start,
                    earliest
                );
                self.run_graph(&graph, earliest, end, chunksize)
            }
            other => other,
        }
    }

    fn run_graph(&self, graph: &TermGraph, start: NaiveDate, end: NaiveDate, chunksize: usize) -> Result<PipelineOutput> {
        let calendar = self.context.calendar();
        let sessions = calendar.sessions_in_range(start, end);
        let (Some(first), Some(last)) = (sessions.first().copied(), sessions.last().copied()) else {
            return Err(PipelineError::InvalidInput(format!(
                "No {} sessions between {} and {}",
                calendar.name(),
                start,
                end
            )));
        };

        if chunksize <= 1 {
            self.hooks.iter().for_each(|h| h.on_pipeline_start(first, last, 1));
            self.hooks.iter().for_each(|h| h.on_chunk_start(0, first, last));
            let output = self.compute_chunk(graph, first, last, None)?;
            self.hooks.iter().for_each(|h| h.on_chunk_end(0, output.len()));
            self.hooks.iter().for_each(|h| h.on_pipeline_end(output.len()));
            return Ok(output);
        }

        let ranges = compute_date_range_chunks(sessions, chunksize);
        self.hooks.iter().for_each(|h| h.on_pipeline_start(first, last, ranges.len()));

        let run_one = |(index, (chunk_start, chunk_end)): (usize, &(NaiveDate, NaiveDate))| -> Result<PipelineOutput> {
            self.hooks.iter().for_each(|h| h.on_chunk_start(index, *chunk_start, *chunk_end));
            let output = self.compute_chunk(graph, *chunk_start, *chunk_end, self.cache.as_ref())?;
            self.hooks.iter().for_each(|h| h.on_chunk_end(index, output.len()));
            Ok(output)
        };
        let outputs = if self.config.parallel_chunks && ranges.len() > 1 {
            ranges.par_iter().enumerate().map(run_one).collect::<Result<Vec<_>>>()?
        } else {
            ranges.iter().enumerate().map(run_one).collect::<Result<Vec<_>>>()?
        };

        let output = concat_outputs(outputs)?;
        self.hooks.iter().for_each(|h| h.on_pipeline_end(output.len()));
        Ok(output)
    }

    /// Asset lifetimes over `[start, end]` plus `extra_rows` earlier sessions.
    /// Assets never alive in that span are dropped.
    fn compute_root_mask(
        &self,
        start: NaiveDate,
        end: NaiveDate,
        extra_rows: usize,
        cache: Option<&TermCache>,
    ) -> Result<RootMask> {
        let calendar = self.context.calendar();
        let sessions = calendar.all_sessions();
        let start_idx = sessions.partition_point(|d| *d < start);
        let end_idx = sessions.partition_point(|d| *d <= end);
        if start_idx >= end_idx {
            return Err(PipelineError::InvalidInput(format!(
                "No {} sessions between {} and {}",
                calendar.name(),
                start,
                end
            )));
        }
        if start_idx < extra_rows {
            return Err(PipelineError::InsufficientHistory {
                requested_start: start,
                extra_rows,
                first_session: sessions[0],
                earliest_start: sessions.get(extra_rows).copied(),
            });
        }
        let dates = sessions[start_idx - extra_rows..end_idx].to_vec();

        let key = cache.map(|c| c.root_mask_key(calendar.name(), &dates));
        if let (Some(cache), Some(key)) = (cache, &key) {
            if let Some((sids, mask)) = cache.load_root_mask(key)? {
                if mask.nrows() == dates.len() {
                    return Ok(RootMask { dates, sids, mask });
                }
            }
        }

        let lifetimes = self.context.asset_finder().lifetimes(&dates, false)?;
        let keep: Vec<usize> = (0..lifetimes.sids.len())
            .filter(|j| lifetimes.mask.column(*j).iter().any(|alive| *alive))
            .collect();
        let sids: Vec<Sid> = keep.iter().map(|j| lifetimes.sids[*j]).collect();
        let mask = lifetimes.mask.select(Axis(1), &keep);

        if let (Some(cache), Some(key)) = (cache, &key) {
            if let Err(e) = cache.save_root_mask(key, &sids, &mask) {
                log::warn!("Failed to cache root mask: {}", e);
            }
        }
        Ok(RootMask { dates, sids, mask })
    }

    /// Evaluate the graph over `[start, end]` (both sessions)
    fn compute_chunk(
        &self,
        graph: &TermGraph,
        start: NaiveDate,
        end: NaiveDate,
        cache: Option<&TermCache>,
    ) -> Result<PipelineOutput> {
        let max_extra = graph.max_extra_rows();
        let root = self.compute_root_mask(start, end, max_extra, cache)?;
        let ctx = self.context.as_ref();

        // Rows of the root mask a term's result covers
        let first_row = |id: TermId| max_extra - graph.extra_rows(id);
        let expected_shape = |id: TermId| {
            let rows = root.dates.len() - first_row(id);
            match graph.term(id).ndim() {
                NDim::Array1D => (rows, 1),
                NDim::Array2D => (rows, root.sids.len()),
            }
        };

        let mut results: Vec<Option<TermArray>> = (0..graph.len()).map(|_| None).collect();
        let mut available = HashSet::new();

        if let Some(cache) = cache {
            let mut stack: Vec<TermId> = graph.outputs().iter().map(|(_, id)| *id).chain(graph.screen()).collect();
            let mut visited = HashSet::new();
            while let Some(id) = stack.pop() {
                if !visited.insert(id) {
                    continue;
                }
                let term = graph.term(id);
                if graph.is_cacheable(id) {
                    let key = cache.term_key(graph.identity(id), &root.dates[first_row(id)..], &root.sids);
                    if let Some(array) = cache.load(&key, term.as_ref(), expected_shape(id))? {
                        self.hooks.iter().for_each(|h| h.on_cache_hit(graph.identity(id)));
                        results[id] = Some(array);
                        available.insert(id);
                        continue;
                    }
                }
                stack.extend(graph.dependencies(id));
            }
        }

        let needed = graph.needed_terms(&available);
        let mut refcounts = graph.initial_refcounts(&needed, &available);

        for &id in graph.execution_order() {
            if !needed.contains(&id) || results[id].is_some() {
                continue;
            }
            let term = graph.term(id);

            if let Some(column) = term.bound_column() {
                let loader = self.loaders.get(&column)?;
                let batch = self.loadable_batch(graph, &needed, &results, &loader, graph.extra_rows(id))?;
                let names: Vec<String> = batch.iter().map(|(id, _)| graph.identity(*id).to_string()).collect();
                self.hooks.iter().for_each(|h| h.on_loading_terms(&names));

                let row0 = first_row(id);
                let columns: Vec<BoundColumn> = batch.iter().map(|(_, c)| c.clone()).collect();
                let arrays = loader.load_adjusted_array(
                    &columns,
                    &root.dates[row0..],
                    &root.sids,
                    root.mask.slice(s![row0.., ..]),
                )?;
                if arrays.len() != batch.len() {
                    return Err(PipelineError::InvalidGraph(format!(
                        "{} returned {} arrays for {} columns",
                        loader.name(),
                        arrays.len(),
                        batch.len()
                    )));
                }
                for ((loaded_id, _), array) in batch.into_iter().zip(arrays) {
                    check_shape(graph, loaded_id, &array, expected_shape(loaded_id))?;
                    results[loaded_id] = Some(array);
                }
                continue;
            }

            self.hooks.iter().for_each(|h| h.on_computing_term(graph.identity(id)));
            let row0 = first_row(id);
            let output = {
                let mask: ArrayView2<'_, bool> = match graph.mask_of(id) {
                    Some(mask_id) => {
                        let array = results[mask_id].as_ref().ok_or_else(|| missing_result(graph, mask_id))?;
                        let offset = graph.mask_offset(id, mask_id);
                        array.as_boolean()?.slice_move(s![offset.., ..])
                    }
                    None => root.mask.slice(s![row0.., ..]),
                };
                let inputs = graph
                    .inputs_of(id)
                    .iter()
                    .map(|input| {
                        Ok(TermInput {
                            array: results[*input].as_ref().ok_or_else(|| missing_result(graph, *input))?,
                            offset: graph.offset(id, *input),
                            ndim: graph.term(*input).ndim(),
                        })
                    })
                    .collect::<Result<Vec<_>>>()?;
                term.compute_chunk(ctx, &root.dates[row0..], &root.sids, mask, &inputs)?
            };
            check_shape(graph, id, &output, expected_shape(id))?;

            if let Some(cache) = cache {
                if graph.is_cacheable(id) {
                    let key = cache.term_key(graph.identity(id), &root.dates[row0..], &root.sids);
                    if let Err(e) = cache.save(&key, &output) {
                        log::warn!("Failed to cache {}: {}", graph.identity(id), e);
                    }
                }
            }
            results[id] = Some(output);

            for garbage in graph.decref_dependencies(id, &mut refcounts) {
                results[garbage] = None;
            }
        }

        self.to_output(graph, &root, &results)
    }

    /// Every still-missing loadable term served by `loader` with the same
    /// extra rows, in execution order
    fn loadable_batch(
        &self,
        graph: &TermGraph,
        needed: &HashSet<TermId>,
        results: &[Option<TermArray>],
        loader: &Arc<dyn PipelineLoader>,
        extra_rows: usize,
    ) -> Result<Vec<(TermId, BoundColumn)>> {
        let mut batch = Vec::new();
        for &other in graph.execution_order() {
            if !needed.contains(&other) || results[other].is_some() || graph.extra_rows(other) != extra_rows {
                continue;
            }
            if let Some(column) = graph.term(other).bound_column() {
                if Arc::ptr_eq(&self.loaders.get(&column)?, loader) {
                    batch.push((other, column));
                }
            }
        }
        Ok(batch)
    }

    fn to_output(&self, graph: &TermGraph, root: &RootMask, results: &[Option<TermArray>]) -> Result<PipelineOutput> {
        let max_extra = graph.max_extra_rows();
        let n_days = root.dates.len() - max_extra;
        let dates = &root.dates[max_extra..];
        let alive = root.mask.slice(s![max_extra.., ..]);

        let trimmed = |id: TermId| -> Result<TermArray> {
            let array = results[id].as_ref().ok_or_else(|| missing_result(graph, id))?;
            Ok(array.skip_rows(graph.extra_rows(id)))
        };

        let screen: Array2<bool> = match graph.screen() {
            Some(id) => {
                let array = trimmed(id)?;
                let values = array.as_boolean()?;
                let broadcast = graph.term(id).ndim() == NDim::Array1D;
                Array2::from_shape_fn((n_days, root.sids.len()), |(i, j)| {
                    alive[[i, j]] && values[[i, if broadcast { 0 } else { j }]]
                })
            }
            None => alive.to_owned(),
        };

        let mut row_dates = Vec::new();
        let mut row_sids = Vec::new();
        let mut cells: Vec<(usize, usize)> = Vec::new();
        for (i, date) in dates.iter().enumerate() {
            for (j, sid) in root.sids.iter().enumerate() {
                if screen[[i, j]] {
                    row_dates.push(*date);
                    row_sids.push(*sid);
                    cells.push((i, j));
                }
            }
        }

        let mut columns = Vec::with_capacity(graph.outputs().len());
        for (name, id) in graph.outputs() {
            let array = trimmed(*id)?;
            let broadcast = graph.term(*id).ndim() == NDim::Array1D;
            let at = |(i, j): (usize, usize)| if broadcast { (i, 0) } else { (i, j) };
            let column = match &array {
                TermArray::Numeric(_) | TermArray::Adjusted(_) => {
                    let values = array.as_numeric()?;
                    OutputColumn::Numeric(cells.iter().map(|c| values[at(*c)]).collect())
                }
                TermArray::Boolean(values) => OutputColumn::Boolean(cells.iter().map(|c| values[at(*c)]).collect()),
                TermArray::Categorical(labels) => OutputColumn::Categorical {
                    codes: cells.iter().map(|c| labels.codes()[at(*c)]).collect(),
                    categories: labels.categories().to_vec(),
                },
            };
            columns.push((name.clone(), column));
        }

        PipelineOutput::new(row_dates, row_sids, columns)
    }
}

fn missing_result(graph: &TermGraph, id: TermId) -> PipelineError {
    PipelineError::InvalidGraph(format!("{} was released before its consumers ran", graph.identity(id)))
}

fn check_shape(graph: &TermGraph, id: TermId, array: &TermArray, expected: (usize, usize)) -> Result<()> {
    let term = graph.term(id);
    if array.kind() != term.output_kind() {
        return Err(PipelineError::TypeMismatch(format!(
            "{} declared {} output but produced {}",
            graph.identity(id),
            term.output_kind(),
            array.kind()
        )));
    }
    if array.shape() != expected {
        return Err(PipelineError::ShapeMismatch {
            term: graph.identity(id).to_string(),
            expected,
            actual: array.shape(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asset::Asset;
    use crate::assets::{AssetDB, AssetFinder};
    use crate::calendar::{TradingCalendar, WeekdayCalendar};
    use crate::config::FundamentalsConfig;
    use crate::data::daily_bars::{SQLiteDailyBarReader, SQLiteDailyBarWriter};
    use crate::pipeline::hooks::LogProgressPublisher;
    use crate::pipeline::term::{term_identity, OutRow, OutputKind};
    use crate::pipeline::array::Window;
    use crate::types::DailyBar;
    use rusqlite::Connection;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2021, 1, day).unwrap()
    }

    /// Weekday calendar starting 2021-01-01; sid 1 trades all month at
    /// close = day of month, sid 2 lists on 01-11
    fn context() -> Arc<BundleContext> {
        let calendar: Arc<dyn TradingCalendar> = Arc::new(WeekdayCalendar::with_bounds(
            d(1),
            NaiveDate::from_ymd_opt(2021, 3, 31).unwrap(),
        ));
        let mut db = AssetDB::new_in_memory().unwrap();
        db.write_equities(&[
            Asset::new(1, "AAA", "NYSE", d(1), d(29)),
            Asset::new(2, "BBB", "NYSE", d(11), d(29)),
        ])
        .unwrap();
        let finder =
            AssetFinder::from_connection(db.into_connection(), calendar.clone(), FundamentalsConfig::default()).unwrap();

        let mut writer =
            SQLiteDailyBarWriter::from_connection(Connection::open_in_memory().unwrap(), calendar.clone(), d(1), d(29))
                .unwrap();
        let mut bars = Vec::new();
        for session in calendar.sessions_in_range(d(1), d(29)) {
            let close = session.format("%d").to_string().parse::<f64>().unwrap();
            bars.push(DailyBar::new(*session, 1, close, close, close, close, 100.0));
            if *session >= d(11) {
                bars.push(DailyBar::new(*session, 2, 2.0 * close, 2.0 * close, 2.0 * close, 2.0 * close, 100.0));
            }
        }
        writer.write_bars(&bars).unwrap();
        let reader = SQLiteDailyBarReader::from_connection(writer.into_connection(), Some(calendar)).unwrap();
        Arc::new(BundleContext::new(Arc::new(finder), Arc::new(reader)))
    }

    /// NaN-tolerant comparison of whole outputs
    fn csv(out: &PipelineOutput) -> String {
        let mut buf = Vec::new();
        out.to_csv(&mut buf).unwrap();
        String::from_utf8(buf).unwrap()
    }

    fn engine(config: PipelineConfig) -> SimplePipelineEngine {
        let ctx = context();
        let loaders = ctx.default_loaders();
        SimplePipelineEngine::new(ctx, loaders, config)
    }

    struct Close;

    impl Term for Close {
        fn identity(&self) -> String {
            "EquityPricing.close".to_string()
        }

        fn output_kind(&self) -> OutputKind {
            OutputKind::Numeric
        }

        fn bound_column(&self) -> Option<BoundColumn> {
            Some(BoundColumn::new(crate::pipeline::loader::PRICING_DATASET, "close"))
        }
    }

    /// Mean of the trailing window, counting its calls
    struct Mean {
        window: usize,
        calls: Arc<AtomicUsize>,
    }

    impl Term for Mean {
        fn identity(&self) -> String {
            term_identity("Mean", &[("window_length", self.window.to_string())], &self.inputs(), None)
        }

        fn output_kind(&self) -> OutputKind {
            OutputKind::Numeric
        }

        fn inputs(&self) -> Vec<Arc<dyn Term>> {
            vec![Arc::new(Close)]
        }

        fn window_length(&self) -> usize {
            self.window
        }

        fn compute(
            &self,
            _ctx: &BundleContext,
            _today: NaiveDate,
            _assets: &[Sid],
            windows: &[Window<'_>],
            out: &mut OutRow<'_>,
        ) -> Result<()> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            let window = windows[0].numeric()?;
            let out = out.numeric()?;
            for (j, column) in window.columns().into_iter().enumerate() {
                out[j] = column.sum() / column.len() as f64;
            }
            Ok(())
        }
    }

    struct AboveTen;

    impl Term for AboveTen {
        fn identity(&self) -> String {
            term_identity("AboveTen", &[], &self.inputs(), None)
        }

        fn output_kind(&self) -> OutputKind {
            OutputKind::Boolean
        }

        fn inputs(&self) -> Vec<Arc<dyn Term>> {
            vec![Arc::new(Close)]
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
            for (slot, value) in out.boolean()?.iter_mut().zip(window.row(0)) {
                *slot = *value > 10.0;
            }
            Ok(())
        }
    }

    struct Bucket;

    impl Term for Bucket {
        fn identity(&self) -> String {
            term_identity("Bucket", &[], &self.inputs(), None)
        }

        fn output_kind(&self) -> OutputKind {
            OutputKind::Categorical
        }

        fn inputs(&self) -> Vec<Arc<dyn Term>> {
            vec![Arc::new(Close)]
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
            for (slot, value) in out.labels()?.iter_mut().zip(window.row(0)) {
                if !value.is_nan() {
                    *slot = if *value < 20.0 { "low" } else { "high" }.to_string();
                }
            }
            Ok(())
        }
    }

    /// Declares a 2-D output but returns a single column
    struct Narrow;

    impl Term for Narrow {
        fn identity(&self) -> String {
            "Narrow()".to_string()
        }

        fn output_kind(&self) -> OutputKind {
            OutputKind::Numeric
        }

        fn inputs(&self) -> Vec<Arc<dyn Term>> {
            vec![Arc::new(Close)]
        }

        fn compute_chunk(
            &self,
            _ctx: &BundleContext,
            dates: &[NaiveDate],
            _assets: &[Sid],
            _mask: ArrayView2<'_, bool>,
            _inputs: &[TermInput<'_>],
        ) -> Result<TermArray> {
            Ok(TermArray::Numeric(Array2::zeros((dates.len(), 1))))
        }
    }

    fn mean(window: usize, calls: &Arc<AtomicUsize>) -> Arc<dyn Term> {
        Arc::new(Mean {
            window,
            calls: calls.clone(),
        })
    }

    #[test]
    fn test_pricing_is_known_the_next_session() {
        let engine = engine(PipelineConfig::default());
        let mut pipeline = Pipeline::new();
        pipeline.add("close", Arc::new(Close));
        let out = engine.run_pipeline(&pipeline, d(12), d(13), Some(1)).unwrap();

        assert_eq!(out.get_f64(d(12), 1, "close"), Some(11.0));
        assert_eq!(out.get_f64(d(13), 1, "close"), Some(12.0));
        // sid 2 lists on 01-11 and only enters the mask on the 12th
        assert_eq!(out.sids_on(d(12)), &[1, 2]);
        assert_eq!(out.get_f64(d(12), 2, "close"), Some(22.0));
        assert_eq!(out.get_f64(d(13), 2, "close"), Some(24.0));
    }

    #[test]
    fn test_windowed_factor_uses_extra_rows() {
        let engine = engine(PipelineConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let mut pipeline = Pipeline::new();
        pipeline.add("mean3", mean(3, &calls));
        let out = engine.run_pipeline(&pipeline, d(14), d(15), Some(1)).unwrap();

        // closes known on the 14th: 11, 12, 13
        assert_eq!(out.get_f64(d(14), 1, "mean3"), Some(12.0));
        assert_eq!(out.get_f64(d(15), 1, "mean3"), Some(13.0));
        assert_eq!(out.unique_dates(), vec![d(14), d(15)]);
    }

    #[test]
    fn test_screen_filters_rows() {
        let engine = engine(PipelineConfig::default());
        let mut pipeline = Pipeline::new();
        pipeline.add("close", Arc::new(Close));
        pipeline.set_screen(Arc::new(AboveTen));
        let out = engine.run_pipeline(&pipeline, d(8), d(13), Some(1)).unwrap();

        // sid 1 closes above ten from the 11th, visible on the 12th
        assert!(out.sids_on(d(8)).is_empty());
        assert!(out.sids_on(d(11)).is_empty());
        assert_eq!(out.sids_on(d(12)), &[1, 2]);
        assert_eq!(out.sids_on(d(13)), &[1, 2]);
        assert_eq!(out.get_f64(d(12), 1, "close"), Some(11.0));
    }

    #[test]
    fn test_chunked_run_matches_single_pass() {
        let engine = engine(PipelineConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let mut pipeline = Pipeline::new();
        pipeline.add("mean3", mean(3, &calls));
        pipeline.add("bucket", Arc::new(Bucket));

        let whole = engine.run_pipeline(&pipeline, d(11), d(28), Some(10_000_000)).unwrap();
        let chunked = engine.run_pipeline(&pipeline, d(11), d(28), Some(4)).unwrap();
        assert_eq!(csv(&whole), csv(&chunked));
        assert_eq!(whole.len(), chunked.len());
    }

    #[test]
    fn test_parallel_chunks_keep_order() {
        let config = PipelineConfig {
            parallel_chunks: true,
            ..PipelineConfig::default()
        };
        let calls = Arc::new(AtomicUsize::new(0));
        let mut pipeline = Pipeline::new();
        pipeline.add("mean3", mean(3, &calls));

        let sequential = engine(PipelineConfig::default())
            .run_pipeline(&pipeline, d(11), d(28), Some(3))
            .unwrap();
        let parallel = engine(config).run_pipeline(&pipeline, d(11), d(28), Some(3)).unwrap();
        assert_eq!(csv(&sequential), csv(&parallel));
    }

    #[test]
    fn test_cache_hit_skips_compute() {
        let dir = TempDir::new().unwrap();
        let publisher = Arc::new(LogProgressPublisher::new());
        let engine = engine(PipelineConfig::default())
            .with_cache(TermCache::new(dir.path()).unwrap())
            .with_hook(publisher.clone());
        let calls = Arc::new(AtomicUsize::new(0));
        let mut pipeline = Pipeline::new();
        pipeline.add("mean3", mean(3, &calls));

        let first = engine.run_pipeline(&pipeline, d(11), d(22), Some(5)).unwrap();
        let computed = calls.load(Ordering::Relaxed);
        assert!(computed > 0);
        assert_eq!(publisher.completed(), 2);

        let second = engine.run_pipeline(&pipeline, d(11), d(22), Some(5)).unwrap();
        assert_eq!(calls.load(Ordering::Relaxed), computed);
        assert_eq!(csv(&first), csv(&second));

        // the unchunked path bypasses the cache
        engine.run_pipeline(&pipeline, d(11), d(22), Some(1)).unwrap();
        assert!(calls.load(Ordering::Relaxed) > computed);
    }

    #[test]
    fn test_shape_mismatch_is_fatal() {
        let engine = engine(PipelineConfig::default());
        let mut pipeline = Pipeline::new();
        pipeline.add("narrow", Arc::new(Narrow));
        let err = engine.run_pipeline(&pipeline, d(12), d(14), Some(1)).unwrap_err();
        match err {
            PipelineError::ShapeMismatch { expected, actual, .. } => {
                assert_eq!(expected, (3, 2));
                assert_eq!(actual, (3, 1));
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_insufficient_history_policies() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut pipeline = Pipeline::new();
        pipeline.add("mean3", mean(3, &calls));

        let strict = engine(PipelineConfig {
            history_policy: HistoryPolicy::Fail,
            ..PipelineConfig::default()
        });
        let err = strict.run_pipeline(&pipeline, d(1), d(8), Some(1)).unwrap_err();
        match err {
            PipelineError::InsufficientHistory {
                extra_rows,
                earliest_start,
                ..
            } => {
                assert_eq!(extra_rows, 2);
                assert_eq!(earliest_start, Some(d(5)));
            }
            other => panic!("unexpected error {:?}", other),
        }

        let lenient = engine(PipelineConfig::default());
        let out = lenient.run_pipeline(&pipeline, d(1), d(8), Some(1)).unwrap();
        assert_eq!(out.unique_dates(), vec![d(5), d(6), d(7), d(8)]);
    }

    #[test]
    fn test_categorical_output_unions_chunk_levels() {
        let engine = engine(PipelineConfig::default());
        let mut pipeline = Pipeline::new();
        pipeline.add("bucket", Arc::new(Bucket));
        let out = engine.run_pipeline(&pipeline, d(12), d(22), Some(3)).unwrap();
        assert_eq!(out.get_label(d(12), 1, "bucket"), Some("low"));
        assert_eq!(out.get_label(d(20), 1, "bucket"), Some("low"));
        assert_eq!(out.get_label(d(21), 1, "bucket"), Some("high"));
        assert_eq!(out.get_label(d(12), 2, "bucket"), Some("high"));
        match out.column("bucket").unwrap() {
            OutputColumn::Categorical { categories, .. } => assert_eq!(categories, &vec!["NA", "high", "low"]),
            other => panic!("unexpected column {:?}", other),
        }
    }

    #[test]
    fn test_empty_range_is_rejected() {
        let engine = engine(PipelineConfig::default());
        let pipeline = Pipeline::new();
        // a weekend
        assert!(engine.run_pipeline(&pipeline, d(9), d(10), None).is_err());
        assert!(engine.run_pipeline(&pipeline, d(12), d(11), None).is_err());
    }
}
