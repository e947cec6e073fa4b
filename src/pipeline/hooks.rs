//! Progress hooks for pipeline runs

use chrono::NaiveDate;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Callbacks invoked by the engine as a run progresses
///
/// Chunks may run in parallel, so implementations must tolerate calls
/// from several threads.
pub trait PipelineHooks: Send + Sync {
    fn on_pipeline_start(&self, _start: NaiveDate, _end: NaiveDate, _chunks: usize) {}

    fn on_chunk_start(&self, _index: usize, _start: NaiveDate, _end: NaiveDate) {}

    fn on_chunk_end(&self, _index: usize, _rows: usize) {}

    fn on_loading_terms(&self, _terms: &[String]) {}

    fn on_computing_term(&self, _term: &str) {}

    fn on_cache_hit(&self, _term: &str) {}

    fn on_pipeline_end(&self, _rows: usize) {}
}

/// Logs percent completion per finished chunk
#[derive(Debug, Default)]
pub struct LogProgressPublisher {
    total: AtomicUsize,
    completed: AtomicUsize,
}

impl LogProgressPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::Relaxed)
    }
}

impl PipelineHooks for LogProgressPublisher {
    fn on_pipeline_start(&self, start: NaiveDate, end: NaiveDate, chunks: usize) {
        self.total.store(chunks, Ordering::Relaxed);
        self.completed.store(0, Ordering::Relaxed);
        log::info!("Running pipeline {} to {} in {} chunk(s)", start, end, chunks);
    }

    fn on_chunk_end(&self, index: usize, rows: usize) {
        let done = self.completed.fetch_add(1, Ordering::Relaxed) + 1;
        let total = self.total.load(Ordering::Relaxed).max(1);
        log::info!(
            "[{:>3}%] chunk {} finished with {} rows",
            done * 100 / total,
            index + 1,
            rows
        );
    }

    fn on_loading_terms(&self, terms: &[String]) {
        log::debug!("Loading {}", terms.join(", "));
    }

    fn on_computing_term(&self, term: &str) {
        log::debug!("Computing {}", term);
    }

    fn on_pipeline_end(&self, rows: usize) {
        log::info!("Pipeline finished with {} rows", rows);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publisher_counts_chunks() {
        let publisher = LogProgressPublisher::new();
        let day = NaiveDate::from_ymd_opt(2021, 1, 4).unwrap();
        publisher.on_pipeline_start(day, day, 2);
        publisher.on_chunk_end(0, 10);
        publisher.on_chunk_end(1, 12);
        assert_eq!(publisher.completed(), 2);
    }
}
