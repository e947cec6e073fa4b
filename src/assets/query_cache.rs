//! Bounded LRU memo for point-in-time queries
//!
//! One instance is owned by each [`AssetFinder`](super::AssetFinder). Entries
//! carry the tick of their last access; when the cache is full the entry
//! with the smallest tick is evicted. Hit and miss counters are exposed so
//! the policy can be observed in tests and logs.

use crate::error::{PipelineError, Result};
use crate::types::Sid;
use chrono::NaiveDate;
use hashbrown::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Which query produced a cached value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryKind {
    Fundamentals,
    FundamentalsTtm,
    WindowLength,
    Info,
    DailyMetrics,
    DateKey,
}

/// Full identity of a point-in-time query
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueryKey {
    pub kind: QueryKind,
    pub sids: Vec<Sid>,
    pub field: String,
    pub as_of: NaiveDate,
    pub n: usize,
}

/// Cached query result
#[derive(Debug, Clone, PartialEq)]
pub enum CachedValue {
    Numbers(Vec<f64>),
    Labels(Vec<String>),
    Dates(Vec<Option<NaiveDate>>),
    Grid { rows: usize, values: Vec<f64> },
}

/// Snapshot of cache counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub len: usize,
    pub capacity: usize,
}

struct Inner {
    entries: HashMap<QueryKey, (CachedValue, u64)>,
    tick: u64,
}

pub struct QueryCache {
    inner: Mutex<Inner>,
    capacity: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl QueryCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::with_capacity(capacity.min(4096)),
                tick: 0,
            }),
            capacity: capacity.max(1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn get(&self, key: &QueryKey) -> Result<Option<CachedValue>> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| PipelineError::LockPoisoned("query cache"))?;
        inner.tick += 1;
        let tick = inner.tick;
        match inner.entries.get_mut(key) {
            Some((value, last_used)) => {
                *last_used = tick;
                self.hits.fetch_add(1, Ordering::Relaxed);
                Ok(Some(value.clone()))
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
        }
    }

    pub fn insert(&self, key: QueryKey, value: CachedValue) -> Result<()> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| PipelineError::LockPoisoned("query cache"))?;
        inner.tick += 1;
        let tick = inner.tick;
        if !inner.entries.contains_key(&key) && inner.entries.len() >= self.capacity {
            let oldest = inner
                .entries
                .iter()
                .min_by_key(|(_, (_, last_used))| *last_used)
                .map(|(k, _)| k.clone());
            if let Some(oldest) = oldest {
                inner.entries.remove(&oldest);
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
        inner.entries.insert(key, (value, tick));
        Ok(())
    }

    /// Drop every entry. Called after the fact store is written to.
    pub fn invalidate(&self) -> Result<()> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| PipelineError::LockPoisoned("query cache"))?;
        let dropped = inner.entries.len();
        inner.entries.clear();
        if dropped > 0 {
            log::debug!("Invalidated {} cached point-in-time queries", dropped);
        }
        Ok(())
    }

    pub fn stats(&self) -> CacheStats {
        let len = self.inner.lock().map(|i| i.entries.len()).unwrap_or(0);
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            len,
            capacity: self.capacity,
        }
    }
}
