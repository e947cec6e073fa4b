//! On-disk term cache
//!
//! Computed term results are persisted as small CSV files keyed by the
//! term's dates, the asset set and the term's structural identity. When a
//! data stamp is configured it is mixed into every key, so re-ingested
//! stores produce fresh keys instead of stale hits.
//!
//! Files are written to a temporary name and renamed into place. There is
//! no cross-process locking; two processes computing the same key both
//! write the same bytes.

use crate::error::{PipelineError, Result};
use crate::pipeline::array::{LabelArray, TermArray};
use crate::pipeline::term::{OutputKind, Term};
use crate::types::{fmt_date, Sid};
use chrono::NaiveDate;
use ndarray::Array2;
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

const TERM_PREFIX: &str = "term-";
const ROOT_PREFIX: &str = "root-";
const EXTENSION: &str = "csv";

/// FNV-1a, 64 bit
fn fnv1a(bytes: impl IntoIterator<Item = u8>) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    hash
}

fn hash_sids(sids: &[Sid]) -> u64 {
    fnv1a(sids.iter().flat_map(|s| s.to_le_bytes()))
}

/// File name of one cache entry
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn file_name(&self) -> &str {
        &self.0
    }
}

/// Directory of persisted term results
#[derive(Debug, Clone)]
pub struct TermCache {
    dir: PathBuf,
    stamp: Option<u64>,
}

impl TermCache {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir, stamp: None })
    }

    /// Mix a data-generation stamp into every key
    pub fn with_stamp(mut self, stamp: &str) -> Self {
        self.stamp = Some(fnv1a(stamp.bytes()));
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn stamp_suffix(&self) -> String {
        self.stamp.map(|s| format!("-{:016x}", s)).unwrap_or_default()
    }

    pub fn term_key(&self, identity: &str, dates: &[NaiveDate], sids: &[Sid]) -> CacheKey {
        let (first, last) = date_bounds(dates);
        CacheKey(format!(
            "{}{}_{}-{:016x}-{:016x}{}.{}",
            TERM_PREFIX,
            first,
            last,
            hash_sids(sids),
            fnv1a(identity.bytes()),
            self.stamp_suffix(),
            EXTENSION
        ))
    }

    pub fn root_mask_key(&self, calendar: &str, dates: &[NaiveDate]) -> CacheKey {
        let (first, last) = date_bounds(dates);
        CacheKey(format!(
            "{}{}_{}-{:016x}{}.{}",
            ROOT_PREFIX,
            first,
            last,
            fnv1a(calendar.bytes()),
            self.stamp_suffix(),
            EXTENSION
        ))
    }

    fn path(&self, key: &CacheKey) -> PathBuf {
        self.dir.join(key.file_name())
    }

    /// Load a term result, reconstructing labels with the term's declared
    /// categories and missing value. Unreadable or mismatched entries are
    /// treated as misses.
    pub fn load(&self, key: &CacheKey, term: &dyn Term, shape: (usize, usize)) -> Result<Option<TermArray>> {
        let path = self.path(key);
        if !path.exists() {
            return Ok(None);
        }
        match read_term_file(&path, term, shape) {
            Ok(array) => {
                log::debug!("Term cache hit: {}", key.file_name());
                Ok(Some(array))
            }
            Err(e) => {
                log::warn!("Ignoring unreadable cache entry {}: {}", path.display(), e);
                Ok(None)
            }
        }
    }

    pub fn save(&self, key: &CacheKey, array: &TermArray) -> Result<()> {
        let (rows, cols) = array.shape();
        let header = [array.kind().tag().to_string(), rows.to_string(), cols.to_string()];
        let records: Box<dyn Iterator<Item = Vec<String>> + '_> = match array {
            TermArray::Numeric(a) => Box::new(
                a.rows()
                    .into_iter()
                    .map(|r| r.iter().map(|v| v.to_string()).collect::<Vec<String>>()),
            ),
            TermArray::Adjusted(a) => {
                Box::new(
                    a.data()
                        .rows()
                        .into_iter()
                        .map(|r| r.iter().map(|v| v.to_string()).collect::<Vec<String>>()),
                )
            }
            TermArray::Boolean(a) => Box::new(
                a.rows()
                    .into_iter()
                    .map(|r| r.iter().map(|v| if *v { "1" } else { "0" }.to_string()).collect::<Vec<String>>()),
            ),
            TermArray::Categorical(a) => {
                let labels = a.to_labels();
                let width = cols.max(1);
                Box::new(
                    labels
                        .chunks(width)
                        .map(|chunk| chunk.to_vec())
                        .collect::<Vec<_>>()
                        .into_iter(),
                )
            }
        };
        self.write_atomic(key, &header, if cols == 0 { None } else { Some(records) })
    }

    pub fn load_root_mask(&self, key: &CacheKey) -> Result<Option<(Vec<Sid>, Array2<bool>)>> {
        let path = self.path(key);
        if !path.exists() {
            return Ok(None);
        }
        match read_root_file(&path) {
            Ok(mask) => Ok(Some(mask)),
            Err(e) => {
                log::warn!("Ignoring unreadable root mask {}: {}", path.display(), e);
                Ok(None)
            }
        }
    }

    pub fn save_root_mask(&self, key: &CacheKey, sids: &[Sid], mask: &Array2<bool>) -> Result<()> {
        let (rows, cols) = mask.dim();
        let header = ["root".to_string(), rows.to_string(), cols.to_string()];
        let sid_row = std::iter::once(sids.iter().map(|s| s.to_string()).collect::<Vec<_>>());
        let mask_rows = mask
            .rows()
            .into_iter()
            .map(|r| r.iter().map(|v| if *v { "1" } else { "0" }.to_string()).collect::<Vec<_>>());
        let records: Box<dyn Iterator<Item = Vec<String>> + '_> = Box::new(sid_row.chain(mask_rows));
        self.write_atomic(key, &header, if cols == 0 { None } else { Some(records) })
    }

    fn write_atomic(
        &self,
        key: &CacheKey,
        header: &[String],
        records: Option<Box<dyn Iterator<Item = Vec<String>> + '_>>,
    ) -> Result<()> {
        let tmp = self.dir.join(format!(".tmp-{}.{}", Uuid::new_v4(), EXTENSION));
        {
            let mut writer = csv::WriterBuilder::new()
                .has_headers(false)
                .flexible(true)
                .from_path(&tmp)?;
            writer.write_record(header)?;
            if let Some(records) = records {
                for record in records {
                    writer.write_record(&record)?;
                }
            }
            writer.flush()?;
        }
        fs::rename(&tmp, self.path(key)).map_err(|e| {
            let _ = fs::remove_file(&tmp);
            PipelineError::CacheError(format!("Could not move cache entry into place: {}", e))
        })
    }

    /// Remove every cache entry; returns the number of files deleted
    pub fn clear(&self) -> Result<usize> {
        let mut removed = 0;
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let ours = (name.starts_with(TERM_PREFIX) || name.starts_with(ROOT_PREFIX) || name.starts_with(".tmp-"))
                && name.ends_with(EXTENSION);
            if ours && entry.file_type()?.is_file() {
                fs::remove_file(entry.path())?;
                removed += 1;
            }
        }
        log::info!("Removed {} entries from {}", removed, self.dir.display());
        Ok(removed)
    }
}

fn date_bounds(dates: &[NaiveDate]) -> (String, String) {
    match (dates.first(), dates.last()) {
        (Some(f), Some(l)) => (fmt_date(*f), fmt_date(*l)),
        _ => ("none".to_string(), "none".to_string()),
    }
}

fn open_reader(path: &Path) -> Result<csv::Reader<fs::File>> {
    Ok(csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(path)?)
}

fn parse_header(record: &csv::StringRecord) -> Result<(String, usize, usize)> {
    let field = |i: usize| {
        record
            .get(i)
            .ok_or_else(|| PipelineError::CacheError("Truncated cache header".to_string()))
    };
    let parse = |s: &str| {
        s.parse::<usize>()
            .map_err(|e| PipelineError::CacheError(format!("Bad dimension '{}': {}", s, e)))
    };
    Ok((field(0)?.to_string(), parse(field(1)?)?, parse(field(2)?)?))
}

fn read_term_file(path: &Path, term: &dyn Term, shape: (usize, usize)) -> Result<TermArray> {
    let mut reader = open_reader(path)?;
    let mut records = reader.records();
    let header = records
        .next()
        .ok_or_else(|| PipelineError::CacheError("Empty cache file".to_string()))??;
    let (tag, rows, cols) = parse_header(&header)?;
    let kind: OutputKind = tag.parse()?;
    if kind != term.output_kind() {
        return Err(PipelineError::CacheError(format!(
            "Entry holds {} values, term produces {}",
            kind,
            term.output_kind()
        )));
    }
    if (rows, cols) != shape {
        return Err(PipelineError::CacheError(format!(
            "Entry has shape {:?}, expected {:?}",
            (rows, cols),
            shape
        )));
    }

    let mut cells: Vec<String> = Vec::with_capacity(rows * cols);
    if cols > 0 {
        for record in records.take(rows) {
            let record = record?;
            if record.len() != cols {
                return Err(PipelineError::CacheError(format!(
                    "Row with {} cells, expected {}",
                    record.len(),
                    cols
                )));
            }
            cells.extend(record.iter().map(str::to_string));
        }
    }
    if cells.len() != rows * cols {
        return Err(PipelineError::CacheError("Truncated cache entry".to_string()));
    }

    Ok(match kind {
        OutputKind::Numeric => {
            let values = cells
                .iter()
                .map(|c| {
                    c.parse::<f64>()
                        .map_err(|e| PipelineError::CacheError(format!("Bad number '{}': {}", c, e)))
                })
                .collect::<Result<Vec<_>>>()?;
            TermArray::Numeric(Array2::from_shape_vec((rows, cols), values)?)
        }
        OutputKind::Boolean => {
            let values: Vec<bool> = cells.iter().map(|c| c == "1").collect();
            TermArray::Boolean(Array2::from_shape_vec((rows, cols), values)?)
        }
        OutputKind::Categorical => {
            let declared = term.categories();
            TermArray::Categorical(LabelArray::from_labels(
                (rows, cols),
                &cells,
                term.missing_label(),
                declared.as_deref(),
            )?)
        }
    })
}

fn read_root_file(path: &Path) -> Result<(Vec<Sid>, Array2<bool>)> {
    let mut reader = open_reader(path)?;
    let mut records = reader.records();
    let header = records
        .next()
        .ok_or_else(|| PipelineError::CacheError("Empty root mask file".to_string()))??;
    let (tag, rows, cols) = parse_header(&header)?;
    if tag != "root" {
        return Err(PipelineError::CacheError(format!("Not a root mask: {}", tag)));
    }
    if cols == 0 {
        return Ok((Vec::new(), Array2::from_elem((rows, 0), false)));
    }
    let sid_record = records
        .next()
        .ok_or_else(|| PipelineError::CacheError("Root mask without sids".to_string()))??;
    let sids = sid_record
        .iter()
        .map(|s| {
            s.parse::<Sid>()
                .map_err(|e| PipelineError::CacheError(format!("Bad sid '{}': {}", s, e)))
        })
        .collect::<Result<Vec<_>>>()?;
    let mut values = Vec::with_capacity(rows * cols);
    for record in records.take(rows) {
        values.extend(record?.iter().map(|c| c == "1"));
    }
    if sids.len() != cols || values.len() != rows * cols {
        return Err(PipelineError::CacheError("Truncated root mask".to_string()));
    }
    Ok((sids, Array2::from_shape_vec((rows, cols), values)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::term::term_identity;
    use ndarray::array;
    use tempfile::TempDir;

    struct Kind(OutputKind, Option<Vec<String>>);

    impl Term for Kind {
        fn identity(&self) -> String {
            term_identity("Kind", &[("kind", self.0.to_string())], &[], None)
        }
        fn output_kind(&self) -> OutputKind {
            self.0
        }
        fn categories(&self) -> Option<Vec<String>> {
            self.1.clone()
        }
    }

    fn dates() -> Vec<NaiveDate> {
        vec![
            NaiveDate::from_ymd_opt(2021, 1, 4).unwrap(),
            NaiveDate::from_ymd_opt(2021, 1, 5).unwrap(),
        ]
    }

    #[test]
    fn test_numeric_entries_round_trip_bit_exact() {
        let dir = TempDir::new().unwrap();
        let cache = TermCache::new(dir.path()).unwrap();
        let term = Kind(OutputKind::Numeric, None);
        let key = cache.term_key(&term.identity(), &dates(), &[1, 2]);
        let values = array![[0.1 + 0.2, f64::NAN], [-0.0, 1e-300]];
        cache.save(&key, &TermArray::Numeric(values.clone())).unwrap();

        let loaded = cache.load(&key, &term, (2, 2)).unwrap().unwrap();
        let loaded = loaded.as_numeric().unwrap().to_owned();
        for (a, b) in loaded.iter().zip(values.iter()) {
            assert_eq!(a.to_bits(), b.to_bits());
        }
    }

    #[test]
    fn test_categorical_entries_use_declared_categories() {
        let dir = TempDir::new().unwrap();
        let cache = TermCache::new(dir.path()).unwrap();
        let declared = vec!["Energy".to_string(), "Utilities".to_string()];
        let term = Kind(OutputKind::Categorical, Some(declared.clone()));
        let labels = LabelArray::from_labels((1, 3), &["Utilities", "NA", "Energy"], "NA", Some(declared.as_slice())).unwrap();
        let key = cache.term_key(&term.identity(), &dates(), &[1, 2, 3]);
        cache.save(&key, &TermArray::Categorical(labels.clone())).unwrap();

        let loaded = cache.load(&key, &term, (1, 3)).unwrap().unwrap();
        assert_eq!(loaded, TermArray::Categorical(labels));
    }

    #[test]
    fn test_keys_depend_on_sids_identity_and_stamp() {
        let dir = TempDir::new().unwrap();
        let cache = TermCache::new(dir.path()).unwrap();
        let a = cache.term_key("A()", &dates(), &[1, 2]);
        assert_ne!(a, cache.term_key("A()", &dates(), &[1, 3]));
        assert_ne!(a, cache.term_key("B()", &dates(), &[1, 2]));
        let stamped = cache.clone().with_stamp("bars=10:2021-01-05");
        assert_ne!(a, stamped.term_key("A()", &dates(), &[1, 2]));
    }

    #[test]
    fn test_shape_mismatch_and_corruption_are_misses() {
        let dir = TempDir::new().unwrap();
        let cache = TermCache::new(dir.path()).unwrap();
        let term = Kind(OutputKind::Boolean, None);
        let key = cache.term_key(&term.identity(), &dates(), &[1]);
        cache
            .save(&key, &TermArray::Boolean(array![[true], [false]]))
            .unwrap();
        assert!(cache.load(&key, &term, (3, 1)).unwrap().is_none());
        assert!(cache.load(&key, &term, (2, 1)).unwrap().is_some());

        fs::write(dir.path().join(key.file_name()), "garbage").unwrap();
        assert!(cache.load(&key, &term, (2, 1)).unwrap().is_none());
    }

    #[test]
    fn test_root_mask_and_clear() {
        let dir = TempDir::new().unwrap();
        let cache = TermCache::new(dir.path()).unwrap();
        let key = cache.root_mask_key("NYSE", &dates());
        let mask = array![[true, false], [true, true]];
        cache.save_root_mask(&key, &[5, 9], &mask).unwrap();
        let (sids, loaded) = cache.load_root_mask(&key).unwrap().unwrap();
        assert_eq!(sids, vec![5, 9]);
        assert_eq!(loaded, mask);

        assert_eq!(cache.clear().unwrap(), 1);
        assert!(cache.load_root_mask(&key).unwrap().is_none());
    }
}
