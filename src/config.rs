//! Engine configuration
//!
//! Loaded from TOML. Every field has a default, so an empty file (or no file
//! at all) yields a working configuration rooted at `~/.rusty-pipeline/`.

use crate::error::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub bundle: BundleConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub fundamentals: FundamentalsConfig,
}

/// Location and layout of the bundle stores
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleConfig {
    #[serde(default = "default_bundle_root")]
    pub root: PathBuf,
    #[serde(default = "default_assets_db_version")]
    pub assets_db_version: u32,
    /// Overrides the calendar name stored in `prices.sqlite`
    #[serde(default)]
    pub calendar: Option<String>,
}

/// How a missing lookback window is handled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryPolicy {
    /// Abort with `InsufficientHistory`
    Fail,
    /// Move the start to the earliest satisfiable date once, with a warning
    AdvanceStart,
}

impl Default for HistoryPolicy {
    fn default() -> Self {
        HistoryPolicy::AdvanceStart
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_chunksize")]
    pub chunksize: usize,
    #[serde(default)]
    pub parallel_chunks: bool,
    #[serde(default)]
    pub history_policy: HistoryPolicy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_cache_dir")]
    pub dir: PathBuf,
    /// Mix a data-generation stamp of the stores into every cache key
    #[serde(default = "default_true")]
    pub stamp_data_version: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FundamentalsConfig {
    /// Staleness window for one quarter of lookback (about five months)
    #[serde(default = "default_staleness_days")]
    pub staleness_days_per_quarter: i64,
    #[serde(default = "default_daily_metric_lag")]
    pub daily_metric_max_lag_sessions: usize,
    #[serde(default = "default_query_cache_capacity")]
    pub query_cache_capacity: usize,
}

fn home_root() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".rusty-pipeline")
}

fn default_bundle_root() -> PathBuf {
    home_root().join("data")
}

fn default_cache_dir() -> PathBuf {
    home_root().join("cache")
}

fn default_assets_db_version() -> u32 {
    7
}

fn default_chunksize() -> usize {
    120
}

fn default_true() -> bool {
    true
}

fn default_staleness_days() -> i64 {
    150
}

fn default_daily_metric_lag() -> usize {
    5
}

fn default_query_cache_capacity() -> usize {
    1024
}

impl Default for BundleConfig {
    fn default() -> Self {
        Self {
            root: default_bundle_root(),
            assets_db_version: default_assets_db_version(),
            calendar: None,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            chunksize: default_chunksize(),
            parallel_chunks: false,
            history_policy: HistoryPolicy::default(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: default_cache_dir(),
            stamp_data_version: true,
        }
    }
}

impl Default for FundamentalsConfig {
    fn default() -> Self {
        Self {
            staleness_days_per_quarter: default_staleness_days(),
            daily_metric_max_lag_sessions: default_daily_metric_lag(),
            query_cache_capacity: default_query_cache_capacity(),
        }
    }
}

impl BundleConfig {
    pub fn prices_path(&self) -> PathBuf {
        self.root.join("prices.sqlite")
    }

    pub fn adjustments_path(&self) -> PathBuf {
        self.root.join("adjustments.sqlite")
    }

    pub fn assets_path(&self) -> PathBuf {
        self.root
            .join(format!("assets-{}.sqlite", self.assets_db_version))
    }

    pub fn universes_path(&self) -> PathBuf {
        self.root.join("universes.sqlite")
    }
}

impl EngineConfig {
    /// Default config file location
    pub fn default_path() -> PathBuf {
        home_root().join("config.toml")
    }

    /// Parse a TOML document
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: EngineConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path`, or from the default location when it exists,
    /// falling back to defaults otherwise
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => {
                let default = Self::default_path();
                if !default.exists() {
                    log::debug!("No config at {}, using defaults", default.display());
                    return Ok(Self::default());
                }
                default
            }
        };
        let contents = fs::read_to_string(&path).map_err(|e| {
            PipelineError::ConfigError(format!("Failed to read {}: {}", path.display(), e))
        })?;
        log::info!("Loaded configuration from {}", path.display());
        Self::from_toml_str(&contents)
    }

    pub fn validate(&self) -> Result<()> {
        if self.fundamentals.staleness_days_per_quarter <= 0 {
            return Err(PipelineError::ConfigError(
                "fundamentals.staleness_days_per_quarter must be positive".to_string(),
            ));
        }
        if self.fundamentals.query_cache_capacity == 0 {
            return Err(PipelineError::ConfigError(
                "fundamentals.query_cache_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Create the bundle and cache directories
    pub fn ensure_dirs(&self) -> Result<()> {
        fs::create_dir_all(&self.bundle.root)?;
        if self.cache.enabled {
            fs::create_dir_all(&self.cache.dir)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = EngineConfig::from_toml_str("").unwrap();
        assert_eq!(config.pipeline.chunksize, 120);
        assert_eq!(config.pipeline.history_policy, HistoryPolicy::AdvanceStart);
        assert_eq!(config.fundamentals.staleness_days_per_quarter, 150);
        assert!(config.cache.enabled);
        assert!(config.bundle.assets_path().ends_with("assets-7.sqlite"));
    }

    #[test]
    fn test_partial_sections() {
        let config = EngineConfig::from_toml_str(
            r#"
            [bundle]
            root = "/tmp/bundle"
            calendar = "XNYS"

            [pipeline]
            chunksize = 60
            history_policy = "fail"

            [cache]
            enabled = false
            "#,
        )
        .unwrap();
        assert_eq!(config.bundle.root, PathBuf::from("/tmp/bundle"));
        assert_eq!(config.bundle.calendar.as_deref(), Some("XNYS"));
        assert_eq!(config.pipeline.chunksize, 60);
        assert_eq!(config.pipeline.history_policy, HistoryPolicy::Fail);
        assert!(!config.cache.enabled);
        assert!(config.cache.stamp_data_version);
        assert_eq!(config.fundamentals.daily_metric_max_lag_sessions, 5);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = EngineConfig::from_toml_str("[fundamentals]\nstaleness_days_per_quarter = 0\n");
        assert!(matches!(err, Err(PipelineError::ConfigError(_))));
        assert!(matches!(
            EngineConfig::from_toml_str("[pipeline]\nchunksize = \"big\"\n"),
            Err(PipelineError::Toml(_))
        ));
    }
}
