//! Bundle context
//!
//! A `BundleContext` owns the handles of one data bundle (asset DB, daily
//! bars, adjustments, universes) and is passed explicitly to the engine and
//! to every term's `compute`. Tests build one from in-memory stores.

use crate::assets::AssetFinder;
use crate::calendar::{get_calendar, TradingCalendar};
use crate::config::{BundleConfig, FundamentalsConfig};
use crate::data::adjustments::SQLiteAdjustmentReader;
use crate::data::bar_reader::SessionBarReader;
use crate::data::daily_bars::SQLiteDailyBarReader;
use crate::data::data_portal::DataPortal;
use crate::error::{PipelineError, Result};
use crate::pipeline::loader::{EquityPricingLoader, LoaderRegistry, PRICING_DATASET};
use crate::universe::UniverseStore;
use chrono::NaiveDate;
use serde::Serialize;
use std::sync::Arc;

/// What a bundle holds, as printed by `bundle-info`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BundleSummary {
    pub calendar: String,
    pub equities: usize,
    pub first_bar: Option<NaiveDate>,
    pub last_bar: Option<NaiveDate>,
    pub adjustments: bool,
    pub universes: Vec<String>,
    pub data_stamp: String,
}

pub struct BundleContext {
    calendar: Arc<dyn TradingCalendar>,
    asset_finder: Arc<AssetFinder>,
    bar_reader: Arc<SQLiteDailyBarReader>,
    adjustment_reader: Option<Arc<SQLiteAdjustmentReader>>,
    universes: Option<Arc<UniverseStore>>,
}

impl BundleContext {
    pub fn new(asset_finder: Arc<AssetFinder>, bar_reader: Arc<SQLiteDailyBarReader>) -> Self {
        Self {
            calendar: bar_reader.trading_calendar(),
            asset_finder,
            bar_reader,
            adjustment_reader: None,
            universes: None,
        }
    }

    pub fn with_adjustments(mut self, reader: Arc<SQLiteAdjustmentReader>) -> Self {
        self.adjustment_reader = Some(reader);
        self
    }

    pub fn with_universes(mut self, universes: Arc<UniverseStore>) -> Self {
        self.universes = Some(universes);
        self
    }

    /// Open the stores of a bundle directory
    ///
    /// `prices.sqlite` and the assets DB must exist; adjustments are
    /// optional and the universe store is created on demand.
    pub fn open(bundle: &BundleConfig, fundamentals: &FundamentalsConfig) -> Result<Self> {
        let prices = bundle.prices_path();
        let assets = bundle.assets_path();
        for path in [&prices, &assets] {
            if !path.exists() {
                return Err(PipelineError::ConfigError(format!(
                    "Bundle file {} does not exist",
                    path.display()
                )));
            }
        }

        let calendar = bundle.calendar.as_deref().map(get_calendar).transpose()?;
        let bar_reader = Arc::new(SQLiteDailyBarReader::open(&prices, calendar)?);
        let calendar = bar_reader.trading_calendar();
        let asset_finder = Arc::new(AssetFinder::open(&assets, calendar.clone(), fundamentals.clone())?);

        let adjustments = bundle.adjustments_path();
        let adjustment_reader = if adjustments.exists() {
            Some(Arc::new(SQLiteAdjustmentReader::open(&adjustments)?))
        } else {
            log::warn!("No adjustments at {}; prices are unadjusted", adjustments.display());
            None
        };
        let universes = Arc::new(UniverseStore::open(&bundle.universes_path())?);

        log::info!(
            "Opened bundle {} ({} calendar)",
            bundle.root.display(),
            calendar.name()
        );
        Ok(Self {
            calendar,
            asset_finder,
            bar_reader,
            adjustment_reader,
            universes: Some(universes),
        })
    }

    pub fn calendar(&self) -> &Arc<dyn TradingCalendar> {
        &self.calendar
    }

    pub fn asset_finder(&self) -> &Arc<AssetFinder> {
        &self.asset_finder
    }

    pub fn bar_reader(&self) -> &Arc<SQLiteDailyBarReader> {
        &self.bar_reader
    }

    pub fn adjustment_reader(&self) -> Option<&Arc<SQLiteAdjustmentReader>> {
        self.adjustment_reader.as_ref()
    }

    pub fn universes(&self) -> Result<&Arc<UniverseStore>> {
        self.universes
            .as_ref()
            .ok_or_else(|| PipelineError::ConfigError("No universe store attached to this bundle".to_string()))
    }

    pub fn data_portal(&self) -> DataPortal {
        let bars: Arc<dyn SessionBarReader> = self.bar_reader.clone();
        DataPortal::new(bars, self.adjustment_reader.clone())
    }

    /// Loaders for every dataset the bundle serves
    pub fn default_loaders(&self) -> LoaderRegistry {
        let bars: Arc<dyn SessionBarReader> = self.bar_reader.clone();
        let mut registry = LoaderRegistry::new();
        registry.register(
            PRICING_DATASET,
            Arc::new(EquityPricingLoader::new(bars, self.adjustment_reader.clone())),
        );
        registry
    }

    /// Data-generation stamp of every store, for term cache keys
    pub fn data_stamp(&self) -> Result<String> {
        let mut parts = vec![self.asset_finder.data_stamp()?, self.bar_reader.data_stamp()?];
        if let Some(reader) = &self.adjustment_reader {
            parts.push(reader.data_stamp()?);
        }
        Ok(parts.join(";"))
    }

    pub fn summary(&self) -> Result<BundleSummary> {
        let universes = match &self.universes {
            Some(store) => store.names()?,
            None => Vec::new(),
        };
        Ok(BundleSummary {
            calendar: self.calendar.name().to_string(),
            equities: self.asset_finder.sids()?.len(),
            first_bar: self.bar_reader.first_trading_day()?,
            last_bar: self.bar_reader.last_available_dt()?,
            adjustments: self.adjustment_reader.is_some(),
            universes,
            data_stamp: self.data_stamp()?,
        })
    }
}
