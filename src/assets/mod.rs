//! Asset metadata and the point-in-time fact store

pub mod asset_db;
pub mod asset_finder;
pub mod query_cache;

pub use asset_db::{AssetDB, FactValue, SupplementaryFact};
pub use asset_finder::{AssetFinder, Lifetimes, MISSING_LABEL};
pub use query_cache::{CacheStats, QueryCache};
