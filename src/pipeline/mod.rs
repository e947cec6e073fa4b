//! Pipeline system: a dependency graph of terms evaluated over a session
//! range against the bundle stores

pub mod array;
pub mod cache;
pub mod chunks;
pub mod classifiers;
pub mod engine;
pub mod factors;
pub mod filters;
pub mod graph;
pub mod hooks;
pub mod loader;
pub mod output;
pub mod term;

pub use array::{AdjustedArray, LabelArray, TermArray, Window};
pub use cache::{CacheKey, TermCache};
pub use chunks::{compute_date_range_chunks, concat_outputs};
pub use classifiers::{label_eq, ElementOf, InfoClassifier};
pub use engine::{Pipeline, SimplePipelineEngine};
pub use factors::{
    time_trend, Arithmetic, ArithmeticOp, CustomFactor, DailyMetric, DaysSinceFiling, Fundamentals,
    FundamentalsTTM, FundamentalsTrend, Latest, PriceColumn, Returns, SimpleMovingAverage, Slice,
};
pub use filters::{
    and, or, BooleanCombination, Comparison, NamedUniverse, Not, NotMissing, NumericComparison,
    PercentileBetween, StaticSids,
};
pub use graph::TermGraph;
pub use hooks::{LogProgressPublisher, PipelineHooks};
pub use loader::{EquityPricingLoader, LoaderRegistry, PipelineLoader, PRICING_DATASET};
pub use output::{OutputColumn, PipelineOutput};
pub use term::{term_identity, BoundColumn, NDim, OutRow, OutputKind, Term, TermId, TermInput};
