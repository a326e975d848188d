//! logstats — grouped streaming statistics engine
//!
//! Implements the `| stats ...` pipe of a log-query pipeline: blocks of
//! columnar rows stream in from multiple worker threads, are aggregated
//! per grouping key by a family of statistics functions, and a single
//! output row per group is emitted to the next pipe stage on flush.

pub mod data;
pub mod pipe;
pub mod query;
pub mod stats;

// Re-export main types
pub use data::{Block, Column, ColumnData, ValueType};
pub use pipe::{CancelToken, CollectorPipe, PipeProcessor};
pub use query::FilterExpr;
pub use stats::{ByField, FuncSpec, StatsFunc, StatsPipe, StatsProcessor};

/// Stats engine error type
#[derive(Debug, thiserror::Error)]
pub enum StatsError {
    #[error("cannot parse stats pipe: {0}")]
    QueryParse(String),

    #[error("cannot calculate [{pipe}], since it requires more than {limit_mb}MB of memory")]
    StateSizeBudgetExceeded { pipe: String, limit_mb: i64 },
}

pub type Result<T> = std::result::Result<T, StatsError>;
