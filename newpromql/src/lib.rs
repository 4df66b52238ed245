//! PromQL evaluation over a pluggable series store.

mod aggregations;
mod engine;
mod functions;
pub mod labels;
pub mod storage;
pub mod value;

pub use {
    engine::{millis_since_epoch, EvalError, QueryEngine, DEFAULT_MAX_SAMPLES},
    labels::Labels,
    storage::{LabelMatcher, MemStorage, Queryable, SelectHints, Series, StorageError},
    value::QueryData,
};
