// Copyright 2022 Zinc Labs Inc. and Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The storage contract consumed by the query engine and the API, and an
//! in-memory implementation on top of DataFusion.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use arrow::{
    array::{Array, ArrayRef, Float64Array, Int64Array, StringArray},
    datatypes::{DataType, Field, Schema},
    error::ArrowError,
    record_batch::RecordBatch,
};
use async_trait::async_trait;
use datafusion::{
    datasource::MemTable,
    error::DataFusionError,
    common::Column,
    logical_expr::Expr,
    prelude::{lit, SessionContext},
};
use indexmap::IndexMap;
use itertools::Itertools;
use promql_parser::{
    label::{MatchOp, Matcher},
    parser::VectorSelector,
};
use regex::Regex;
use tokio_util::sync::CancellationToken;

use crate::{
    labels::{Labels, METRIC_NAME},
    value::Sample,
};

// Reserved column names are not valid label names, so no label can shadow them.
pub const FIELD_HASH: &str = "@hash";
pub const FIELD_RESOLUTION: &str = "@resolution";
pub const FIELD_TIME: &str = "@timestamp";
pub const FIELD_VALUE: &str = "@value";

/// Resolution of raw, not downsampled, data.
pub const RESOLUTION_RAW: i64 = 0;

// See https://docs.rs/indexmap/latest/indexmap/#alternate-hashers
type FxIndexMap<K, V> = IndexMap<K, V, std::hash::BuildHasherDefault<rustc_hash::FxHasher>>;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage operation canceled")]
    Canceled,
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("invalid series: {0}")]
    InvalidSeries(String),
    #[error("invalid matcher: {0}")]
    InvalidMatcher(String),
    #[error(transparent)]
    DataFusion(#[from] DataFusionError),
    #[error(transparent)]
    Arrow(#[from] ArrowError),
}

pub type Result<T, E = StorageError> = std::result::Result<T, E>;

/// A time series: a label set plus samples ordered by timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct Series {
    pub labels: Labels,
    pub samples: Vec<Sample>,
}

impl Series {
    pub fn new(labels: Labels, samples: Vec<Sample>) -> Self {
        Self { labels, samples }
    }
}

/// Selects series by a single label.
#[derive(Debug, Clone)]
pub enum LabelMatcher {
    Equal { name: String, value: String },
    NotEqual { name: String, value: String },
    Regex { name: String, regex: Regex },
    NotRegex { name: String, regex: Regex },
}

impl LabelMatcher {
    pub fn equal(name: impl Into<String>, value: impl Into<String>) -> Self {
        LabelMatcher::Equal {
            name: name.into(),
            value: value.into(),
        }
    }

    /// Builds a fully anchored regex matcher.
    pub fn regex(name: impl Into<String>, re: &str) -> Result<Self> {
        Ok(LabelMatcher::Regex {
            name: name.into(),
            regex: anchored(re)?,
        })
    }

    pub fn from_promql(matcher: &Matcher) -> Result<Self> {
        let name = matcher.name.clone();
        let value = matcher.value.clone();
        Ok(match &matcher.op {
            MatchOp::Equal => LabelMatcher::Equal { name, value },
            MatchOp::NotEqual => LabelMatcher::NotEqual { name, value },
            MatchOp::Re(_) => LabelMatcher::Regex {
                name,
                regex: anchored(&value)?,
            },
            MatchOp::NotRe(_) => LabelMatcher::NotRegex {
                name,
                regex: anchored(&value)?,
            },
        })
    }

    /// All matchers of a vector selector, the metric name included.
    pub fn from_selector(selector: &VectorSelector) -> Result<Vec<Self>> {
        let mut matchers = Vec::new();
        if let Some(name) = &selector.name {
            matchers.push(LabelMatcher::equal(METRIC_NAME, name.as_str()));
        }
        for mat in selector.matchers.matchers.iter() {
            matchers.push(LabelMatcher::from_promql(mat)?);
        }
        Ok(matchers)
    }

    pub fn name(&self) -> &str {
        match self {
            LabelMatcher::Equal { name, .. }
            | LabelMatcher::NotEqual { name, .. }
            | LabelMatcher::Regex { name, .. }
            | LabelMatcher::NotRegex { name, .. } => name,
        }
    }

    /// Reports whether the label set satisfies the matcher. A missing label
    /// is matched as the empty string.
    pub fn matches(&self, labels: &Labels) -> bool {
        let value = labels.get(self.name()).unwrap_or("");
        match self {
            LabelMatcher::Equal { value: v, .. } => value == v,
            LabelMatcher::NotEqual { value: v, .. } => value != v,
            LabelMatcher::Regex { regex, .. } => regex.is_match(value),
            LabelMatcher::NotRegex { regex, .. } => !regex.is_match(value),
        }
    }

    /// The metric name this matcher pins, if it is an equality matcher on
    /// `__name__`.
    fn metric_name(&self) -> Option<&str> {
        match self {
            LabelMatcher::Equal { name, value } if name == METRIC_NAME => Some(value),
            _ => None,
        }
    }
}

fn anchored(re: &str) -> Result<Regex> {
    Regex::new(&format!("^(?:{re})$")).map_err(|e| StorageError::InvalidMatcher(e.to_string()))
}

/// Read window and resolution ceiling of a select.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectHints {
    /// Inclusive start, milliseconds since the Unix epoch.
    pub start: i64,
    /// Inclusive end, milliseconds since the Unix epoch.
    pub end: i64,
    /// Maximum spacing between stored samples the caller accepts. Zero means
    /// raw data only.
    pub max_resolution_millis: i64,
}

impl SelectHints {
    pub fn new(start: i64, end: i64) -> Self {
        Self {
            start,
            end,
            max_resolution_millis: RESOLUTION_RAW,
        }
    }

    /// The whole retained history.
    pub fn all() -> Self {
        Self::new(i64::MIN, i64::MAX)
    }
}

/// Read access to stored series.
///
/// Implementations must honor `cancel` at every point where they may block
/// and fail with [`StorageError::Canceled`] once it fires.
#[async_trait]
pub trait Queryable: Send + Sync {
    /// Returns the series matching all `matchers` that have at least one
    /// sample inside the hinted window, sorted by label set. Only samples
    /// inside the window are returned.
    async fn select(
        &self,
        matchers: &[LabelMatcher],
        hints: &SelectHints,
        cancel: &CancellationToken,
    ) -> Result<Vec<Series>>;

    /// Sorted, duplicate-free label names of the series in the window.
    async fn label_names(
        &self,
        hints: &SelectHints,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>> {
        let series = self.select(&[], hints, cancel).await?;
        Ok(series
            .iter()
            .flat_map(|s| s.labels.iter().map(|l| l.name.clone()))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect())
    }

    /// Sorted, duplicate-free values of label `name` in the window.
    async fn label_values(
        &self,
        name: &str,
        hints: &SelectHints,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>> {
        let series = self.select(&[], hints, cancel).await?;
        Ok(series
            .iter()
            .filter_map(|s| s.labels.get(name))
            .map(str::to_owned)
            .sorted()
            .dedup()
            .collect())
    }
}

/// Collects series before they are loaded into a [`MemStorage`].
#[derive(Debug, Default)]
pub struct MemStorageBuilder {
    /// key — metric name; value — (resolution, series)
    metrics: BTreeMap<String, Vec<(i64, Series)>>,
}

impl MemStorageBuilder {
    /// Adds raw samples.
    pub fn add_series(self, series: Series) -> Result<Self> {
        self.add_downsampled(RESOLUTION_RAW, series)
    }

    /// Adds samples that were downsampled to `resolution_millis`.
    pub fn add_downsampled(mut self, resolution_millis: i64, series: Series) -> Result<Self> {
        if resolution_millis < 0 {
            return Err(StorageError::InvalidSeries(format!(
                "negative resolution {resolution_millis}ms"
            )));
        }
        let name = series
            .labels
            .metric_name()
            .ok_or_else(|| {
                StorageError::InvalidSeries(format!("{} has no metric name", series.labels))
            })?
            .to_owned();
        if let Some(label) = series.labels.iter().find(|l| is_reserved_field(&l.name)) {
            return Err(StorageError::InvalidSeries(format!(
                "{} uses reserved label name {:?}",
                series.labels, label.name
            )));
        }
        self.metrics
            .entry(name)
            .or_default()
            .push((resolution_millis, series));
        Ok(self)
    }

    /// Registers one in-memory table per metric name.
    pub fn build(self) -> Result<MemStorage> {
        let ctx = SessionContext::new();
        let mut tables = BTreeMap::new();
        for (idx, (metric_name, series)) in self.metrics.into_iter().enumerate() {
            let schema = Arc::new(create_schema(&series));
            let batch = create_record_batch(schema.clone(), &series)?;
            let provider = MemTable::try_new(schema, vec![vec![batch]])?;
            // Metric names may contain characters DataFusion would interpret
            // in a table reference.
            let table_name = format!("metric_{idx}");
            ctx.register_table(table_name.as_str(), Arc::new(provider))?;
            tracing::debug!(%metric_name, %table_name, series = series.len(), "registered table");
            tables.insert(metric_name, table_name);
        }
        Ok(MemStorage { ctx, tables })
    }
}

fn create_schema(data: &[(i64, Series)]) -> Schema {
    let label_names = data
        .iter()
        .flat_map(|(_, series)| series.labels.iter().map(|l| l.name.clone()))
        .collect::<BTreeSet<_>>();
    let mut fields = label_names
        .into_iter()
        .map(|name| Field::new(name, DataType::Utf8, true))
        .collect::<Vec<_>>();
    fields.push(Field::new(FIELD_HASH, DataType::Utf8, false));
    fields.push(Field::new(FIELD_RESOLUTION, DataType::Int64, false));
    fields.push(Field::new(FIELD_TIME, DataType::Int64, false));
    fields.push(Field::new(FIELD_VALUE, DataType::Float64, false));
    Schema::new(fields)
}

/// Column by its unqualified name, `col` would parse the name as a
/// qualified identifier.
fn column(name: &str) -> Expr {
    Expr::Column(Column::from_name(name))
}

fn is_reserved_field(name: &str) -> bool {
    name == FIELD_HASH || name == FIELD_RESOLUTION || name == FIELD_TIME || name == FIELD_VALUE
}

fn create_record_batch(schema: Arc<Schema>, data: &[(i64, Series)]) -> Result<RecordBatch> {
    let mut label_values = BTreeMap::<&str, Vec<Option<String>>>::new();
    let mut hash_values = Vec::new();
    let mut resolution_values = Vec::new();
    let mut time_values = Vec::new();
    let mut value_values = Vec::new();

    for (resolution, series) in data {
        let hash: String = series.labels.signature().into();
        for sample in &series.samples {
            for field in schema.fields() {
                let name = field.name().as_str();
                if is_reserved_field(name) {
                    continue;
                }
                label_values
                    .entry(name)
                    .or_default()
                    .push(series.labels.get(name).map(str::to_owned));
            }
            hash_values.push(hash.clone());
            resolution_values.push(*resolution);
            time_values.push(sample.timestamp);
            value_values.push(sample.value);
        }
    }

    let mut columns: Vec<ArrayRef> = Vec::new();
    for field in schema.fields() {
        let name = field.name().as_str();
        if is_reserved_field(name) {
            continue;
        }
        let values = label_values.remove(name).unwrap_or_default();
        columns.push(Arc::new(StringArray::from(values)));
    }
    columns.push(Arc::new(StringArray::from(hash_values)));
    columns.push(Arc::new(Int64Array::from(resolution_values)));
    columns.push(Arc::new(Int64Array::from(time_values)));
    columns.push(Arc::new(Float64Array::from(value_values)));

    Ok(RecordBatch::try_new(schema, columns)?)
}

/// Series held in DataFusion memory tables, one table per metric name.
///
/// Built once by [`MemStorageBuilder`]; reads share no mutable state.
pub struct MemStorage {
    ctx: SessionContext,
    /// key — metric name; value — DataFusion table name
    tables: BTreeMap<String, String>,
}

impl MemStorage {
    pub fn builder() -> MemStorageBuilder {
        MemStorageBuilder::default()
    }

    /// Names of all stored metrics.
    pub fn metric_names(&self) -> impl Iterator<Item = &str> {
        self.tables.keys().map(String::as_str)
    }

    /// Loads time series data of one metric from DataFusion.
    #[tracing::instrument(skip_all, fields(table = table_name))]
    async fn load_table(
        &self,
        table_name: &str,
        matchers: &[LabelMatcher],
        hints: &SelectHints,
    ) -> Result<Vec<Series>> {
        let table = self.ctx.table(table_name).await?;
        let df = table.filter(
            column(FIELD_TIME)
                .gt_eq(lit(hints.start))
                .and(column(FIELD_TIME).lt_eq(lit(hints.end)))
                .and(column(FIELD_RESOLUTION).lt_eq(lit(hints.max_resolution_millis))),
        )?;
        let batches = df.collect().await?;

        // key — series hash; value — (labels, (resolution, sample))
        let mut metrics = FxIndexMap::<String, (Labels, Vec<(i64, Sample)>)>::default();
        for batch in &batches {
            let hash_values = string_column(batch, FIELD_HASH)?;
            let resolution_values = int64_column(batch, FIELD_RESOLUTION)?;
            let time_values = int64_column(batch, FIELD_TIME)?;
            let value_values = batch
                .column_by_name(FIELD_VALUE)
                .and_then(|c| c.as_any().downcast_ref::<Float64Array>())
                .ok_or_else(|| missing_column(FIELD_VALUE))?;
            let schema = batch.schema();
            for i in 0..batch.num_rows() {
                let hash = hash_values.value(i);
                if !metrics.contains_key(hash) {
                    let labels = Labels::new(
                        schema
                            .fields()
                            .iter()
                            .zip(batch.columns())
                            .filter(|(field, _)| !is_reserved_field(field.name()))
                            .filter_map(|(field, column)| {
                                let values = column.as_any().downcast_ref::<StringArray>()?;
                                if values.is_null(i) {
                                    return None;
                                }
                                Some((field.name().to_owned(), values.value(i).to_owned()))
                            }),
                    );
                    metrics.insert(hash.to_owned(), (labels, Vec::new()));
                }
                if let Some((_, samples)) = metrics.get_mut(hash) {
                    samples.push((
                        resolution_values.value(i),
                        Sample::new(time_values.value(i), value_values.value(i)),
                    ));
                }
            }
        }

        Ok(metrics
            .into_values()
            .filter(|(labels, _)| matchers.iter().all(|m| m.matches(labels)))
            .map(|(labels, samples)| Series::new(labels, coarsest_tier(samples)))
            .collect())
    }
}

/// Keeps the samples of the coarsest resolution present, ordered by
/// timestamp with one sample per timestamp.
fn coarsest_tier(mut samples: Vec<(i64, Sample)>) -> Vec<Sample> {
    let resolution = samples.iter().map(|(r, _)| *r).max().unwrap_or(RESOLUTION_RAW);
    samples.retain(|(r, _)| *r == resolution);
    let mut samples = samples.into_iter().map(|(_, s)| s).collect::<Vec<_>>();
    samples.sort_by_key(|s| s.timestamp);
    samples.dedup_by_key(|s| s.timestamp);
    samples
}

fn missing_column(name: &str) -> StorageError {
    StorageError::DataFusion(DataFusionError::Internal(format!(
        "column {name} is missing or has an unexpected type"
    )))
}

fn string_column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a StringArray> {
    batch
        .column_by_name(name)
        .and_then(|c| c.as_any().downcast_ref::<StringArray>())
        .ok_or_else(|| missing_column(name))
}

fn int64_column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a Int64Array> {
    batch
        .column_by_name(name)
        .and_then(|c| c.as_any().downcast_ref::<Int64Array>())
        .ok_or_else(|| missing_column(name))
}

#[async_trait]
impl Queryable for MemStorage {
    async fn select(
        &self,
        matchers: &[LabelMatcher],
        hints: &SelectHints,
        cancel: &CancellationToken,
    ) -> Result<Vec<Series>> {
        if hints.start > hints.end {
            return Ok(Vec::new());
        }
        let pinned = matchers.iter().find_map(LabelMatcher::metric_name);
        let mut result = Vec::new();
        for (metric_name, table_name) in &self.tables {
            if pinned.map_or(false, |name| name != metric_name.as_str()) {
                continue;
            }
            if cancel.is_cancelled() {
                return Err(StorageError::Canceled);
            }
            let series = tokio::select! {
                _ = cancel.cancelled() => return Err(StorageError::Canceled),
                series = self.load_table(table_name, matchers, hints) => series?,
            };
            result.extend(series);
        }
        result.sort_by(|a, b| a.labels.cmp(&b.labels));
        Ok(result)
    }
}
