use std::{
    str::FromStr,
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use async_recursion::async_recursion;
use promql_parser::parser::{
    token, AggregateExpr, BinaryExpr, Call, EvalStmt, Expr as PromExpr, Function, FunctionArgs,
    LabelModifier, MatrixSelector, NumberLiteral, ParenExpr, StringLiteral, TokenType, UnaryExpr,
    VectorSelector,
};
use rustc_hash::FxHashMap;
use tokio_util::sync::CancellationToken;

use crate::{
    aggregations,
    functions::{self, Func},
    labels::{Labels, METRIC_NAME},
    storage::{LabelMatcher, Queryable, SelectHints, Series, StorageError},
    value::*,
};

/// Default limit on the number of samples a single query may load.
pub const DEFAULT_MAX_SAMPLES: usize = 50_000_000;

const FIVE_MINUTES: i64 = 300_000;

#[derive(Debug, thiserror::Error)]
pub enum EvalError {
    #[error("query evaluation canceled")]
    Canceled,
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("invalid expression: {0}")]
    InvalidExpression(String),
    #[error("unsupported expression: {0}")]
    Unsupported(String),
    #[error("{0}")]
    Execution(String),
    #[error("query processing would load too many samples into memory")]
    TooManySamples,
}

pub type Result<T, E = EvalError> = std::result::Result<T, E>;

/// key — selector matchers and look-back window; value — time series data
type MetricsCache = FxHashMap<String, Arc<Vec<Series>>>;

pub struct QueryEngine {
    queryable: Arc<dyn Queryable>,
    cancel: CancellationToken,
    /// The time boundaries for the evaluation, in milliseconds. If start
    /// equals end an instant is evaluated.
    start: i64,
    end: i64,
    /// Time between two evaluated instants for the range [start:end].
    interval: i64,
    /// Default look back from sample search.
    lookback_delta: i64,
    /// The index of the current time window. Used when evaluating a [range query].
    ///
    /// [range query]: https://promlabs.com/blog/2020/06/18/the-anatomy-of-a-promql-query/#range-queries
    time_window_idx: i64,
    max_samples: usize,
    samples_loaded: usize,
    metrics_cache: MetricsCache,
}

impl QueryEngine {
    pub fn new(queryable: Arc<dyn Queryable>) -> Self {
        let now = millis_since_epoch(SystemTime::now());
        Self {
            queryable,
            cancel: CancellationToken::new(),
            start: now,
            end: now,
            interval: FIVE_MINUTES,
            lookback_delta: FIVE_MINUTES,
            time_window_idx: 0,
            max_samples: DEFAULT_MAX_SAMPLES,
            samples_loaded: 0,
            metrics_cache: Default::default(),
        }
    }

    /// Aborts evaluation with [`EvalError::Canceled`] once `cancel` fires.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_max_samples(mut self, max_samples: usize) -> Self {
        self.max_samples = max_samples;
        self
    }

    pub async fn exec(&mut self, stmt: EvalStmt) -> Result<QueryData> {
        self.start = millis_since_epoch(stmt.start);
        self.end = millis_since_epoch(stmt.end);
        if stmt.interval > Duration::ZERO {
            self.interval = millis(stmt.interval);
        }
        if stmt.lookback_delta > Duration::ZERO {
            self.lookback_delta = millis(stmt.lookback_delta);
        }
        self.time_window_idx = 0;
        self.samples_loaded = 0;
        self.metrics_cache.clear();

        if self.start == self.end {
            self.exec_instant(&stmt.expr).await
        } else {
            self.exec_range(&stmt.expr).await
        }
    }

    async fn exec_instant(&mut self, expr: &PromExpr) -> Result<QueryData> {
        let mut value = self.exec_expr(expr).await?;
        value.sort();
        Ok(match value {
            Value::Float(v) => QueryData::Scalar(Sample::new(self.end, v)),
            Value::Sample(v) => QueryData::Scalar(v),
            Value::String(v) => QueryData::String(StringValue {
                timestamp: self.end,
                value: v,
            }),
            Value::Instant(v) => QueryData::Vector(vec![v]),
            Value::Vector(v) => QueryData::Vector(v),
            Value::Range(v) => QueryData::Matrix(vec![v]),
            Value::Matrix(v) => QueryData::Matrix(v),
            Value::None => QueryData::Vector(Vec::new()),
        })
    }

    // See https://promlabs.com/blog/2020/06/18/the-anatomy-of-a-promql-query/#range-queries
    async fn exec_range(&mut self, expr: &PromExpr) -> Result<QueryData> {
        if self.interval <= 0 {
            return Err(EvalError::InvalidExpression(format!(
                "range query step must be at least 1ms, got {}ms",
                self.interval
            )));
        }
        let mut instant_vectors = Vec::new();
        let nr_steps = ((self.end - self.start) / self.interval) + 1;
        for i in 0..nr_steps {
            if self.cancel.is_cancelled() {
                return Err(EvalError::Canceled);
            }
            self.time_window_idx = i;
            let value = self.exec_expr(expr).await?;
            match value {
                Value::Instant(v) => instant_vectors.push((v.labels, v.sample)),
                Value::Vector(vs) => {
                    instant_vectors.extend(vs.into_iter().map(|v| (v.labels, v.sample)))
                }
                Value::Sample(v) => instant_vectors.push((Labels::default(), v)),
                Value::Float(v) => {
                    instant_vectors.push((Labels::default(), Sample::new(self.eval_time(), v)))
                }
                Value::None => continue,
                Value::Range(_) | Value::Matrix(_) | Value::String(_) => {
                    return Err(EvalError::InvalidExpression(format!(
                        "invalid expression type {:?} for range query, must be scalar or instant vector",
                        value.get_type()
                    )))
                }
            };
        }

        // merge data
        let mut merged_samples = FxHashMap::default();
        let mut merged_metrics = FxHashMap::default();
        for (labels, sample) in instant_vectors {
            let sig = labels.signature();
            merged_samples
                .entry(sig.clone())
                .or_insert_with(Vec::new)
                .push(sample);
            merged_metrics.entry(sig).or_insert(labels);
        }

        let mut merged_data = merged_samples
            .into_iter()
            .filter_map(|(sig, samples)| {
                Some(RangeValue {
                    labels: merged_metrics.remove(&sig)?,
                    samples,
                    time_range: None,
                })
            })
            .collect::<Vec<_>>();
        merged_data.sort_by(|a, b| a.labels.cmp(&b.labels));
        Ok(QueryData::Matrix(merged_data))
    }

    /// The instant currently being evaluated.
    fn eval_time(&self) -> i64 {
        self.start + (self.interval * self.time_window_idx)
    }

    #[async_recursion]
    pub async fn exec_expr(&mut self, prom_expr: &PromExpr) -> Result<Value> {
        Ok(match &prom_expr {
            PromExpr::Aggregate(AggregateExpr {
                op,
                expr,
                param,
                modifier,
                ..
            }) => self.aggregate_exprs(op, expr, param, modifier).await?,
            PromExpr::Unary(UnaryExpr { expr, .. }) => {
                let input = self.exec_expr(expr).await?;
                negate(input)?
            }
            PromExpr::Binary(BinaryExpr { op, lhs, rhs, .. }) => {
                let lhs = self.exec_expr(lhs).await?;
                let rhs = self.exec_expr(rhs).await?;
                binary_op(op, lhs, rhs)?
            }
            PromExpr::Paren(ParenExpr { expr }) => self.exec_expr(expr).await?,
            PromExpr::NumberLiteral(NumberLiteral { val }) => Value::Float(*val),
            PromExpr::StringLiteral(StringLiteral { val }) => Value::String(val.clone()),
            PromExpr::VectorSelector(v) => {
                let data = self.eval_vector_selector(v).await?;
                if data.is_empty() {
                    Value::None
                } else {
                    Value::Vector(data)
                }
            }
            PromExpr::MatrixSelector(MatrixSelector {
                vector_selector,
                range,
                ..
            }) => {
                let data = self.eval_matrix_selector(vector_selector, *range).await?;
                if data.is_empty() {
                    Value::None
                } else {
                    Value::Matrix(data)
                }
            }
            PromExpr::Call(Call { func, args }) => self.call_expr(func, args).await?,
            _ => {
                return Err(EvalError::Unsupported(format!(
                    "expression {prom_expr:?}"
                )))
            }
        })
    }

    async fn eval_vector_selector(
        &mut self,
        selector: &VectorSelector,
    ) -> Result<Vec<InstantValue>> {
        let metrics = self.selector_fetch(selector, None).await?;

        // https://promlabs.com/blog/2020/07/02/selecting-data-in-promql/#lookback-delta
        let end = self.eval_time();
        let start = end - self.lookback_delta;
        Ok(metrics
            .iter()
            .filter_map(|series| {
                let idx = series.samples.partition_point(|s| s.timestamp <= end);
                let sample = series.samples[..idx]
                    .last()
                    .filter(|s| s.timestamp > start)?;
                Some(InstantValue {
                    labels: series.labels.clone(),
                    sample: Sample::new(end, sample.value),
                })
            })
            .collect())
    }

    /// MatrixSelector is a special case of VectorSelector that returns a matrix of samples.
    async fn eval_matrix_selector(
        &mut self,
        selector: &VectorSelector,
        range: Duration,
    ) -> Result<Vec<RangeValue>> {
        let metrics = self.selector_fetch(selector, Some(range)).await?;

        let end = self.eval_time();
        let start = end - millis(range);
        Ok(metrics
            .iter()
            .filter_map(|series| {
                let lo = series.samples.partition_point(|s| s.timestamp <= start);
                let hi = series.samples.partition_point(|s| s.timestamp <= end);
                if lo >= hi {
                    return None;
                }
                Some(RangeValue {
                    labels: series.labels.clone(),
                    samples: series.samples[lo..hi].to_vec(),
                    time_range: Some((start, end)),
                })
            })
            .collect())
    }

    /// Loads time series data from `cache` if it exists, otherwise loads it
    /// from storage and caches.
    ///
    /// Data is loaded once for the whole evaluation window, every step then
    /// slices what it needs.
    async fn selector_fetch(
        &mut self,
        selector: &VectorSelector,
        range: Option<Duration>,
    ) -> Result<Arc<Vec<Series>>> {
        if selector.offset.is_some() || selector.at.is_some() {
            return Err(EvalError::Unsupported("offset and @ modifiers".to_string()));
        }
        let matchers = selector_matchers(selector)?;
        let lookback_delta = range.map_or(self.lookback_delta, millis);
        let key = format!("{matchers:?}[{lookback_delta}]");
        if let Some(metrics) = self.metrics_cache.get(&key) {
            return Ok(Arc::clone(metrics));
        }

        let hints = SelectHints::new(
            self.start.saturating_sub(lookback_delta).saturating_add(1),
            self.end,
        );
        let metrics = self
            .queryable
            .select(&matchers, &hints, &self.cancel)
            .await
            .map_err(|e| match e {
                StorageError::Canceled => EvalError::Canceled,
                e => EvalError::Storage(e),
            })?;

        self.samples_loaded += metrics.iter().map(|s| s.samples.len()).sum::<usize>();
        if self.samples_loaded > self.max_samples {
            return Err(EvalError::TooManySamples);
        }
        tracing::debug!(series = metrics.len(), samples = self.samples_loaded, "loaded metrics");

        let metrics = Arc::new(metrics);
        self.metrics_cache.insert(key, Arc::clone(&metrics));
        Ok(metrics)
    }

    async fn aggregate_exprs(
        &mut self,
        op: &TokenType,
        expr: &PromExpr,
        param: &Option<Box<PromExpr>>,
        modifier: &Option<LabelModifier>,
    ) -> Result<Value> {
        let sample_time = self.eval_time();
        let input = self.exec_expr(expr).await?;

        Ok(match op.id() {
            token::T_SUM => aggregations::sum(sample_time, modifier, &input)?,
            token::T_AVG => aggregations::avg(sample_time, modifier, &input)?,
            token::T_COUNT => aggregations::count(sample_time, modifier, &input)?,
            token::T_MIN => aggregations::min(sample_time, modifier, &input)?,
            token::T_MAX => aggregations::max(sample_time, modifier, &input)?,
            token::T_GROUP => aggregations::group(sample_time, modifier, &input)?,
            token::T_TOPK | token::T_BOTTOMK => {
                let is_bottom = op.id() == token::T_BOTTOMK;
                let param = param.as_ref().ok_or_else(|| {
                    EvalError::InvalidExpression(format!("{op:?}: parameter expected"))
                })?;
                let k = match self.exec_expr(param).await? {
                    Value::Float(v) => v,
                    _ => {
                        return Err(EvalError::InvalidExpression(format!(
                            "{op:?}: parameter must be a scalar"
                        )))
                    }
                };
                aggregations::eval_top(k, modifier, &input, is_bottom)?
            }
            _ => return Err(EvalError::Unsupported(format!("aggregation {op:?}"))),
        })
    }

    async fn call_expr(&mut self, func: &Function, args: &FunctionArgs) -> Result<Value> {
        let func_name = Func::from_str(func.name)
            .map_err(|_| EvalError::Unsupported(format!("function {}", func.name)))?;

        let sample_time = self.eval_time();
        let args = &args.args;
        if func_name == Func::Time {
            return Ok(Value::Float(sample_time as f64 / 1000.0));
        }
        let first_arg = args.first().ok_or_else(|| {
            EvalError::InvalidExpression(format!("{}: argument expected", func.name))
        })?;
        let input = self.exec_expr(first_arg).await?;

        Ok(match func_name {
            Func::Abs => functions::math(&input, "abs", f64::abs)?,
            Func::Ceil => functions::math(&input, "ceil", f64::ceil)?,
            Func::Exp => functions::math(&input, "exp", f64::exp)?,
            Func::Floor => functions::math(&input, "floor", f64::floor)?,
            Func::Ln => functions::math(&input, "ln", f64::ln)?,
            Func::Log10 => functions::math(&input, "log10", f64::log10)?,
            Func::Log2 => functions::math(&input, "log2", f64::log2)?,
            Func::Sqrt => functions::math(&input, "sqrt", f64::sqrt)?,
            Func::Round => {
                let to_nearest = match args.get(1) {
                    Some(arg) => match self.exec_expr(arg).await? {
                        Value::Float(v) => v,
                        _ => {
                            return Err(EvalError::InvalidExpression(
                                "round: to_nearest must be a scalar".to_owned(),
                            ))
                        }
                    },
                    None => 1.0,
                };
                functions::round(&input, to_nearest)?
            }
            Func::Scalar => functions::scalar(&input)?,
            Func::Vector => functions::vector(sample_time, &input)?,
            Func::Time => Value::Float(sample_time as f64 / 1000.0),
            Func::AvgOverTime => functions::avg_over_time(&input)?,
            Func::CountOverTime => functions::count_over_time(&input)?,
            Func::MaxOverTime => functions::max_over_time(&input)?,
            Func::MinOverTime => functions::min_over_time(&input)?,
            Func::SumOverTime => functions::sum_over_time(&input)?,
            Func::Delta => functions::delta(&input)?,
            Func::Idelta => functions::idelta(&input)?,
            Func::Increase => functions::increase(&input)?,
            Func::Irate => functions::irate(&input)?,
            Func::Rate => functions::rate(&input)?,
        })
    }
}

/// Turns a selector into storage matchers, pinning the metric name when the
/// selector carries one.
fn selector_matchers(selector: &VectorSelector) -> Result<Vec<LabelMatcher>> {
    let mut matchers = LabelMatcher::from_selector(selector)
        .map_err(|e| EvalError::InvalidExpression(e.to_string()))?;
    // the cache key is built from the matchers, keep it stable
    matchers.sort_by(|a, b| format!("{a:?}").cmp(&format!("{b:?}")));
    Ok(matchers)
}

fn negate(input: Value) -> Result<Value> {
    Ok(match input {
        Value::Float(v) => Value::Float(-v),
        Value::Vector(vs) => Value::Vector(
            vs.into_iter()
                .map(|v| InstantValue {
                    labels: v.labels.without_metric_name(),
                    sample: Sample::new(v.sample.timestamp, -v.sample.value),
                })
                .collect(),
        ),
        Value::None => Value::None,
        v => {
            return Err(EvalError::InvalidExpression(format!(
                "unary expression only allowed on expressions of type scalar or instant vector, got {:?}",
                v.get_type()
            )))
        }
    })
}

fn arithmetic_fn(op: &TokenType) -> Result<fn(f64, f64) -> f64> {
    let f: fn(f64, f64) -> f64 = match op.id() {
        token::T_ADD => |l, r| l + r,
        token::T_SUB => |l, r| l - r,
        token::T_MUL => |l, r| l * r,
        token::T_DIV => |l, r| l / r,
        token::T_MOD => |l, r| l % r,
        token::T_POW => f64::powf,
        _ => return Err(EvalError::Unsupported(format!("binary operator {op:?}"))),
    };
    Ok(f)
}

fn binary_op(op: &TokenType, lhs: Value, rhs: Value) -> Result<Value> {
    let f = arithmetic_fn(op)?;
    let apply = |vs: Vec<InstantValue>, scalar: f64, scalar_on_left: bool| {
        vs.into_iter()
            .map(|v| InstantValue {
                labels: v.labels.without_metric_name(),
                sample: Sample::new(
                    v.sample.timestamp,
                    if scalar_on_left {
                        f(scalar, v.sample.value)
                    } else {
                        f(v.sample.value, scalar)
                    },
                ),
            })
            .collect::<Vec<_>>()
    };
    Ok(match (lhs, rhs) {
        (Value::Float(l), Value::Float(r)) => Value::Float(f(l, r)),
        (Value::Vector(vs), Value::Float(r)) => Value::Vector(apply(vs, r, false)),
        (Value::Float(l), Value::Vector(vs)) => Value::Vector(apply(vs, l, true)),
        (Value::Vector(lhs), Value::Vector(rhs)) => {
            // one-to-one matching on all labels but the metric name
            let rhs = rhs
                .into_iter()
                .map(|v| (v.labels.signature_without_labels(&[METRIC_NAME]), v.sample))
                .collect::<FxHashMap<_, _>>();
            let values = lhs
                .into_iter()
                .filter_map(|v| {
                    let r = rhs.get(&v.labels.signature_without_labels(&[METRIC_NAME]))?;
                    Some(InstantValue {
                        labels: v.labels.without_metric_name(),
                        sample: Sample::new(v.sample.timestamp, f(v.sample.value, r.value)),
                    })
                })
                .collect::<Vec<_>>();
            if values.is_empty() {
                Value::None
            } else {
                Value::Vector(values)
            }
        }
        (Value::None, Value::Float(_) | Value::Vector(_) | Value::None)
        | (Value::Float(_) | Value::Vector(_), Value::None) => Value::None,
        (l, r) => {
            return Err(EvalError::InvalidExpression(format!(
                "binary expression must contain only scalar and instant vector types, got {:?} and {:?}",
                l.get_type(),
                r.get_type()
            )))
        }
    })
}

/// Converts `t` to the number of milliseconds elapsed since the beginning of
/// the Unix epoch. Instants before the epoch are negative.
pub fn millis_since_epoch(t: SystemTime) -> i64 {
    match t.duration_since(UNIX_EPOCH) {
        Ok(d) => millis(d),
        Err(e) => -millis(e.duration()),
    }
}

fn millis(t: Duration) -> i64 {
    t.as_millis().try_into().unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use promql_parser::parser;

    use super::*;
    use crate::storage::MemStorage;

    fn storage() -> Arc<MemStorage> {
        let mut builder = MemStorage::builder();
        for (labels, step) in [
            (vec![("__name__", "http_requests_total"), ("job", "api")], 1.0),
            (vec![("__name__", "http_requests_total"), ("job", "db")], 2.0),
            (vec![("__name__", "up"), ("job", "api")], 0.0),
            (vec![("__name__", "up"), ("job", "db")], 0.0),
        ] {
            let samples = (0..10)
                .map(|i| Sample::new(i * 60_000, if step == 0.0 { 1.0 } else { i as f64 * step }))
                .collect();
            builder = builder
                .add_series(Series::new(Labels::new(labels), samples))
                .unwrap();
        }
        Arc::new(builder.build().unwrap())
    }

    fn instant(query: &str, secs: u64) -> EvalStmt {
        let t = UNIX_EPOCH + Duration::from_secs(secs);
        EvalStmt {
            expr: parser::parse(query).unwrap(),
            start: t,
            end: t,
            interval: Duration::ZERO,
            lookback_delta: Duration::from_secs(300),
        }
    }

    fn range(query: &str, start: u64, end: u64, step: u64) -> EvalStmt {
        EvalStmt {
            expr: parser::parse(query).unwrap(),
            start: UNIX_EPOCH + Duration::from_secs(start),
            end: UNIX_EPOCH + Duration::from_secs(end),
            interval: Duration::from_secs(step),
            lookback_delta: Duration::from_secs(300),
        }
    }

    async fn exec(stmt: EvalStmt) -> Result<QueryData> {
        QueryEngine::new(storage()).exec(stmt).await
    }

    fn vector(data: QueryData) -> Vec<(String, f64)> {
        match data {
            QueryData::Vector(vs) => vs
                .into_iter()
                .map(|v| (v.labels.to_string(), v.sample.value))
                .collect(),
            other => panic!("expected vector, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_scalar_literal() {
        let stmt = EvalStmt {
            start: UNIX_EPOCH + Duration::from_millis(123_400),
            end: UNIX_EPOCH + Duration::from_millis(123_400),
            ..instant("2", 0)
        };
        assert_eq!(
            exec(stmt).await.unwrap(),
            QueryData::Scalar(Sample::new(123_400, 2.0))
        );
        assert_eq!(
            exec(instant("(1 + 2) * 3", 10)).await.unwrap(),
            QueryData::Scalar(Sample::new(10_000, 9.0))
        );
        assert_eq!(
            exec(instant("2 ^ 3 - 10 % 4", 10)).await.unwrap(),
            QueryData::Scalar(Sample::new(10_000, 6.0))
        );
    }

    #[tokio::test]
    async fn test_string_literal() {
        assert_eq!(
            exec(instant(r#""foo""#, 10)).await.unwrap(),
            QueryData::String(StringValue {
                timestamp: 10_000,
                value: "foo".to_owned()
            })
        );
    }

    #[tokio::test]
    async fn test_vector_selector() {
        let data = exec(instant("http_requests_total", 123)).await.unwrap();
        let QueryData::Vector(vs) = &data else {
            panic!("expected vector, got {data:?}");
        };
        assert_eq!(vs.len(), 2);
        // sample timestamps are the evaluation time
        assert!(vs.iter().all(|v| v.sample.timestamp == 123_000));
        assert_eq!(
            vector(data),
            vec![
                (r#"{__name__="http_requests_total", job="api"}"#.to_owned(), 2.0),
                (r#"{__name__="http_requests_total", job="db"}"#.to_owned(), 4.0),
            ]
        );

        assert_eq!(
            vector(exec(instant(r#"http_requests_total{job=~"d.*"}"#, 123)).await.unwrap()),
            vec![(r#"{__name__="http_requests_total", job="db"}"#.to_owned(), 4.0)]
        );
        assert_eq!(
            vector(exec(instant(r#"{__name__="up", job!="api"}"#, 123)).await.unwrap()),
            vec![(r#"{__name__="up", job="db"}"#.to_owned(), 1.0)]
        );
    }

    #[tokio::test]
    async fn test_vector_selector_lookback() {
        // last sample is at 540s, the default look-back is 5m
        assert_eq!(vector(exec(instant("up", 839)).await.unwrap()).len(), 2);
        assert!(vector(exec(instant("up", 840)).await.unwrap()).is_empty());
        assert!(vector(exec(instant("nonexistent", 100)).await.unwrap()).is_empty());
    }

    #[tokio::test]
    async fn test_matrix_selector() {
        let data = exec(instant(r#"http_requests_total{job="api"}[2m]"#, 240))
            .await
            .unwrap();
        let QueryData::Matrix(ms) = data else {
            panic!("expected matrix, got {data:?}");
        };
        assert_eq!(ms.len(), 1);
        // (120s, 240s]
        assert_eq!(
            ms[0].samples,
            vec![Sample::new(180_000, 3.0), Sample::new(240_000, 4.0)]
        );
    }

    #[tokio::test]
    async fn test_binary_operators() {
        assert_eq!(
            vector(exec(instant("http_requests_total * 2", 120)).await.unwrap()),
            vec![
                (r#"{job="api"}"#.to_owned(), 4.0),
                (r#"{job="db"}"#.to_owned(), 8.0),
            ]
        );
        assert_eq!(
            vector(exec(instant("http_requests_total / up", 120)).await.unwrap()),
            vec![
                (r#"{job="api"}"#.to_owned(), 2.0),
                (r#"{job="db"}"#.to_owned(), 4.0),
            ]
        );
        assert_eq!(
            vector(exec(instant("-up", 120)).await.unwrap()),
            vec![
                (r#"{job="api"}"#.to_owned(), -1.0),
                (r#"{job="db"}"#.to_owned(), -1.0),
            ]
        );
    }

    #[tokio::test]
    async fn test_aggregations() {
        assert_eq!(
            vector(exec(instant("sum(http_requests_total)", 120)).await.unwrap()),
            vec![("{}".to_owned(), 6.0)]
        );
        assert_eq!(
            vector(exec(instant("avg by (job) (http_requests_total)", 120)).await.unwrap()),
            vec![
                (r#"{job="api"}"#.to_owned(), 2.0),
                (r#"{job="db"}"#.to_owned(), 4.0),
            ]
        );
        assert_eq!(
            vector(
                exec(instant("count without (job) (http_requests_total)", 120))
                    .await
                    .unwrap()
            ),
            vec![("{}".to_owned(), 2.0)]
        );
        assert_eq!(
            vector(exec(instant("max(http_requests_total)", 120)).await.unwrap()),
            vec![("{}".to_owned(), 4.0)]
        );
        assert_eq!(
            vector(exec(instant("topk(1, http_requests_total)", 120)).await.unwrap()),
            vec![(r#"{__name__="http_requests_total", job="db"}"#.to_owned(), 4.0)]
        );
        assert_eq!(
            vector(exec(instant("bottomk(1, http_requests_total)", 120)).await.unwrap()),
            vec![(r#"{__name__="http_requests_total", job="api"}"#.to_owned(), 2.0)]
        );
    }

    #[tokio::test]
    async fn test_range_functions() {
        // http_requests_total{job="db"} grows by 2 every minute
        assert_eq!(
            vector(
                exec(instant(r#"rate(http_requests_total{job="db"}[5m])"#, 300))
                    .await
                    .unwrap()
            ),
            vec![(r#"{job="db"}"#.to_owned(), 2.0 / 60.0)]
        );
        assert_eq!(
            vector(
                exec(instant(r#"irate(http_requests_total{job="db"}[5m])"#, 300))
                    .await
                    .unwrap()
            ),
            vec![(r#"{job="db"}"#.to_owned(), 2.0 / 60.0)]
        );
        assert_eq!(
            vector(
                exec(instant(r#"sum_over_time(http_requests_total{job="api"}[3m])"#, 300))
                    .await
                    .unwrap()
            ),
            vec![(r#"{job="api"}"#.to_owned(), 3.0 + 4.0 + 5.0)]
        );
        assert_eq!(
            vector(
                exec(instant(r#"count_over_time(up{job="api"}[10m])"#, 600))
                    .await
                    .unwrap()
            ),
            vec![(r#"{job="api"}"#.to_owned(), 9.0)]
        );
    }

    #[tokio::test]
    async fn test_range_query() {
        let data = exec(range("time()", 0, 2, 1)).await.unwrap();
        assert_eq!(
            data,
            QueryData::Matrix(vec![RangeValue {
                labels: Labels::default(),
                samples: vec![
                    Sample::new(0, 0.0),
                    Sample::new(1_000, 1.0),
                    Sample::new(2_000, 2.0)
                ],
                time_range: None,
            }])
        );

        let data = exec(range("up", 0, 120, 60)).await.unwrap();
        let QueryData::Matrix(ms) = data else {
            panic!("expected matrix, got {data:?}");
        };
        assert_eq!(ms.len(), 2);
        assert!(ms.iter().all(|m| m.samples.len() == 3));
    }

    #[tokio::test]
    async fn test_range_query_rejects_matrix() {
        let err = exec(range("up[5m]", 0, 120, 60)).await.unwrap_err();
        assert!(matches!(err, EvalError::InvalidExpression(_)), "{err}");
    }

    #[tokio::test]
    async fn test_unsupported() {
        let err = exec(instant("up > 0", 60)).await.unwrap_err();
        assert!(matches!(err, EvalError::Unsupported(_)), "{err}");
        let err = exec(instant("label_replace(up, \"a\", \"b\", \"c\", \"d\")", 60))
            .await
            .unwrap_err();
        assert!(matches!(err, EvalError::Unsupported(_)), "{err}");
    }

    #[tokio::test]
    async fn test_selector_modifiers_unsupported() {
        for query in ["up offset 5m", "up @ 100", "rate(up[5m] offset 1m)"] {
            let err = exec(instant(query, 600)).await.unwrap_err();
            assert!(matches!(err, EvalError::Unsupported(_)), "{query}: {err}");
        }
    }

    #[tokio::test]
    async fn test_range_query_sub_millisecond_step() {
        let stmt = EvalStmt {
            interval: Duration::from_micros(500),
            ..range("up", 0, 120, 60)
        };
        let err = exec(stmt).await.unwrap_err();
        assert!(matches!(err, EvalError::InvalidExpression(_)), "{err}");
    }

    #[tokio::test]
    async fn test_too_many_samples() {
        let err = QueryEngine::new(storage())
            .with_max_samples(5)
            .exec(instant("up", 600))
            .await
            .unwrap_err();
        assert!(matches!(err, EvalError::TooManySamples));
    }

    #[tokio::test]
    async fn test_canceled() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = QueryEngine::new(storage())
            .with_cancellation(cancel)
            .exec(instant("up", 600))
            .await
            .unwrap_err();
        assert!(matches!(err, EvalError::Canceled));
    }

    #[test]
    fn test_millis_since_epoch() {
        assert_eq!(millis_since_epoch(UNIX_EPOCH), 0);
        assert_eq!(
            millis_since_epoch(UNIX_EPOCH + Duration::from_millis(123_400)),
            123_400
        );
        assert_eq!(
            millis_since_epoch(UNIX_EPOCH - Duration::from_secs(2)),
            -2_000
        );
    }
}
