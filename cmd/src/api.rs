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

//! Endpoint handlers: validate parameters, scope the storage for the request
//! and run the engine or a series lookup.

use std::{sync::Arc, time::SystemTime};

use itertools::Itertools;
use newpromql::{
    value::RangeValue,
    EvalError, LabelMatcher, Labels, QueryData, QueryEngine, Queryable, SelectHints, StorageError,
};
use promql_parser::parser::{self, EvalStmt, Expr};
use time::{Duration, OffsetDateTime};
use tokio_util::sync::CancellationToken;

use crate::{
    clock::Clock,
    config::ApiConfig,
    dedup::build_dedup_view,
    params::{self, parse_bool, parse_duration, parse_time, ParseError, Params},
    response::ApiError,
};

pub type Result<T, E = ApiError> = std::result::Result<T, E>;

impl From<ParseError> for ApiError {
    fn from(e: ParseError) -> Self {
        ApiError::bad_data(e.to_string())
    }
}

impl From<EvalError> for ApiError {
    fn from(e: EvalError) -> Self {
        match e {
            EvalError::Canceled | EvalError::Storage(StorageError::Canceled) => {
                ApiError::canceled(e.to_string())
            }
            EvalError::Storage(StorageError::Unavailable(_)) => ApiError::unavailable(e.to_string()),
            EvalError::Storage(StorageError::InvalidMatcher(_)) | EvalError::InvalidExpression(_) => {
                ApiError::bad_data(e.to_string())
            }
            EvalError::Storage(_) => ApiError::internal(e.to_string()),
            EvalError::Unsupported(_) | EvalError::Execution(_) | EvalError::TooManySamples => {
                ApiError::execution(e.to_string())
            }
        }
    }
}

impl From<StorageError> for ApiError {
    fn from(e: StorageError) -> Self {
        EvalError::Storage(e).into()
    }
}

/// Per-request settings derived from the shared [`ApiConfig`].
#[derive(Debug, Clone)]
struct RequestScope {
    replica_labels: Vec<String>,
    max_resolution_millis: i64,
}

pub struct Api {
    config: ApiConfig,
    storage: Arc<dyn Queryable>,
    clock: Arc<dyn Clock>,
}

impl Api {
    pub fn new(config: ApiConfig, storage: Arc<dyn Queryable>, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            storage,
            clock,
        }
    }

    /// `/query`: evaluates an expression at one instant.
    pub async fn query(&self, params: &Params, cancel: &CancellationToken) -> Result<QueryData> {
        let time = match params.get_non_empty("time") {
            Some(t) => parse_time(t)?,
            None => self.clock.now(),
        };
        let timeout = self.evaluation_timeout(params)?;
        let scope = RequestScope {
            replica_labels: self.replica_labels(params)?,
            max_resolution_millis: params::resolve_max_source_resolution_millis(
                params.get("max_source_resolution"),
                Duration::ZERO,
                self.config.auto_downsampling,
                self.config.auto_downsampling_divisor,
            )?,
        };
        let expr = parse_expr(params)?;
        self.evaluate(expr, time, time, Duration::ZERO, scope, timeout, cancel)
            .await
    }

    /// `/query_range`: evaluates an expression at every step of a window.
    pub async fn query_range(
        &self,
        params: &Params,
        cancel: &CancellationToken,
    ) -> Result<QueryData> {
        let start = parse_time(required(params, "start")?)?;
        let end = parse_time(required(params, "end")?)?;
        if end < start {
            return Err(ApiError::bad_data(
                "end timestamp must not be before start time",
            ));
        }
        let step = parse_duration(required(params, "step")?)?;
        if step <= Duration::ZERO {
            return Err(ApiError::bad_data(
                "zero or negative query resolution step widths are not accepted. Try a positive integer",
            ));
        }
        if step < Duration::MILLISECOND {
            return Err(ApiError::bad_data(
                "query resolution step must be at least 1ms",
            ));
        }
        // the number of points is bounded per series
        let points = (end - start).whole_milliseconds() / step.whole_milliseconds();
        if points > i128::from(self.config.max_points_per_series) {
            return Err(ApiError::bad_data(format!(
                "exceeded maximum resolution of {} points per timeseries. Try decreasing the query resolution (?step=XX)",
                self.config.max_points_per_series
            )));
        }
        let timeout = self.evaluation_timeout(params)?;
        let scope = RequestScope {
            replica_labels: self.replica_labels(params)?,
            max_resolution_millis: params::resolve_max_source_resolution_millis(
                params.get("max_source_resolution"),
                step,
                self.config.auto_downsampling,
                self.config.auto_downsampling_divisor,
            )?,
        };
        let expr = parse_expr(params)?;
        let data = self
            .evaluate(expr, start, end, step, scope, timeout, cancel)
            .await?;
        // a single step is evaluated as an instant, the answer is still a matrix
        Ok(match data {
            QueryData::Vector(vs) => QueryData::Matrix(
                vs.into_iter()
                    .map(|v| RangeValue {
                        labels: v.labels,
                        samples: vec![v.sample],
                        time_range: None,
                    })
                    .collect(),
            ),
            QueryData::Scalar(sample) => QueryData::Matrix(vec![RangeValue {
                labels: Labels::default(),
                samples: vec![sample],
                time_range: None,
            }]),
            QueryData::String(_) => {
                return Err(ApiError::bad_data(
                    "invalid expression type \"string\" for range query, must be scalar or instant vector",
                ))
            }
            data => data,
        })
    }

    /// `/series`: label sets of the series matching any `match[]` selector.
    pub async fn series(&self, params: &Params, cancel: &CancellationToken) -> Result<Vec<Labels>> {
        let selectors = params.get_all("match[]");
        if selectors.is_empty() {
            return Err(ApiError::bad_data("no match[] parameter provided"));
        }
        let matcher_sets = selectors
            .into_iter()
            .map(parse_selector)
            .collect::<Result<Vec<_>>>()?;
        let hints = window(params)?;
        let view = self.scoped_view(self.metadata_scope(params)?);

        let mut result = Vec::new();
        for matchers in &matcher_sets {
            let series = view.select(matchers, &hints, cancel).await?;
            result.extend(series.into_iter().map(|s| s.labels));
        }
        Ok(result.into_iter().sorted().dedup().collect())
    }

    /// `/labels`: every label name in the window.
    pub async fn label_names(
        &self,
        params: &Params,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>> {
        let hints = window(params)?;
        let view = self.scoped_view(self.metadata_scope(params)?);
        Ok(view.label_names(&hints, cancel).await?)
    }

    /// `/labels/:name/values`: every value of label `name` in the window.
    pub async fn label_values(
        &self,
        name: &str,
        params: &Params,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>> {
        if !params::is_valid_label_name(name) {
            return Err(ApiError::bad_data(format!("invalid label name: {name:?}")));
        }
        let hints = window(params)?;
        let view = self.scoped_view(self.metadata_scope(params)?);
        Ok(view.label_values(name, &hints, cancel).await?)
    }

    /// Replica labels in effect for the request: none when deduplication is
    /// off, `replicaLabels[]` when given, the configured ones otherwise.
    fn replica_labels(&self, params: &Params) -> Result<Vec<String>> {
        let dedup = match params.get_non_empty("dedup") {
            Some(s) => parse_bool(s)?,
            None => self.config.dedup_by_default,
        };
        if !dedup {
            return Ok(Vec::new());
        }
        let overrides = params
            .get_all("replicaLabels[]")
            .into_iter()
            .filter(|s| !s.is_empty())
            .map(str::to_owned)
            .collect::<Vec<_>>();
        if overrides.is_empty() {
            Ok(self.config.replica_labels.clone())
        } else {
            Ok(overrides)
        }
    }

    /// Scope of the metadata endpoints, which may read any resolution.
    fn metadata_scope(&self, params: &Params) -> Result<RequestScope> {
        Ok(RequestScope {
            replica_labels: self.replica_labels(params)?,
            max_resolution_millis: i64::MAX,
        })
    }

    /// The configured timeout, lowered by a `timeout` parameter.
    fn evaluation_timeout(&self, params: &Params) -> Result<Duration> {
        Ok(match params.get_non_empty("timeout") {
            Some(s) => parse_duration(s)?.min(self.config.query_timeout),
            None => self.config.query_timeout,
        })
    }

    fn scoped_view(&self, scope: RequestScope) -> Arc<dyn Queryable> {
        build_dedup_view(
            self.storage.clone(),
            scope.replica_labels,
            scope.max_resolution_millis,
        )
    }

    #[allow(clippy::too_many_arguments)]
    async fn evaluate(
        &self,
        expr: Expr,
        start: OffsetDateTime,
        end: OffsetDateTime,
        step: Duration,
        scope: RequestScope,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<QueryData> {
        let start_time = std::time::Instant::now();
        tracing::debug!(
            replica_labels = ?scope.replica_labels,
            max_resolution_millis = scope.max_resolution_millis,
            "evaluating query"
        );
        let eval_stmt = EvalStmt {
            expr,
            start: SystemTime::from(start),
            end: SystemTime::from(end),
            interval: to_std(step)?,
            lookback_delta: to_std(self.config.lookback_delta)?,
        };
        let cancel = cancel.child_token();
        let mut engine = QueryEngine::new(self.scoped_view(scope))
            .with_cancellation(cancel.clone())
            .with_max_samples(self.config.max_samples);
        tracing::info!("prepare time: {:?}", start_time.elapsed());

        let result = tokio::time::timeout(to_std(timeout)?, engine.exec(eval_stmt)).await;
        tracing::info!("execute time: {:?}", start_time.elapsed());
        match result {
            Ok(data) => data.map_err(ApiError::from),
            Err(_) => {
                cancel.cancel();
                Err(ApiError::timeout(format!(
                    "query timed out in expression evaluation after {timeout}"
                )))
            }
        }
    }
}

fn required<'a>(params: &'a Params, name: &str) -> Result<&'a str> {
    params
        .get_non_empty(name)
        .ok_or_else(|| ApiError::bad_data(format!("missing parameter {name:?}")))
}

fn parse_expr(params: &Params) -> Result<Expr> {
    let query = required(params, "query")?;
    parser::parse(query).map_err(|e| ApiError::bad_data(e.to_string()))
}

/// Matchers of one `match[]` value, which must be a plain vector selector.
fn parse_selector(s: &str) -> Result<Vec<LabelMatcher>> {
    match parser::parse(s) {
        Ok(Expr::VectorSelector(selector)) => {
            LabelMatcher::from_selector(&selector).map_err(|e| ApiError::bad_data(e.to_string()))
        }
        Ok(_) => Err(ApiError::bad_data(format!(
            "invalid parameter \"match[]\": {s:?} is not a series selector"
        ))),
        Err(e) => Err(ApiError::bad_data(format!(
            "invalid parameter \"match[]\": {e}"
        ))),
    }
}

/// The `start`/`end` window of metadata endpoints, unbounded by default.
fn window(params: &Params) -> Result<SelectHints> {
    let start = match params.get_non_empty("start") {
        Some(s) => params::millis(parse_time(s)?),
        None => SelectHints::all().start,
    };
    let end = match params.get_non_empty("end") {
        Some(s) => params::millis(parse_time(s)?),
        None => SelectHints::all().end,
    };
    Ok(SelectHints::new(start, end))
}

fn to_std(d: Duration) -> Result<std::time::Duration> {
    std::time::Duration::try_from(d)
        .map_err(|_| ApiError::bad_data(format!("duration {d} must not be negative")))
}
