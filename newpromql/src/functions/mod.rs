use strum::EnumString;

use crate::{
    engine::{EvalError, Result},
    value::{InstantValue, RangeValue, Sample, Value},
};

mod avg_over_time;
mod count_over_time;
mod delta;
mod idelta;
mod increase;
mod irate;
mod math;
mod max_over_time;
mod min_over_time;
mod rate;
mod sum_over_time;

pub(crate) use avg_over_time::avg_over_time;
pub(crate) use count_over_time::count_over_time;
pub(crate) use delta::delta;
pub(crate) use idelta::idelta;
pub(crate) use increase::increase;
pub(crate) use irate::irate;
pub(crate) use math::{math, round, scalar, vector};
pub(crate) use max_over_time::max_over_time;
pub(crate) use min_over_time::min_over_time;
pub(crate) use rate::rate;
pub(crate) use sum_over_time::sum_over_time;

/// The functions the engine evaluates.
///
/// Reference: https://prometheus.io/docs/prometheus/latest/querying/functions/
#[derive(Debug, Clone, Copy, PartialEq, EnumString)]
#[strum(serialize_all = "snake_case")]
pub(crate) enum Func {
    Abs,
    AvgOverTime,
    Ceil,
    CountOverTime,
    Delta,
    Exp,
    Floor,
    Idelta,
    Increase,
    Irate,
    Ln,
    Log10,
    Log2,
    MaxOverTime,
    MinOverTime,
    Rate,
    Round,
    Scalar,
    Sqrt,
    SumOverTime,
    Time,
    Vector,
}

/// Applies `exec` to every range of a matrix. The result is an instant vector
/// stamped with the end of each range, without metric names. Ranges for which
/// `exec` yields nothing are left out.
pub(crate) fn eval_range_fn(
    data: &Value,
    f_name: &str,
    exec: fn(&RangeValue) -> Option<f64>,
) -> Result<Value> {
    let data = match data {
        Value::Matrix(v) => v,
        Value::None => return Ok(Value::None),
        _ => {
            return Err(EvalError::InvalidExpression(format!(
                "{f_name}: range vector argument expected"
            )))
        }
    };

    let values = data
        .iter()
        .filter_map(|range| {
            let (_, end) = range.time_range?;
            let value = exec(range)?;
            Some(InstantValue {
                labels: range.labels.without_metric_name(),
                sample: Sample::new(end, value),
            })
        })
        .collect::<Vec<_>>();
    Ok(if values.is_empty() {
        Value::None
    } else {
        Value::Vector(values)
    })
}

/// Calculates the rate or increase of a range, extrapolated to the range
/// boundaries. Counter resets are corrected when `is_counter` is set.
///
/// See <https://promlabs.com/blog/2021/01/29/how-exactly-does-promql-calculate-rates/>
pub(crate) fn extrapolated_rate(range: &RangeValue, is_counter: bool, is_rate: bool) -> Option<f64> {
    let samples = &range.samples;
    if samples.len() < 2 {
        return None;
    }
    let (range_start, range_end) = range.time_range?;
    let first = samples.first()?;
    let last = samples.last()?;

    let mut result = last.value - first.value;
    if is_counter {
        // https://promlabs.com/blog/2021/01/29/how-exactly-does-promql-calculate-rates/#dealing-with-counter-resets
        let mut prev = first.value;
        for sample in &samples[1..] {
            if sample.value < prev {
                result += prev;
            }
            prev = sample.value;
        }
    }

    let sampled_interval = secs(last.timestamp - first.timestamp);
    let average_duration_between_samples = sampled_interval / (samples.len() - 1) as f64;
    let mut duration_to_start = secs(first.timestamp - range_start);
    let duration_to_end = secs(range_end - last.timestamp);

    if is_counter && result > 0.0 && first.value >= 0.0 {
        // counters don't go below zero
        let duration_to_zero = sampled_interval * (first.value / result);
        if duration_to_zero < duration_to_start {
            duration_to_start = duration_to_zero;
        }
    }

    // Extrapolate to the boundary when the gap is close to the average
    // sample spacing, otherwise only by half the spacing.
    let extrapolation_threshold = average_duration_between_samples * 1.1;
    let mut extrapolate_to_interval = sampled_interval;
    extrapolate_to_interval += if duration_to_start < extrapolation_threshold {
        duration_to_start
    } else {
        average_duration_between_samples / 2.0
    };
    extrapolate_to_interval += if duration_to_end < extrapolation_threshold {
        duration_to_end
    } else {
        average_duration_between_samples / 2.0
    };

    result *= extrapolate_to_interval / sampled_interval;
    if is_rate {
        result /= secs(range_end - range_start);
    }
    Some(result)
}

fn secs(millis: i64) -> f64 {
    millis as f64 / 1000.0
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;
    use crate::labels::Labels;

    fn range(samples: &[(i64, f64)], time_range: (i64, i64)) -> RangeValue {
        RangeValue {
            labels: Labels::new([("__name__", "requests_total"), ("job", "api")]),
            samples: samples.iter().map(|&(t, v)| Sample::new(t, v)).collect(),
            time_range: Some(time_range),
        }
    }

    #[test]
    fn test_func_from_str() {
        assert_eq!(Func::from_str("avg_over_time").unwrap(), Func::AvgOverTime);
        assert_eq!(Func::from_str("log10").unwrap(), Func::Log10);
        assert_eq!(Func::from_str("idelta").unwrap(), Func::Idelta);
        assert!(Func::from_str("histogram_quantile").is_err());
    }

    #[test]
    fn test_extrapolated_rate_aligned() {
        let r = range(&[(0, 0.0), (60_000, 60.0)], (0, 60_000));
        assert_eq!(extrapolated_rate(&r, true, false), Some(60.0));
        assert_eq!(extrapolated_rate(&r, true, true), Some(1.0));
    }

    #[test]
    fn test_extrapolated_rate_counter_reset() {
        // 10 -> 20, reset, 5 -> 15: increase of 10 + 15
        let r = range(
            &[(0, 10.0), (15_000, 20.0), (30_000, 5.0), (45_000, 15.0)],
            (0, 45_000),
        );
        assert_eq!(extrapolated_rate(&r, true, false), Some(25.0));
        // a gauge may go down
        assert_eq!(extrapolated_rate(&r, false, false), Some(5.0));
    }

    #[test]
    fn test_extrapolated_rate_needs_two_samples() {
        let r = range(&[(30_000, 1.0)], (0, 60_000));
        assert_eq!(extrapolated_rate(&r, true, true), None);
    }

    #[test]
    fn test_eval_range_fn_drops_metric_name() {
        let data = Value::Matrix(vec![range(&[(0, 1.0), (10_000, 3.0)], (0, 10_000))]);
        let Value::Vector(vs) = count_over_time(&data).unwrap() else {
            panic!("expected vector");
        };
        assert_eq!(vs.len(), 1);
        assert_eq!(vs[0].labels, Labels::new([("job", "api")]));
        assert_eq!(vs[0].sample, Sample::new(10_000, 2.0));

        assert!(matches!(rate(&Value::None).unwrap(), Value::None));
        assert!(rate(&Value::Float(1.0)).is_err());
    }
}
