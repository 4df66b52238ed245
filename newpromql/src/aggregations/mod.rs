use promql_parser::parser::LabelModifier;
use rustc_hash::FxHashMap;

use crate::{
    engine::{EvalError, Result},
    labels::{self, Labels, METRIC_NAME},
    value::{InstantValue, Sample, Value},
};

mod avg;
mod count;
mod group;
mod max;
mod min;
mod sum;

pub(crate) use avg::avg;
pub(crate) use count::count;
pub(crate) use group::group;
pub(crate) use max::max;
pub(crate) use min::min;
pub(crate) use sum::sum;

#[derive(Debug, Clone, Default)]
pub(crate) struct ArithmeticItem {
    pub(crate) labels: Labels,
    pub(crate) value: f64,
    pub(crate) num: usize,
}

impl ArithmeticItem {
    pub(crate) fn into_instant_value(
        self,
        timestamp: i64,
        calculate_sample_value: fn(&Self) -> f64,
    ) -> InstantValue {
        let value = calculate_sample_value(&self);
        InstantValue {
            labels: self.labels,
            sample: Sample { timestamp, value },
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct TopItem {
    pub(crate) index: usize,
    pub(crate) value: f64,
}

/// The labels an element of `by`/`without` group is identified by.
fn group_labels(modifier: &Option<LabelModifier>, labels: &Labels) -> Labels {
    let mut labels = labels.clone();
    match modifier {
        Some(LabelModifier::Include(labels_to_include)) => {
            labels.retain(|label| labels_to_include.contains(&label.name));
        }
        Some(LabelModifier::Exclude(labels_to_exclude)) => {
            labels.retain(|label| {
                label.name != METRIC_NAME && !labels_to_exclude.contains(&label.name)
            });
        }
        None => return Labels::default(),
    }
    labels
}

/// Folds the values of every group with `f_handler`. The first value of a
/// group seeds the fold.
pub(crate) fn eval_arithmetic(
    modifier: &Option<LabelModifier>,
    data: &Value,
    f_name: &str,
    f_handler: fn(total: f64, val: f64) -> f64,
) -> Result<Option<FxHashMap<labels::Signature, ArithmeticItem>>> {
    let data = match data {
        Value::Vector(v) => v,
        Value::None => return Ok(None),
        _ => {
            return Err(EvalError::InvalidExpression(format!(
                "{f_name}: vector argument expected"
            )))
        }
    };

    let mut score_values = FxHashMap::<labels::Signature, ArithmeticItem>::default();
    for ival in data {
        let labels = group_labels(modifier, &ival.labels);
        let value = ival.sample.value;
        score_values
            .entry(labels.signature())
            .and_modify(|entry| {
                entry.value = f_handler(entry.value, value);
                entry.num += 1;
            })
            .or_insert(ArithmeticItem {
                labels,
                value,
                num: 1,
            });
    }
    Ok(Some(score_values))
}

/// Implements `topk` and `bottomk`: the `k` largest (smallest) elements of
/// every group, with their original labels. NaN values are never selected.
pub(crate) fn eval_top(
    k: f64,
    modifier: &Option<LabelModifier>,
    data: &Value,
    is_bottom: bool,
) -> Result<Value> {
    let fn_name = if is_bottom { "bottomk" } else { "topk" };
    if k.is_nan() || k < 1.0 {
        return Ok(Value::None);
    }
    let n = k as usize;

    let data = match data {
        Value::Vector(v) => v,
        Value::None => return Ok(Value::None),
        _ => {
            return Err(EvalError::InvalidExpression(format!(
                "{fn_name}: vector argument expected"
            )))
        }
    };

    let mut groups = FxHashMap::<labels::Signature, Vec<TopItem>>::default();
    for (index, ival) in data.iter().enumerate() {
        if ival.sample.value.is_nan() {
            continue;
        }
        groups
            .entry(group_labels(modifier, &ival.labels).signature())
            .or_default()
            .push(TopItem {
                index,
                value: ival.sample.value,
            });
    }

    let mut values = Vec::new();
    for mut score_values in groups.into_values() {
        if is_bottom {
            score_values.sort_by(|a, b| a.value.total_cmp(&b.value));
        } else {
            score_values.sort_by(|a, b| b.value.total_cmp(&a.value));
        }
        values.extend(
            score_values
                .iter()
                .take(n)
                .map(|v| data[v.index].clone()),
        );
    }
    Ok(if values.is_empty() {
        Value::None
    } else {
        Value::Vector(values)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input() -> Value {
        Value::Vector(
            [("a", "x", 1.0), ("b", "x", 5.0), ("c", "y", 3.0), ("d", "y", f64::NAN)]
                .into_iter()
                .map(|(instance, job, value)| InstantValue {
                    labels: Labels::new([("__name__", "m"), ("instance", instance), ("job", job)]),
                    sample: Sample::new(0, value),
                })
                .collect(),
        )
    }

    fn by_job() -> Option<LabelModifier> {
        Some(LabelModifier::Include(["job".to_owned()].into_iter().collect()))
    }

    fn sorted(v: Value) -> Vec<(String, f64)> {
        let Value::Vector(mut vs) = v else {
            panic!("expected vector");
        };
        vs.sort_by(|a, b| a.labels.cmp(&b.labels));
        vs.into_iter()
            .map(|v| (v.labels.to_string(), v.sample.value))
            .collect()
    }

    #[test]
    fn test_sum_without_grouping() {
        let v = sorted(sum(10, &None, &input()).unwrap());
        assert_eq!(v.len(), 1);
        assert_eq!(v[0].0, "{}");
        assert!(v[0].1.is_nan());
    }

    #[test]
    fn test_grouping() {
        assert_eq!(
            sorted(count(10, &by_job(), &input()).unwrap()),
            vec![(r#"{job="x"}"#.to_owned(), 2.0), (r#"{job="y"}"#.to_owned(), 2.0)]
        );
        assert_eq!(
            sorted(max(10, &by_job(), &input()).unwrap()),
            vec![(r#"{job="x"}"#.to_owned(), 5.0), (r#"{job="y"}"#.to_owned(), 3.0)]
        );
        assert_eq!(
            sorted(min(10, &by_job(), &input()).unwrap()),
            vec![(r#"{job="x"}"#.to_owned(), 1.0), (r#"{job="y"}"#.to_owned(), 3.0)]
        );
        let without = Some(LabelModifier::Exclude(
            ["instance".to_owned()].into_iter().collect(),
        ));
        assert_eq!(
            sorted(group(10, &without, &input()).unwrap()),
            vec![(r#"{job="x"}"#.to_owned(), 1.0), (r#"{job="y"}"#.to_owned(), 1.0)]
        );
    }

    #[test]
    fn test_avg() {
        assert_eq!(
            sorted(avg(10, &by_job(), &input()).unwrap())[0],
            (r#"{job="x"}"#.to_owned(), 3.0)
        );
    }

    #[test]
    fn test_top() {
        let top = sorted(eval_top(1.0, &by_job(), &input(), false).unwrap());
        assert_eq!(
            top,
            vec![
                (r#"{__name__="m", instance="b", job="x"}"#.to_owned(), 5.0),
                (r#"{__name__="m", instance="c", job="y"}"#.to_owned(), 3.0),
            ]
        );
        let bottom = sorted(eval_top(2.0, &None, &input(), true).unwrap());
        assert_eq!(bottom.len(), 2);
        assert_eq!(bottom[0].1, 1.0);
        assert_eq!(bottom[1].1, 3.0);
        assert!(matches!(eval_top(0.0, &None, &input(), false).unwrap(), Value::None));
    }
}
