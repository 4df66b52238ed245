use crate::{
    engine::{EvalError, Result},
    labels::Labels,
    value::{InstantValue, Sample, Value},
};

/// Applies `f` to every sample value of an instant vector.
pub(crate) fn math(data: &Value, f_name: &str, f: fn(f64) -> f64) -> Result<Value> {
    let data = match data {
        Value::Vector(v) => v,
        Value::None => return Ok(Value::None),
        _ => {
            return Err(EvalError::InvalidExpression(format!(
                "{f_name}: instant vector argument expected"
            )))
        }
    };
    Ok(Value::Vector(
        data.iter()
            .map(|v| InstantValue {
                labels: v.labels.without_metric_name(),
                sample: Sample::new(v.sample.timestamp, f(v.sample.value)),
            })
            .collect(),
    ))
}

/// Rounds to the nearest multiple of `to_nearest`, ties up.
pub(crate) fn round(data: &Value, to_nearest: f64) -> Result<Value> {
    let data = match data {
        Value::Vector(v) => v,
        Value::None => return Ok(Value::None),
        _ => {
            return Err(EvalError::InvalidExpression(
                "round: instant vector argument expected".to_owned(),
            ))
        }
    };
    // dividing by the inverse is more precise for fractional `to_nearest`
    let inverse = 1.0 / to_nearest;
    Ok(Value::Vector(
        data.iter()
            .map(|v| InstantValue {
                labels: v.labels.without_metric_name(),
                sample: Sample::new(
                    v.sample.timestamp,
                    (v.sample.value * inverse + 0.5).floor() / inverse,
                ),
            })
            .collect(),
    ))
}

/// The value of a single-element vector as a scalar, NaN otherwise.
pub(crate) fn scalar(data: &Value) -> Result<Value> {
    Ok(match data {
        Value::Vector(v) if v.len() == 1 => Value::Float(v[0].sample.value),
        Value::Vector(_) | Value::None => Value::Float(f64::NAN),
        _ => {
            return Err(EvalError::InvalidExpression(
                "scalar: instant vector argument expected".to_owned(),
            ))
        }
    })
}

/// A scalar as a vector with one element and no labels.
pub(crate) fn vector(timestamp: i64, data: &Value) -> Result<Value> {
    match data {
        Value::Float(v) => Ok(Value::Vector(vec![InstantValue {
            labels: Labels::default(),
            sample: Sample::new(timestamp, *v),
        }])),
        _ => Err(EvalError::InvalidExpression(
            "vector: scalar argument expected".to_owned(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(values: &[f64]) -> Value {
        Value::Vector(
            values
                .iter()
                .enumerate()
                .map(|(i, &v)| {
                    let i = i.to_string();
                    InstantValue {
                        labels: Labels::new([("__name__", "m"), ("i", i.as_str())]),
                        sample: Sample::new(1_000, v),
                    }
                })
                .collect(),
        )
    }

    fn values(v: Value) -> Vec<f64> {
        match v {
            Value::Vector(vs) => vs.into_iter().map(|v| v.sample.value).collect(),
            _ => panic!("expected vector"),
        }
    }

    #[test]
    fn test_math() {
        assert_eq!(values(math(&input(&[-1.5, 2.0]), "abs", f64::abs).unwrap()), vec![1.5, 2.0]);
        assert_eq!(values(math(&input(&[-1.5, 2.2]), "ceil", f64::ceil).unwrap()), vec![-1.0, 3.0]);
        let Value::Vector(vs) = math(&input(&[4.0]), "sqrt", f64::sqrt).unwrap() else {
            panic!("expected vector");
        };
        assert_eq!(vs[0].labels, Labels::new([("i", "0")]));
        assert_eq!(vs[0].sample.value, 2.0);
    }

    #[test]
    fn test_round() {
        assert_eq!(
            values(round(&input(&[1.5, 2.4, -1.5]), 1.0).unwrap()),
            vec![2.0, 2.0, -1.0]
        );
        assert_eq!(values(round(&input(&[12.0, 17.0]), 5.0).unwrap()), vec![10.0, 15.0]);
    }

    #[test]
    fn test_scalar_and_vector() {
        assert!(matches!(scalar(&input(&[3.0])).unwrap(), Value::Float(v) if v == 3.0));
        assert!(matches!(scalar(&input(&[1.0, 2.0])).unwrap(), Value::Float(v) if v.is_nan()));
        assert!(matches!(scalar(&Value::None).unwrap(), Value::Float(v) if v.is_nan()));

        let Value::Vector(vs) = vector(5_000, &Value::Float(7.0)).unwrap() else {
            panic!("expected vector");
        };
        assert_eq!(vs.len(), 1);
        assert!(vs[0].labels.is_empty());
        assert_eq!(vs[0].sample, Sample::new(5_000, 7.0));
    }
}
