use promql_parser::parser::LabelModifier;

use crate::{engine::Result, value::Value};

pub fn min(timestamp: i64, modifier: &Option<LabelModifier>, data: &Value) -> Result<Value> {
    let score_values = match super::eval_arithmetic(modifier, data, "min", |prev, val| {
        if val < prev || prev.is_nan() {
            val
        } else {
            prev
        }
    })? {
        Some(v) => v,
        None => return Ok(Value::None),
    };
    let values = score_values
        .into_values()
        .map(|x| x.into_instant_value(timestamp, |x| x.value))
        .collect();
    Ok(Value::Vector(values))
}
