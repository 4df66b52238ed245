use promql_parser::parser::LabelModifier;

use crate::{engine::Result, value::Value};

pub fn avg(timestamp: i64, modifier: &Option<LabelModifier>, data: &Value) -> Result<Value> {
    let score_values = match super::eval_arithmetic(modifier, data, "avg", |total, val| total + val)? {
        Some(v) => v,
        None => return Ok(Value::None),
    };
    let values = score_values
        .into_values()
        .map(|item| item.into_instant_value(timestamp, |item| item.value / item.num as f64))
        .collect();
    Ok(Value::Vector(values))
}
