use promql_parser::parser::LabelModifier;

use crate::{engine::Result, value::Value};

pub fn count(timestamp: i64, modifier: &Option<LabelModifier>, data: &Value) -> Result<Value> {
    let score_values = match super::eval_arithmetic(modifier, data, "count", |_prev, _val| 0.0)? {
        Some(v) => v,
        None => return Ok(Value::None),
    };
    let values = score_values
        .into_values()
        .map(|x| x.into_instant_value(timestamp, |x| x.num as f64))
        .collect();
    Ok(Value::Vector(values))
}
