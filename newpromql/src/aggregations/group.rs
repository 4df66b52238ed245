use promql_parser::parser::LabelModifier;

use crate::{engine::Result, value::Value};

pub fn group(timestamp: i64, modifier: &Option<LabelModifier>, data: &Value) -> Result<Value> {
    let score_values = match super::eval_arithmetic(modifier, data, "group", |_prev, _val| 1.0)? {
        Some(v) => v,
        None => return Ok(Value::None),
    };
    let values = score_values
        .into_values()
        .map(|x| x.into_instant_value(timestamp, |_| 1.0))
        .collect();
    Ok(Value::Vector(values))
}
