use crate::{
    engine::Result,
    value::{RangeValue, Value},
};

pub(crate) fn avg_over_time(data: &Value) -> Result<Value> {
    super::eval_range_fn(data, "avg_over_time", exec)
}

fn exec(data: &RangeValue) -> Option<f64> {
    if data.samples.is_empty() {
        return None;
    }
    Some(data.samples.iter().map(|s| s.value).sum::<f64>() / data.samples.len() as f64)
}
