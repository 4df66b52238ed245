use crate::{
    engine::Result,
    value::{RangeValue, Value},
};

pub(crate) fn max_over_time(data: &Value) -> Result<Value> {
    super::eval_range_fn(data, "max_over_time", exec)
}

fn exec(data: &RangeValue) -> Option<f64> {
    data.samples
        .iter()
        .map(|s| s.value)
        .reduce(|max, v| if v > max || max.is_nan() { v } else { max })
}
