use crate::{
    engine::Result,
    value::{RangeValue, Value},
};

pub(crate) fn min_over_time(data: &Value) -> Result<Value> {
    super::eval_range_fn(data, "min_over_time", exec)
}

fn exec(data: &RangeValue) -> Option<f64> {
    data.samples
        .iter()
        .map(|s| s.value)
        .reduce(|min, v| if v < min || min.is_nan() { v } else { min })
}
