use crate::{
    engine::Result,
    value::{RangeValue, Value},
};

pub(crate) fn count_over_time(data: &Value) -> Result<Value> {
    super::eval_range_fn(data, "count_over_time", exec)
}

fn exec(data: &RangeValue) -> Option<f64> {
    (!data.samples.is_empty()).then_some(data.samples.len() as f64)
}
