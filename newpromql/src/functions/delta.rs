use crate::{
    engine::Result,
    value::{RangeValue, Value},
};

pub(crate) fn delta(data: &Value) -> Result<Value> {
    super::eval_range_fn(data, "delta", exec)
}

fn exec(range: &RangeValue) -> Option<f64> {
    super::extrapolated_rate(range, false, false)
}
