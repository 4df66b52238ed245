use crate::{
    engine::Result,
    value::{RangeValue, Value},
};

pub(crate) fn increase(data: &Value) -> Result<Value> {
    super::eval_range_fn(data, "increase", exec)
}

fn exec(data: &RangeValue) -> Option<f64> {
    super::extrapolated_rate(data, true, false)
}
