use crate::{
    engine::Result,
    value::{RangeValue, Value},
};

pub(crate) fn rate(data: &Value) -> Result<Value> {
    super::eval_range_fn(data, "rate", exec)
}

fn exec(data: &RangeValue) -> Option<f64> {
    super::extrapolated_rate(data, true, true)
}
