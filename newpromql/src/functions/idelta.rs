use crate::{
    engine::Result,
    value::{RangeValue, Value},
};

pub(crate) fn idelta(data: &Value) -> Result<Value> {
    super::eval_range_fn(data, "idelta", exec)
}

fn exec(data: &RangeValue) -> Option<f64> {
    let (last, data) = data.samples.split_last()?;
    let previous = data.last()?;
    Some(last.value - previous.value)
}
