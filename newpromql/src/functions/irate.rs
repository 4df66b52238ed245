use crate::{
    engine::Result,
    value::{RangeValue, Value},
};

pub(crate) fn irate(data: &Value) -> Result<Value> {
    super::eval_range_fn(data, "irate", exec)
}

fn exec(data: &RangeValue) -> Option<f64> {
    let (last, data) = data.samples.split_last()?;
    let before_last = data.last()?;
    let dt_seconds = (last.timestamp - before_last.timestamp) as f64 / 1000.0;
    if dt_seconds == 0.0 {
        return None;
    }
    let dv = if last.value < before_last.value {
        // counter reset
        last.value
    } else {
        last.value - before_last.value
    };
    Some(dv / dt_seconds)
}
