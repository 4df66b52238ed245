use serde::{
    de::{Deserialize, Deserializer, Error as _},
    ser::{SerializeSeq, Serializer},
    Serialize,
};

use crate::labels::Labels;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    /// Time in milliseconds since the Unix epoch
    pub timestamp: i64,
    pub value: f64,
}

impl Sample {
    pub fn new(timestamp: i64, value: f64) -> Self {
        Self { timestamp, value }
    }
}

/// Formats a sample value the way the Prometheus HTTP API does.
pub fn format_value(value: f64) -> String {
    if value.is_nan() {
        "NaN".to_owned()
    } else if value == f64::INFINITY {
        "+Inf".to_owned()
    } else if value == f64::NEG_INFINITY {
        "-Inf".to_owned()
    } else {
        value.to_string()
    }
}

/// Inverse of [`format_value`].
pub fn parse_value(s: &str) -> Result<f64, std::num::ParseFloatError> {
    match s {
        "NaN" => Ok(f64::NAN),
        "+Inf" | "Inf" => Ok(f64::INFINITY),
        "-Inf" => Ok(f64::NEG_INFINITY),
        _ => s.parse(),
    }
}

impl Serialize for Sample {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut seq = serializer.serialize_seq(Some(2))?;
        seq.serialize_element(&(self.timestamp as f64 / 1000.0))?;
        seq.serialize_element(&format_value(self.value))?;
        seq.end()
    }
}

impl<'de> Deserialize<'de> for Sample {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let (secs, value) = <(f64, String)>::deserialize(deserializer)?;
        Ok(Sample {
            timestamp: (secs * 1000.0).round() as i64,
            value: parse_value(&value).map_err(D::Error::custom)?,
        })
    }
}

/// A string evaluated at a point in time.
#[derive(Debug, Clone, PartialEq)]
pub struct StringValue {
    pub timestamp: i64,
    pub value: String,
}

impl Serialize for StringValue {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut seq = serializer.serialize_seq(Some(2))?;
        seq.serialize_element(&(self.timestamp as f64 / 1000.0))?;
        seq.serialize_element(&self.value)?;
        seq.end()
    }
}

impl<'de> Deserialize<'de> for StringValue {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let (secs, value) = <(f64, String)>::deserialize(deserializer)?;
        Ok(StringValue {
            timestamp: (secs * 1000.0).round() as i64,
            value,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, serde::Deserialize)]
pub struct InstantValue {
    #[serde(rename = "metric")]
    pub labels: Labels,
    #[serde(rename = "value")]
    pub sample: Sample,
}

#[derive(Debug, Clone, PartialEq, Serialize, serde::Deserialize)]
pub struct RangeValue {
    #[serde(rename = "metric")]
    pub labels: Labels,
    #[serde(rename = "values")]
    pub samples: Vec<Sample>,
    /// The `(start, end]` window the samples were selected from.
    #[serde(skip)]
    pub time_range: Option<(i64, i64)>,
}

/// Intermediate result of evaluating a PromQL expression node.
#[derive(Debug, Clone)]
pub enum Value {
    Instant(InstantValue),
    Range(RangeValue),
    Vector(Vec<InstantValue>),
    Matrix(Vec<RangeValue>),
    Sample(Sample),
    Float(f64),
    String(String),
    None,
}

impl Value {
    pub fn get_type(&self) -> &str {
        match self {
            Value::Instant(_) => "vector",
            Value::Range(_) => "matrix",
            Value::Vector(_) => "vector",
            Value::Matrix(_) => "matrix",
            Value::Sample(_) => "scalar",
            Value::Float(_) => "scalar",
            Value::String(_) => "string",
            Value::None => "vector",
        }
    }

    /// Orders vectors and matrices by label set.
    pub fn sort(&mut self) {
        match self {
            Value::Vector(v) => v.sort_by(|a, b| a.labels.cmp(&b.labels)),
            Value::Matrix(v) => v.sort_by(|a, b| a.labels.cmp(&b.labels)),
            _ => {}
        }
    }
}

/// The typed result of a query, tagged with its result type discriminator.
///
/// Serializes as `{"resultType": "<type>", "result": <payload>}`.
#[derive(Debug, Clone, PartialEq, Serialize, serde::Deserialize)]
#[serde(tag = "resultType", content = "result", rename_all = "lowercase")]
pub enum QueryData {
    Scalar(Sample),
    Vector(Vec<InstantValue>),
    Matrix(Vec<RangeValue>),
    String(StringValue),
}

impl QueryData {
    pub fn result_type(&self) -> &'static str {
        match self {
            QueryData::Scalar(_) => "scalar",
            QueryData::Vector(_) => "vector",
            QueryData::Matrix(_) => "matrix",
            QueryData::String(_) => "string",
        }
    }

    pub fn num_series(&self) -> usize {
        match self {
            QueryData::Vector(v) => v.len(),
            QueryData::Matrix(v) => v.len(),
            QueryData::Scalar(_) | QueryData::String(_) => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use expect_test::expect;

    #[test]
    fn test_format_value() {
        assert_eq!(format_value(2.0), "2");
        assert_eq!(format_value(0.333), "0.333");
        assert_eq!(format_value(f64::NAN), "NaN");
        assert_eq!(format_value(f64::INFINITY), "+Inf");
        assert_eq!(format_value(f64::NEG_INFINITY), "-Inf");
        assert_eq!(parse_value("+Inf").unwrap(), f64::INFINITY);
        assert!(parse_value("NaN").unwrap().is_nan());
    }

    #[test]
    fn test_serialize_scalar() {
        let data = QueryData::Scalar(Sample::new(123_400, 2.0));
        expect![[r#"{"resultType":"scalar","result":[123.4,"2"]}"#]]
            .assert_eq(&serde_json::to_string(&data).unwrap());
    }

    #[test]
    fn test_serialize_vector_and_matrix() {
        let labels = Labels::new([("__name__", "up"), ("job", "node")]);
        let vector = QueryData::Vector(vec![InstantValue {
            labels: labels.clone(),
            sample: Sample::new(1_000, 1.0),
        }]);
        expect![[r#"{"resultType":"vector","result":[{"metric":{"__name__":"up","job":"node"},"value":[1.0,"1"]}]}"#]]
            .assert_eq(&serde_json::to_string(&vector).unwrap());

        let matrix = QueryData::Matrix(vec![RangeValue {
            labels,
            samples: vec![Sample::new(0, 0.5), Sample::new(15_000, f64::NAN)],
            time_range: Some((0, 15_000)),
        }]);
        expect![[r#"{"resultType":"matrix","result":[{"metric":{"__name__":"up","job":"node"},"values":[[0.0,"0.5"],[15.0,"NaN"]]}]}"#]]
            .assert_eq(&serde_json::to_string(&matrix).unwrap());
    }

    #[test]
    fn test_deserialize_keeps_result_type() {
        for json in [
            r#"{"resultType":"scalar","result":[123.4,"2"]}"#,
            r#"{"resultType":"string","result":[1.5,"foo"]}"#,
            r#"{"resultType":"vector","result":[{"metric":{"a":"b"},"value":[1.0,"1"]}]}"#,
            r#"{"resultType":"matrix","result":[{"metric":{},"values":[[0.0,"0"],[1.0,"1"]]}]}"#,
        ] {
            let data: QueryData = serde_json::from_str(json).unwrap();
            assert_eq!(serde_json::to_string(&data).unwrap(), json);
        }

        let data: QueryData =
            serde_json::from_str(r#"{"resultType":"scalar","result":[123.4,"2"]}"#).unwrap();
        assert_eq!(data, QueryData::Scalar(Sample::new(123_400, 2.0)));
        assert_eq!(data.result_type(), "scalar");
    }
}
