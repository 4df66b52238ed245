//! Request parameters: the form multimap plus the time, duration and boolean
//! parsers every endpoint shares.

use once_cell::sync::Lazy;
use regex::Regex;
use time::{
    format_description::{self, well_known::Rfc3339},
    Duration, OffsetDateTime, PrimitiveDateTime,
};

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("cannot parse {0:?} to a valid timestamp")]
    InvalidTime(String),
    #[error("cannot parse {0:?} to a valid timestamp, it overflows int64")]
    TimeOverflow(String),
    #[error("cannot parse {0:?} to a valid duration")]
    InvalidDuration(String),
    #[error("cannot parse {0:?} to a valid duration, it overflows int64")]
    DurationOverflow(String),
    #[error("cannot parse {0:?} to a valid boolean")]
    InvalidBool(String),
    #[error("negative 'max_source_resolution' is not accepted, try a positive duration")]
    NegativeResolution,
    #[error("negative duration {0:?} is not accepted")]
    NegativeDuration(String),
}

pub type Result<T, E = ParseError> = std::result::Result<T, E>;

/// Nanoseconds representable in an `i64`, as a float bound.
const MAX_NANOS: f64 = i64::MAX as f64;
const NANOS_PER_SEC: f64 = 1e9;

/// Parses a timestamp given either as (fractional) seconds since the Unix
/// epoch or as an RFC 3339 instant. The fraction is rounded to milliseconds.
pub fn parse_time(s: &str) -> Result<OffsetDateTime> {
    if let Ok(t) = s.parse::<f64>() {
        if !t.is_finite() {
            return Err(ParseError::InvalidTime(s.to_owned()));
        }
        if t.abs() * NANOS_PER_SEC >= MAX_NANOS {
            return Err(ParseError::TimeOverflow(s.to_owned()));
        }
        let secs = t.trunc();
        let millis = (t.fract() * 1000.0).round();
        return Ok(OffsetDateTime::UNIX_EPOCH
            + Duration::seconds(secs as i64)
            + Duration::milliseconds(millis as i64));
    }
    if let Ok(t) = OffsetDateTime::parse(s, &Rfc3339) {
        return Ok(t);
    }
    // RFC 3339 without an offset is taken as UTC
    for fmt in [
        "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond]",
        "[year]-[month]-[day]T[hour]:[minute]:[second]",
    ] {
        let Ok(items) = format_description::parse(fmt) else {
            continue;
        };
        if let Ok(t) = PrimitiveDateTime::parse(s, &items) {
            return Ok(t.assume_utc());
        }
    }
    Err(ParseError::InvalidTime(s.to_owned()))
}

static DURATION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        "^(([0-9]+)y)?(([0-9]+)w)?(([0-9]+)d)?(([0-9]+)h)?(([0-9]+)m)?(([0-9]+)s)?(([0-9]+)ms)?$",
    )
    .expect("BUG: invalid duration regex")
});

/// Milliseconds per unit of every capture group of [`DURATION_RE`], in order.
const DURATION_UNITS: [(usize, i64); 7] = [
    (2, 365 * 24 * 60 * 60 * 1000),
    (4, 7 * 24 * 60 * 60 * 1000),
    (6, 24 * 60 * 60 * 1000),
    (8, 60 * 60 * 1000),
    (10, 60 * 1000),
    (12, 1000),
    (14, 1),
];

/// Parses a duration given either as (fractional) seconds or as a compact
/// literal such as `1h30m`, `5m` or `250ms`. Timestamps are not durations.
pub fn parse_duration(s: &str) -> Result<Duration> {
    if let Ok(d) = s.parse::<f64>() {
        if !d.is_finite() {
            return Err(ParseError::InvalidDuration(s.to_owned()));
        }
        let nanos = d * NANOS_PER_SEC;
        if nanos >= MAX_NANOS || nanos <= -MAX_NANOS {
            return Err(ParseError::DurationOverflow(s.to_owned()));
        }
        return Ok(Duration::nanoseconds(nanos.round() as i64));
    }
    parse_compact_duration(s)
}

fn parse_compact_duration(s: &str) -> Result<Duration> {
    if s == "0" {
        return Ok(Duration::ZERO);
    }
    let invalid = || ParseError::InvalidDuration(s.to_owned());
    if s.is_empty() {
        return Err(invalid());
    }
    let caps = DURATION_RE.captures(s).ok_or_else(invalid)?;
    let mut millis: i64 = 0;
    for (group, unit) in DURATION_UNITS {
        let Some(m) = caps.get(group) else {
            continue;
        };
        let n = m.as_str().parse::<i64>().map_err(|_| invalid())?;
        millis = n
            .checked_mul(unit)
            .and_then(|v| millis.checked_add(v))
            .ok_or_else(|| ParseError::DurationOverflow(s.to_owned()))?;
    }
    // the result is handed around as nanoseconds as well
    if millis.checked_mul(1_000_000).is_none() {
        return Err(ParseError::DurationOverflow(s.to_owned()));
    }
    Ok(Duration::milliseconds(millis))
}

/// Accepts the boolean spellings `1 t T TRUE true True 0 f F FALSE false False`.
pub fn parse_bool(s: &str) -> Result<bool> {
    match s {
        "1" | "t" | "T" | "TRUE" | "true" | "True" => Ok(true),
        "0" | "f" | "F" | "FALSE" | "false" | "False" => Ok(false),
        _ => Err(ParseError::InvalidBool(s.to_owned())),
    }
}

/// Negotiates the coarsest resolution, in milliseconds, the storage may
/// serve. An explicit value wins; otherwise auto-downsampling suggests
/// `step / divisor` and raw data is used when it is off.
pub fn resolve_max_source_resolution_millis(
    explicit: Option<&str>,
    step: Duration,
    auto_downsampling: bool,
    divisor: i64,
) -> Result<i64> {
    let resolution = match explicit.filter(|s| !s.is_empty()) {
        Some(s) => parse_duration(s)?,
        None if auto_downsampling && divisor > 0 => {
            Duration::milliseconds((step.whole_milliseconds() / i128::from(divisor)) as i64)
        }
        None => Duration::ZERO,
    };
    if resolution.is_negative() {
        return Err(ParseError::NegativeResolution);
    }
    Ok(resolution.whole_milliseconds() as i64)
}

/// Milliseconds since the Unix epoch, negative before it.
pub fn millis(t: OffsetDateTime) -> i64 {
    (t.unix_timestamp_nanos().div_euclid(1_000_000)) as i64
}

static LABEL_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new("^[a-zA-Z_][a-zA-Z0-9_]*$").expect("BUG: invalid label name regex"));

pub fn is_valid_label_name(name: &str) -> bool {
    LABEL_NAME_RE.is_match(name)
}

/// Form values of a request: the urlencoded body first, then the URL query
/// string. A name may repeat.
#[derive(Debug, Clone, Default)]
pub struct Params(Vec<(String, String)>);

impl Params {
    pub fn parse(query: Option<&str>, form_body: Option<&[u8]>) -> Self {
        let mut params = Vec::new();
        if let Some(body) = form_body {
            params.extend(form_urlencoded::parse(body).into_owned());
        }
        if let Some(query) = query {
            params.extend(form_urlencoded::parse(query.as_bytes()).into_owned());
        }
        Self(params)
    }

    /// The first value of `name`, if any.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k.as_str() == name)
            .map(|(_, v)| v.as_str())
    }

    /// The first value of `name` unless it is missing or empty.
    pub fn get_non_empty(&self, name: &str) -> Option<&str> {
        self.get(name).filter(|v| !v.is_empty())
    }

    pub fn get_all(&self, name: &str) -> Vec<&str> {
        self.0
            .iter()
            .filter(|(k, _)| k.as_str() == name)
            .map(|(_, v)| v.as_str())
            .collect()
    }
}

impl<K, V> FromIterator<(K, V)> for Params
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}
