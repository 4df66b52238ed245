use std::{net::SocketAddr, path::PathBuf};

use clap::Parser;
use time::Duration;

use crate::params::{self, parse_duration};

/// Samples to fit in one step when auto-downsampling picks a resolution.
pub const DEFAULT_AUTO_DOWNSAMPLING_DIVISOR: i64 = 5;

#[derive(Debug, Parser)]
#[command(version, about = "PromQL query API over replicated, downsampled series")]
pub struct Cli {
    /// Address the HTTP server listens on
    #[arg(long, env = "PROM_QUERY_LISTEN_ADDRESS", default_value = "0.0.0.0:5080")]
    pub listen_address: SocketAddr,

    /// Directory with `*.json` Prometheus range-query responses to serve
    #[arg(long, env = "PROM_QUERY_SAMPLES_DIR", default_value = "samples")]
    pub samples_dir: PathBuf,

    /// Label whose values mark replicas of one series (repeatable)
    #[arg(long = "replica-label", env = "PROM_QUERY_REPLICA_LABELS", value_delimiter = ',')]
    pub replica_labels: Vec<String>,

    /// Deduplicate replicas unless a request sets `dedup`
    #[arg(
        long,
        env = "PROM_QUERY_DEDUP_BY_DEFAULT",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub dedup_by_default: bool,

    /// Let range queries read downsampled data when no
    /// `max_source_resolution` is given
    #[arg(long, env = "PROM_QUERY_AUTO_DOWNSAMPLING")]
    pub auto_downsampling: bool,

    /// Maximum time one query may evaluate
    #[arg(long, env = "PROM_QUERY_TIMEOUT", default_value = "2m", value_parser = parse_duration_arg)]
    pub query_timeout: Duration,

    /// How far back a vector selector looks for a sample
    #[arg(long, env = "PROM_QUERY_LOOKBACK_DELTA", default_value = "5m", value_parser = parse_duration_arg)]
    pub lookback_delta: Duration,

    /// Maximum samples one query may load
    #[arg(long, env = "PROM_QUERY_MAX_SAMPLES", default_value_t = newpromql::DEFAULT_MAX_SAMPLES)]
    pub max_samples: usize,

    /// Maximum points per series a range query may return
    #[arg(long, env = "PROM_QUERY_MAX_POINTS_PER_SERIES", default_value_t = 11_000)]
    pub max_points_per_series: i64,

    /// Path the API is mounted under
    #[arg(long, env = "PROM_QUERY_ROUTE_PREFIX", default_value = "/api/v1")]
    pub route_prefix: String,
}

fn parse_duration_arg(s: &str) -> Result<Duration, params::ParseError> {
    let d = parse_duration(s)?;
    if d.is_negative() {
        return Err(params::ParseError::NegativeDuration(s.to_owned()));
    }
    Ok(d)
}

/// Process-wide settings of the API, built once at startup.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub replica_labels: Vec<String>,
    pub dedup_by_default: bool,
    pub auto_downsampling: bool,
    pub auto_downsampling_divisor: i64,
    pub query_timeout: Duration,
    pub lookback_delta: Duration,
    pub max_samples: usize,
    pub max_points_per_series: i64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            replica_labels: Vec::new(),
            dedup_by_default: true,
            auto_downsampling: false,
            auto_downsampling_divisor: DEFAULT_AUTO_DOWNSAMPLING_DIVISOR,
            query_timeout: Duration::minutes(2),
            lookback_delta: Duration::minutes(5),
            max_samples: newpromql::DEFAULT_MAX_SAMPLES,
            max_points_per_series: 11_000,
        }
    }
}

impl From<&Cli> for ApiConfig {
    fn from(cli: &Cli) -> Self {
        Self {
            replica_labels: cli.replica_labels.clone(),
            dedup_by_default: cli.dedup_by_default,
            auto_downsampling: cli.auto_downsampling,
            auto_downsampling_divisor: DEFAULT_AUTO_DOWNSAMPLING_DIVISOR,
            query_timeout: cli.query_timeout,
            lookback_delta: cli.lookback_delta,
            max_samples: cli.max_samples,
            max_points_per_series: cli.max_points_per_series,
        }
    }
}
