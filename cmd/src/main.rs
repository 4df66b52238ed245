use std::sync::Arc;

use clap::Parser;
use color_eyre::eyre::Result;
use tracing_subscriber::EnvFilter;

use prom_query::{
    api::Api,
    clock::SystemClock,
    config::{ApiConfig, Cli},
    http,
};

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();
    let cli = Cli::parse();
    let start_time = std::time::Instant::now();

    let storage = prom_query::load_storage(&cli.samples_dir)?;
    tracing::info!(
        metrics = storage.metric_names().count(),
        "prepare time: {:?}",
        start_time.elapsed()
    );

    let api = Api::new(ApiConfig::from(&cli), Arc::new(storage), Arc::new(SystemClock));
    let app = http::router(Arc::new(api), &cli.route_prefix);
    http::serve(cli.listen_address, app).await
}
