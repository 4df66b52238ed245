use std::{fs, path::Path};

use color_eyre::eyre::{bail, eyre, Result, WrapErr};
use newpromql::{value::RangeValue, MemStorage, Series};
use serde::{Deserialize, Serialize};

pub mod api;
pub mod clock;
pub mod config;
pub mod dedup;
pub mod http;
pub mod params;
pub mod response;

/// Prometheus HTTP API response
///
/// See https://prometheus.io/docs/prometheus/latest/querying/api/
#[derive(Debug, Serialize, Deserialize)]
struct Response {
    pub status: String,
    pub data: ResponseData,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResponseData {
    result_type: String,
    result: Vec<RangeValue>,
}

/// Loads every `*.json` range-query response in `samples_dir`.
///
/// A file named `<anything>@<duration>.json`, e.g. `up@5m.json`, holds data
/// downsampled to that resolution; any other file holds raw samples.
pub fn load_storage(samples_dir: impl AsRef<Path>) -> Result<MemStorage> {
    let samples_dir = samples_dir.as_ref();
    let paths = fs::read_dir(samples_dir).wrap_err_with(|| format!("{}", samples_dir.display()))?;
    let mut builder = MemStorage::builder();
    for dentry in paths {
        let path = dentry?.path();
        if path.extension().map_or(true, |ext| ext != "json") {
            continue;
        }
        let resolution = file_resolution(&path)?;
        let data = fs::read(&path).wrap_err_with(|| format!("{}", path.display()))?;
        let resp: Response = serde_json::from_slice(&data)
            .map_err(|e| eyre!("Failed to parse JSON file {}: {e}", path.display()))?;
        if resp.status != "success" || resp.data.result_type != "matrix" {
            bail!(
                "{}: expected a successful matrix response, got status {:?} with result type {:?}",
                path.display(),
                resp.status,
                resp.data.result_type
            );
        }
        tracing::info!(
            path = %path.display(),
            series = resp.data.result.len(),
            resolution,
            "loading samples"
        );
        for range in resp.data.result {
            builder = builder
                .add_downsampled(resolution, Series::new(range.labels, range.samples))
                .wrap_err_with(|| format!("{}", path.display()))?;
        }
    }
    Ok(builder.build()?)
}

fn file_resolution(path: &Path) -> Result<i64> {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| eyre!("invalid file name {}", path.display()))?;
    match stem.rsplit_once('@') {
        Some((_, resolution)) => {
            let resolution = params::parse_duration(resolution)
                .wrap_err_with(|| format!("{}", path.display()))?;
            Ok(resolution.whole_milliseconds() as i64)
        }
        None => Ok(newpromql::storage::RESOLUTION_RAW),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use newpromql::{Labels, Queryable, SelectHints};
    use tokio_util::sync::CancellationToken;

    use super::*;

    fn write_samples(dir: &Path, file: &str, body: &str) {
        fs::write(dir.join(file), body).unwrap();
    }

    #[tokio::test]
    async fn test_load_storage() {
        let dir = std::env::temp_dir().join(format!("prom-query-load-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        write_samples(
            &dir,
            "up.json",
            r#"{"status":"success","data":{"resultType":"matrix","result":[
                {"metric":{"__name__":"up","job":"api"},"values":[[0,"1"],[60,"0"]]},
                {"metric":{"__name__":"up","job":"db"},"values":[[0,"1"]]}
            ]}}"#,
        );
        write_samples(
            &dir,
            "up@5m.json",
            r#"{"status":"success","data":{"resultType":"matrix","result":[
                {"metric":{"__name__":"up","job":"api"},"values":[[0,"0.5"]]}
            ]}}"#,
        );
        write_samples(&dir, "README.txt", "ignored");

        let storage: Arc<dyn Queryable> = Arc::new(load_storage(&dir).unwrap());
        let cancel = CancellationToken::new();
        let raw = storage
            .select(&[], &SelectHints::all(), &cancel)
            .await
            .unwrap();
        assert_eq!(raw.len(), 2);
        assert_eq!(raw[0].labels, Labels::new([("__name__", "up"), ("job", "api")]));
        assert_eq!(raw[0].samples.len(), 2);

        let hints = SelectHints {
            max_resolution_millis: 300_000,
            ..SelectHints::all()
        };
        let downsampled = storage.select(&[], &hints, &cancel).await.unwrap();
        assert_eq!(downsampled[0].samples.len(), 1);
        assert_eq!(downsampled[0].samples[0].value, 0.5);

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_load_storage_rejects_bad_files() {
        let dir = std::env::temp_dir().join(format!("prom-query-bad-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        write_samples(
            &dir,
            "up.json",
            r#"{"status":"success","data":{"resultType":"vector","result":[]}}"#,
        );
        assert!(load_storage(&dir).is_err());
        fs::remove_dir_all(&dir).unwrap();

        assert!(load_storage(dir.join("missing")).is_err());
    }
}
