#![allow(dead_code)]

use async_trait::async_trait;
use econ_convergence_lib::core::rate_limiter::RateLimiter;
use econ_convergence_lib::error::FetchError;
use econ_convergence_lib::fetcher::{DataSource, FetchedSeries};
use econ_convergence_lib::models::{
    DataSourceKind, DateRange, SeriesPoint, SeriesRequest, TransformedPoint, TransformedSeries,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

pub const GOOD_RESULT: &str =
    r#"{"predicted_data_required":120,"actual_data_required":100,"prediction_error":0.2,"validation_successful":true}"#;

/// Provider stand-in serving canned series keyed by dataset id. Unknown ids
/// answer 404.
pub struct CannedSource {
    pub name: &'static str,
    pub kind: DataSourceKind,
    pub series: HashMap<String, Vec<Option<f64>>>,
}

impl CannedSource {
    pub fn new(name: &'static str, kind: DataSourceKind) -> Self {
        Self { name, kind, series: HashMap::new() }
    }

    pub fn with_series(mut self, dataset_id: &str, values: Vec<Option<f64>>) -> Self {
        self.series.insert(dataset_id.to_string(), values);
        self
    }
}

#[async_trait]
impl DataSource for CannedSource {
    fn name(&self) -> &str {
        self.name
    }

    fn kind(&self) -> DataSourceKind {
        self.kind
    }

    async fn fetch_series(
        &self,
        request: &SeriesRequest,
        _range: &DateRange,
        limiter: &RateLimiter,
    ) -> Result<FetchedSeries, FetchError> {
        limiter.wait().await;
        let raw = self
            .series
            .get(&request.dataset_id())
            .ok_or(FetchError::Status { status: 404, body: "unknown series".to_string() })?;

        // nulls are dropped the same way the real providers drop them
        let points = raw
            .iter()
            .enumerate()
            .filter_map(|(i, v)| v.map(|v| SeriesPoint::new(format!("{}", 2000 + i), v)))
            .collect();

        Ok(FetchedSeries { series_name: request.metric.clone(), points })
    }
}

pub fn steady(n: usize) -> Vec<Option<f64>> {
    (0..n).map(|i| Some(100.0 + (i % 3) as f64)).collect()
}

/// Write a `/bin/sh` script; the interchange path arrives as `$1`.
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    path
}

pub fn curve(dataset_id: &str, n: usize) -> TransformedSeries {
    TransformedSeries {
        dataset_id: dataset_id.to_string(),
        series_name: dataset_id.to_string(),
        points: (1..=n)
            .map(|i| TransformedPoint {
                iteration: i,
                data_size: i,
                accuracy: if i <= 5 { 0.0 } else { 0.9 },
                economic_value: i as f64,
                date: format!("{}", 2000 + i),
            })
            .collect(),
    }
}

pub fn dir_is_empty(dir: &Path) -> bool {
    std::fs::read_dir(dir).unwrap().next().is_none()
}
