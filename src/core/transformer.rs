use tracing::{debug, info};

use crate::db::SeriesStore;
use crate::error::{ConfigError, PersistenceError};
use crate::models::{EconomicSeries, TransformedPoint, TransformedSeries, ValidationStatus};

/// Number of trailing values in the stability window.
pub const STABILITY_WINDOW: usize = 5;

/// Points before this index have too little history and score 0. The
/// trailing window needs a full `STABILITY_WINDOW` values behind it.
pub const WARMUP_POINTS: usize = STABILITY_WINDOW;
const _: () = assert!(WARMUP_POINTS >= STABILITY_WINDOW);

/// Turns stored series into accuracy-vs-sample-size curves.
#[derive(Debug, Clone)]
pub struct StabilityTransformer {
    min_data_points: usize,
    accuracy_scale: f64,
}

impl StabilityTransformer {
    /// `accuracy_scale` must be positive and finite; anything else makes the
    /// accuracy constant or rising with dispersion.
    pub fn new(min_data_points: usize, accuracy_scale: f64) -> Result<Self, ConfigError> {
        if !(accuracy_scale.is_finite() && accuracy_scale > 0.0) {
            return Err(ConfigError::Invalid {
                key: "ACCURACY_SCALE".to_string(),
                reason: format!("must be a positive finite number, got {}", accuracy_scale),
            });
        }
        Ok(Self { min_data_points, accuracy_scale })
    }

    /// Curve for one series, or an empty vec if the series is too short.
    pub fn transform(&self, series: &EconomicSeries) -> Vec<TransformedPoint> {
        if series.points.len() < self.min_data_points {
            return Vec::new();
        }

        let numeric: Vec<(&str, f64)> = series
            .points
            .iter()
            .filter(|p| p.value.is_finite())
            .map(|p| (p.date.as_str(), p.value))
            .collect();

        if numeric.len() < self.min_data_points || numeric.is_empty() {
            return Vec::new();
        }

        let values: Vec<f64> = numeric.iter().map(|(_, v)| *v).collect();

        numeric
            .iter()
            .enumerate()
            .map(|(i, (date, value))| {
                let accuracy = if i < WARMUP_POINTS {
                    0.0
                } else {
                    let window = &values[i + 1 - STABILITY_WINDOW..=i];
                    accuracy_from_cv(coefficient_of_variation(window), self.accuracy_scale)
                };

                TransformedPoint {
                    iteration: i + 1,
                    data_size: i + 1,
                    accuracy,
                    economic_value: *value,
                    date: date.to_string(),
                }
            })
            .collect()
    }

    /// Transform every validated series in the store, keeping the store's
    /// newest-first order and dropping series that yield no curve.
    pub async fn transform_all(&self, store: &dyn SeriesStore) -> Result<Vec<TransformedSeries>, PersistenceError> {
        let series = store.list_by_status(ValidationStatus::Validated).await?;
        let total = series.len();

        let mut transformed = Vec::new();
        for s in &series {
            let points = self.transform(s);
            if points.is_empty() {
                debug!(
                    dataset_id = %s.dataset_id,
                    points = s.points.len(),
                    min = self.min_data_points,
                    "Series below minimum length, excluded"
                );
                continue;
            }
            transformed.push(TransformedSeries {
                dataset_id: s.dataset_id.clone(),
                series_name: s.series_name.clone(),
                points,
            });
        }

        info!(validated = total, qualifying = transformed.len(), "Transformed stored series");
        Ok(transformed)
    }
}

/// Population coefficient of variation. A zero mean counts as maximally
/// unstable (cv = 1).
pub fn coefficient_of_variation(window: &[f64]) -> f64 {
    if window.is_empty() {
        return 1.0;
    }

    let n = window.len() as f64;
    let mean = window.iter().sum::<f64>() / n;
    if mean.abs() < f64::EPSILON {
        return 1.0;
    }

    let variance = window.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    variance.sqrt() / mean.abs()
}

/// `1 - cv * scale`, clamped to [0, 1]. Non-finite input scores 0.
pub fn accuracy_from_cv(cv: f64, scale: f64) -> f64 {
    let accuracy = 1.0 - cv * scale;
    if accuracy.is_finite() {
        accuracy.clamp(0.0, 1.0)
    } else {
        0.0
    }
}
