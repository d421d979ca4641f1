use serde::{Deserialize, Serialize};
use chrono::{DateTime, Utc};
use std::fmt;
use std::str::FromStr;

/// Providers a series can come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataSourceKind {
    WorldBank,
    Fred,
}

impl DataSourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataSourceKind::WorldBank => "worldbank",
            DataSourceKind::Fred => "fred",
        }
    }
}

impl fmt::Display for DataSourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for DataSourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "worldbank" => Ok(DataSourceKind::WorldBank),
            "fred" => Ok(DataSourceKind::Fred),
            other => Err(format!("unknown data source '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationStatus {
    Validated,
    Pending,
    Rejected,
}

impl ValidationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationStatus::Validated => "validated",
            ValidationStatus::Pending => "pending",
            ValidationStatus::Rejected => "rejected",
        }
    }
}

impl fmt::Display for ValidationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for ValidationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "validated" => Ok(ValidationStatus::Validated),
            "pending" => Ok(ValidationStatus::Pending),
            "rejected" => Ok(ValidationStatus::Rejected),
            other => Err(format!("unknown validation status '{}'", other)),
        }
    }
}

/// A single observation. Dates are kept as the provider wrote them
/// ("2023", "2023-01-01", "2023Q1", ...).
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct SeriesPoint {
    pub date: String,
    pub value: f64,
}

impl SeriesPoint {
    pub fn new(date: impl Into<String>, value: f64) -> Self {
        Self { date: date.into(), value }
    }
}

/// A persisted series. `dataset_id` is the only identity.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct EconomicSeries {
    pub dataset_id: String,
    pub series_name: String,
    pub points: Vec<SeriesPoint>,
    pub source: DataSourceKind,
    pub validation_status: ValidationStatus,
    pub last_updated: DateTime<Utc>,
}

/// One (entity, metric) pair a provider is asked for.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct SeriesRequest {
    pub entity: String,
    pub metric: String,
}

impl SeriesRequest {
    pub fn new(entity: impl Into<String>, metric: impl Into<String>) -> Self {
        Self { entity: entity.into(), metric: metric.into() }
    }

    /// `<entity>_<metric>`, e.g. `USA_NY.GDP.MKTP.CD`.
    pub fn dataset_id(&self) -> String {
        format!("{}_{}", self.entity, self.metric)
    }
}

/// Inclusive range of calendar years.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct DateRange {
    pub start_year: i32,
    pub end_year: i32,
}

impl DateRange {
    pub fn new(start_year: i32, end_year: i32) -> Self {
        Self { start_year, end_year }
    }

    pub fn start_date(&self) -> String {
        format!("{:04}-01-01", self.start_year)
    }

    pub fn end_date(&self) -> String {
        format!("{:04}-12-31", self.end_year)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct TransformedPoint {
    pub iteration: usize,
    pub data_size: usize,
    pub accuracy: f64,
    pub economic_value: f64,
    pub date: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TransformedSeries {
    pub dataset_id: String,
    pub series_name: String,
    pub points: Vec<TransformedPoint>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ConvergenceResult {
    pub dataset_name: String,
    pub predicted_data_required: u64,
    pub actual_data_required: u64,
    pub prediction_error: f64,
    pub validation_successful: bool,
    pub economic_indicator: String,
    pub country: String,
    pub total_data_points: usize,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RunPhase {
    Fetching,
    Transforming,
    Validating,
    Complete,
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunPhase::Fetching => "fetching",
            RunPhase::Transforming => "transforming",
            RunPhase::Validating => "validating",
            RunPhase::Complete => "complete",
        };
        f.pad(name)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FailureStage {
    Fetch,
    Validate,
}

/// An item-level failure recorded on the run summary.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DatasetFailure {
    pub dataset_id: String,
    pub stage: FailureStage,
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct IntegrationRunSummary {
    pub run_id: uuid::Uuid,
    pub total_data_points: usize,
    pub sources: Vec<String>,
    pub results: Vec<ConvergenceResult>,
    pub datasets_attempted: usize,
    pub warnings: Vec<String>,
    pub failures: Vec<DatasetFailure>,
    pub phase: RunPhase,
    pub cancelled: bool,
    pub elapsed_ms: u64,
}

/// Split `<country>_<indicator>` on the first underscore.
/// Both halves are empty when there is no underscore.
pub fn split_dataset_id(dataset_id: &str) -> (String, String) {
    match dataset_id.split_once('_') {
        Some((country, indicator)) => (country.to_string(), indicator.to_string()),
        None => (String::new(), String::new()),
    }
}
