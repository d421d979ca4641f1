use crate::error::ConfigError;
use crate::models::{DateRange, SeriesRequest};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_WORLDBANK_BASE_URL: &str = "https://api.worldbank.org/v2";
pub const DEFAULT_FRED_BASE_URL: &str = "https://api.stlouisfed.org/fred";

/// FRED series are US-only, so they are keyed under this entity.
pub const FRED_ENTITY: &str = "USA";

/// Everything one pipeline run needs. Credentials live here and are handed to
/// the fetchers at construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    pub database_path: PathBuf,
    pub worldbank_countries: Vec<String>,
    pub worldbank_indicators: Vec<String>,
    pub worldbank_base_url: String,
    pub fred_series: Vec<String>,
    #[serde(skip_serializing)]
    pub fred_api_key: Option<String>,
    pub fred_base_url: String,
    pub date_range: DateRange,
    pub page_size: u32,
    pub min_data_points: usize,
    pub accuracy_scale: f64,
    pub request_interval_ms: u64,
    pub rate_limit_burst: u32,
    pub request_jitter_ms: u64,
    pub fetch_concurrency: usize,
    pub fetch_max_retries: u32,
    pub fetch_retry_backoff_ms: u64,
    pub validator_command: Vec<String>,
    pub validator_timeout_secs: u64,
    pub validator_concurrency: usize,
    pub validator_max_retries: u32,
    pub scratch_dir: PathBuf,
}

impl Default for RunConfig {
    fn default() -> Self {
        RunConfig {
            database_path: PathBuf::from("./data/economic_series.db"),
            worldbank_countries: to_strings(&["USA", "GBR", "DEU", "JPN"]),
            worldbank_indicators: to_strings(&["NY.GDP.MKTP.CD", "FP.CPI.TOTL.ZG", "SL.UEM.TOTL.ZS"]),
            worldbank_base_url: DEFAULT_WORLDBANK_BASE_URL.to_string(),
            fred_series: to_strings(&["GDP", "CPIAUCSL", "UNRATE"]),
            fred_api_key: None,
            fred_base_url: DEFAULT_FRED_BASE_URL.to_string(),
            date_range: DateRange::new(2000, 2023),
            page_size: 1000,
            min_data_points: 10,
            accuracy_scale: 1.0,
            request_interval_ms: 100,
            rate_limit_burst: 1,
            request_jitter_ms: 0,
            fetch_concurrency: 4,
            fetch_max_retries: 2,
            fetch_retry_backoff_ms: 500,
            validator_command: to_strings(&["python3", "convergence_validator.py"]),
            validator_timeout_secs: 120,
            validator_concurrency: 4,
            validator_max_retries: 0,
            scratch_dir: std::env::temp_dir(),
        }
    }
}

impl RunConfig {
    /// Load `.env` (if present) and then read the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        Self::from_vars(std::env::vars())
    }

    /// Build a config from explicit key/value pairs on top of the defaults.
    pub fn from_vars<I>(vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let vars: HashMap<String, String> = vars.into_iter().collect();
        let mut config = RunConfig::default();

        if let Some(path) = vars.get("DATABASE_PATH") {
            config.database_path = PathBuf::from(path);
        }
        if let Some(list) = vars.get("WORLDBANK_COUNTRIES") {
            config.worldbank_countries = parse_list(list);
        }
        if let Some(list) = vars.get("WORLDBANK_INDICATORS") {
            config.worldbank_indicators = parse_list(list);
        }
        if let Some(url) = vars.get("WORLDBANK_BASE_URL") {
            config.worldbank_base_url = url.trim_end_matches('/').to_string();
        }
        if let Some(list) = vars.get("FRED_SERIES") {
            config.fred_series = parse_list(list);
        }
        if let Some(url) = vars.get("FRED_BASE_URL") {
            config.fred_base_url = url.trim_end_matches('/').to_string();
        }
        // Blank keys count as missing
        config.fred_api_key = vars
            .get("FRED_API_KEY")
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty());

        config.date_range.start_year = parse_or(&vars, "START_YEAR", config.date_range.start_year)?;
        config.date_range.end_year = parse_or(&vars, "END_YEAR", config.date_range.end_year)?;
        if config.date_range.start_year > config.date_range.end_year {
            return Err(ConfigError::Invalid {
                key: "START_YEAR".to_string(),
                reason: format!(
                    "start year {} is after end year {}",
                    config.date_range.start_year, config.date_range.end_year
                ),
            });
        }

        config.page_size = parse_or(&vars, "PAGE_SIZE", config.page_size)?;
        config.min_data_points = parse_or(&vars, "MIN_DATA_POINTS", config.min_data_points)?;
        config.accuracy_scale = parse_or(&vars, "ACCURACY_SCALE", config.accuracy_scale)?;
        if !(config.accuracy_scale.is_finite() && config.accuracy_scale > 0.0) {
            return Err(ConfigError::Invalid {
                key: "ACCURACY_SCALE".to_string(),
                reason: format!("must be a positive finite number, got {}", config.accuracy_scale),
            });
        }
        config.request_interval_ms = parse_or(&vars, "REQUEST_INTERVAL_MS", config.request_interval_ms)?;
        config.rate_limit_burst = parse_or(&vars, "RATE_LIMIT_BURST", config.rate_limit_burst)?;
        config.request_jitter_ms = parse_or(&vars, "REQUEST_JITTER_MS", config.request_jitter_ms)?;
        config.fetch_concurrency = parse_or(&vars, "FETCH_CONCURRENCY", config.fetch_concurrency)?;
        config.fetch_max_retries = parse_or(&vars, "FETCH_MAX_RETRIES", config.fetch_max_retries)?;
        config.fetch_retry_backoff_ms = parse_or(&vars, "FETCH_RETRY_BACKOFF_MS", config.fetch_retry_backoff_ms)?;
        config.validator_timeout_secs = parse_or(&vars, "VALIDATOR_TIMEOUT_SECS", config.validator_timeout_secs)?;
        config.validator_concurrency = parse_or(&vars, "VALIDATOR_CONCURRENCY", config.validator_concurrency)?;
        config.validator_max_retries = parse_or(&vars, "VALIDATOR_MAX_RETRIES", config.validator_max_retries)?;

        if let Some(cmd) = vars.get("VALIDATOR_COMMAND") {
            let parts: Vec<String> = cmd.split_whitespace().map(str::to_string).collect();
            if parts.is_empty() {
                return Err(ConfigError::Invalid {
                    key: "VALIDATOR_COMMAND".to_string(),
                    reason: "command is empty".to_string(),
                });
            }
            config.validator_command = parts;
        }
        if let Some(dir) = vars.get("SCRATCH_DIR") {
            config.scratch_dir = PathBuf::from(dir);
        }

        if config.page_size == 0 {
            return Err(ConfigError::Invalid {
                key: "PAGE_SIZE".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }

        Ok(config)
    }

    pub fn worldbank_requests(&self) -> Vec<SeriesRequest> {
        let mut requests = Vec::new();
        for country in &self.worldbank_countries {
            for indicator in &self.worldbank_indicators {
                requests.push(SeriesRequest::new(country.clone(), indicator.clone()));
            }
        }
        requests
    }

    pub fn fred_requests(&self) -> Vec<SeriesRequest> {
        self.fred_series
            .iter()
            .map(|id| SeriesRequest::new(FRED_ENTITY, id.clone()))
            .collect()
    }

    pub fn request_interval(&self) -> Duration {
        Duration::from_millis(self.request_interval_ms)
    }

    pub fn validator_timeout(&self) -> Duration {
        Duration::from_secs(self.validator_timeout_secs)
    }
}

fn to_strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_or<T>(vars: &HashMap<String, String>, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match vars.get(key) {
        Some(raw) => raw.trim().parse::<T>().map_err(|e| ConfigError::Invalid {
            key: key.to_string(),
            reason: e.to_string(),
        }),
        None => Ok(default),
    }
}
