//! Bridge to the external convergence validator.
//!
//! Each call writes the curve to its own interchange file, runs
//! `<program> [args..] <file>` and reads a JSON result from stdout. The file
//! is held by a `tempfile` guard, so it is removed on every exit path,
//! including timeout and cancellation (the future is dropped, the guard with
//! it, and the child is killed via `kill_on_drop`).

use serde_json::Value;
use std::io::Write;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tempfile::TempPath;
use tokio::process::Command;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::RunConfig;
use crate::error::{ConfigError, ValidatorProcessError};
use crate::models::{split_dataset_id, ConvergenceResult, TransformedPoint, TransformedSeries};

pub const INTERCHANGE_HEADER: &str = "iteration,data_size,accuracy";

/// Raw fields read from the validator's JSON line.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatorReport {
    pub predicted_data_required: u64,
    pub actual_data_required: u64,
    pub prediction_error: f64,
    pub validation_successful: bool,
}

pub struct ValidatorBridge {
    program: String,
    args: Vec<String>,
    timeout: Duration,
    scratch_dir: PathBuf,
    max_retries: u32,
    retry_backoff: Duration,
}

impl ValidatorBridge {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            timeout: Duration::from_secs(120),
            scratch_dir: std::env::temp_dir(),
            max_retries: 0,
            retry_backoff: Duration::from_millis(250),
        }
    }

    pub fn from_config(config: &RunConfig) -> Result<Self, ConfigError> {
        let (program, args) = config.validator_command.split_first().ok_or_else(|| ConfigError::Invalid {
            key: "VALIDATOR_COMMAND".to_string(),
            reason: "command is empty".to_string(),
        })?;

        Ok(Self::new(program.clone(), args.to_vec())
            .with_timeout(config.validator_timeout())
            .with_scratch_dir(config.scratch_dir.clone())
            .with_retries(config.validator_max_retries))
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch_dir = dir.into();
        self
    }

    pub fn with_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Validate one series. Exactly one result or one typed failure.
    pub async fn validate(
        &self,
        run_id: &str,
        series: &TransformedSeries,
        cancel: &CancellationToken,
    ) -> Result<ConvergenceResult, ValidatorProcessError> {
        let mut attempt: u32 = 0;
        loop {
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(ValidatorProcessError::Cancelled),
                r = self.invoke(run_id, &series.dataset_id, &series.points) => r,
            };

            match outcome {
                Ok(report) => return Ok(to_result(&series.dataset_id, series.points.len(), report)),
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    attempt += 1;
                    warn!(dataset_id = %series.dataset_id, attempt, error = %e, "Validator failed, retrying");
                    sleep(self.retry_backoff * attempt).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn invoke(
        &self,
        run_id: &str,
        dataset_id: &str,
        points: &[TransformedPoint],
    ) -> Result<ValidatorReport, ValidatorProcessError> {
        // Dropped at the end of this scope on every path
        let scratch = self.write_interchange(run_id, dataset_id, points)?;

        let child = Command::new(&self.program)
            .args(&self.args)
            .arg(scratch.as_os_str())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(ValidatorProcessError::Spawn)?;

        debug!(dataset_id, path = %scratch.display(), "Validator started");

        let output = match timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(ValidatorProcessError::Spawn)?,
            Err(_) => return Err(ValidatorProcessError::Timeout(self.timeout)),
        };

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();

        if !output.status.success() {
            return Err(ValidatorProcessError::NonZeroExit {
                code: output.status.code(),
                stderr,
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_validator_output(&stdout).ok_or(ValidatorProcessError::MalformedOutput { stderr })
    }

    fn write_interchange(
        &self,
        run_id: &str,
        dataset_id: &str,
        points: &[TransformedPoint],
    ) -> Result<TempPath, ValidatorProcessError> {
        let prefix = format!("convergence_{}_{}_", sanitize_for_path(dataset_id), run_id);
        let mut file = tempfile::Builder::new()
            .prefix(&prefix)
            .suffix(".csv")
            .tempfile_in(&self.scratch_dir)
            .map_err(ValidatorProcessError::ScratchFile)?;

        file.write_all(interchange_contents(points).as_bytes())
            .and_then(|_| file.flush())
            .map_err(ValidatorProcessError::ScratchFile)?;

        Ok(file.into_temp_path())
    }
}

/// Header line plus one `iteration,data_size,accuracy` row per point.
pub fn interchange_contents(points: &[TransformedPoint]) -> String {
    let mut out = String::with_capacity(32 * (points.len() + 1));
    out.push_str(INTERCHANGE_HEADER);
    out.push('\n');
    for p in points {
        out.push_str(&format!("{},{},{}\n", p.iteration, p.data_size, p.accuracy));
    }
    out
}

/// Last line of stdout that parses as a JSON object; falls back to the whole
/// output for validators that pretty-print a single object.
pub fn parse_validator_output(stdout: &str) -> Option<ValidatorReport> {
    let object = stdout
        .lines()
        .rev()
        .map(str::trim)
        .filter(|line| line.starts_with('{'))
        .find_map(|line| serde_json::from_str::<Value>(line).ok().filter(Value::is_object))
        .or_else(|| serde_json::from_str::<Value>(stdout.trim()).ok().filter(Value::is_object))?;

    Some(ValidatorReport {
        predicted_data_required: as_count(&object["predicted_data_required"]),
        actual_data_required: as_count(&object["actual_data_required"]),
        prediction_error: object["prediction_error"].as_f64().filter(|v| v.is_finite()).unwrap_or(0.0),
        validation_successful: object["validation_successful"].as_bool().unwrap_or(false),
    })
}

fn as_count(value: &Value) -> u64 {
    if let Some(n) = value.as_u64() {
        return n;
    }
    match value.as_f64() {
        Some(f) if f.is_finite() && f > 0.0 => f.round() as u64,
        _ => 0,
    }
}

fn to_result(dataset_id: &str, total_data_points: usize, report: ValidatorReport) -> ConvergenceResult {
    let (country, economic_indicator) = split_dataset_id(dataset_id);
    ConvergenceResult {
        dataset_name: dataset_id.to_string(),
        predicted_data_required: report.predicted_data_required,
        actual_data_required: report.actual_data_required,
        prediction_error: report.prediction_error,
        validation_successful: report.validation_successful,
        economic_indicator,
        country,
        total_data_points,
    }
}

fn sanitize_for_path(raw: &str) -> String {
    raw.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' { c } else { '_' })
        .collect()
}
