use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::RunConfig;
use crate::core::rate_limiter::RateLimiter;
use crate::db::SeriesStore;
use crate::error::{AuthError, FetchError};
use crate::models::{DataSourceKind, DateRange, SeriesPoint, SeriesRequest, ValidationStatus};

pub mod fred;
pub mod worldbank;

#[cfg(test)]
mod test_server;

/// A normalized series as returned by a provider: nulls and sentinels
/// already dropped, points in ascending date order.
#[derive(Debug, Clone)]
pub struct FetchedSeries {
    pub series_name: String,
    pub points: Vec<SeriesPoint>,
}

#[async_trait]
pub trait DataSource: Send + Sync {
    fn name(&self) -> &str;

    fn kind(&self) -> DataSourceKind;

    /// Stage-level precondition. An error here skips every request of the
    /// provider for the run.
    fn check_credentials(&self) -> Result<(), AuthError> {
        Ok(())
    }

    /// Fetch every page of one series. `limiter` must be awaited before
    /// each HTTP request, not once per series.
    async fn fetch_series(
        &self,
        request: &SeriesRequest,
        range: &DateRange,
        limiter: &RateLimiter,
    ) -> Result<FetchedSeries, FetchError>;
}

#[derive(Debug)]
pub struct ItemFailure {
    pub dataset_id: String,
    pub error: FetchError,
}

/// Outcome of one provider stage.
#[derive(Debug)]
pub struct StageReport {
    pub source: DataSourceKind,
    pub points_written: usize,
    pub series_written: usize,
    pub failures: Vec<ItemFailure>,
    pub skipped: Option<AuthError>,
    pub cancelled: bool,
}

impl StageReport {
    fn empty(source: DataSourceKind) -> Self {
        Self {
            source,
            points_written: 0,
            series_written: 0,
            failures: Vec::new(),
            skipped: None,
            cancelled: false,
        }
    }
}

/// Runs every configured request of one provider through the rate limiter
/// and writes the results to the store.
pub struct SourceFetcher {
    source: Arc<dyn DataSource>,
    requests: Vec<SeriesRequest>,
    limiter: RateLimiter,
    concurrency: usize,
    max_retries: u32,
    retry_backoff: Duration,
}

impl SourceFetcher {
    pub fn new(source: Arc<dyn DataSource>, requests: Vec<SeriesRequest>) -> Self {
        Self {
            source,
            requests,
            limiter: RateLimiter::new(Duration::from_millis(100), 1, 0),
            concurrency: 1,
            max_retries: 0,
            retry_backoff: Duration::from_millis(500),
        }
    }

    pub fn from_config(source: Arc<dyn DataSource>, requests: Vec<SeriesRequest>, config: &RunConfig) -> Self {
        Self::new(source, requests)
            .with_rate_limit(RateLimiter::new(
                config.request_interval(),
                config.rate_limit_burst,
                config.request_jitter_ms,
            ))
            .with_concurrency(config.fetch_concurrency)
            .with_retries(config.fetch_max_retries, Duration::from_millis(config.fetch_retry_backoff_ms))
    }

    pub fn with_rate_limit(mut self, limiter: RateLimiter) -> Self {
        self.limiter = limiter;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_retries(mut self, max_retries: u32, backoff: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_backoff = backoff;
        self
    }

    pub fn name(&self) -> &str {
        self.source.name()
    }

    pub fn kind(&self) -> DataSourceKind {
        self.source.kind()
    }

    /// Fetch one pair and upsert it. Returns the number of valid points written.
    pub async fn fetch_one(
        &self,
        store: &dyn SeriesStore,
        request: &SeriesRequest,
        range: &DateRange,
    ) -> Result<usize, FetchError> {
        let fetched = self.fetch_with_retry(request, range).await?;
        let count = fetched.points.len();
        let status = if count > 0 {
            ValidationStatus::Validated
        } else {
            ValidationStatus::Rejected
        };

        store
            .upsert(&request.dataset_id(), &fetched.series_name, fetched.points, self.source.kind(), status)
            .await?;

        Ok(count)
    }

    async fn fetch_with_retry(&self, request: &SeriesRequest, range: &DateRange) -> Result<FetchedSeries, FetchError> {
        let mut attempt: u32 = 0;
        loop {
            match self.source.fetch_series(request, range, &self.limiter).await {
                Ok(series) => return Ok(series),
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    let backoff = self.retry_backoff.saturating_mul(2u32.saturating_pow(attempt));
                    warn!(
                        provider = self.source.name(),
                        dataset_id = %request.dataset_id(),
                        attempt = attempt + 1,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Fetch failed, retrying"
                    );
                    sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Run the whole stage. Never fails: item errors land in the report and
    /// a missing credential marks the stage as skipped.
    pub async fn run(&self, store: &dyn SeriesStore, range: &DateRange, cancel: &CancellationToken) -> StageReport {
        let mut report = StageReport::empty(self.source.kind());

        if let Err(auth) = self.source.check_credentials() {
            warn!(provider = self.source.name(), reason = %auth.reason, "Skipping provider stage");
            report.skipped = Some(auth);
            return report;
        }

        info!(provider = self.source.name(), requests = self.requests.len(), "Starting provider stage");

        let outcomes: Vec<(String, Result<usize, FetchError>)> = stream::iter(self.requests.iter())
            .map(|request| async move {
                let dataset_id = request.dataset_id();
                let result = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err(FetchError::Cancelled),
                    r = self.fetch_one(store, request, range) => r,
                };
                (dataset_id, result)
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        for (dataset_id, result) in outcomes {
            match result {
                Ok(count) => {
                    info!(provider = self.source.name(), dataset_id = %dataset_id, points = count, "Stored series");
                    report.points_written += count;
                    report.series_written += 1;
                }
                Err(FetchError::Cancelled) => {
                    report.cancelled = true;
                }
                Err(error) => {
                    warn!(provider = self.source.name(), dataset_id = %dataset_id, error = %error, "Fetch failed, skipping");
                    report.failures.push(ItemFailure { dataset_id, error });
                }
            }
        }

        info!(
            provider = self.source.name(),
            points = report.points_written,
            series = report.series_written,
            failed = report.failures.len(),
            "Provider stage finished"
        );

        report
    }
}
