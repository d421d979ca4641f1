use futures::future::join_all;
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::RunConfig;
use crate::core::transformer::StabilityTransformer;
use crate::core::validator::ValidatorBridge;
use crate::db::SeriesStore;
use crate::error::{ConfigError, ValidatorProcessError};
use crate::fetcher::fred::FredFetcher;
use crate::fetcher::worldbank::WorldBankFetcher;
use crate::fetcher::SourceFetcher;
use crate::models::{DatasetFailure, DateRange, FailureStage, IntegrationRunSummary, RunPhase};

/// Orchestrator for one end-to-end pass: fetch, transform, validate.
///
/// A run always completes and returns a summary. Stage-level skips become
/// warnings and item-level failures are recorded and left out of the results.
pub struct IntegrationOrchestrator {
    store: Arc<dyn SeriesStore>,
    fetchers: Vec<SourceFetcher>,
    transformer: StabilityTransformer,
    bridge: ValidatorBridge,
    date_range: DateRange,
    validator_concurrency: usize,
}

impl IntegrationOrchestrator {
    pub fn new(
        store: Arc<dyn SeriesStore>,
        fetchers: Vec<SourceFetcher>,
        transformer: StabilityTransformer,
        bridge: ValidatorBridge,
        date_range: DateRange,
    ) -> Self {
        Self {
            store,
            fetchers,
            transformer,
            bridge,
            date_range,
            validator_concurrency: 1,
        }
    }

    /// Wire both providers, the transformer and the bridge from configuration.
    pub fn from_config(config: &RunConfig, store: Arc<dyn SeriesStore>) -> Result<Self, ConfigError> {
        let worldbank = Arc::new(WorldBankFetcher::new(config.worldbank_base_url.clone(), config.page_size));
        let fred = Arc::new(FredFetcher::new(
            config.fred_api_key.clone(),
            config.fred_base_url.clone(),
            config.page_size,
        ));

        let fetchers = vec![
            SourceFetcher::from_config(worldbank, config.worldbank_requests(), config),
            SourceFetcher::from_config(fred, config.fred_requests(), config),
        ];

        let transformer = StabilityTransformer::new(config.min_data_points, config.accuracy_scale)?;
        let bridge = ValidatorBridge::from_config(config)?;

        Ok(Self::new(store, fetchers, transformer, bridge, config.date_range)
            .with_validator_concurrency(config.validator_concurrency))
    }

    pub fn with_validator_concurrency(mut self, concurrency: usize) -> Self {
        self.validator_concurrency = concurrency.max(1);
        self
    }

    pub async fn run(&self, cancel: CancellationToken) -> IntegrationRunSummary {
        let started = Instant::now();
        let run_id = Uuid::new_v4();
        let run_tag = run_id.simple().to_string();

        let mut summary = IntegrationRunSummary {
            run_id,
            total_data_points: 0,
            sources: Vec::new(),
            results: Vec::new(),
            datasets_attempted: 0,
            warnings: Vec::new(),
            failures: Vec::new(),
            phase: RunPhase::Fetching,
            cancelled: false,
            elapsed_ms: 0,
        };

        info!(run_id = %run_id, phase = %summary.phase, providers = self.fetchers.len(), "Integration run started");

        // 1. Fetch: providers run side by side, each behind its own limiter
        let reports = join_all(
            self.fetchers
                .iter()
                .map(|fetcher| fetcher.run(self.store.as_ref(), &self.date_range, &cancel)),
        )
        .await;

        for (fetcher, report) in self.fetchers.iter().zip(reports) {
            if let Some(auth) = report.skipped {
                summary.warnings.push(auth.to_string());
                continue;
            }

            summary.total_data_points += report.points_written;
            if report.points_written > 0 {
                summary.sources.push(fetcher.name().to_string());
            }
            summary.cancelled |= report.cancelled;

            for failure in report.failures {
                summary.failures.push(DatasetFailure {
                    dataset_id: failure.dataset_id,
                    stage: FailureStage::Fetch,
                    message: failure.error.to_string(),
                });
            }
        }

        if cancel.is_cancelled() {
            return finish(summary, started);
        }

        // 2. Transform
        advance(&mut summary, RunPhase::Transforming);
        let transformed = match self.transformer.transform_all(self.store.as_ref()).await {
            Ok(series) => series,
            Err(e) => {
                warn!(error = %e, "Could not read stored series, nothing to validate");
                summary.warnings.push(format!("Failed to read stored series: {}", e));
                Vec::new()
            }
        };

        if cancel.is_cancelled() {
            return finish(summary, started);
        }

        // 3. Validate
        advance(&mut summary, RunPhase::Validating);
        summary.datasets_attempted = transformed.len();

        let run_tag = run_tag.as_str();
        let cancel_ref = &cancel;
        let outcomes: Vec<_> = stream::iter(transformed.iter())
            .map(|series| async move {
                let result = self.bridge.validate(run_tag, series, cancel_ref).await;
                (series.dataset_id.clone(), result)
            })
            .buffered(self.validator_concurrency)
            .collect()
            .await;

        for (dataset_id, outcome) in outcomes {
            match outcome {
                Ok(result) => {
                    info!(
                        dataset_id = %dataset_id,
                        predicted = result.predicted_data_required,
                        actual = result.actual_data_required,
                        successful = result.validation_successful,
                        "Validated series"
                    );
                    summary.results.push(result);
                }
                Err(ValidatorProcessError::Cancelled) => {
                    summary.cancelled = true;
                }
                Err(e) => {
                    warn!(dataset_id = %dataset_id, error = %e, "Validation failed, skipping dataset");
                    summary.failures.push(DatasetFailure {
                        dataset_id,
                        stage: FailureStage::Validate,
                        message: e.to_string(),
                    });
                }
            }
        }

        if cancel.is_cancelled() {
            return finish(summary, started);
        }

        advance(&mut summary, RunPhase::Complete);
        finish(summary, started)
    }
}

fn advance(summary: &mut IntegrationRunSummary, next: RunPhase) {
    info!(run_id = %summary.run_id, from = %summary.phase, to = %next, "Run phase changed");
    summary.phase = next;
}

fn finish(mut summary: IntegrationRunSummary, started: Instant) -> IntegrationRunSummary {
    summary.elapsed_ms = started.elapsed().as_millis() as u64;
    if summary.phase != RunPhase::Complete {
        summary.cancelled = true;
    }

    info!(
        run_id = %summary.run_id,
        phase = %summary.phase,
        points = summary.total_data_points,
        validated = summary.results.len(),
        attempted = summary.datasets_attempted,
        failures = summary.failures.len(),
        cancelled = summary.cancelled,
        elapsed_ms = summary.elapsed_ms,
        "Integration run finished"
    );
    summary
}
