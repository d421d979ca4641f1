pub mod config;
pub mod core;
pub mod db;
pub mod error;
pub mod fetcher;
pub mod models;

pub use crate::config::RunConfig;
pub use crate::core::orchestrator::IntegrationOrchestrator;
pub use crate::db::{SeriesStore, SqliteSeriesStore};
pub use crate::models::{ConvergenceResult, EconomicSeries, IntegrationRunSummary};
