use anyhow::Result;
use econ_convergence_lib::{db, IntegrationOrchestrator, RunConfig, SqliteSeriesStore};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "econ_convergence_lib=info,run_integration=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // 0. Config (credentials included) comes from the environment / .env
    let config = RunConfig::from_env()?;
    info!(
        database = %config.database_path.display(),
        worldbank_requests = config.worldbank_requests().len(),
        fred_requests = config.fred_requests().len(),
        fred_key_present = config.fred_api_key.is_some(),
        "Loaded configuration"
    );

    // 1. Store
    let pool = db::init(&config.database_path).await?;
    let store = Arc::new(SqliteSeriesStore::new(pool));

    // 2. Pipeline
    let orchestrator = IntegrationOrchestrator::from_config(&config, store)?;

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling run");
            interrupt.cancel();
        }
    });

    let summary = orchestrator.run(cancel).await;

    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
