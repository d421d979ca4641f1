use anyhow::{anyhow, Result};
use econ_convergence_lib::models::ValidationStatus;
use econ_convergence_lib::{db, RunConfig, SeriesStore, SqliteSeriesStore};

#[tokio::main]
async fn main() -> Result<()> {
    let config = RunConfig::from_env()?;

    let status: ValidationStatus = match std::env::args().nth(1) {
        Some(raw) => raw.parse().map_err(|e: String| anyhow!(e))?,
        None => ValidationStatus::Validated,
    };

    if !config.database_path.exists() {
        println!("Database not found at {}", config.database_path.display());
        return Ok(());
    }

    let pool = db::init(&config.database_path).await?;
    let store = SqliteSeriesStore::new(pool);
    let series = store.list_by_status(status).await?;

    println!("{:<30} | {:<10} | {:<10} | {:<8} | {:<12} | {:<12} | {:<25}", "Dataset", "Source", "Status", "Count", "Start", "End", "Last Updated");
    println!("{}", "-".repeat(120));

    for s in &series {
        println!(
            "{:<30} | {:<10} | {:<10} | {:<8} | {:<12} | {:<12} | {:<25}",
            s.dataset_id,
            s.source,
            s.validation_status,
            s.points.len(),
            s.points.first().map(|p| p.date.as_str()).unwrap_or("N/A"),
            s.points.last().map(|p| p.date.as_str()).unwrap_or("N/A"),
            s.last_updated.format("%Y-%m-%d %H:%M:%S").to_string()
        );
    }

    println!("\n{} series with status '{}'", series.len(), status);
    Ok(())
}
