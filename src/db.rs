use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::PersistenceError;
use crate::models::{DataSourceKind, EconomicSeries, SeriesPoint, ValidationStatus};

const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

/// Persistence for named series. Upserts on distinct ids may run
/// concurrently; each upsert is atomic for its key.
#[async_trait]
pub trait SeriesStore: Send + Sync {
    /// Insert or replace the series stored under `dataset_id`.
    async fn upsert(
        &self,
        dataset_id: &str,
        series_name: &str,
        points: Vec<SeriesPoint>,
        source: DataSourceKind,
        status: ValidationStatus,
    ) -> Result<EconomicSeries, PersistenceError>;

    /// All series with `status`, most recently updated first.
    async fn list_by_status(&self, status: ValidationStatus) -> Result<Vec<EconomicSeries>, PersistenceError>;

    async fn get(&self, dataset_id: &str) -> Result<Option<EconomicSeries>, PersistenceError>;
}

pub async fn init(db_path: &Path) -> Result<SqlitePool, PersistenceError> {
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent).map_err(|e| PersistenceError::Database(sqlx::Error::Io(e)))?;
        }
    }

    info!(path = %db_path.display(), "Connecting to SQLite database");

    // Writers queue on the busy handler instead of failing with SQLITE_BUSY
    let options = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(BUSY_TIMEOUT);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    debug!("Running migrations");
    sqlx::migrate!("./migrations").run(&pool).await?;

    info!("Database initialized");
    Ok(pool)
}

/// Single-connection in-memory database. Every connection to `sqlite::memory:`
/// is its own database, so the pool must never open a second one.
pub async fn connect_in_memory() -> Result<SqlitePool, PersistenceError> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;
    Ok(pool)
}

#[derive(Clone)]
pub struct SqliteSeriesStore {
    pool: SqlitePool,
}

impl SqliteSeriesStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn load_points(&self, dataset_id: &str) -> Result<Vec<SeriesPoint>, PersistenceError> {
        let rows = sqlx::query(
            "SELECT date, value FROM series_points WHERE dataset_id = $1 ORDER BY seq ASC"
        )
        .bind(dataset_id)
        .fetch_all(&self.pool)
        .await?;

        let mut points = Vec::with_capacity(rows.len());
        for row in rows {
            points.push(SeriesPoint {
                date: row.try_get("date")?,
                value: row.try_get("value")?,
            });
        }
        Ok(points)
    }

    async fn hydrate(&self, row: sqlx::sqlite::SqliteRow) -> Result<EconomicSeries, PersistenceError> {
        let dataset_id: String = row.try_get("dataset_id")?;
        let series_name: String = row.try_get("series_name")?;
        let source_raw: String = row.try_get("source")?;
        let status_raw: String = row.try_get("validation_status")?;
        let last_updated_us: i64 = row.try_get("last_updated")?;

        let corrupt = |reason: String| PersistenceError::Corrupt {
            dataset_id: dataset_id.clone(),
            reason,
        };

        let source = source_raw.parse::<DataSourceKind>().map_err(corrupt)?;
        let validation_status = status_raw.parse::<ValidationStatus>().map_err(corrupt)?;
        let last_updated = micros_to_datetime(last_updated_us)
            .ok_or_else(|| corrupt(format!("timestamp {} out of range", last_updated_us)))?;

        let points = self.load_points(&dataset_id).await?;

        Ok(EconomicSeries {
            dataset_id,
            series_name,
            points,
            source,
            validation_status,
            last_updated,
        })
    }
}

#[async_trait]
impl SeriesStore for SqliteSeriesStore {
    async fn upsert(
        &self,
        dataset_id: &str,
        series_name: &str,
        points: Vec<SeriesPoint>,
        source: DataSourceKind,
        status: ValidationStatus,
    ) -> Result<EconomicSeries, PersistenceError> {
        let now_us = Utc::now().timestamp_micros();
        let mut tx = self.pool.begin().await?;

        // 1. Upsert the series row. The first statement is a write, so the
        // transaction takes the write lock up front. lastUpdated moves
        // forward even if the clock has not.
        let stored_us: i64 = sqlx::query_scalar(
            "INSERT INTO economic_series (dataset_id, series_name, source, validation_status, last_updated)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (dataset_id) DO UPDATE
             SET series_name = excluded.series_name,
                 source = excluded.source,
                 validation_status = excluded.validation_status,
                 last_updated = MAX(excluded.last_updated, economic_series.last_updated + 1)
             RETURNING last_updated"
        )
        .bind(dataset_id)
        .bind(series_name)
        .bind(source.as_str())
        .bind(status.as_str())
        .bind(now_us)
        .fetch_one(&mut *tx)
        .await?;

        // 2. Replace the points wholesale
        sqlx::query("DELETE FROM series_points WHERE dataset_id = $1")
            .bind(dataset_id)
            .execute(&mut *tx)
            .await?;

        for (seq, point) in points.iter().enumerate() {
            sqlx::query(
                "INSERT INTO series_points (dataset_id, seq, date, value) VALUES ($1, $2, $3, $4)"
            )
            .bind(dataset_id)
            .bind(seq as i64)
            .bind(&point.date)
            .bind(point.value)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        let last_updated = micros_to_datetime(stored_us).ok_or_else(|| PersistenceError::Corrupt {
            dataset_id: dataset_id.to_string(),
            reason: format!("timestamp {} out of range", stored_us),
        })?;

        debug!(dataset_id, points = points.len(), status = %status, "Upserted series");

        Ok(EconomicSeries {
            dataset_id: dataset_id.to_string(),
            series_name: series_name.to_string(),
            points,
            source,
            validation_status: status,
            last_updated,
        })
    }

    async fn list_by_status(&self, status: ValidationStatus) -> Result<Vec<EconomicSeries>, PersistenceError> {
        let rows = sqlx::query(
            r#"
            SELECT dataset_id, series_name, source, validation_status, last_updated
            FROM economic_series
            WHERE validation_status = $1
            ORDER BY last_updated DESC, dataset_id ASC
            "#
        )
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;

        let mut result = Vec::with_capacity(rows.len());
        for row in rows {
            result.push(self.hydrate(row).await?);
        }
        Ok(result)
    }

    async fn get(&self, dataset_id: &str) -> Result<Option<EconomicSeries>, PersistenceError> {
        let row = sqlx::query(
            "SELECT dataset_id, series_name, source, validation_status, last_updated
             FROM economic_series WHERE dataset_id = $1"
        )
        .bind(dataset_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(self.hydrate(row).await?)),
            None => Ok(None),
        }
    }
}

fn micros_to_datetime(micros: i64) -> Option<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_micros(micros)
}
