use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use tracing::{debug, info};

use crate::config::PersistenceConfig;
use crate::error::StoreError;
use crate::job::{JobId, JobRecord, JobStatus, JobType, OrderId};
use crate::report::{MetricSet, Report, ReportId, ReportWindow};
use crate::state::TransitionGuard;

use super::{CasOutcome, JobStore, ReportStore};

const SCHEMA: &str = include_str!("../../migrations/001_initial_schema.sql");

const JOB_COLUMNS: &str = r#"
    id, order_id, provider_id, job_type, payload, status, attempts,
    max_attempts, cancel_requested, version, created_at, updated_at,
    started_at, finished_at, next_attempt_at, last_error, result
"#;

/// PostgreSQL-backed job and report store.
///
/// Guarded writes are a single `UPDATE ... WHERE status = $ AND version = $`,
/// so concurrent workers never need row locks held across a provider call.
#[derive(Clone, Debug)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Create a store over an existing pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open a pool with the given settings.
    pub async fn connect(config: &PersistenceConfig) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_seconds))
            .connect(&config.connection_string)
            .await?;
        Ok(Self::new(pool))
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the tables and indexes if they do not exist.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        info!("tally schema is up to date");
        Ok(())
    }

    fn job_from_row(row: &PgRow) -> Result<JobRecord, StoreError> {
        let status: String = row.try_get("status")?;
        let job_type: String = row.try_get("job_type")?;
        let attempts: i32 = row.try_get("attempts")?;
        let max_attempts: i32 = row.try_get("max_attempts")?;
        let version: i64 = row.try_get("version")?;

        Ok(JobRecord {
            id: JobId(row.try_get("id")?),
            order_id: OrderId::new(row.try_get::<String, _>("order_id")?),
            provider_id: row.try_get::<String, _>("provider_id")?.into(),
            job_type: JobType::parse(&job_type).ok_or_else(|| {
                StoreError::Corrupt(format!("unknown job type {job_type:?}"))
            })?,
            payload: row.try_get("payload")?,
            status: JobStatus::parse(&status).ok_or_else(|| {
                StoreError::Corrupt(format!("unknown job status {status:?}"))
            })?,
            attempts: u32::try_from(attempts).map_err(|_| {
                StoreError::Corrupt(format!("negative attempts {attempts}"))
            })?,
            max_attempts: u32::try_from(max_attempts).map_err(|_| {
                StoreError::Corrupt(format!("negative max_attempts {max_attempts}"))
            })?,
            cancel_requested: row.try_get("cancel_requested")?,
            version: u64::try_from(version).map_err(|_| {
                StoreError::Corrupt(format!("negative version {version}"))
            })?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            started_at: row.try_get("started_at")?,
            finished_at: row.try_get("finished_at")?,
            next_attempt_at: row.try_get("next_attempt_at")?,
            last_error: row.try_get("last_error")?,
            result: row.try_get("result")?,
        })
    }

    fn report_from_row(row: &PgRow) -> Result<Report, StoreError> {
        let start: DateTime<Utc> = row.try_get("window_start")?;
        let end: DateTime<Utc> = row.try_get("window_end")?;
        let window = ReportWindow::new(start, end)
            .map_err(|err| StoreError::Corrupt(err.to_string()))?;
        let metrics: MetricSet = serde_json::from_value(row.try_get("metrics")?)?;
        let source_job_count: i64 = row.try_get("source_job_count")?;

        Ok(Report {
            id: ReportId(row.try_get("id")?),
            window,
            metrics,
            generated_at: row.try_get("generated_at")?,
            source_job_count: u64::try_from(source_job_count).unwrap_or_default(),
        })
    }

    fn jobs_from_rows(rows: &[PgRow]) -> Result<Vec<JobRecord>, StoreError> {
        rows.iter().map(Self::job_from_row).collect()
    }
}

fn to_i32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

#[async_trait]
impl JobStore for PostgresStore {
    async fn insert_job(&self, job: &JobRecord) -> Result<(), StoreError> {
        let res = sqlx::query(
            r#"
            INSERT INTO tally_jobs (
                id, order_id, provider_id, job_type, payload, status, attempts,
                max_attempts, cancel_requested, version, created_at, updated_at,
                started_at, finished_at, next_attempt_at, last_error, result
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            "#,
        )
        .bind(job.id.0)
        .bind(job.order_id.as_str())
        .bind(job.provider_id.as_str())
        .bind(job.job_type.as_str())
        .bind(&job.payload)
        .bind(job.status.as_str())
        .bind(to_i32(job.attempts))
        .bind(to_i32(job.max_attempts))
        .bind(job.cancel_requested)
        .bind(to_i64(job.version))
        .bind(job.created_at)
        .bind(job.updated_at)
        .bind(job.started_at)
        .bind(job.finished_at)
        .bind(job.next_attempt_at)
        .bind(&job.last_error)
        .bind(&job.result)
        .execute(&self.pool)
        .await;

        match res {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => Err(
                StoreError::Corrupt(format!("job {} already exists", job.id)),
            ),
            Err(err) => Err(err.into()),
        }
    }

    async fn get_job(&self, id: JobId) -> Result<Option<JobRecord>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM tally_jobs WHERE id = $1"
        ))
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::job_from_row).transpose()
    }

    async fn compare_and_swap(
        &self,
        guard: &TransitionGuard,
        next: &JobRecord,
    ) -> Result<CasOutcome, StoreError> {
        let updated = sqlx::query(
            r#"
            UPDATE tally_jobs
            SET status = $4,
                attempts = $5,
                max_attempts = $6,
                cancel_requested = $7,
                version = $8,
                updated_at = $9,
                started_at = $10,
                finished_at = $11,
                next_attempt_at = $12,
                last_error = $13,
                result = $14
            WHERE id = $1
              AND status = $2
              AND version = $3
            "#,
        )
        .bind(guard.job_id.0)
        .bind(guard.status.as_str())
        .bind(to_i64(guard.version))
        .bind(next.status.as_str())
        .bind(to_i32(next.attempts))
        .bind(to_i32(next.max_attempts))
        .bind(next.cancel_requested)
        .bind(to_i64(next.version))
        .bind(next.updated_at)
        .bind(next.started_at)
        .bind(next.finished_at)
        .bind(next.next_attempt_at)
        .bind(&next.last_error)
        .bind(&next.result)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() > 0 {
            return Ok(CasOutcome::Applied);
        }

        let current = self.get_job(guard.job_id).await?;
        debug!(
            job_id = %guard.job_id,
            expected_status = %guard.status,
            expected_version = guard.version,
            "guarded update matched no row"
        );
        Ok(CasOutcome::Stale { current })
    }

    async fn jobs_for_order(
        &self,
        order_id: &OrderId,
    ) -> Result<Vec<JobRecord>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM tally_jobs WHERE order_id = $1 ORDER BY created_at, id"
        ))
        .bind(order_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        Self::jobs_from_rows(&rows)
    }

    async fn jobs_updated_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<JobRecord>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM tally_jobs
            WHERE updated_at >= $1
              AND updated_at < $2
            ORDER BY updated_at, id
            "#
        ))
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;

        Self::jobs_from_rows(&rows)
    }

    async fn stale_jobs(
        &self,
        statuses: &[JobStatus],
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<JobRecord>, StoreError> {
        let statuses: Vec<String> =
            statuses.iter().map(|s| s.as_str().to_string()).collect();
        let rows = sqlx::query(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM tally_jobs
            WHERE status = ANY($1)
              AND updated_at < $2
            ORDER BY updated_at, id
            "#
        ))
        .bind(&statuses)
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        Self::jobs_from_rows(&rows)
    }
}

#[async_trait]
impl ReportStore for PostgresStore {
    async fn insert_report(&self, report: &Report) -> Result<(), StoreError> {
        let metrics = serde_json::to_value(&report.metrics)?;
        sqlx::query(
            r#"
            INSERT INTO tally_reports (
                id, window_start, window_end, metrics, generated_at, source_job_count
            )
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(report.id.0)
        .bind(report.window.start())
        .bind(report.window.end())
        .bind(metrics)
        .bind(report.generated_at)
        .bind(to_i64(report.source_job_count))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_reports(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Report>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, window_start, window_end, metrics, generated_at, source_job_count
            FROM tally_reports
            WHERE window_start >= $1
              AND window_end <= $2
            ORDER BY window_start, generated_at, id
            "#,
        )
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::report_from_row).collect()
    }
}

