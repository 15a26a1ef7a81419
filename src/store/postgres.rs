//! Postgres implementation of the job store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{FromRow, PgConnection, PgPool, Row};

use super::{allowed_sources, JobStore, MetricsSnapshot, StatusPatch};
use crate::config::StoreConfig;
use crate::error::TaskmillError;
use crate::job::{AttemptRecord, Job, JobId, JobStatus, Priority};
use crate::Result;

const JOB_COLUMNS: &str = "id, job_type, priority, payload, status, attempts, max_retries, \
     progress, created_at, updated_at, started_at, completed_at, failed_at, scheduled_at, \
     last_error, result";

#[derive(FromRow)]
struct JobRow {
    id: uuid::Uuid,
    job_type: String,
    priority: i32,
    payload: serde_json::Value,
    status: String,
    attempts: i32,
    max_retries: i32,
    progress: i32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    failed_at: Option<DateTime<Utc>>,
    scheduled_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    result: Option<serde_json::Value>,
}

impl JobRow {
    fn into_job(self) -> Result<Job> {
        Ok(Job {
            id: self.id,
            job_type: self.job_type,
            priority: Priority::new(self.priority)?,
            payload: self.payload,
            status: self.status.parse()?,
            attempts: self.attempts.max(0) as u32,
            max_retries: self.max_retries.max(0) as u32,
            progress: self.progress.clamp(0, 100) as u8,
            created_at: self.created_at,
            updated_at: self.updated_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
            failed_at: self.failed_at,
            scheduled_at: self.scheduled_at,
            last_error: self.last_error,
            result: self.result,
        })
    }
}

#[derive(FromRow)]
struct ResultRow {
    job_id: uuid::Uuid,
    success: bool,
    data: Option<serde_json::Value>,
    error: Option<String>,
    duration_ms: i64,
    attempt_no: i32,
    recorded_at: DateTime<Utc>,
}

impl ResultRow {
    fn into_record(self) -> AttemptRecord {
        AttemptRecord {
            job_id: self.job_id,
            success: self.success,
            data: self.data,
            error: self.error,
            duration_ms: self.duration_ms.max(0) as u64,
            attempt_no: self.attempt_no.max(0) as u32,
            recorded_at: self.recorded_at,
        }
    }
}

/// Durable store backed by a Postgres connection pool.
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connects with the configured pool bound and runs schema setup.
    pub async fn connect(config: &StoreConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.url())
            .await?;
        crate::migrations::run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn transition_on(
        conn: &mut PgConnection,
        id: JobId,
        status: JobStatus,
        patch: &StatusPatch,
    ) -> Result<Job> {
        let sources: Vec<String> = allowed_sources(status)
            .iter()
            .map(|s| s.as_str().to_string())
            .collect();

        let sql = format!(
            r#"
            UPDATE jobs SET
                status = $2,
                updated_at = NOW(),
                started_at = COALESCE($3, started_at),
                completed_at = COALESCE($4, completed_at),
                failed_at = COALESCE($5, failed_at),
                scheduled_at = CASE WHEN $2 = 'delayed'
                    THEN COALESCE($6, scheduled_at) ELSE NULL END,
                attempts = COALESCE($7, attempts),
                progress = COALESCE($8, progress),
                result = COALESCE($9, result),
                last_error = COALESCE($10, last_error)
            WHERE id = $1 AND status = ANY($11)
            RETURNING {JOB_COLUMNS}
            "#
        );

        let row: Option<JobRow> = sqlx::query_as(&sql)
            .bind(id)
            .bind(status.as_str())
            .bind(patch.started_at)
            .bind(patch.completed_at)
            .bind(patch.failed_at)
            .bind(patch.scheduled_at)
            .bind(patch.attempts.map(|a| a as i32))
            .bind(patch.progress.map(|p| p as i32))
            .bind(patch.result.as_ref())
            .bind(patch.last_error.as_ref())
            .bind(&sources)
            .fetch_optional(&mut *conn)
            .await?;

        match row {
            Some(row) => row.into_job(),
            None => {
                // Distinguish a missing row from a forbidden transition.
                let current: Option<String> =
                    sqlx::query_scalar("SELECT status FROM jobs WHERE id = $1")
                        .bind(id)
                        .fetch_optional(&mut *conn)
                        .await?;
                match current {
                    Some(from) => Err(TaskmillError::InvalidTransition {
                        from,
                        to: status.to_string(),
                    }),
                    None => Err(TaskmillError::JobNotFound { id: id.to_string() }),
                }
            }
        }
    }

    async fn insert_result(conn: &mut PgConnection, record: &AttemptRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO job_results (job_id, success, data, error, duration_ms, attempt_no, recorded_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(record.job_id)
        .bind(record.success)
        .bind(record.data.as_ref())
        .bind(record.error.as_ref())
        .bind(record.duration_ms as i64)
        .bind(record.attempt_no as i32)
        .bind(record.recorded_at)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl JobStore for PostgresStore {
    async fn create(&self, job: &Job) -> Result<()> {
        let outcome = sqlx::query(
            r#"
            INSERT INTO jobs
            (id, job_type, priority, payload, status, attempts, max_retries, progress,
             created_at, updated_at, started_at, completed_at, failed_at, scheduled_at,
             last_error, result)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            "#,
        )
        .bind(job.id)
        .bind(&job.job_type)
        .bind(job.priority.get() as i32)
        .bind(&job.payload)
        .bind(job.status.as_str())
        .bind(job.attempts as i32)
        .bind(job.max_retries as i32)
        .bind(job.progress as i32)
        .bind(job.created_at)
        .bind(job.updated_at)
        .bind(job.started_at)
        .bind(job.completed_at)
        .bind(job.failed_at)
        .bind(job.scheduled_at)
        .bind(&job.last_error)
        .bind(&job.result)
        .execute(&self.pool)
        .await;

        match outcome {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.code().as_deref() == Some("23505") => {
                Err(TaskmillError::Conflict {
                    id: job.id.to_string(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1");
        let row: Option<JobRow> = sqlx::query_as(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(JobRow::into_job).transpose()
    }

    async fn update_status(
        &self,
        id: JobId,
        status: JobStatus,
        patch: StatusPatch,
    ) -> Result<Job> {
        let mut conn = self.pool.acquire().await?;
        Self::transition_on(&mut conn, id, status, &patch).await
    }

    async fn update_status_with_result(
        &self,
        id: JobId,
        status: JobStatus,
        patch: StatusPatch,
        attempt: AttemptRecord,
    ) -> Result<Job> {
        let mut tx = self.pool.begin().await?;
        let job = Self::transition_on(&mut tx, id, status, &patch).await?;
        Self::insert_result(&mut tx, &attempt).await?;
        tx.commit().await?;
        Ok(job)
    }

    async fn list_by_status(&self, status: JobStatus, limit: u32) -> Result<Vec<Job>> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE status = $1 ORDER BY created_at ASC LIMIT $2"
        );
        let rows: Vec<JobRow> = sqlx::query_as(&sql)
            .bind(status.as_str())
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(JobRow::into_job).collect()
    }

    async fn append_result(&self, record: &AttemptRecord) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        Self::insert_result(&mut conn, record).await
    }

    async fn results_for(&self, job_id: JobId) -> Result<Vec<AttemptRecord>> {
        let rows: Vec<ResultRow> = sqlx::query_as(
            r#"
            SELECT job_id, success, data, error, duration_ms, attempt_no, recorded_at
            FROM job_results WHERE job_id = $1 ORDER BY seq ASC
            "#,
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(ResultRow::into_record).collect())
    }

    async fn record_metric(
        &self,
        name: &str,
        value: f64,
        metadata: Option<serde_json::Value>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO system_metrics (name, value, metadata, recorded_at) VALUES ($1, $2, $3, $4)",
        )
        .bind(name)
        .bind(value)
        .bind(metadata)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn metrics_snapshot(&self) -> Result<MetricsSnapshot> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) AS total,
                COUNT(*) FILTER (WHERE status = 'completed') AS completed,
                COUNT(*) FILTER (WHERE status IN ('failed', 'dead')) AS failed,
                COUNT(*) FILTER (WHERE status IN ('waiting', 'active', 'delayed')) AS pending,
                COALESCE(
                    AVG(EXTRACT(EPOCH FROM (completed_at - started_at)))
                        FILTER (WHERE status = 'completed'
                                AND started_at IS NOT NULL
                                AND completed_at IS NOT NULL),
                    0
                )::DOUBLE PRECISION AS avg_seconds
            FROM jobs
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        let total: i64 = row.get("total");
        let completed: i64 = row.get("completed");
        let failed: i64 = row.get("failed");
        let pending: i64 = row.get("pending");
        let avg_seconds: f64 = row.get("avg_seconds");

        Ok(MetricsSnapshot::finish(
            total as u64,
            completed as u64,
            failed as u64,
            pending as u64,
            avg_seconds,
        ))
    }

    async fn prune(&self, job_type: &str, keep_completed: u64, keep_failed: u64) -> Result<u64> {
        let completed = sqlx::query(
            r#"
            DELETE FROM jobs WHERE id IN (
                SELECT id FROM jobs
                WHERE job_type = $1 AND status = 'completed'
                ORDER BY completed_at DESC NULLS LAST
                OFFSET $2
            )
            "#,
        )
        .bind(job_type)
        .bind(keep_completed as i64)
        .execute(&self.pool)
        .await?
        .rows_affected();

        let failed = sqlx::query(
            r#"
            DELETE FROM jobs WHERE id IN (
                SELECT id FROM jobs
                WHERE job_type = $1 AND status IN ('failed', 'dead')
                ORDER BY COALESCE(failed_at, updated_at) DESC
                OFFSET $2
            )
            "#,
        )
        .bind(job_type)
        .bind(keep_failed as i64)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(completed + failed)
    }
}
