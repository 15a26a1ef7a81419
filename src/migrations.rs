//! Schema setup for the Postgres store.

use sqlx::PgPool;

use crate::Result;

const STATEMENTS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS jobs (
        id UUID PRIMARY KEY,
        job_type VARCHAR NOT NULL,
        priority INTEGER NOT NULL DEFAULT 5,
        payload JSONB NOT NULL,
        status VARCHAR NOT NULL,
        attempts INTEGER NOT NULL DEFAULT 0,
        max_retries INTEGER NOT NULL DEFAULT 3,
        progress INTEGER NOT NULL DEFAULT 0,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL,
        started_at TIMESTAMPTZ,
        completed_at TIMESTAMPTZ,
        failed_at TIMESTAMPTZ,
        scheduled_at TIMESTAMPTZ,
        last_error TEXT,
        result JSONB
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs (status)",
    "CREATE INDEX IF NOT EXISTS idx_jobs_type ON jobs (job_type)",
    "CREATE INDEX IF NOT EXISTS idx_jobs_created_at ON jobs (created_at)",
    "CREATE INDEX IF NOT EXISTS idx_jobs_priority ON jobs (priority)",
    "CREATE INDEX IF NOT EXISTS idx_jobs_status_type ON jobs (status, job_type)",
    r#"
    CREATE TABLE IF NOT EXISTS job_results (
        seq BIGSERIAL PRIMARY KEY,
        job_id UUID NOT NULL REFERENCES jobs (id) ON DELETE CASCADE,
        success BOOLEAN NOT NULL,
        data JSONB,
        error TEXT,
        duration_ms BIGINT NOT NULL,
        attempt_no INTEGER NOT NULL,
        recorded_at TIMESTAMPTZ NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_job_results_job_id ON job_results (job_id)",
    r#"
    CREATE TABLE IF NOT EXISTS system_metrics (
        seq BIGSERIAL PRIMARY KEY,
        name VARCHAR NOT NULL,
        value DOUBLE PRECISION NOT NULL,
        metadata JSONB,
        recorded_at TIMESTAMPTZ NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_system_metrics_name ON system_metrics (name, recorded_at)",
];

/// Creates the job, attempt-history, and metrics tables plus the indexes
/// the query paths rely on. Safe to run repeatedly.
pub async fn run(pool: &PgPool) -> Result<()> {
    for statement in STATEMENTS {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}
