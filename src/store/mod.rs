//! Durable persistence for job records, attempt history, and metrics.
//!
//! The [`JobStore`] trait is the seam between the lifecycle coordinator and
//! the storage backend. [`postgres::PostgresStore`] is the production
//! implementation; [`memory::MemoryStore`] implements the same contract
//! in-memory for tests and embedded use.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::job::{AttemptRecord, Job, JobId, JobStatus};
use crate::Result;

pub mod memory;
pub mod postgres;

pub use memory::{MemoryStore, MockClock};
pub use postgres::PostgresStore;

/// Field updates applied together with a status transition.
///
/// Unset fields keep their current value. `scheduled_at` is only meaningful
/// while a job is `delayed`; implementations clear it on any transition to a
/// non-delayed status.
#[derive(Debug, Default, Clone)]
pub struct StatusPatch {
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub attempts: Option<u32>,
    pub progress: Option<u8>,
    pub result: Option<serde_json::Value>,
    pub last_error: Option<String>,
}

impl StatusPatch {
    pub fn started_at(mut self, at: DateTime<Utc>) -> Self {
        self.started_at = Some(at);
        self
    }

    pub fn completed_at(mut self, at: DateTime<Utc>) -> Self {
        self.completed_at = Some(at);
        self
    }

    pub fn failed_at(mut self, at: DateTime<Utc>) -> Self {
        self.failed_at = Some(at);
        self
    }

    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    pub fn attempts(mut self, attempts: u32) -> Self {
        self.attempts = Some(attempts);
        self
    }

    pub fn progress(mut self, progress: u8) -> Self {
        self.progress = Some(progress.min(100));
        self
    }

    pub fn result(mut self, result: serde_json::Value) -> Self {
        self.result = Some(result);
        self
    }

    pub fn last_error(mut self, error: impl Into<String>) -> Self {
        self.last_error = Some(error.into());
        self
    }
}

/// Aggregate counters derived from the jobs table.
///
/// `pending` counts `waiting + active + delayed`; `failed` counts terminal
/// and parked failures (`failed + dead`). The success rate is 0 when no job
/// has finished yet.
#[derive(Debug, Clone, Copy, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub total: u64,
    pub completed: u64,
    pub failed: u64,
    pub pending: u64,
    pub avg_processing_seconds: f64,
    pub success_rate_pct: f64,
}

impl MetricsSnapshot {
    pub(crate) fn finish(
        total: u64,
        completed: u64,
        failed: u64,
        pending: u64,
        avg_processing_seconds: f64,
    ) -> Self {
        let finished = completed + failed;
        let success_rate_pct = if finished == 0 {
            0.0
        } else {
            100.0 * completed as f64 / finished as f64
        };
        Self {
            total,
            completed,
            failed,
            pending,
            avg_processing_seconds,
            success_rate_pct,
        }
    }
}

/// Durable job storage contract.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Inserts a new job row. Fails with `Conflict` when the id exists.
    async fn create(&self, job: &Job) -> Result<()>;

    async fn get(&self, id: JobId) -> Result<Option<Job>>;

    /// Atomically updates `status`, `updated_at`, and the patched fields.
    /// Transitions not permitted by the state machine are rejected with
    /// `InvalidTransition`; a missing job yields `JobNotFound`. Returns the
    /// updated row.
    async fn update_status(&self, id: JobId, status: JobStatus, patch: StatusPatch)
        -> Result<Job>;

    /// Same as [`update_status`](JobStore::update_status) but commits the
    /// attempt record in the same transaction.
    async fn update_status_with_result(
        &self,
        id: JobId,
        status: JobStatus,
        patch: StatusPatch,
        attempt: AttemptRecord,
    ) -> Result<Job>;

    async fn list_by_status(&self, status: JobStatus, limit: u32) -> Result<Vec<Job>>;

    /// Appends one per-attempt history row.
    async fn append_result(&self, record: &AttemptRecord) -> Result<()>;

    async fn results_for(&self, job_id: JobId) -> Result<Vec<AttemptRecord>>;

    /// Records a named numeric observation in the metrics history table.
    async fn record_metric(
        &self,
        name: &str,
        value: f64,
        metadata: Option<serde_json::Value>,
    ) -> Result<()>;

    async fn metrics_snapshot(&self) -> Result<MetricsSnapshot>;

    /// Deletes completed rows beyond `keep_completed` and failed/dead rows
    /// beyond `keep_failed` for one queue type, newest first retained.
    /// Returns the number of deleted rows.
    async fn prune(&self, job_type: &str, keep_completed: u64, keep_failed: u64) -> Result<u64>;
}

/// Statuses from which a transition into `to` is legal. Used by store
/// implementations for the server-side transition check.
pub(crate) fn allowed_sources(to: JobStatus) -> &'static [JobStatus] {
    use JobStatus::*;
    match to {
        Active => &[Waiting, Active],
        Completed => &[Active],
        Delayed => &[Active],
        Failed => &[Active],
        Dead => &[Active, Failed],
        Waiting => &[Delayed, Failed, Paused],
        Paused => &[Waiting, Delayed, Failed],
    }
}
