//! In-memory implementation of the job store for tests and embedded use.
//!
//! Supports time manipulation through [`MockClock`] so delayed scheduling
//! and staleness behavior can be tested deterministically without a
//! database connection.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;

use super::{JobStore, MetricsSnapshot, StatusPatch};
use crate::error::TaskmillError;
use crate::job::{transition_allowed, AttemptRecord, Job, JobId, JobStatus};
use crate::Result;

/// Controllable clock for deterministic tests.
///
/// ```rust
/// use taskmill::store::MockClock;
/// use chrono::Duration;
///
/// let clock = MockClock::new();
/// let start = clock.now();
/// clock.advance(Duration::minutes(30));
/// assert_eq!((clock.now() - start).num_minutes(), 30);
/// ```
#[derive(Clone, Debug)]
pub struct MockClock {
    current: Arc<Mutex<DateTime<Utc>>>,
}

impl MockClock {
    pub fn new() -> Self {
        Self {
            current: Arc::new(Mutex::new(Utc::now())),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        *self.current.lock().unwrap()
    }

    pub fn advance(&self, duration: chrono::Duration) {
        let mut time = self.current.lock().unwrap();
        *time += duration;
    }
}

impl Default for MockClock {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
struct MetricRow {
    #[allow(dead_code)]
    name: String,
    #[allow(dead_code)]
    value: f64,
    #[allow(dead_code)]
    metadata: Option<serde_json::Value>,
    #[allow(dead_code)]
    recorded_at: DateTime<Utc>,
}

#[derive(Default)]
struct Inner {
    jobs: HashMap<JobId, Job>,
    results: Vec<AttemptRecord>,
    metrics: Vec<MetricRow>,
}

/// In-memory [`JobStore`] implementation.
pub struct MemoryStore {
    inner: RwLock<Inner>,
    clock: Option<MockClock>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            clock: None,
        }
    }

    pub fn with_clock(clock: MockClock) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            clock: Some(clock),
        }
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.as_ref().map(MockClock::now).unwrap_or_else(Utc::now)
    }

    fn apply(job: &mut Job, status: JobStatus, patch: &StatusPatch, now: DateTime<Utc>) {
        job.status = status;
        job.updated_at = now;
        if let Some(at) = patch.started_at {
            job.started_at = Some(at);
        }
        if let Some(at) = patch.completed_at {
            job.completed_at = Some(at);
        }
        if let Some(at) = patch.failed_at {
            job.failed_at = Some(at);
        }
        job.scheduled_at = if status == JobStatus::Delayed {
            patch.scheduled_at.or(job.scheduled_at)
        } else {
            None
        };
        if let Some(attempts) = patch.attempts {
            job.attempts = attempts;
        }
        if let Some(progress) = patch.progress {
            job.progress = progress;
        }
        if let Some(result) = &patch.result {
            job.result = Some(result.clone());
        }
        if let Some(error) = &patch.last_error {
            job.last_error = Some(error.clone());
        }
    }

    fn transition(
        inner: &mut Inner,
        id: JobId,
        status: JobStatus,
        patch: &StatusPatch,
        now: DateTime<Utc>,
    ) -> Result<Job> {
        let job = inner
            .jobs
            .get_mut(&id)
            .ok_or_else(|| TaskmillError::JobNotFound { id: id.to_string() })?;
        if !transition_allowed(job.status, status) {
            return Err(TaskmillError::InvalidTransition {
                from: job.status.to_string(),
                to: status.to_string(),
            });
        }
        Self::apply(job, status, patch, now);
        Ok(job.clone())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn create(&self, job: &Job) -> Result<()> {
        let mut inner = self.inner.write().await;
        if inner.jobs.contains_key(&job.id) {
            return Err(TaskmillError::Conflict {
                id: job.id.to_string(),
            });
        }
        inner.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>> {
        let inner = self.inner.read().await;
        Ok(inner.jobs.get(&id).cloned())
    }

    async fn update_status(
        &self,
        id: JobId,
        status: JobStatus,
        patch: StatusPatch,
    ) -> Result<Job> {
        let now = self.now();
        let mut inner = self.inner.write().await;
        Self::transition(&mut inner, id, status, &patch, now)
    }

    async fn update_status_with_result(
        &self,
        id: JobId,
        status: JobStatus,
        patch: StatusPatch,
        attempt: AttemptRecord,
    ) -> Result<Job> {
        let now = self.now();
        let mut inner = self.inner.write().await;
        // Both writes happen under one lock guard, mirroring the single
        // transaction of the relational store.
        let job = Self::transition(&mut inner, id, status, &patch, now)?;
        inner.results.push(attempt);
        Ok(job)
    }

    async fn list_by_status(&self, status: JobStatus, limit: u32) -> Result<Vec<Job>> {
        let inner = self.inner.read().await;
        let mut jobs: Vec<Job> = inner
            .jobs
            .values()
            .filter(|j| j.status == status)
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.created_at);
        jobs.truncate(limit as usize);
        Ok(jobs)
    }

    async fn append_result(&self, record: &AttemptRecord) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.results.push(record.clone());
        Ok(())
    }

    async fn results_for(&self, job_id: JobId) -> Result<Vec<AttemptRecord>> {
        let inner = self.inner.read().await;
        Ok(inner
            .results
            .iter()
            .filter(|r| r.job_id == job_id)
            .cloned()
            .collect())
    }

    async fn record_metric(
        &self,
        name: &str,
        value: f64,
        metadata: Option<serde_json::Value>,
    ) -> Result<()> {
        let now = self.now();
        let mut inner = self.inner.write().await;
        inner.metrics.push(MetricRow {
            name: name.to_string(),
            value,
            metadata,
            recorded_at: now,
        });
        Ok(())
    }

    async fn metrics_snapshot(&self) -> Result<MetricsSnapshot> {
        let inner = self.inner.read().await;
        let total = inner.jobs.len() as u64;
        let mut completed = 0u64;
        let mut failed = 0u64;
        let mut pending = 0u64;
        let mut processing_secs = 0.0f64;

        for job in inner.jobs.values() {
            match job.status {
                JobStatus::Completed => {
                    completed += 1;
                    if let (Some(started), Some(done)) = (job.started_at, job.completed_at) {
                        processing_secs += (done - started).num_milliseconds() as f64 / 1000.0;
                    }
                }
                JobStatus::Failed | JobStatus::Dead => failed += 1,
                JobStatus::Waiting | JobStatus::Active | JobStatus::Delayed => pending += 1,
                JobStatus::Paused => {}
            }
        }

        let avg = if completed == 0 {
            0.0
        } else {
            processing_secs / completed as f64
        };
        Ok(MetricsSnapshot::finish(total, completed, failed, pending, avg))
    }

    async fn prune(&self, job_type: &str, keep_completed: u64, keep_failed: u64) -> Result<u64> {
        let mut inner = self.inner.write().await;

        let trim = |statuses: &[JobStatus], keep: u64| -> Vec<JobId> {
            let mut rows: Vec<(DateTime<Utc>, JobId)> = inner
                .jobs
                .values()
                .filter(|j| j.job_type == job_type && statuses.contains(&j.status))
                .map(|j| {
                    let finished = j
                        .completed_at
                        .or(j.failed_at)
                        .unwrap_or(j.updated_at);
                    (finished, j.id)
                })
                .collect();
            rows.sort_by(|a, b| b.0.cmp(&a.0));
            rows.into_iter().skip(keep as usize).map(|(_, id)| id).collect()
        };

        let mut doomed = trim(&[JobStatus::Completed], keep_completed);
        doomed.extend(trim(&[JobStatus::Failed, JobStatus::Dead], keep_failed));

        let removed = doomed.len() as u64;
        for id in doomed {
            inner.jobs.remove(&id);
        }
        Ok(removed)
    }
}
