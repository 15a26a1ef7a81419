//! Lifecycle coordinator: the single owner of job status mutations.
//!
//! Every transition runs the same sequence: validate, durable update,
//! broker update, side effects. The durable store is authoritative; when a
//! broker step fails after the durable step succeeded the error is logged
//! and the next claim/promote cycle (or boot recovery) restores
//! consistency.

use chrono::Utc;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::broker::Broker;
use crate::error::TaskmillError;
use crate::job::{Job, JobId, JobStatus};
use crate::registry::HandlerRegistry;
use crate::retry::{RetryDecision, RetryPolicy};
use crate::store::{JobStore, StatusPatch};
use crate::Result;

/// Bounded local retries for store and broker calls, per the propagation
/// policy for transient infrastructure errors.
const INFRA_ATTEMPTS: u32 = 3;
const INFRA_BACKOFF: Duration = Duration::from_millis(100);

/// Cancellation signals for attempts currently executing in some worker.
#[derive(Default)]
pub struct InflightTracker {
    map: Mutex<HashMap<JobId, watch::Sender<bool>>>,
}

impl InflightTracker {
    pub fn register(&self, id: JobId) -> watch::Receiver<bool> {
        let (tx, rx) = watch::channel(false);
        self.map.lock().unwrap().insert(id, tx);
        rx
    }

    pub fn complete(&self, id: JobId) {
        self.map.lock().unwrap().remove(&id);
    }

    /// Signals one in-flight attempt. Returns whether the job was running.
    pub fn cancel(&self, id: JobId) -> bool {
        let map = self.map.lock().unwrap();
        match map.get(&id) {
            Some(tx) => tx.send(true).is_ok(),
            None => false,
        }
    }

    /// Signals every in-flight attempt; used at shutdown.
    pub fn cancel_all(&self) -> usize {
        let map = self.map.lock().unwrap();
        let mut signalled = 0;
        for tx in map.values() {
            if tx.send(true).is_ok() {
                signalled += 1;
            }
        }
        signalled
    }

    pub fn contains(&self, id: JobId) -> bool {
        self.map.lock().unwrap().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.map.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.lock().unwrap().is_empty()
    }
}

/// Orchestrates state transitions across the store, the broker, and the
/// worker pools.
pub struct JobCoordinator {
    store: Arc<dyn JobStore>,
    broker: Arc<Broker>,
    registry: Arc<HandlerRegistry>,
    inflight: InflightTracker,
}

impl JobCoordinator {
    pub fn new(
        store: Arc<dyn JobStore>,
        broker: Arc<Broker>,
        registry: Arc<HandlerRegistry>,
    ) -> Self {
        Self {
            store,
            broker,
            registry,
            inflight: InflightTracker::default(),
        }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn broker(&self) -> &Arc<Broker> {
        &self.broker
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    pub fn inflight(&self) -> &InflightTracker {
        &self.inflight
    }

    /// Validates and admits a job: durable record first, then the broker.
    pub async fn submit(&self, job: Job) -> Result<JobId> {
        if !self.registry.contains(&job.job_type) {
            return Err(TaskmillError::validation(format!(
                "unknown task type: {}",
                job.job_type
            )));
        }
        if !job.payload.is_null() && !job.payload.is_object() && !job.payload.is_array() {
            return Err(TaskmillError::validation(
                "payload must be a JSON object or array",
            ));
        }

        let delay = match (job.status, job.scheduled_at) {
            (JobStatus::Delayed, Some(due)) => {
                let remaining = (due - Utc::now()).num_milliseconds().max(0) as u64;
                Some(Duration::from_millis(remaining))
            }
            _ => None,
        };

        let id = job.id;
        let job_type = job.job_type.clone();
        let envelope = job.envelope();

        with_infra_retries(|| self.store.create(&job)).await?;
        if let Err(e) = self.broker.enqueue(&job_type, envelope, delay) {
            // The durable row exists and boot recovery will re-insert it;
            // surface the failure so admission can report it.
            error!(job_id = %id, error = %e, "broker enqueue failed after durable create");
            return Err(e);
        }

        debug!(job_id = %id, job_type = %job_type, "job submitted");
        Ok(id)
    }

    /// Transitions a claimed job to `active`, stamping the attempt start,
    /// incrementing the attempt counter, and resetting progress.
    pub async fn mark_active(&self, id: JobId) -> Result<Job> {
        let current = self.job(id).await?;
        let patch = StatusPatch::default()
            .started_at(Utc::now())
            .attempts(current.attempts + 1)
            .progress(0);
        with_infra_retries(|| self.store.update_status(id, JobStatus::Active, patch.clone()))
            .await
    }

    /// Records a successful attempt: terminal status and history row commit
    /// together, then the broker drops the claim.
    pub async fn mark_completed(
        &self,
        id: JobId,
        result: serde_json::Value,
        duration_ms: u64,
    ) -> Result<Job> {
        let current = self.job(id).await?;
        let patch = StatusPatch::default()
            .completed_at(Utc::now())
            .progress(100)
            .result(result.clone());
        let record =
            crate::job::AttemptRecord::success(id, result, duration_ms, current.attempts);

        let job = with_infra_retries(|| {
            self.store.update_status_with_result(
                id,
                JobStatus::Completed,
                patch.clone(),
                record.clone(),
            )
        })
        .await?;

        if let Err(e) = self.broker.ack(&job.job_type, id) {
            warn!(job_id = %id, error = %e, "broker ack failed after completion");
        }
        debug!(job_id = %id, attempts = job.attempts, "job completed");
        Ok(job)
    }

    /// Records a failed attempt and applies the retry decision: another
    /// delayed attempt, or dead-lettering once the budget is exhausted.
    pub async fn mark_failed(
        &self,
        id: JobId,
        error_message: &str,
        duration_ms: u64,
    ) -> Result<RetryDecision> {
        let current = self.job(id).await?;
        let policy = self.policy_for(&current);
        let decision = policy.decide(current.attempts);
        let record = crate::job::AttemptRecord::failure(
            id,
            error_message,
            duration_ms,
            current.attempts,
        );

        match decision {
            RetryDecision::Retry { delay } => {
                let due = Utc::now()
                    + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
                let patch = StatusPatch::default()
                    .scheduled_at(due)
                    .last_error(error_message);
                with_infra_retries(|| {
                    self.store.update_status_with_result(
                        id,
                        JobStatus::Delayed,
                        patch.clone(),
                        record.clone(),
                    )
                })
                .await?;
                if let Err(e) = self.broker.fail(&current.job_type, id, Some(delay)) {
                    warn!(job_id = %id, error = %e, "broker reschedule failed after durable delay");
                }
                info!(
                    job_id = %id,
                    attempt = current.attempts,
                    retry_in_ms = delay.as_millis() as u64,
                    "attempt failed, retry scheduled"
                );
            }
            RetryDecision::Dead => {
                let patch = StatusPatch::default()
                    .failed_at(Utc::now())
                    .last_error(error_message);
                with_infra_retries(|| {
                    self.store.update_status_with_result(
                        id,
                        JobStatus::Dead,
                        patch.clone(),
                        record.clone(),
                    )
                })
                .await?;
                if let Err(e) = self.broker.ack(&current.job_type, id) {
                    warn!(job_id = %id, error = %e, "broker ack failed after dead-letter");
                }
                warn!(job_id = %id, attempts = current.attempts, "job dead-lettered");
            }
        }
        Ok(decision)
    }

    /// Persists a mid-attempt progress value. Races with the terminal
    /// transition are benign and reported as `Ok(false)`.
    pub async fn record_progress(&self, id: JobId, progress: u8) -> Result<bool> {
        match self
            .store
            .update_status(id, JobStatus::Active, StatusPatch::default().progress(progress))
            .await
        {
            Ok(_) => Ok(true),
            Err(TaskmillError::InvalidTransition { .. }) | Err(TaskmillError::JobNotFound { .. }) => {
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Moves due broker entries to `ready` and flips their durable status
    /// back to `waiting`.
    pub async fn promote_due(&self, queue: &str) -> Result<usize> {
        let promoted = self.broker.promote_due(queue, Utc::now())?;
        for id in &promoted {
            if let Err(e) = self
                .store
                .update_status(*id, JobStatus::Waiting, StatusPatch::default())
                .await
            {
                warn!(job_id = %id, error = %e, "durable promotion failed");
            }
        }
        Ok(promoted.len())
    }

    /// Pauses claiming on a queue. Queue-level only; durable job records
    /// and in-flight attempts are untouched.
    pub async fn pause(&self, queue: &str) -> Result<()> {
        self.broker.pause(queue)?;
        info!(queue, "queue paused");
        Ok(())
    }

    pub async fn resume(&self, queue: &str) -> Result<()> {
        self.broker.resume(queue)?;
        info!(queue, "queue resumed");
        Ok(())
    }

    /// Re-enqueues every durably `failed` job (optionally one queue type).
    /// Dead jobs are never touched. Returns the number re-enqueued.
    pub async fn retry_failed(&self, queue: Option<&str>) -> Result<u64> {
        if let Some(name) = queue {
            if !self.broker.contains(name) {
                return Err(TaskmillError::QueueNotFound {
                    name: name.to_string(),
                });
            }
        }

        let failed = with_infra_retries(|| self.store.list_by_status(JobStatus::Failed, 10_000))
            .await?;

        let mut flipped = Vec::new();
        for job in failed {
            if queue.map_or(false, |name| name != job.job_type) {
                continue;
            }
            match self
                .store
                .update_status(job.id, JobStatus::Waiting, StatusPatch::default())
                .await
            {
                Ok(_) => flipped.push(job),
                Err(e) => warn!(job_id = %job.id, error = %e, "retry-failed durable flip failed"),
            }
        }

        let moved = self.broker.retry_all_failed(queue)?;
        debug!(moved, "broker failed entries re-enqueued");

        // Rows that were never in the broker failed set (for example after
        // manual repair) get a fresh envelope.
        for job in &flipped {
            if let Err(e) = self.broker.enqueue(&job.job_type, job.envelope(), None) {
                match e {
                    TaskmillError::Broker { .. } => {}
                    other => {
                        warn!(job_id = %job.id, error = %other, "retry-failed enqueue failed")
                    }
                }
            }
        }

        let count = flipped.len() as u64;
        info!(count, queue = queue.unwrap_or("*"), "failed jobs re-enqueued");
        Ok(count)
    }

    /// Signals cancellation on an in-flight attempt.
    pub async fn cancel(&self, id: JobId) -> Result<()> {
        if self.inflight.cancel(id) {
            info!(job_id = %id, "cancellation signalled");
            Ok(())
        } else {
            Err(TaskmillError::JobNotFound { id: id.to_string() })
        }
    }

    pub async fn job(&self, id: JobId) -> Result<Job> {
        with_infra_retries(|| self.store.get(id))
            .await?
            .ok_or_else(|| TaskmillError::JobNotFound { id: id.to_string() })
    }

    /// Retry policy for a job: queue configuration for delay and backoff,
    /// the job row for the retry budget.
    pub fn policy_for(&self, job: &Job) -> RetryPolicy {
        match self.registry.queue_config(&job.job_type) {
            Some(cfg) => RetryPolicy::new(job.max_retries, cfg.retry_delay, cfg.backoff),
            None => RetryPolicy::new(job.max_retries, Duration::from_secs(5), Default::default()),
        }
    }
}

fn is_transient(error: &TaskmillError) -> bool {
    matches!(error, TaskmillError::Database(_))
}

/// Runs a store operation with the bounded transient-error retry policy.
async fn with_infra_retries<T, F, Fut>(op: F) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if is_transient(&e) && attempt + 1 < INFRA_ATTEMPTS => {
                attempt += 1;
                warn!(error = %e, attempt, "transient store error, retrying");
                tokio::time::sleep(INFRA_BACKOFF).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use crate::retry::Backoff;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn coordinator() -> JobCoordinator {
        let mut registry = HandlerRegistry::new();
        registry.register(
            QueueConfig::new("email")
                .with_retry_delay(Duration::from_millis(50))
                .with_backoff(Backoff::Fixed),
            |_envelope, _ctx| async { Ok(json!({})) },
        );
        let registry = Arc::new(registry);
        let broker = Arc::new(Broker::new(["email"]));
        let store: Arc<dyn JobStore> = Arc::new(MemoryStore::new());
        JobCoordinator::new(store, broker, registry)
    }

    #[tokio::test]
    async fn test_submit_validates_type() {
        let c = coordinator();
        let err = c.submit(Job::new("video", json!({}))).await.unwrap_err();
        assert!(matches!(err, TaskmillError::Validation { .. }));
    }

    #[tokio::test]
    async fn test_submit_creates_and_enqueues() {
        let c = coordinator();
        let id = c.submit(Job::new("email", json!({"to": ["a@b"]}))).await.unwrap();

        let job = c.job(id).await.unwrap();
        assert_eq!(job.status, JobStatus::Waiting);
        assert_eq!(c.broker().stats("email").unwrap().ready, 1);
    }

    #[tokio::test]
    async fn test_full_success_cycle() {
        let c = coordinator();
        let id = c.submit(Job::new("email", json!({}))).await.unwrap();

        let claimed = c.broker().claim("email", 1).unwrap();
        assert_eq!(claimed[0].id, id);

        let active = c.mark_active(id).await.unwrap();
        assert_eq!(active.status, JobStatus::Active);
        assert_eq!(active.attempts, 1);
        assert_eq!(active.progress, 0);

        let done = c
            .mark_completed(id, json!({"sent": 1}), 25)
            .await
            .unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.progress, 100);
        assert!(done.result.is_some());

        let depths = c.broker().stats("email").unwrap();
        assert_eq!(depths.active, 0);

        let results = c.store().results_for(id).await.unwrap();
        assert_eq!(results.len(), 1);
        assert!(results[0].success);
    }

    #[tokio::test]
    async fn test_failure_schedules_retry_then_dead() {
        let c = coordinator();
        let id = c
            .submit(Job::new("email", json!({})).with_max_retries(1))
            .await
            .unwrap();

        // Attempt 1 fails: one retry remains.
        c.broker().claim("email", 1).unwrap();
        c.mark_active(id).await.unwrap();
        let decision = c.mark_failed(id, "smtp unreachable", 10).await.unwrap();
        assert!(matches!(decision, RetryDecision::Retry { .. }));

        let job = c.job(id).await.unwrap();
        assert_eq!(job.status, JobStatus::Delayed);
        assert_eq!(job.last_error.as_deref(), Some("smtp unreachable"));
        assert!(job.scheduled_at.is_some());

        // Promote, reclaim, fail again: budget exhausted.
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(c.promote_due("email").await.unwrap(), 1);
        c.broker().claim("email", 1).unwrap();
        c.mark_active(id).await.unwrap();
        let decision = c.mark_failed(id, "smtp unreachable", 10).await.unwrap();
        assert_eq!(decision, RetryDecision::Dead);

        let job = c.job(id).await.unwrap();
        assert_eq!(job.status, JobStatus::Dead);
        assert_eq!(job.attempts, 2);
        assert!(job.failed_at.is_some());

        let results = c.store().results_for(id).await.unwrap();
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| !r.success));
    }

    #[tokio::test]
    async fn test_progress_race_after_terminal_is_benign() {
        let c = coordinator();
        let id = c.submit(Job::new("email", json!({}))).await.unwrap();
        c.broker().claim("email", 1).unwrap();
        c.mark_active(id).await.unwrap();

        assert!(c.record_progress(id, 40).await.unwrap());
        assert_eq!(c.job(id).await.unwrap().progress, 40);

        c.mark_completed(id, json!({}), 5).await.unwrap();
        assert!(!c.record_progress(id, 90).await.unwrap());
        assert_eq!(c.job(id).await.unwrap().progress, 100);
    }

    #[tokio::test]
    async fn test_retry_failed_skips_dead() {
        let c = coordinator();

        // One dead job and two durably failed jobs, built by driving the
        // state machine directly.
        let dead = c
            .submit(Job::new("email", json!({})).with_max_retries(0))
            .await
            .unwrap();
        c.broker().claim("email", 1).unwrap();
        c.mark_active(dead).await.unwrap();
        c.mark_failed(dead, "boom", 1).await.unwrap();

        let mut failed_ids = Vec::new();
        for _ in 0..2 {
            let id = c.submit(Job::new("email", json!({}))).await.unwrap();
            c.broker().claim("email", 1).unwrap();
            c.mark_active(id).await.unwrap();
            c.store()
                .update_status(id, JobStatus::Failed, StatusPatch::default())
                .await
                .unwrap();
            c.broker().fail("email", id, None).unwrap();
            failed_ids.push(id);
        }

        let count = c.retry_failed(None).await.unwrap();
        assert_eq!(count, 2);

        for id in failed_ids {
            assert_eq!(c.job(id).await.unwrap().status, JobStatus::Waiting);
        }
        assert_eq!(c.job(dead).await.unwrap().status, JobStatus::Dead);

        // Idempotence: a second call with no new failures moves nothing.
        assert_eq!(c.retry_failed(None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_cancel_requires_inflight() {
        let c = coordinator();
        let id = c.submit(Job::new("email", json!({}))).await.unwrap();
        assert!(c.cancel(id).await.is_err());

        let mut rx = c.inflight().register(id);
        c.cancel(id).await.unwrap();
        assert!(*rx.borrow_and_update());
    }
}
