//! Scheduler/dispatcher: per-queue worker pools and background timers.
//!
//! One pool per registered queue type, sized to the configured concurrency.
//! Each worker claims one envelope at a time, drives it through the
//! lifecycle coordinator, and never buffers beyond the claimed envelope.
//! Background tasks promote due delayed jobs, sweep retention, and recover
//! stale `active` rows left behind by crashed processes.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::coordinator::JobCoordinator;
use crate::job::{JobEnvelope, JobStatus};
use crate::registry::HandlerContext;
use crate::retry::RetryDecision;
use crate::store::StatusPatch;
use crate::Result;

/// Runtime knobs for the dispatcher loops.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Cadence of the per-queue delayed-to-ready promotion sweep.
    pub promote_interval: Duration,
    /// Fallback poll interval when the ready signal stays quiet.
    pub poll_interval: Duration,
    /// Ceiling for durable progress writes; intermediate values coalesce.
    pub progress_flush_interval: Duration,
    /// How long shutdown waits for in-flight handlers.
    pub shutdown_grace: Duration,
    /// Age past which a durable `active` row counts as a crashed attempt.
    pub stale_active_after: Duration,
    /// Cadence of the retention sweep.
    pub sweep_interval: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            promote_interval: Duration::from_millis(200),
            poll_interval: Duration::from_millis(100),
            progress_flush_interval: Duration::from_millis(500),
            shutdown_grace: Duration::from_secs(30),
            stale_active_after: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// What boot recovery found and did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Stale active attempts re-scheduled for another run.
    pub requeued: usize,
    /// Stale active attempts whose retry budget was exhausted.
    pub dead_lettered: usize,
    /// Waiting rows re-inserted into the broker ready sets.
    pub reloaded_waiting: usize,
    /// Delayed rows re-inserted with their remaining delay.
    pub reloaded_delayed: usize,
    /// Failed rows re-loaded into the broker failed sets.
    pub reloaded_failed: usize,
}

/// Runs the worker pools and background timers over a coordinator.
pub struct Dispatcher {
    coordinator: Arc<JobCoordinator>,
    config: DispatcherConfig,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Dispatcher {
    pub fn new(coordinator: Arc<JobCoordinator>, config: DispatcherConfig) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            coordinator,
            config,
            shutdown_tx,
            shutdown_rx,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Receiver that flips to `true` once shutdown begins. Used to stop the
    /// HTTP surface alongside the workers.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    /// Rebuilds the broker from durable state and settles stale attempts.
    /// Must run before [`start`](Dispatcher::start).
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();
        let coordinator = &self.coordinator;
        let store = coordinator.store();

        let (requeued, dead_lettered) =
            settle_stale_active(coordinator, self.config.stale_active_after).await?;
        report.requeued = requeued;
        report.dead_lettered = dead_lettered;

        for job in store.list_by_status(JobStatus::Waiting, 100_000).await? {
            match coordinator
                .broker()
                .enqueue(&job.job_type, job.envelope(), None)
            {
                Ok(()) => report.reloaded_waiting += 1,
                Err(e) => warn!(job_id = %job.id, error = %e, "skipping waiting row on recovery"),
            }
        }

        let now = chrono::Utc::now();
        for job in store.list_by_status(JobStatus::Delayed, 100_000).await? {
            let remaining = job
                .scheduled_at
                .map(|due| (due - now).num_milliseconds().max(0) as u64)
                .unwrap_or(0);
            match coordinator.broker().enqueue(
                &job.job_type,
                job.envelope(),
                Some(Duration::from_millis(remaining)),
            ) {
                Ok(()) => report.reloaded_delayed += 1,
                Err(e) => warn!(job_id = %job.id, error = %e, "skipping delayed row on recovery"),
            }
        }

        for job in store.list_by_status(JobStatus::Failed, 100_000).await? {
            match coordinator.broker().load_failed(&job.job_type, job.envelope()) {
                Ok(()) => report.reloaded_failed += 1,
                Err(e) => warn!(job_id = %job.id, error = %e, "skipping failed row on recovery"),
            }
        }

        info!(
            requeued = report.requeued,
            dead_lettered = report.dead_lettered,
            waiting = report.reloaded_waiting,
            delayed = report.reloaded_delayed,
            failed = report.reloaded_failed,
            "broker rebuilt from durable state"
        );

        let reloaded =
            report.reloaded_waiting + report.reloaded_delayed + report.reloaded_failed;
        if let Err(e) = store
            .record_metric(
                "boot_recovery",
                reloaded as f64,
                Some(serde_json::json!({
                    "requeued": report.requeued,
                    "deadLettered": report.dead_lettered,
                })),
            )
            .await
        {
            warn!(error = %e, "could not record recovery metric");
        }

        Ok(report)
    }

    /// Spawns worker pools and background timers for every registered
    /// queue type.
    pub fn start(&self) {
        let mut tasks = self.tasks.lock().unwrap();

        for config in self.coordinator.registry().queue_configs() {
            let queue = config.name.clone();
            for worker_no in 0..config.concurrency {
                tasks.push(tokio::spawn(worker_loop(
                    self.coordinator.clone(),
                    queue.clone(),
                    worker_no,
                    config.timeout,
                    self.config.clone(),
                    self.shutdown_rx.clone(),
                )));
            }

            tasks.push(tokio::spawn(promote_loop(
                self.coordinator.clone(),
                queue.clone(),
                self.config.promote_interval,
                self.shutdown_rx.clone(),
            )));

            tasks.push(tokio::spawn(sweep_loop(
                self.coordinator.clone(),
                queue.clone(),
                config.keep_completed,
                config.keep_failed,
                self.config.sweep_interval,
                self.shutdown_rx.clone(),
            )));

            info!(queue = %queue, concurrency = config.concurrency, "worker pool started");
        }

        tasks.push(tokio::spawn(reaper_loop(
            self.coordinator.clone(),
            self.config.stale_active_after,
            self.shutdown_rx.clone(),
        )));
    }

    /// Graceful shutdown: stop claiming, cancel in-flight handlers, wait up
    /// to the grace period, then abandon whatever is still running. An
    /// abandoned attempt keeps its durable `active` record for the next
    /// boot's recovery; no terminal state is fabricated.
    pub async fn shutdown(&self) {
        if self.shutdown_tx.send(true).is_err() {
            return;
        }
        let signalled = self.coordinator.inflight().cancel_all();
        info!(in_flight = signalled, "shutdown started, cancellation signalled");

        let mut tasks = {
            let mut guard = self.tasks.lock().unwrap();
            std::mem::take(&mut *guard)
        };

        let drained = tokio::time::timeout(self.config.shutdown_grace, async {
            for task in tasks.iter_mut() {
                let _ = task.await;
            }
        })
        .await;

        match drained {
            Ok(()) => info!("all workers drained"),
            Err(_) => {
                let abandoned = tasks.iter().filter(|t| !t.is_finished()).count();
                for task in &tasks {
                    task.abort();
                }
                warn!(
                    abandoned,
                    "grace period elapsed, abandoning running handlers for next-boot recovery"
                );
            }
        }
    }
}

/// Treats durable `active` rows older than the stale threshold as failed
/// attempts: the retry engine decides re-enqueue vs dead. Attempts
/// currently running in this process are exempt.
async fn settle_stale_active(
    coordinator: &JobCoordinator,
    stale_active_after: Duration,
) -> Result<(usize, usize)> {
    let store = coordinator.store();
    let now = chrono::Utc::now();
    let stale_after = chrono::Duration::from_std(stale_active_after)
        .unwrap_or_else(|_| chrono::Duration::seconds(60));

    let mut requeued = 0;
    let mut dead_lettered = 0;

    for job in store.list_by_status(JobStatus::Active, 100_000).await? {
        if coordinator.inflight().contains(job.id) {
            continue;
        }
        let stale = job
            .started_at
            .map_or(true, |started| now - started >= stale_after);
        if !stale {
            continue;
        }

        let record = crate::job::AttemptRecord::failure(
            job.id,
            "attempt abandoned by a previous process",
            0,
            job.attempts,
        );
        match coordinator.policy_for(&job).decide(job.attempts) {
            RetryDecision::Retry { delay } => {
                let due = now
                    + chrono::Duration::from_std(delay)
                        .unwrap_or_else(|_| chrono::Duration::zero());
                let patch = StatusPatch::default()
                    .scheduled_at(due)
                    .last_error("attempt abandoned by a previous process");
                store
                    .update_status_with_result(job.id, JobStatus::Delayed, patch, record)
                    .await?;
                coordinator.broker().remove(&job.job_type, job.id).ok();
                coordinator
                    .broker()
                    .enqueue(&job.job_type, job.envelope(), Some(delay))?;
                requeued += 1;
                info!(job_id = %job.id, attempts = job.attempts, "stale active attempt re-scheduled");
            }
            RetryDecision::Dead => {
                let patch = StatusPatch::default()
                    .failed_at(now)
                    .last_error("attempt abandoned by a previous process");
                store
                    .update_status_with_result(job.id, JobStatus::Dead, patch, record)
                    .await?;
                coordinator.broker().remove(&job.job_type, job.id).ok();
                dead_lettered += 1;
                warn!(job_id = %job.id, attempts = job.attempts, "stale active attempt dead-lettered");
            }
        }
    }
    Ok((requeued, dead_lettered))
}

/// Periodically re-runs the stale-active scan so attempts abandoned right
/// before a restart are recovered once they cross the threshold.
async fn reaper_loop(
    coordinator: Arc<JobCoordinator>,
    stale_active_after: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let interval = (stale_active_after / 2).max(Duration::from_millis(500));
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tokio::time::sleep(interval) => {
                match settle_stale_active(&coordinator, stale_active_after).await {
                    Ok((0, 0)) => {}
                    Ok((requeued, dead_lettered)) => {
                        info!(requeued, dead_lettered, "stale active attempts settled");
                    }
                    Err(e) => warn!(error = %e, "stale-active scan failed"),
                }
            }
        }
    }
}

async fn worker_loop(
    coordinator: Arc<JobCoordinator>,
    queue: String,
    worker_no: usize,
    timeout: Option<Duration>,
    config: DispatcherConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!(queue = %queue, worker_no, "worker started");
    loop {
        if *shutdown.borrow() {
            break;
        }

        let claimed = match coordinator.broker().claim(&queue, 1) {
            Ok(claimed) => claimed,
            Err(e) => {
                error!(queue = %queue, error = %e, "claim failed");
                tokio::time::sleep(config.poll_interval).await;
                continue;
            }
        };

        match claimed.into_iter().next() {
            Some(envelope) => {
                process_one(&coordinator, &queue, envelope, timeout, &config).await;
            }
            None => {
                tokio::select! {
                    _ = shutdown.changed() => {}
                    _ = wait_ready(&coordinator, &queue) => {}
                    _ = tokio::time::sleep(config.poll_interval) => {}
                }
            }
        }
    }
    debug!(queue = %queue, worker_no, "worker stopped");
}

async fn wait_ready(coordinator: &JobCoordinator, queue: &str) {
    if coordinator.broker().ready_signal(queue).await.is_err() {
        // Unknown queue can only mean shutdown-time teardown; park briefly.
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// Drives one claimed envelope through a full attempt.
async fn process_one(
    coordinator: &Arc<JobCoordinator>,
    queue: &str,
    envelope: JobEnvelope,
    timeout: Option<Duration>,
    config: &DispatcherConfig,
) {
    let id = envelope.id;

    // Registered before activation so the stale-attempt reaper never
    // mistakes this attempt for an abandoned one.
    let cancel_rx = coordinator.inflight().register(id);

    if let Err(e) = coordinator.mark_active(id).await {
        // Durable state is authoritative; drop the claim and move on.
        warn!(job_id = %id, error = %e, "could not activate claimed job");
        coordinator.inflight().complete(id);
        coordinator.broker().ack(queue, id).ok();
        return;
    }

    let (progress_tx, progress_rx) = mpsc::channel(32);
    let ctx = HandlerContext::new(cancel_rx, progress_tx);
    let writer = tokio::spawn(progress_writer(
        coordinator.clone(),
        id,
        progress_rx,
        config.progress_flush_interval,
    ));

    let outcome = match coordinator.registry().handler(&envelope.job_type) {
        Some(handler) => {
            let attempt = handler(envelope, ctx);
            let started = Instant::now();
            let result = match timeout {
                Some(limit) => match tokio::time::timeout(limit, attempt).await {
                    Ok(result) => result,
                    Err(_) => Err(crate::error::TaskmillError::handler(format!(
                        "attempt timed out after {}ms",
                        limit.as_millis()
                    ))),
                },
                None => attempt.await,
            };
            (result, started.elapsed().as_millis() as u64)
        }
        None => (
            Err(crate::error::TaskmillError::handler(format!(
                "no handler registered for type {}",
                envelope.job_type
            ))),
            0,
        ),
    };

    coordinator.inflight().complete(id);
    // The handler future is gone, so the progress sender is closed; the
    // writer flushes the last value before the terminal transition below.
    let _ = writer.await;

    let (result, duration_ms) = outcome;
    match result {
        Ok(data) => {
            if let Err(e) = coordinator.mark_completed(id, data, duration_ms).await {
                error!(job_id = %id, error = %e, "terminal completion failed");
            }
        }
        Err(handler_error) => {
            match coordinator
                .mark_failed(id, &handler_error.to_string(), duration_ms)
                .await
            {
                Ok(RetryDecision::Retry { .. }) | Ok(RetryDecision::Dead) => {}
                Err(e) => error!(job_id = %id, error = %e, "terminal failure handling failed"),
            }
        }
    }
}

/// Consumes handler progress updates, coalescing durable writes to at most
/// one per flush interval and always writing the freshest value last.
async fn progress_writer(
    coordinator: Arc<JobCoordinator>,
    id: crate::job::JobId,
    mut rx: mpsc::Receiver<u8>,
    flush_interval: Duration,
) {
    let mut ticker = tokio::time::interval(flush_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut latest: u8 = 0;
    let mut dirty = false;

    loop {
        tokio::select! {
            update = rx.recv() => match update {
                Some(value) => {
                    // Progress is monotone within one attempt.
                    if value >= latest {
                        latest = value;
                        dirty = true;
                    }
                }
                None => break,
            },
            _ = ticker.tick() => {
                if dirty {
                    dirty = false;
                    if let Err(e) = coordinator.record_progress(id, latest).await {
                        warn!(job_id = %id, error = %e, "progress write failed");
                    }
                }
            }
        }
    }

    if dirty {
        if let Err(e) = coordinator.record_progress(id, latest).await {
            warn!(job_id = %id, error = %e, "final progress flush failed");
        }
    }
}

async fn promote_loop(
    coordinator: Arc<JobCoordinator>,
    queue: String,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tokio::time::sleep(interval) => {
                if let Err(e) = coordinator.promote_due(&queue).await {
                    warn!(queue = %queue, error = %e, "promotion sweep failed");
                }
            }
        }
    }
}

async fn sweep_loop(
    coordinator: Arc<JobCoordinator>,
    queue: String,
    keep_completed: u64,
    keep_failed: u64,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tokio::time::sleep(interval) => {
                match coordinator.store().prune(&queue, keep_completed, keep_failed).await {
                    Ok(0) => {}
                    Ok(removed) => debug!(queue = %queue, removed, "retention sweep"),
                    Err(e) => warn!(queue = %queue, error = %e, "retention sweep failed"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::Broker;
    use crate::config::QueueConfig;
    use crate::job::Job;
    use crate::registry::HandlerRegistry;
    use crate::store::{JobStore, MemoryStore};
    use serde_json::json;

    fn harness<F>(configure: F) -> (Arc<JobCoordinator>, Dispatcher)
    where
        F: FnOnce(&mut HandlerRegistry),
    {
        let mut registry = HandlerRegistry::new();
        configure(&mut registry);
        let registry = Arc::new(registry);
        let broker = Arc::new(Broker::new(registry.type_names()));
        let store: Arc<dyn JobStore> = Arc::new(MemoryStore::new());
        let coordinator = Arc::new(JobCoordinator::new(store, broker, registry));
        let dispatcher = Dispatcher::new(
            coordinator.clone(),
            DispatcherConfig {
                promote_interval: Duration::from_millis(20),
                poll_interval: Duration::from_millis(10),
                progress_flush_interval: Duration::from_millis(20),
                shutdown_grace: Duration::from_secs(2),
                stale_active_after: Duration::from_millis(100),
                sweep_interval: Duration::from_secs(3600),
            },
        );
        (coordinator, dispatcher)
    }

    async fn wait_for_status(
        coordinator: &JobCoordinator,
        id: crate::job::JobId,
        status: JobStatus,
        within: Duration,
    ) -> Job {
        let deadline = Instant::now() + within;
        loop {
            let job = coordinator.job(id).await.unwrap();
            if job.status == status {
                return job;
            }
            if Instant::now() > deadline {
                panic!("job {} stuck in {:?}, wanted {:?}", id, job.status, status);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_worker_completes_job() {
        let (coordinator, dispatcher) = harness(|registry| {
            registry.register(QueueConfig::new("email"), |envelope, ctx| async move {
                ctx.report_progress(50);
                Ok(json!({"echo": envelope.payload}))
            });
        });

        dispatcher.start();
        let id = coordinator
            .submit(Job::new("email", json!({"to": ["a@b"]})))
            .await
            .unwrap();

        let job = wait_for_status(&coordinator, id, JobStatus::Completed, Duration::from_secs(2))
            .await;
        assert_eq!(job.attempts, 1);
        assert_eq!(job.progress, 100);
        assert_eq!(job.result.unwrap()["echo"], json!({"to": ["a@b"]}));

        let results = coordinator.store().results_for(id).await.unwrap();
        assert_eq!(results.len(), 1);

        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_failing_handler_retries_then_dies() {
        let (coordinator, dispatcher) = harness(|registry| {
            registry.register(
                QueueConfig::new("api")
                    .with_max_retries(2)
                    .with_retry_delay(Duration::from_millis(30)),
                |_envelope, _ctx| async move {
                    Err(crate::error::TaskmillError::handler("upstream 503"))
                },
            );
        });

        dispatcher.start();
        let id = coordinator
            .submit(Job::new("api", json!({})).with_max_retries(2))
            .await
            .unwrap();

        let job =
            wait_for_status(&coordinator, id, JobStatus::Dead, Duration::from_secs(5)).await;
        assert_eq!(job.attempts, 3);
        assert_eq!(job.last_error.as_deref(), Some("Handler error: upstream 503"));

        let results = coordinator.store().results_for(id).await.unwrap();
        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|r| !r.success));

        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_handler_timeout_counts_as_failure() {
        let (coordinator, dispatcher) = harness(|registry| {
            registry.register(
                QueueConfig::new("file")
                    .with_max_retries(0)
                    .with_timeout(Duration::from_millis(30)),
                |_envelope, _ctx| async move {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok(json!({}))
                },
            );
        });

        dispatcher.start();
        let id = coordinator
            .submit(Job::new("file", json!({})).with_max_retries(0))
            .await
            .unwrap();

        let job =
            wait_for_status(&coordinator, id, JobStatus::Dead, Duration::from_secs(2)).await;
        assert!(job.last_error.unwrap().contains("timed out"));

        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_recovery_requeues_stale_active() {
        let (coordinator, dispatcher) = harness(|registry| {
            registry.register(
                QueueConfig::new("export").with_retry_delay(Duration::from_millis(30)),
                |_envelope, _ctx| async move { Ok(json!({"rows": 1})) },
            );
        });

        // A crashed predecessor left this row active with an old start.
        let mut job = Job::new("export", json!({}));
        job.status = JobStatus::Active;
        job.attempts = 1;
        job.started_at = Some(chrono::Utc::now() - chrono::Duration::seconds(300));
        let id = job.id;
        coordinator.store().create(&job).await.unwrap();

        let report = dispatcher.recover().await.unwrap();
        assert_eq!(report.requeued, 1);

        let recovered = coordinator.job(id).await.unwrap();
        assert_eq!(recovered.status, JobStatus::Delayed);

        // Once due, the worker pool runs it to completion.
        dispatcher.start();
        let job =
            wait_for_status(&coordinator, id, JobStatus::Completed, Duration::from_secs(10))
                .await;
        assert_eq!(job.attempts, 2);

        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_recovery_dead_letters_exhausted_stale_active() {
        let (coordinator, dispatcher) = harness(|registry| {
            registry.register(QueueConfig::new("export"), |_envelope, _ctx| async move {
                Ok(json!({}))
            });
        });

        let mut job = Job::new("export", json!({})).with_max_retries(1);
        job.status = JobStatus::Active;
        job.attempts = 2;
        job.started_at = Some(chrono::Utc::now() - chrono::Duration::seconds(300));
        let id = job.id;
        coordinator.store().create(&job).await.unwrap();

        let report = dispatcher.recover().await.unwrap();
        assert_eq!(report.dead_lettered, 1);
        assert_eq!(coordinator.job(id).await.unwrap().status, JobStatus::Dead);
    }

    #[tokio::test]
    async fn test_recovery_reloads_waiting_delayed_failed() {
        let (coordinator, dispatcher) = harness(|registry| {
            registry.register(QueueConfig::new("cleanup"), |_envelope, _ctx| async move {
                Ok(json!({}))
            });
        });
        let store = coordinator.store();

        store.create(&Job::new("cleanup", json!({}))).await.unwrap();
        store
            .create(&Job::with_delay(
                "cleanup",
                json!({}),
                chrono::Duration::seconds(60),
            ))
            .await
            .unwrap();
        let mut failed = Job::new("cleanup", json!({}));
        failed.status = JobStatus::Failed;
        store.create(&failed).await.unwrap();

        let report = dispatcher.recover().await.unwrap();
        assert_eq!(report.reloaded_waiting, 1);
        assert_eq!(report.reloaded_delayed, 1);
        assert_eq!(report.reloaded_failed, 1);

        let depths = coordinator.broker().stats("cleanup").unwrap();
        assert_eq!((depths.ready, depths.delayed, depths.failed), (1, 1, 1));
    }

    #[tokio::test]
    async fn test_shutdown_leaves_sleeper_active_for_next_boot() {
        let (coordinator, dispatcher) = harness(|registry| {
            registry.register(QueueConfig::new("file"), |_envelope, _ctx| async move {
                // Ignores cancellation entirely.
                tokio::time::sleep(Duration::from_secs(600)).await;
                Ok(json!({}))
            });
        });

        dispatcher.start();
        let id = coordinator.submit(Job::new("file", json!({}))).await.unwrap();
        wait_for_status(&coordinator, id, JobStatus::Active, Duration::from_secs(2)).await;

        dispatcher.shutdown().await;

        // No terminal state was fabricated; recovery owns this row now.
        let job = coordinator.job(id).await.unwrap();
        assert_eq!(job.status, JobStatus::Active);
    }

    #[tokio::test]
    async fn test_cooperative_handler_stops_on_cancel() {
        let (coordinator, dispatcher) = harness(|registry| {
            registry.register(QueueConfig::new("api"), |_envelope, ctx| async move {
                tokio::select! {
                    _ = ctx.cancelled() => Err(crate::error::TaskmillError::handler("cancelled")),
                    _ = tokio::time::sleep(Duration::from_secs(600)) => Ok(json!({})),
                }
            });
        });

        dispatcher.start();
        let id = coordinator.submit(Job::new("api", json!({}))).await.unwrap();
        wait_for_status(&coordinator, id, JobStatus::Active, Duration::from_secs(2)).await;

        coordinator.cancel(id).await.unwrap();
        let job =
            wait_for_status(&coordinator, id, JobStatus::Delayed, Duration::from_secs(2)).await;
        assert!(job.last_error.unwrap().contains("cancelled"));

        dispatcher.shutdown().await;
    }
}
