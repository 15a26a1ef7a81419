//! Job types and utilities for representing work units in the task processor.
//!
//! This module provides the core [`Job`] struct, the [`JobStatus`] state
//! machine, the numeric [`Priority`] used for queue ordering, and the
//! [`AttemptRecord`] history row written once per execution attempt.

use crate::error::TaskmillError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a job.
pub type JobId = Uuid;

/// The current status of a job in its lifecycle.
///
/// Valid transitions form a fixed state machine:
///
/// ```text
/// waiting -> active -> {completed | delayed | failed | dead}
/// delayed -> waiting            (promotion when due)
/// failed  -> waiting | dead     (explicit retry / exhaustion)
/// waiting | delayed | failed -> paused -> waiting
/// ```
///
/// `completed` and `dead` are terminal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Job is ready and waiting to be claimed by a worker.
    Waiting,
    /// Job is currently being processed by a worker.
    Active,
    /// Job completed successfully.
    Completed,
    /// Job failed but has not exhausted its retry budget.
    Failed,
    /// Job is scheduled to re-enter the ready set at a future instant.
    Delayed,
    /// Job is parked by an operator; resumable to `waiting`.
    Paused,
    /// Job failed permanently after exhausting all retry attempts.
    Dead,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Dead)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Waiting => "waiting",
            JobStatus::Active => "active",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Delayed => "delayed",
            JobStatus::Paused => "paused",
            JobStatus::Dead => "dead",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = TaskmillError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(JobStatus::Waiting),
            "active" => Ok(JobStatus::Active),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "delayed" => Ok(JobStatus::Delayed),
            "paused" => Ok(JobStatus::Paused),
            "dead" => Ok(JobStatus::Dead),
            other => Err(TaskmillError::validation(format!(
                "unknown job status: {other}"
            ))),
        }
    }
}

/// Returns whether `from -> to` is a legal edge of the status state machine.
///
/// A same-status "transition" is accepted only for `active -> active`, which
/// is how progress patches are applied mid-attempt.
pub fn transition_allowed(from: JobStatus, to: JobStatus) -> bool {
    use JobStatus::*;
    match (from, to) {
        (Active, Active) => true,
        (Waiting, Active) => true,
        (Active, Completed) | (Active, Delayed) | (Active, Failed) | (Active, Dead) => true,
        (Delayed, Waiting) => true,
        (Failed, Waiting) | (Failed, Dead) => true,
        (Waiting, Paused) | (Delayed, Paused) | (Failed, Paused) => true,
        (Paused, Waiting) => true,
        _ => false,
    }
}

/// Scheduling priority: an integer in `[1, 10]` where a *lower* value means
/// the job runs *earlier*. The default is 5.
///
/// ```rust
/// use taskmill::Priority;
///
/// assert!(Priority::new(1).is_ok());
/// assert!(Priority::new(10).is_ok());
/// assert!(Priority::new(0).is_err());
/// assert!(Priority::new(11).is_err());
/// assert_eq!(Priority::default().get(), 5);
/// ```
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Priority(u8);

impl Priority {
    pub const HIGHEST: Priority = Priority(1);
    pub const LOWEST: Priority = Priority(10);

    pub fn new(value: impl TryInto<u8>) -> Result<Self, TaskmillError> {
        let value: u8 = value
            .try_into()
            .map_err(|_| TaskmillError::validation("priority must be an integer in [1, 10]"))?;
        if (1..=10).contains(&value) {
            Ok(Priority(value))
        } else {
            Err(TaskmillError::validation(format!(
                "priority {value} out of range [1, 10]"
            )))
        }
    }

    pub fn get(self) -> u8 {
        self.0
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority(5)
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A unit of work to be processed by the task processor.
///
/// # Examples
///
/// ```rust
/// use taskmill::{Job, JobStatus, Priority};
/// use serde_json::json;
///
/// let job = Job::new("email", json!({"to": ["user@example.com"]}))
///     .with_priority(Priority::new(2).unwrap())
///     .with_max_retries(5);
///
/// assert_eq!(job.job_type, "email");
/// assert_eq!(job.status, JobStatus::Waiting);
/// assert_eq!(job.attempts, 0);
/// assert_eq!(job.max_retries, 5);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    /// Unique identifier for this job.
    pub id: JobId,
    /// Registered queue type this job belongs to.
    #[serde(rename = "type")]
    pub job_type: String,
    /// Scheduling priority; lower value runs earlier.
    pub priority: Priority,
    /// Opaque JSON payload; the schema is handler-defined.
    pub payload: serde_json::Value,
    /// Current lifecycle status.
    pub status: JobStatus,
    /// Number of execution attempts started so far.
    pub attempts: u32,
    /// Retry budget; the job runs at most `max_retries + 1` times.
    pub max_retries: u32,
    /// Handler-reported completion percentage in `[0, 100]`.
    pub progress: u8,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    /// Due instant while the job is `delayed`.
    pub scheduled_at: Option<DateTime<Utc>>,
    /// Message of the most recent failed attempt.
    pub last_error: Option<String>,
    /// Terminal success artifact returned by the handler.
    pub result: Option<serde_json::Value>,
}

impl Job {
    /// Creates a new job in `waiting` status with default priority and a
    /// retry budget of 3.
    pub fn new(job_type: impl Into<String>, payload: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            job_type: job_type.into(),
            priority: Priority::default(),
            payload,
            status: JobStatus::Waiting,
            attempts: 0,
            max_retries: 3,
            progress: 0,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            failed_at: None,
            scheduled_at: None,
            last_error: None,
            result: None,
        }
    }

    /// Creates a job in `delayed` status, due `delay` from now.
    pub fn with_delay(
        job_type: impl Into<String>,
        payload: serde_json::Value,
        delay: chrono::Duration,
    ) -> Self {
        let mut job = Self::new(job_type, payload);
        job.status = JobStatus::Delayed;
        job.scheduled_at = Some(job.created_at + delay);
        job
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// True once the job has used its whole execution budget.
    pub fn has_exhausted_retries(&self) -> bool {
        self.attempts >= self.max_retries + 1
    }

    /// Time between the attempt start and the terminal timestamp, or the
    /// time since start for an in-flight attempt. `None` before first start.
    pub fn processing_duration(&self) -> Option<chrono::Duration> {
        self.started_at.map(|started| {
            self.completed_at
                .or(self.failed_at)
                .unwrap_or_else(Utc::now)
                - started
        })
    }

    /// The broker-side runtime representation of this job.
    pub fn envelope(&self) -> JobEnvelope {
        JobEnvelope {
            id: self.id,
            job_type: self.job_type.clone(),
            priority: self.priority,
            payload: self.payload.clone(),
        }
    }
}

/// The runtime representation of a job inside the broker, and the immutable
/// input handed to handlers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEnvelope {
    pub id: JobId,
    pub job_type: String,
    pub priority: Priority,
    pub payload: serde_json::Value,
}

/// Append-only per-attempt history row.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttemptRecord {
    pub job_id: JobId,
    pub success: bool,
    pub data: Option<serde_json::Value>,
    pub error: Option<String>,
    pub duration_ms: u64,
    pub attempt_no: u32,
    pub recorded_at: DateTime<Utc>,
}

impl AttemptRecord {
    pub fn success(job_id: JobId, data: serde_json::Value, duration_ms: u64, attempt_no: u32) -> Self {
        Self {
            job_id,
            success: true,
            data: Some(data),
            error: None,
            duration_ms,
            attempt_no,
            recorded_at: Utc::now(),
        }
    }

    pub fn failure(job_id: JobId, error: impl Into<String>, duration_ms: u64, attempt_no: u32) -> Self {
        Self {
            job_id,
            success: false,
            data: None,
            error: Some(error.into()),
            duration_ms,
            attempt_no,
            recorded_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_job_new_defaults() {
        let job = Job::new("email", json!({"to": ["a@b"]}));

        assert_eq!(job.job_type, "email");
        assert_eq!(job.status, JobStatus::Waiting);
        assert_eq!(job.priority, Priority::default());
        assert_eq!(job.attempts, 0);
        assert_eq!(job.max_retries, 3);
        assert_eq!(job.progress, 0);
        assert!(job.started_at.is_none());
        assert!(job.result.is_none());
        assert_eq!(job.created_at, job.updated_at);
    }

    #[test]
    fn test_job_with_delay() {
        let delay = chrono::Duration::minutes(5);
        let job = Job::with_delay("cleanup", json!({}), delay);

        assert_eq!(job.status, JobStatus::Delayed);
        assert_eq!(job.scheduled_at, Some(job.created_at + delay));
    }

    #[test]
    fn test_priority_bounds() {
        assert_eq!(Priority::new(1).unwrap(), Priority::HIGHEST);
        assert_eq!(Priority::new(10).unwrap(), Priority::LOWEST);
        assert!(Priority::new(0).is_err());
        assert!(Priority::new(11).is_err());
        assert!(Priority::new(-1i64).is_err());
    }

    #[test]
    fn test_priority_ordering_lower_value_first() {
        let urgent = Priority::new(1).unwrap();
        let relaxed = Priority::new(9).unwrap();
        assert!(urgent < relaxed);
    }

    #[test]
    fn test_transition_table() {
        use JobStatus::*;

        assert!(transition_allowed(Waiting, Active));
        assert!(transition_allowed(Active, Completed));
        assert!(transition_allowed(Active, Delayed));
        assert!(transition_allowed(Active, Failed));
        assert!(transition_allowed(Active, Dead));
        assert!(transition_allowed(Delayed, Waiting));
        assert!(transition_allowed(Failed, Waiting));
        assert!(transition_allowed(Failed, Dead));
        assert!(transition_allowed(Paused, Waiting));
        assert!(transition_allowed(Waiting, Paused));
        assert!(transition_allowed(Active, Active));

        // Terminal states never transition.
        assert!(!transition_allowed(Completed, Waiting));
        assert!(!transition_allowed(Dead, Waiting));
        assert!(!transition_allowed(Completed, Active));
        // No skipping the active state.
        assert!(!transition_allowed(Waiting, Completed));
        assert!(!transition_allowed(Delayed, Active));
        // Only active->active is a legal self-loop.
        assert!(!transition_allowed(Waiting, Waiting));
    }

    #[test]
    fn test_exhausted_retries() {
        let mut job = Job::new("api", json!({})).with_max_retries(2);
        assert!(!job.has_exhausted_retries());
        job.attempts = 2;
        assert!(!job.has_exhausted_retries());
        job.attempts = 3;
        assert!(job.has_exhausted_retries());
    }

    #[test]
    fn test_status_round_trip() {
        for status in [
            JobStatus::Waiting,
            JobStatus::Active,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Delayed,
            JobStatus::Paused,
            JobStatus::Dead,
        ] {
            let parsed: JobStatus = status.as_str().parse().unwrap();
            assert_eq!(parsed, status);
        }
        assert!("bogus".parse::<JobStatus>().is_err());
    }

    #[test]
    fn test_job_serialization_shape() {
        let job = Job::new("export", json!({"rows": 10}));
        let value = serde_json::to_value(&job).unwrap();

        assert_eq!(value["type"], "export");
        assert_eq!(value["status"], "waiting");
        assert_eq!(value["priority"], 5);
        assert!(value["createdAt"].is_string());
    }

    #[test]
    fn test_processing_duration() {
        let mut job = Job::new("file", json!({}));
        assert!(job.processing_duration().is_none());

        let start = Utc::now() - chrono::Duration::seconds(8);
        job.started_at = Some(start);
        job.completed_at = Some(start + chrono::Duration::seconds(5));
        assert_eq!(job.processing_duration().unwrap().num_seconds(), 5);
    }
}
