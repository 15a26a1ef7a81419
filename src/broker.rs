//! In-memory broker holding the schedulable state of every queue.
//!
//! Each queue type owns four sets (`ready`, `active`, `delayed`, `failed`)
//! and a pause flag, guarded by a single mutex per queue. The broker is a
//! cache of the durable store: it can be rebuilt from job rows at any time,
//! which boot recovery relies on.
//!
//! `ready` is ordered by `(priority, enqueue_seq)` so that lower priority
//! values run first and ties break FIFO. `delayed` is ordered by due-time.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;

use crate::error::TaskmillError;
use crate::job::{JobEnvelope, JobId, Priority};
use crate::Result;

/// Cardinalities of the four sets plus the pause flag.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct QueueDepths {
    pub ready: usize,
    pub active: usize,
    pub delayed: usize,
    pub failed: usize,
    pub paused: bool,
}

#[derive(Debug)]
struct Slot {
    envelope: JobEnvelope,
    seq: u64,
}

#[derive(Debug, Default)]
struct QueueState {
    ready: BTreeSet<(Priority, u64, JobId)>,
    delayed: BTreeSet<(DateTime<Utc>, u64, JobId)>,
    active: HashSet<JobId>,
    failed: BTreeSet<(Priority, u64, JobId)>,
    slots: HashMap<JobId, Slot>,
    paused: bool,
}

impl QueueState {
    fn depths(&self) -> QueueDepths {
        QueueDepths {
            ready: self.ready.len(),
            active: self.active.len(),
            delayed: self.delayed.len(),
            failed: self.failed.len(),
            paused: self.paused,
        }
    }

    /// Drops the job from whichever set currently holds it.
    fn detach(&mut self, id: JobId) -> Option<Slot> {
        let slot = self.slots.remove(&id)?;
        let priority = slot.envelope.priority;
        if !self.ready.remove(&(priority, slot.seq, id)) && !self.active.remove(&id) {
            self.delayed.retain(|&(_, _, entry)| entry != id);
            self.failed.remove(&(priority, slot.seq, id));
        }
        Some(slot)
    }
}

struct QueueHandle {
    state: Mutex<QueueState>,
    ready_notify: Notify,
}

/// The in-memory broker. Queues are registered at construction and the set
/// of queues is read-only afterwards.
pub struct Broker {
    queues: HashMap<String, QueueHandle>,
    seq: AtomicU64,
}

impl Broker {
    pub fn new<I, S>(queue_names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let queues = queue_names
            .into_iter()
            .map(|name| {
                (
                    name.into(),
                    QueueHandle {
                        state: Mutex::new(QueueState::default()),
                        ready_notify: Notify::new(),
                    },
                )
            })
            .collect();
        Self {
            queues,
            seq: AtomicU64::new(0),
        }
    }

    pub fn contains(&self, queue: &str) -> bool {
        self.queues.contains_key(queue)
    }

    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.queues.keys().cloned().collect();
        names.sort();
        names
    }

    fn handle(&self, queue: &str) -> Result<&QueueHandle> {
        self.queues
            .get(queue)
            .ok_or_else(|| TaskmillError::QueueNotFound {
                name: queue.to_string(),
            })
    }

    /// Places an envelope into `ready`, or into `delayed` when a positive
    /// delay is given.
    pub fn enqueue(
        &self,
        queue: &str,
        envelope: JobEnvelope,
        delay: Option<Duration>,
    ) -> Result<()> {
        let handle = self.handle(queue)?;
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let id = envelope.id;
        let priority = envelope.priority;

        let mut state = handle.state.lock().unwrap();
        if state.slots.contains_key(&id) {
            return Err(TaskmillError::Broker {
                message: format!("job {id} is already enqueued on {queue}"),
            });
        }

        let mut notify = false;
        match delay {
            Some(d) if !d.is_zero() => {
                let due = Utc::now()
                    + chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::zero());
                state.delayed.insert((due, seq, id));
            }
            _ => {
                state.ready.insert((priority, seq, id));
                notify = true;
            }
        }
        state.slots.insert(id, Slot { envelope, seq });
        drop(state);

        if notify {
            handle.ready_notify.notify_one();
        }
        Ok(())
    }

    /// Claims up to `n` envelopes from `ready` in `(priority, seq)` order,
    /// moving them to `active`. Returns nothing from a paused queue.
    pub fn claim(&self, queue: &str, n: usize) -> Result<Vec<JobEnvelope>> {
        let handle = self.handle(queue)?;
        let mut state = handle.state.lock().unwrap();
        if state.paused {
            return Ok(Vec::new());
        }

        let picked: Vec<(Priority, u64, JobId)> =
            state.ready.iter().take(n).copied().collect();
        let mut claimed = Vec::with_capacity(picked.len());
        for key in picked {
            state.ready.remove(&key);
            state.active.insert(key.2);
            if let Some(slot) = state.slots.get(&key.2) {
                claimed.push(slot.envelope.clone());
            }
        }
        Ok(claimed)
    }

    /// Removes a job from `active` after a terminal outcome.
    pub fn ack(&self, queue: &str, id: JobId) -> Result<()> {
        let handle = self.handle(queue)?;
        let mut state = handle.state.lock().unwrap();
        if state.active.remove(&id) {
            state.slots.remove(&id);
            Ok(())
        } else {
            Err(TaskmillError::Broker {
                message: format!("job {id} is not active on {queue}"),
            })
        }
    }

    /// Removes a job from `active`; re-schedules it into `delayed` when
    /// `retry_in` is given, otherwise parks it in `failed`.
    pub fn fail(&self, queue: &str, id: JobId, retry_in: Option<Duration>) -> Result<()> {
        let handle = self.handle(queue)?;
        let mut state = handle.state.lock().unwrap();
        if !state.active.remove(&id) {
            return Err(TaskmillError::Broker {
                message: format!("job {id} is not active on {queue}"),
            });
        }
        let slot = state.slots.get(&id).ok_or_else(|| TaskmillError::Broker {
            message: format!("job {id} has no envelope on {queue}"),
        })?;
        let seq = slot.seq;
        let priority = slot.envelope.priority;

        match retry_in {
            Some(d) => {
                let due = Utc::now()
                    + chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::zero());
                state.delayed.insert((due, seq, id));
            }
            None => {
                state.failed.insert((priority, seq, id));
            }
        }
        Ok(())
    }

    /// Loads an envelope directly into the `failed` set. Used when the
    /// broker is rebuilt from durable `failed` rows on boot.
    pub fn load_failed(&self, queue: &str, envelope: JobEnvelope) -> Result<()> {
        let handle = self.handle(queue)?;
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let id = envelope.id;
        let priority = envelope.priority;

        let mut state = handle.state.lock().unwrap();
        if state.slots.contains_key(&id) {
            return Err(TaskmillError::Broker {
                message: format!("job {id} is already enqueued on {queue}"),
            });
        }
        state.failed.insert((priority, seq, id));
        state.slots.insert(id, Slot { envelope, seq });
        Ok(())
    }

    /// Moves every `delayed` entry whose due-time has passed into `ready`,
    /// preserving priority order. Returns the promoted job ids.
    pub fn promote_due(&self, queue: &str, now: DateTime<Utc>) -> Result<Vec<JobId>> {
        let handle = self.handle(queue)?;
        let mut state = handle.state.lock().unwrap();

        let due: Vec<(DateTime<Utc>, u64, JobId)> = state
            .delayed
            .iter()
            .take_while(|&&(when, _, _)| when <= now)
            .copied()
            .collect();

        let mut promoted = Vec::with_capacity(due.len());
        for key in due {
            state.delayed.remove(&key);
            let (_, seq, id) = key;
            let priority = match state.slots.get(&id) {
                Some(slot) => slot.envelope.priority,
                None => continue,
            };
            state.ready.insert((priority, seq, id));
            promoted.push(id);
        }
        let woke = !promoted.is_empty();
        drop(state);

        if woke {
            handle.ready_notify.notify_waiters();
        }
        Ok(promoted)
    }

    /// Sets the pause flag. Jobs already `active` are not interrupted.
    pub fn pause(&self, queue: &str) -> Result<()> {
        let handle = self.handle(queue)?;
        handle.state.lock().unwrap().paused = true;
        Ok(())
    }

    /// Clears the pause flag and wakes claimers.
    pub fn resume(&self, queue: &str) -> Result<()> {
        let handle = self.handle(queue)?;
        handle.state.lock().unwrap().paused = false;
        handle.ready_notify.notify_waiters();
        Ok(())
    }

    /// Moves `failed` entries back into `ready` with their original
    /// priority. Restricted to one queue when `queue` is given. Returns the
    /// number of re-enqueued jobs.
    pub fn retry_all_failed(&self, queue: Option<&str>) -> Result<usize> {
        let mut count = 0;
        match queue {
            Some(name) => {
                self.handle(name)?;
                count += self.retry_failed_on(name)?;
            }
            None => {
                for name in self.queues.keys() {
                    count += self.retry_failed_on(name)?;
                }
            }
        }
        Ok(count)
    }

    fn retry_failed_on(&self, queue: &str) -> Result<usize> {
        let handle = self.handle(queue)?;
        let mut state = handle.state.lock().unwrap();
        let entries: Vec<(Priority, u64, JobId)> = state.failed.iter().copied().collect();
        state.failed.clear();
        let count = entries.len();
        for key in entries {
            state.ready.insert(key);
        }
        drop(state);

        if count > 0 {
            handle.ready_notify.notify_waiters();
        }
        Ok(count)
    }

    /// Drops a job from whichever set holds it. Returns whether it was
    /// present.
    pub fn remove(&self, queue: &str, id: JobId) -> Result<bool> {
        let handle = self.handle(queue)?;
        let mut state = handle.state.lock().unwrap();
        Ok(state.detach(id).is_some())
    }

    pub fn stats(&self, queue: &str) -> Result<QueueDepths> {
        let handle = self.handle(queue)?;
        let state = handle.state.lock().unwrap();
        Ok(state.depths())
    }

    pub fn all_stats(&self) -> HashMap<String, QueueDepths> {
        self.queues
            .iter()
            .map(|(name, handle)| (name.clone(), handle.state.lock().unwrap().depths()))
            .collect()
    }

    /// Resolves once new work may be ready on the queue. Claimers should
    /// re-check `claim` after waking; wakeups can be spurious.
    pub async fn ready_signal(&self, queue: &str) -> Result<()> {
        let handle = self.handle(queue)?;
        handle.ready_notify.notified().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope(priority: u8) -> JobEnvelope {
        JobEnvelope {
            id: uuid::Uuid::new_v4(),
            job_type: "email".to_string(),
            priority: Priority::new(priority).unwrap(),
            payload: json!({}),
        }
    }

    fn broker() -> Broker {
        Broker::new(["email", "cleanup"])
    }

    #[test]
    fn test_claim_orders_by_priority_then_fifo() {
        let b = broker();
        let first_normal = envelope(5);
        let second_normal = envelope(5);
        let urgent = envelope(1);

        b.enqueue("email", first_normal.clone(), None).unwrap();
        b.enqueue("email", second_normal.clone(), None).unwrap();
        b.enqueue("email", urgent.clone(), None).unwrap();

        let claimed = b.claim("email", 3).unwrap();
        let ids: Vec<JobId> = claimed.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![urgent.id, first_normal.id, second_normal.id]);

        let depths = b.stats("email").unwrap();
        assert_eq!(depths.active, 3);
        assert_eq!(depths.ready, 0);
    }

    #[test]
    fn test_claim_respects_limit() {
        let b = broker();
        for _ in 0..5 {
            b.enqueue("email", envelope(5), None).unwrap();
        }
        assert_eq!(b.claim("email", 2).unwrap().len(), 2);
        assert_eq!(b.stats("email").unwrap().ready, 3);
    }

    #[test]
    fn test_paused_queue_never_claims() {
        let b = broker();
        b.enqueue("email", envelope(5), None).unwrap();
        b.pause("email").unwrap();

        assert!(b.claim("email", 1).unwrap().is_empty());
        assert!(b.stats("email").unwrap().paused);

        // Pause is idempotent; resume restores claims.
        b.pause("email").unwrap();
        b.resume("email").unwrap();
        assert_eq!(b.claim("email", 1).unwrap().len(), 1);
    }

    #[test]
    fn test_delayed_promotes_when_due() {
        let b = broker();
        let env = envelope(5);
        b.enqueue("email", env.clone(), Some(Duration::from_secs(60)))
            .unwrap();

        assert!(b.claim("email", 1).unwrap().is_empty());
        assert_eq!(b.stats("email").unwrap().delayed, 1);

        // Not due yet.
        assert!(b.promote_due("email", Utc::now()).unwrap().is_empty());

        let promoted = b
            .promote_due("email", Utc::now() + chrono::Duration::seconds(61))
            .unwrap();
        assert_eq!(promoted, vec![env.id]);
        assert_eq!(b.claim("email", 1).unwrap()[0].id, env.id);
    }

    #[test]
    fn test_fail_with_retry_goes_to_delayed() {
        let b = broker();
        let env = envelope(5);
        b.enqueue("email", env.clone(), None).unwrap();
        b.claim("email", 1).unwrap();

        b.fail("email", env.id, Some(Duration::from_secs(5))).unwrap();
        let depths = b.stats("email").unwrap();
        assert_eq!((depths.active, depths.delayed), (0, 1));
    }

    #[test]
    fn test_fail_without_retry_parks_in_failed() {
        let b = broker();
        let env = envelope(3);
        b.enqueue("email", env.clone(), None).unwrap();
        b.claim("email", 1).unwrap();
        b.fail("email", env.id, None).unwrap();

        assert_eq!(b.stats("email").unwrap().failed, 1);

        // Retry-failed restores priority ordering.
        let lower = envelope(7);
        b.enqueue("email", lower.clone(), None).unwrap();
        assert_eq!(b.retry_all_failed(Some("email")).unwrap(), 1);
        let claimed = b.claim("email", 2).unwrap();
        assert_eq!(claimed[0].id, env.id);
        assert_eq!(claimed[1].id, lower.id);
    }

    #[test]
    fn test_retry_all_failed_is_idempotent() {
        let b = broker();
        let env = envelope(5);
        b.enqueue("email", env.clone(), None).unwrap();
        b.claim("email", 1).unwrap();
        b.fail("email", env.id, None).unwrap();

        assert_eq!(b.retry_all_failed(None).unwrap(), 1);
        assert_eq!(b.retry_all_failed(None).unwrap(), 0);
    }

    #[test]
    fn test_ack_removes_from_active() {
        let b = broker();
        let env = envelope(5);
        b.enqueue("email", env.clone(), None).unwrap();
        b.claim("email", 1).unwrap();
        b.ack("email", env.id).unwrap();

        let depths = b.stats("email").unwrap();
        assert_eq!(depths.active, 0);
        assert!(b.ack("email", env.id).is_err());
    }

    #[test]
    fn test_job_in_at_most_one_set() {
        let b = broker();
        let env = envelope(5);
        b.enqueue("email", env.clone(), None).unwrap();
        assert!(b.enqueue("email", env.clone(), None).is_err());

        b.claim("email", 1).unwrap();
        b.fail("email", env.id, Some(Duration::from_millis(1))).unwrap();
        let depths = b.stats("email").unwrap();
        assert_eq!(
            depths.ready + depths.active + depths.delayed + depths.failed,
            1
        );
    }

    #[test]
    fn test_unknown_queue_is_an_error() {
        let b = broker();
        assert!(matches!(
            b.enqueue("video", envelope(5), None),
            Err(TaskmillError::QueueNotFound { .. })
        ));
        assert!(b.stats("video").is_err());
    }

    #[test]
    fn test_remove_detaches_from_any_set() {
        let b = broker();
        let env = envelope(5);
        b.enqueue("email", env.clone(), Some(Duration::from_secs(60)))
            .unwrap();
        assert!(b.remove("email", env.id).unwrap());
        assert!(!b.remove("email", env.id).unwrap());
        assert_eq!(b.stats("email").unwrap().delayed, 0);
    }
}
