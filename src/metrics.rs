//! Pull-based metrics aggregation.
//!
//! Snapshots compose the durable counters with broker depths and process
//! runtime data. No background timer; every snapshot reads fresh state.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use crate::broker::{Broker, QueueDepths};
use crate::store::JobStore;
use crate::Result;

/// Aggregate system view served by `/stats/system`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemMetrics {
    pub total_tasks: u64,
    pub completed_tasks: u64,
    pub failed_tasks: u64,
    pub pending_tasks: u64,
    pub success_rate_pct: f64,
    pub avg_processing_seconds: f64,
    pub throughput_per_hour: f64,
    pub uptime_seconds: u64,
    /// Resident set size when the platform exposes it.
    pub memory_rss_bytes: Option<u64>,
    pub queues: HashMap<String, QueueDepths>,
    pub generated_at: DateTime<Utc>,
}

/// Composes store counters, broker depths, and runtime data on demand.
pub struct MetricsAggregator {
    store: Arc<dyn JobStore>,
    broker: Arc<Broker>,
    started_at: Instant,
}

impl MetricsAggregator {
    pub fn new(store: Arc<dyn JobStore>, broker: Arc<Broker>) -> Self {
        Self {
            store,
            broker,
            started_at: Instant::now(),
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    pub async fn snapshot(&self) -> Result<SystemMetrics> {
        let durable = self.store.metrics_snapshot().await?;
        let uptime = self.started_at.elapsed();
        let uptime_hours = (uptime.as_secs_f64() / 3600.0).max(f64::EPSILON);

        Ok(SystemMetrics {
            total_tasks: durable.total,
            completed_tasks: durable.completed,
            failed_tasks: durable.failed,
            pending_tasks: durable.pending,
            success_rate_pct: durable.success_rate_pct,
            avg_processing_seconds: durable.avg_processing_seconds,
            throughput_per_hour: durable.completed as f64 / uptime_hours,
            uptime_seconds: uptime.as_secs(),
            memory_rss_bytes: resident_set_bytes(),
            queues: self.broker.all_stats(),
            generated_at: Utc::now(),
        })
    }
}

/// RSS from `/proc/self/statm`; `None` off Linux or when unreadable.
pub fn resident_set_bytes() -> Option<u64> {
    let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
    let resident_pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    Some(resident_pages * 4096)
}
