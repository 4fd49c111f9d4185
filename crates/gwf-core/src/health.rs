// Health/stats snapshot served by the observability endpoint

use serde::Serialize;

use crate::metrics::MetricsCollector;

/// How many failure reasons the snapshot carries.
const TOP_REASONS: usize = 10;

/// Persistent-queue health counters.
#[derive(Debug, Clone, Serialize)]
pub struct PersistHealth {
    pub store_file: String,
    pub recovered_total: u64,
    pub corrupt_fallback_total: u64,
    pub persist_write_failure_total: u64,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ReasonCount {
    pub reason: String,
    pub count: u64,
}

/// Point-in-time view of the whole pipeline, serialized as JSON for the
/// dashboard and stats endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub queue_length: i64,
    pub workers: i64,
    pub inflight: i64,
    pub events_total: u64,
    pub queue_full_total: u64,
    pub queue_shed_total: u64,
    pub retry_total: u64,
    pub success_total: u64,
    pub failure_total: u64,
    pub top_failure_reasons: Vec<ReasonCount>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub persist: Option<PersistHealth>,
}

impl HealthSnapshot {
    pub fn collect(metrics: &MetricsCollector, persist: Option<PersistHealth>) -> Self {
        let snap = metrics.snapshot();
        Self {
            queue_length: snap.queue_length,
            workers: snap.workers,
            inflight: snap.inflight,
            events_total: snap.file_events,
            queue_full_total: snap.queue_full,
            queue_shed_total: snap.queue_shed,
            retry_total: snap.retries,
            success_total: snap.successes,
            failure_total: snap.failures,
            top_failure_reasons: metrics.top_failure_reasons(TOP_REASONS),
            persist,
        }
    }
}
