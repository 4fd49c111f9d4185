// Metrics collector with Prometheus text exposition (v0.0.4)
//
// Counters are plain atomics so the hot upload path never takes a lock.
// The duration histogram and the failure-reason map sit behind one RwLock;
// rendering copies both under the read lock before producing text, so
// exposition never blocks updates.
//
// The collector is a process-wide instance, but always reached through an
// injected Arc handle so tests stay hermetic.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use parking_lot::RwLock;

use crate::health::ReasonCount;

/// Upper bounds of the upload-duration histogram, in seconds.
pub const DURATION_BUCKETS: [f64; 9] = [0.05, 0.1, 0.25, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0];

/// Reason labels are bounded: at most this many distinct entries, evicting
/// the least-recently-seen, and each normalized to at most 120 characters.
const MAX_REASONS: usize = 2 * 64;
const MAX_REASON_LEN: usize = 120;

#[derive(Debug, Default, Clone)]
struct Histogram {
    /// Cumulative counts: `buckets[i]` counts observations `<= DURATION_BUCKETS[i]`.
    buckets: [u64; DURATION_BUCKETS.len()],
    sum: f64,
    count: u64,
}

impl Histogram {
    fn observe(&mut self, value: f64) {
        for (i, bound) in DURATION_BUCKETS.iter().enumerate() {
            if value <= *bound {
                self.buckets[i] += 1;
            }
        }
        self.sum += value;
        self.count += 1;
    }
}

#[derive(Debug, Clone)]
struct ReasonEntry {
    count: u64,
    last_seen: u64,
}

#[derive(Debug, Default)]
struct LockedState {
    duration: Histogram,
    reasons: HashMap<String, ReasonEntry>,
    reason_clock: u64,
}

/// Pipeline-wide metrics. All counter/gauge updates are wait-free.
#[derive(Debug, Default)]
pub struct MetricsCollector {
    file_events: AtomicU64,
    queue_full: AtomicU64,
    queue_shed: AtomicU64,
    retries: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,

    queue_length: AtomicI64,
    inflight: AtomicI64,
    workers: AtomicI64,

    state: RwLock<LockedState>,
}

/// Point-in-time copy of every counter and gauge.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsSnapshot {
    pub file_events: u64,
    pub queue_full: u64,
    pub queue_shed: u64,
    pub retries: u64,
    pub successes: u64,
    pub failures: u64,
    pub queue_length: i64,
    pub inflight: i64,
    pub workers: i64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr_file_events(&self) {
        self.file_events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_queue_full(&self) {
        self.queue_full.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_queue_shed(&self) {
        self.queue_shed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_success(&self) {
        self.successes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_queue_length(&self, v: i64) {
        self.queue_length.store(v, Ordering::Relaxed);
    }

    pub fn set_inflight(&self, v: i64) {
        self.inflight.store(v, Ordering::Relaxed);
    }

    pub fn set_workers(&self, v: i64) {
        self.workers.store(v, Ordering::Relaxed);
    }

    pub fn observe_upload_duration(&self, secs: f64) {
        self.state.write().duration.observe(secs);
    }

    /// Count one upload failure under its normalized reason label.
    pub fn record_failure_reason(&self, reason: &str) {
        let key = normalize_reason(reason);
        let mut state = self.state.write();
        state.reason_clock += 1;
        let clock = state.reason_clock;

        if let Some(entry) = state.reasons.get_mut(&key) {
            entry.count += 1;
            entry.last_seen = clock;
            return;
        }

        if state.reasons.len() >= MAX_REASONS {
            if let Some(oldest) = state
                .reasons
                .iter()
                .min_by_key(|(_, e)| e.last_seen)
                .map(|(k, _)| k.clone())
            {
                state.reasons.remove(&oldest);
            }
        }

        state.reasons.insert(
            key,
            ReasonEntry {
                count: 1,
                last_seen: clock,
            },
        );
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            file_events: self.file_events.load(Ordering::Relaxed),
            queue_full: self.queue_full.load(Ordering::Relaxed),
            queue_shed: self.queue_shed.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            queue_length: self.queue_length.load(Ordering::Relaxed),
            inflight: self.inflight.load(Ordering::Relaxed),
            workers: self.workers.load(Ordering::Relaxed),
        }
    }

    /// Top failure reasons ordered by count descending, then reason ascending.
    pub fn top_failure_reasons(&self, n: usize) -> Vec<ReasonCount> {
        let state = self.state.read();
        let mut entries: Vec<ReasonCount> = state
            .reasons
            .iter()
            .map(|(reason, e)| ReasonCount {
                reason: reason.clone(),
                count: e.count,
            })
            .collect();
        drop(state);

        entries.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.reason.cmp(&b.reason)));
        entries.truncate(n);
        entries
    }

    /// Render every metric in the Prometheus text exposition format. All
    /// documented names appear even when no events have occurred, so absence
    /// alerts never fire against a healthy agent.
    pub fn render_prometheus(&self) -> String {
        let snap = self.snapshot();
        let (duration, mut reasons) = {
            let state = self.state.read();
            let mut reasons: Vec<(String, u64)> = state
                .reasons
                .iter()
                .map(|(k, e)| (k.clone(), e.count))
                .collect();
            reasons.sort_by(|a, b| a.0.cmp(&b.0));
            (state.duration.clone(), reasons)
        };

        let mut out = String::with_capacity(2048);

        counter(
            &mut out,
            "gwf_file_events_total",
            "Filesystem events that passed every filter.",
            snap.file_events,
        );
        gauge(
            &mut out,
            "gwf_upload_queue_length",
            "Items buffered in the upload channel.",
            snap.queue_length,
        );
        gauge(
            &mut out,
            "gwf_upload_inflight",
            "Uploads currently being executed by workers.",
            snap.inflight,
        );
        gauge(
            &mut out,
            "gwf_upload_workers",
            "Configured upload worker count.",
            snap.workers,
        );
        counter(
            &mut out,
            "gwf_upload_queue_full_total",
            "Enqueue attempts rejected because the channel was full.",
            snap.queue_full,
        );
        counter(
            &mut out,
            "gwf_upload_queue_shed_total",
            "Events deliberately dropped above the saturation threshold.",
            snap.queue_shed,
        );
        counter(
            &mut out,
            "gwf_upload_retry_total",
            "Upload attempts that were retried after a failure.",
            snap.retries,
        );
        counter(
            &mut out,
            "gwf_upload_success_total",
            "Uploads completed successfully.",
            snap.successes,
        );
        counter(
            &mut out,
            "gwf_upload_failure_total",
            "Uploads that failed terminally.",
            snap.failures,
        );

        let _ = writeln!(
            out,
            "# HELP gwf_upload_failure_reason_total Upload failures by normalized reason."
        );
        let _ = writeln!(out, "# TYPE gwf_upload_failure_reason_total counter");
        for (reason, count) in reasons.drain(..) {
            let _ = writeln!(
                out,
                "gwf_upload_failure_reason_total{{reason=\"{}\"}} {}",
                escape_label(&reason),
                count
            );
        }

        let _ = writeln!(
            out,
            "# HELP gwf_upload_duration_seconds Upload duration in seconds."
        );
        let _ = writeln!(out, "# TYPE gwf_upload_duration_seconds histogram");
        for (i, bound) in DURATION_BUCKETS.iter().enumerate() {
            let _ = writeln!(
                out,
                "gwf_upload_duration_seconds_bucket{{le=\"{}\"}} {}",
                bound, duration.buckets[i]
            );
        }
        let _ = writeln!(
            out,
            "gwf_upload_duration_seconds_bucket{{le=\"+Inf\"}} {}",
            duration.count
        );
        let _ = writeln!(out, "gwf_upload_duration_seconds_sum {}", duration.sum);
        let _ = writeln!(out, "gwf_upload_duration_seconds_count {}", duration.count);

        out
    }
}

/// Lowercase, collapse runs of whitespace, truncate to the label budget.
fn normalize_reason(reason: &str) -> String {
    let collapsed = reason
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    collapsed.chars().take(MAX_REASON_LEN).collect()
}

fn escape_label(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

fn counter(out: &mut String, name: &str, help: &str, value: u64) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} counter");
    let _ = writeln!(out, "{name} {value}");
}

fn gauge(out: &mut String, name: &str, help: &str, value: i64) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} gauge");
    let _ = writeln!(out, "{name} {value}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_documented_names_render_even_at_zero() {
        let m = MetricsCollector::new();
        let text = m.render_prometheus();
        for name in [
            "gwf_file_events_total",
            "gwf_upload_queue_length",
            "gwf_upload_inflight",
            "gwf_upload_workers",
            "gwf_upload_queue_full_total",
            "gwf_upload_queue_shed_total",
            "gwf_upload_retry_total",
            "gwf_upload_success_total",
            "gwf_upload_failure_total",
            "gwf_upload_failure_reason_total",
            "gwf_upload_duration_seconds",
        ] {
            assert!(text.contains(name), "missing metric {name}");
        }
        assert!(text.contains("gwf_file_events_total 0"));
    }

    #[test]
    fn histogram_buckets_are_cumulative() {
        let m = MetricsCollector::new();
        m.observe_upload_duration(0.07);
        m.observe_upload_duration(0.3);
        m.observe_upload_duration(60.0);

        let text = m.render_prometheus();
        let mut prev = 0u64;
        for bound in DURATION_BUCKETS {
            let needle = format!("gwf_upload_duration_seconds_bucket{{le=\"{bound}\"}} ");
            let line = text
                .lines()
                .find(|l| l.starts_with(&needle))
                .unwrap_or_else(|| panic!("no bucket line for {bound}"));
            let count: u64 = line.rsplit(' ').next().unwrap().parse().unwrap();
            assert!(count >= prev, "bucket counts must be non-decreasing");
            prev = count;
        }
        assert!(text.contains("gwf_upload_duration_seconds_bucket{le=\"+Inf\"} 3"));
        assert!(text.contains("gwf_upload_duration_seconds_count 3"));
    }

    #[test]
    fn reason_normalization_collapses_whitespace() {
        let m = MetricsCollector::new();
        m.record_failure_reason("Network   Timeout\nwhile\tsending");
        let text = m.render_prometheus();
        assert!(
            text.contains("gwf_upload_failure_reason_total{reason=\"network timeout while sending\"} 1"),
            "got: {text}"
        );
    }

    #[test]
    fn label_values_are_escaped() {
        assert_eq!(escape_label(r#"a"b\c"#), r#"a\"b\\c"#);
        assert_eq!(escape_label("a\nb"), "a\\nb");
    }

    #[test]
    fn reason_truncation() {
        let m = MetricsCollector::new();
        let long = "x".repeat(500);
        m.record_failure_reason(&long);
        let top = m.top_failure_reasons(1);
        assert_eq!(top[0].reason.len(), MAX_REASON_LEN);
    }

    #[test]
    fn reason_map_evicts_least_recently_seen() {
        let m = MetricsCollector::new();
        for i in 0..MAX_REASONS {
            m.record_failure_reason(&format!("reason-{i}"));
        }
        // Refresh reason-0 so reason-1 becomes the eviction candidate.
        m.record_failure_reason("reason-0");
        m.record_failure_reason("brand-new");

        let reasons: Vec<String> = m
            .top_failure_reasons(usize::MAX)
            .into_iter()
            .map(|r| r.reason)
            .collect();
        assert!(reasons.iter().any(|r| r == "reason-0"));
        assert!(reasons.iter().any(|r| r == "brand-new"));
        assert!(!reasons.iter().any(|r| r == "reason-1"));
        assert_eq!(reasons.len(), MAX_REASONS);
    }

    #[test]
    fn top_reasons_order() {
        let m = MetricsCollector::new();
        m.record_failure_reason("beta");
        m.record_failure_reason("beta");
        m.record_failure_reason("alpha");
        m.record_failure_reason("gamma");

        let top = m.top_failure_reasons(3);
        assert_eq!(top[0].reason, "beta");
        assert_eq!(top[0].count, 2);
        // Ties break on reason ascending.
        assert_eq!(top[1].reason, "alpha");
        assert_eq!(top[2].reason, "gamma");
    }
}
