// Runtime telemetry
//
// Process-wide counters and a fixed-bucket duration histogram, all
// lock-free. Counters are telemetry only: relaxed atomics are enough and
// an occasional lost per-dataset update is acceptable. The snapshot is
// what /metrics serves.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use dashmap::DashMap;
use serde::Serialize;

use crate::dataset::Severity;
use crate::scanner::ScanStatus;

/// Histogram bucket upper bounds in milliseconds.
const DURATION_BUCKETS_MS: [u64; 9] = [5, 10, 20, 50, 100, 200, 500, 1000, 2000];

#[derive(Default)]
pub struct Telemetry {
    requests_clean: AtomicU64,
    requests_clean_code: AtomicU64,
    requests_rejected: AtomicU64,
    requests_warn: AtomicU64,
    requests_review_required: AtomicU64,
    requests_error: AtomicU64,

    duration_buckets: [AtomicU64; 10],
    duration_sum_micros: AtomicU64,
    duration_count: AtomicU64,

    matches_critical: AtomicU64,
    matches_high: AtomicU64,
    matches_medium: AtomicU64,
    matches_low: AtomicU64,
    matches_by_dataset: DashMap<String, u64>,

    regex_timeouts: AtomicU64,
    reload_failures: AtomicU64,
    circuit_breaker_trips: AtomicU64,
    active_requests: AtomicI64,
}

impl Telemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&self, status: ScanStatus) {
        let counter = match status {
            ScanStatus::Clean => &self.requests_clean,
            ScanStatus::CleanCode => &self.requests_clean_code,
            ScanStatus::Rejected => &self.requests_rejected,
            ScanStatus::Warn => &self.requests_warn,
            ScanStatus::ReviewRequired => &self.requests_review_required,
            ScanStatus::Error => &self.requests_error,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn observe_scan_duration(&self, millis: f64) {
        let bucket = DURATION_BUCKETS_MS
            .iter()
            .position(|&bound| millis <= bound as f64)
            .unwrap_or(DURATION_BUCKETS_MS.len());
        self.duration_buckets[bucket].fetch_add(1, Ordering::Relaxed);
        self.duration_sum_micros
            .fetch_add((millis * 1000.0) as u64, Ordering::Relaxed);
        self.duration_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rule_match(&self, dataset: &str, severity: Severity) {
        let counter = match severity {
            Severity::Critical => &self.matches_critical,
            Severity::High => &self.matches_high,
            Severity::Medium => &self.matches_medium,
            Severity::Low => &self.matches_low,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        *self
            .matches_by_dataset
            .entry(dataset.to_string())
            .or_insert(0) += 1;
    }

    pub fn record_regex_timeout(&self) {
        self.regex_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reload_failure(&self) {
        self.reload_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// One transition of the scan circuit breaker to open.
    pub fn record_circuit_breaker_trip(&self) {
        self.circuit_breaker_trips.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_started(&self) {
        self.active_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_finished(&self) {
        self.active_requests.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        let buckets = DURATION_BUCKETS_MS
            .iter()
            .enumerate()
            .map(|(i, &bound)| DurationBucket {
                le_ms: Some(bound),
                count: self.duration_buckets[i].load(Ordering::Relaxed),
            })
            .chain(std::iter::once(DurationBucket {
                le_ms: None,
                count: self.duration_buckets[DURATION_BUCKETS_MS.len()].load(Ordering::Relaxed),
            }))
            .collect();

        let matches_by_dataset = self
            .matches_by_dataset
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect();

        TelemetrySnapshot {
            requests_total: RequestCounts {
                clean: self.requests_clean.load(Ordering::Relaxed),
                clean_code: self.requests_clean_code.load(Ordering::Relaxed),
                rejected: self.requests_rejected.load(Ordering::Relaxed),
                warn: self.requests_warn.load(Ordering::Relaxed),
                review_required: self.requests_review_required.load(Ordering::Relaxed),
                error: self.requests_error.load(Ordering::Relaxed),
            },
            scan_duration_ms: DurationHistogram {
                buckets,
                sum_ms: self.duration_sum_micros.load(Ordering::Relaxed) as f64 / 1000.0,
                count: self.duration_count.load(Ordering::Relaxed),
            },
            rule_matches: MatchCounts {
                critical: self.matches_critical.load(Ordering::Relaxed),
                high: self.matches_high.load(Ordering::Relaxed),
                medium: self.matches_medium.load(Ordering::Relaxed),
                low: self.matches_low.load(Ordering::Relaxed),
                by_dataset: matches_by_dataset,
            },
            regex_timeouts: self.regex_timeouts.load(Ordering::Relaxed),
            dataset_reload_failures: self.reload_failures.load(Ordering::Relaxed),
            circuit_breaker_trips: self.circuit_breaker_trips.load(Ordering::Relaxed),
            active_requests: self.active_requests.load(Ordering::Relaxed),
        }
    }
}

// ---------------------------------------------------------------------------
// Serialized snapshot
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct TelemetrySnapshot {
    pub requests_total: RequestCounts,
    pub scan_duration_ms: DurationHistogram,
    pub rule_matches: MatchCounts,
    pub regex_timeouts: u64,
    pub dataset_reload_failures: u64,
    pub circuit_breaker_trips: u64,
    pub active_requests: i64,
}

#[derive(Debug, Serialize)]
pub struct RequestCounts {
    pub clean: u64,
    pub clean_code: u64,
    pub rejected: u64,
    pub warn: u64,
    pub review_required: u64,
    pub error: u64,
}

#[derive(Debug, Serialize)]
pub struct DurationHistogram {
    pub buckets: Vec<DurationBucket>,
    pub sum_ms: f64,
    pub count: u64,
}

#[derive(Debug, Serialize)]
pub struct DurationBucket {
    /// Upper bound in ms; None is the overflow bucket.
    pub le_ms: Option<u64>,
    pub count: u64,
}

#[derive(Debug, Serialize)]
pub struct MatchCounts {
    pub critical: u64,
    pub high: u64,
    pub medium: u64,
    pub low: u64,
    pub by_dataset: std::collections::BTreeMap<String, u64>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_counters_track_status() {
        let t = Telemetry::new();
        t.record_request(ScanStatus::Clean);
        t.record_request(ScanStatus::Clean);
        t.record_request(ScanStatus::Rejected);

        let snap = t.snapshot();
        assert_eq!(snap.requests_total.clean, 2);
        assert_eq!(snap.requests_total.rejected, 1);
        assert_eq!(snap.requests_total.warn, 0);
    }

    #[test]
    fn duration_histogram_buckets_correctly() {
        let t = Telemetry::new();
        t.observe_scan_duration(3.0); // <= 5
        t.observe_scan_duration(42.0); // <= 50
        t.observe_scan_duration(5000.0); // overflow

        let snap = t.snapshot();
        assert_eq!(snap.scan_duration_ms.count, 3);
        assert_eq!(snap.scan_duration_ms.buckets[0].count, 1);
        assert_eq!(snap.scan_duration_ms.buckets[3].count, 1);
        let overflow = snap.scan_duration_ms.buckets.last().unwrap();
        assert_eq!(overflow.le_ms, None);
        assert_eq!(overflow.count, 1);
    }

    #[test]
    fn rule_matches_count_by_severity_and_dataset() {
        let t = Telemetry::new();
        t.record_rule_match("injection", Severity::Critical);
        t.record_rule_match("injection", Severity::High);
        t.record_rule_match("jailbreak", Severity::Critical);

        let snap = t.snapshot();
        assert_eq!(snap.rule_matches.critical, 2);
        assert_eq!(snap.rule_matches.high, 1);
        assert_eq!(snap.rule_matches.by_dataset["injection"], 2);
        assert_eq!(snap.rule_matches.by_dataset["jailbreak"], 1);
    }

    #[test]
    fn active_request_gauge_goes_up_and_down() {
        let t = Telemetry::new();
        t.request_started();
        t.request_started();
        t.request_finished();
        assert_eq!(t.snapshot().active_requests, 1);
    }

    #[test]
    fn circuit_breaker_trips_counted() {
        let t = Telemetry::new();
        t.record_circuit_breaker_trip();
        t.record_circuit_breaker_trip();
        assert_eq!(t.snapshot().circuit_breaker_trips, 2);
    }
}
