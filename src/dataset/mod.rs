// Rule and dataset model
//
// A Rule is a compiled detection unit inside exactly one registry
// snapshot. Metadata fields are immutable after load; the analytics
// counters are read-mostly telemetry updated through atomics (occasional
// lost updates are acceptable, they are never used for correctness).

pub mod loader;

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::matcher::SafePattern;

/// Consecutive timeouts before a rule is benched for the remainder of
/// the snapshot's life.
pub const TIMEOUT_QUARANTINE_STRIKES: u32 = 3;

// ---------------------------------------------------------------------------
// Severity and lifecycle state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
}

impl Severity {
    /// Canonical-order weight: critical=4, high=3, medium=2, low=1.
    pub fn weight(&self) -> u8 {
        match self {
            Severity::Critical => 4,
            Severity::High => 3,
            Severity::Medium => 2,
            Severity::Low => 1,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Critical => "critical",
            Severity::High => "high",
            Severity::Medium => "medium",
            Severity::Low => "low",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleState {
    Draft,
    Testing,
    Canary,
    Active,
    Deprecated,
    Quarantined,
}

// ---------------------------------------------------------------------------
// Rule
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct Rule {
    /// Stable id, unique within its dataset.
    pub id: String,
    /// Owning dataset name.
    pub dataset: String,
    pub name: String,
    pub description: String,
    /// Compiled pattern; the original pattern text lives inside.
    pub pattern: SafePattern,
    pub severity: Severity,
    pub state: RuleState,
    pub enabled: bool,
    /// Contribution to the ensemble score, in [0, 1].
    pub impact_score: f64,
    pub tags: Vec<String>,
    pub positive_tests: Vec<String>,
    pub negative_tests: Vec<String>,
    counters: RuleCounters,
}

#[derive(Debug, Default)]
struct RuleCounters {
    match_count: AtomicU64,
    /// Unix seconds of the most recent match; 0 = never.
    last_matched_at: AtomicU64,
    /// Cumulative pattern execution time across matches, in microseconds.
    exec_time_micros: AtomicU64,
    timeout_strikes: AtomicU32,
    timeout_quarantined: AtomicBool,
}

impl Rule {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: String,
        dataset: String,
        name: String,
        description: String,
        pattern: SafePattern,
        severity: Severity,
        state: RuleState,
        enabled: bool,
        impact_score: f64,
        tags: Vec<String>,
        positive_tests: Vec<String>,
        negative_tests: Vec<String>,
    ) -> Self {
        Self {
            id,
            dataset,
            name,
            description,
            pattern,
            severity,
            state,
            enabled,
            impact_score,
            tags,
            positive_tests,
            negative_tests,
            counters: RuleCounters::default(),
        }
    }

    /// Whether this rule participates in scans: enabled, in an eligible
    /// lifecycle state, and not benched for repeated timeouts.
    pub fn is_scannable(&self) -> bool {
        self.enabled
            && matches!(self.state, RuleState::Active | RuleState::Canary)
            && !self.counters.timeout_quarantined.load(Ordering::Relaxed)
    }

    /// Canary rules are scanned in shadow mode: matches are recorded but
    /// never produce a verdict.
    pub fn counts_toward_verdict(&self) -> bool {
        self.state == RuleState::Active
    }

    /// Record a match and the wall-clock time the matching search took.
    pub fn record_match(&self, execution_time_ms: f64) {
        self.counters.match_count.fetch_add(1, Ordering::Relaxed);
        self.counters
            .exec_time_micros
            .fetch_add((execution_time_ms * 1000.0) as u64, Ordering::Relaxed);
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        self.counters.last_matched_at.store(now, Ordering::Relaxed);
    }

    /// Record a pattern timeout. Returns true when this strike tripped
    /// the quarantine (the rule is benched until the next reload).
    pub fn record_timeout(&self) -> bool {
        let strikes = self.counters.timeout_strikes.fetch_add(1, Ordering::Relaxed) + 1;
        if strikes >= TIMEOUT_QUARANTINE_STRIKES {
            !self.counters.timeout_quarantined.swap(true, Ordering::Relaxed)
        } else {
            false
        }
    }

    pub fn match_count(&self) -> u64 {
        self.counters.match_count.load(Ordering::Relaxed)
    }

    pub fn last_matched_at(&self) -> Option<u64> {
        match self.counters.last_matched_at.load(Ordering::Relaxed) {
            0 => None,
            secs => Some(secs),
        }
    }

    /// Average execution time per matching search, in milliseconds.
    /// Cumulative over the snapshot's lifetime; None before any match.
    pub fn avg_execution_time_ms(&self) -> Option<f64> {
        let matches = self.counters.match_count.load(Ordering::Relaxed);
        if matches == 0 {
            return None;
        }
        let total_micros = self.counters.exec_time_micros.load(Ordering::Relaxed);
        Some(total_micros as f64 / 1000.0 / matches as f64)
    }

    pub fn is_timeout_quarantined(&self) -> bool {
        self.counters.timeout_quarantined.load(Ordering::Relaxed)
    }
}

// ---------------------------------------------------------------------------
// Dataset metadata
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DatasetMetadata {
    pub name: String,
    pub version: String,
    pub source: String,
    pub last_updated: String,
    pub total_rules: usize,
    pub dataset_build_id: String,
    /// Hex-encoded HMAC-SHA256 over the canonical serialization of the
    /// dataset with this field removed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hmac_signature: Option<String>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
