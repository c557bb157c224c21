// Scan orchestration
//
// One request flows through: size gate -> per-source normalization ->
// code bypass (user input only) -> keyword prefilter -> multi-source
// rule scan -> verdict + audit token. Sources are scanned in canonical
// order (user < external[0] < ... < combined) and rules in canonical
// registry order, so two identical requests against the same snapshot
// produce identical verdicts and audit tokens.
//
// The scan path is CPU-bound and does no I/O; the async wrapper moves it
// onto the blocking pool and enforces the request deadline. Any internal
// failure maps to REVIEW_REQUIRED under fail-closed (the default) or
// CLEAN under fail-open.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::config::Config;
use crate::dataset::{Rule, Severity};
use crate::detect::CodeDetector;
use crate::normalize::{NormalizeError, Normalizer, PipelineNormalizer};
use crate::prefilter::KeywordPrefilter;
use crate::registry::{RegistrySnapshot, SharedRegistry};
use crate::telemetry::Telemetry;

pub const SCANNER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Sentinel between sources in the combined view: a private-use
/// codepoint that the normalizer can never emit from user content.
pub const SOURCE_SEPARATOR: char = '\u{F8FF}';

// ---------------------------------------------------------------------------
// Request / result contracts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanRequest {
    pub user_input: String,
    #[serde(default)]
    pub external_chunks: Vec<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScanStatus {
    Clean,
    CleanCode,
    Rejected,
    Warn,
    ReviewRequired,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanResult {
    pub status: ScanStatus,
    pub rule_id: Option<String>,
    pub dataset: Option<String>,
    pub severity: Option<Severity>,
    pub audit_token: String,
    pub processing_time_ms: f64,
    pub rule_set_version: String,
    pub scanner_version: String,
    pub note: Option<String>,
    /// True when this result came from the fail policy (internal error,
    /// deadline, panic) rather than a real decision. Feeds the HTTP
    /// layer's circuit breaker; never serialized.
    #[serde(skip)]
    pub degraded: bool,
}

/// Which scanned text a verdict came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    User,
    External(usize),
    Combined,
}

impl SourceKind {
    pub fn label(&self) -> String {
        match self {
            SourceKind::User => "user".to_string(),
            SourceKind::External(i) => format!("external[{i}]"),
            SourceKind::Combined => "combined".to_string(),
        }
    }
}

/// A verdict-producing match, fully redacted: rule identity, source kind
/// and a span hash, never the matched text.
#[derive(Debug, Clone)]
struct RuleHit {
    rule: Arc<Rule>,
    source: SourceKind,
    span_hash: String,
}

// ---------------------------------------------------------------------------
// Scanner
// ---------------------------------------------------------------------------

pub struct Scanner {
    config: Arc<Config>,
    registry: SharedRegistry,
    normalizer: Arc<dyn Normalizer>,
    detector: CodeDetector,
    prefilter: KeywordPrefilter,
    telemetry: Arc<Telemetry>,
}

impl Scanner {
    pub fn new(config: Arc<Config>, registry: SharedRegistry, telemetry: Arc<Telemetry>) -> Self {
        let normalizer: Arc<dyn Normalizer> =
            Arc::new(PipelineNormalizer::new(config.normalize.clone()));
        let detector = CodeDetector::new(config.code_detection.clone());
        let prefilter = KeywordPrefilter::new(&config.prefilter);
        Self {
            config,
            registry,
            normalizer,
            detector,
            prefilter,
            telemetry,
        }
    }

    pub fn registry(&self) -> &SharedRegistry {
        &self.registry
    }

    /// Run one scan to completion. CPU-bound; never panics outward — any
    /// internal failure is mapped by the fail policy.
    pub fn scan(&self, request: &ScanRequest) -> ScanResult {
        let started = Instant::now();
        let request_id = Uuid::new_v4();
        let snapshot = self.registry.current();

        let result = match self.scan_inner(request, &snapshot, started) {
            Ok(result) => result,
            Err(message) => {
                tracing::error!(request_id = %request_id, error = %message, "scan failed");
                self.failure_result(request, &snapshot, started, &message)
            }
        };

        self.telemetry.record_request(result.status);
        self.telemetry
            .observe_scan_duration(result.processing_time_ms);

        tracing::info!(
            request_id = %request_id,
            status = ?result.status,
            rule_id = result.rule_id.as_deref().unwrap_or("-"),
            rule_set_version = %result.rule_set_version,
            latency_ms = result.processing_time_ms,
            "scan complete"
        );

        result
    }

    /// Async entry point enforcing the whole-scan deadline. The scan runs
    /// on the blocking pool; exceeding the deadline yields the fail-policy
    /// status and the task's eventual result is discarded.
    pub async fn scan_with_deadline(self: Arc<Self>, request: ScanRequest) -> ScanResult {
        let deadline = Duration::from_millis(self.config.scan.scan_deadline_ms);
        let started = Instant::now();

        let scanner = Arc::clone(&self);
        let task_request = request.clone();
        let task = tokio::task::spawn_blocking(move || scanner.scan(&task_request));

        match tokio::time::timeout(deadline, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => {
                tracing::error!(error = %join_error, "scan task failed");
                let result = self.failure_result(
                    &request,
                    &self.registry.current(),
                    started,
                    "scan task failed",
                );
                self.telemetry.record_request(result.status);
                result
            }
            Err(_) => {
                tracing::warn!(
                    deadline_ms = self.config.scan.scan_deadline_ms,
                    "scan deadline exceeded"
                );
                let result = self.failure_result(
                    &request,
                    &self.registry.current(),
                    started,
                    "scan deadline exceeded",
                );
                self.telemetry.record_request(result.status);
                result
            }
        }
    }

    fn scan_inner(
        &self,
        request: &ScanRequest,
        snapshot: &RegistrySnapshot,
        started: Instant,
    ) -> Result<ScanResult, String> {
        // 1) Size gate over the whole request.
        let total_bytes: usize = request.user_input.len()
            + request.external_chunks.iter().map(|c| c.len()).sum::<usize>();
        if total_bytes > self.config.scan.max_input_bytes {
            return Ok(self.finish(
                request,
                snapshot,
                started,
                ScanStatus::Error,
                None,
                Some(format!(
                    "input of {total_bytes} bytes exceeds the {} byte limit",
                    self.config.scan.max_input_bytes
                )),
            ));
        }

        // 2) Normalize every source independently.
        let user = match self.normalizer.normalize(&request.user_input) {
            Ok(n) => n,
            Err(NormalizeError::Oversize { size, limit }) => {
                return Ok(self.finish(
                    request,
                    snapshot,
                    started,
                    ScanStatus::Error,
                    None,
                    Some(format!(
                        "input of {size} bytes exceeds the {limit} byte limit"
                    )),
                ));
            }
        };
        if user.flags.zero_width_present || user.flags.homoglyph_present || user.flags.bidi_present
        {
            tracing::debug!(
                zero_width = user.flags.zero_width_present,
                homoglyph = user.flags.homoglyph_present,
                bidi = user.flags.bidi_present,
                "obfuscation indicators raised during normalization"
            );
        }

        let mut chunks = Vec::with_capacity(request.external_chunks.len());
        for chunk in &request.external_chunks {
            match self.normalizer.normalize(chunk) {
                Ok(n) => chunks.push(n),
                Err(NormalizeError::Oversize { size, limit }) => {
                    return Ok(self.finish(
                        request,
                        snapshot,
                        started,
                        ScanStatus::Error,
                        None,
                        Some(format!(
                            "chunk of {size} bytes exceeds the {limit} byte limit"
                        )),
                    ));
                }
            }
        }

        // 3) Code bypass for user input — never for external chunks,
        //    which are untrusted regardless of what they look like.
        if request.external_chunks.is_empty() {
            let verdict = self.detector.detect(&user.normalized);
            if verdict.is_code {
                return Ok(self.finish(
                    request,
                    snapshot,
                    started,
                    ScanStatus::CleanCode,
                    None,
                    Some(format!(
                        "code detected ({}, confidence={:.2})",
                        verdict.reason, verdict.confidence
                    )),
                ));
            }
        }

        // 4) Assemble sources in canonical order. The combined view joins
        //    the sources with the boundary sentinel, rendered as a space
        //    for matching so a phrase split across chunks still matches.
        let mut sources: Vec<(SourceKind, String)> =
            vec![(SourceKind::User, user.normalized.clone())];
        for (i, chunk) in chunks.iter().enumerate() {
            sources.push((SourceKind::External(i), chunk.normalized.clone()));
        }
        if !chunks.is_empty() {
            let combined: String = sources
                .iter()
                .map(|(_, text)| text.as_str())
                .collect::<Vec<_>>()
                .join(&SOURCE_SEPARATOR.to_string());
            sources.push((
                SourceKind::Combined,
                combined.replace(SOURCE_SEPARATOR, " "),
            ));
        }

        // 5) Keyword prefilter over every source.
        if !self.prefilter.any_hit(sources.iter().map(|(_, text)| text.as_str())) {
            return Ok(self.finish(
                request,
                snapshot,
                started,
                ScanStatus::Clean,
                None,
                Some("no prefilter keyword present".to_string()),
            ));
        }

        // 6) Full rule scan.
        if self.config.scan.stop_on_first_match {
            for (kind, text) in &sources {
                if let Some(hit) = self.scan_source(snapshot, *kind, text) {
                    let status = severity_status(hit.rule.severity);
                    let note = format!("matched in {}", hit.source.label());
                    return Ok(self.finish(
                        request,
                        snapshot,
                        started,
                        status,
                        Some(&hit),
                        Some(note),
                    ));
                }
            }
        } else {
            let hits = self.scan_ensemble(snapshot, &sources);
            if !hits.is_empty() {
                let score = ensemble_score(&hits);
                let status = if score >= self.config.scan.ensemble_threshold {
                    ScanStatus::Rejected
                } else {
                    ScanStatus::Warn
                };
                let top = hits
                    .iter()
                    .max_by(|a, b| a.rule.impact_score.total_cmp(&b.rule.impact_score))
                    .expect("hits is non-empty");
                let note = format!("ensemble score {score:.2} from {} rules", hits.len());
                return Ok(self.finish(
                    request,
                    snapshot,
                    started,
                    status,
                    Some(top),
                    Some(note),
                ));
            }
        }

        // 7) Nothing matched.
        Ok(self.finish(request, snapshot, started, ScanStatus::Clean, None, None))
    }

    /// Scan one source against the snapshot in canonical rule order,
    /// returning the first verdict-producing hit. Canary matches and
    /// pattern timeouts are recorded and skipped.
    fn scan_source(
        &self,
        snapshot: &RegistrySnapshot,
        kind: SourceKind,
        text: &str,
    ) -> Option<RuleHit> {
        let budget = Duration::from_millis(self.config.scan.regex_timeout_ms);

        for rule in snapshot.active_rules() {
            let search_started = Instant::now();
            match rule.pattern.search(text, budget) {
                Ok(Some(record)) => {
                    rule.record_match(search_started.elapsed().as_secs_f64() * 1000.0);
                    self.telemetry.record_rule_match(&rule.dataset, rule.severity);
                    if !rule.counts_toward_verdict() {
                        tracing::info!(
                            rule_id = %rule.id,
                            dataset = %rule.dataset,
                            source = %kind.label(),
                            span_hash = %record.span_hash,
                            "canary rule matched (shadow)"
                        );
                        continue;
                    }
                    return Some(RuleHit {
                        rule: Arc::clone(rule),
                        source: kind,
                        span_hash: record.span_hash,
                    });
                }
                Ok(None) => {}
                Err(timeout) => {
                    self.telemetry.record_regex_timeout();
                    let benched = rule.record_timeout();
                    tracing::warn!(
                        rule_id = %rule.id,
                        dataset = %rule.dataset,
                        source = %kind.label(),
                        budget_ms = timeout.budget_ms,
                        benched,
                        "regex timeout, treating as no match"
                    );
                }
            }
        }
        None
    }

    /// Evaluate every rule against every source, deduplicating by rule.
    /// Whether the combined view contributes is configuration.
    fn scan_ensemble(
        &self,
        snapshot: &RegistrySnapshot,
        sources: &[(SourceKind, String)],
    ) -> Vec<RuleHit> {
        let budget = Duration::from_millis(self.config.scan.regex_timeout_ms);
        let mut hits: Vec<RuleHit> = Vec::new();

        for (kind, text) in sources {
            if *kind == SourceKind::Combined && !self.config.scan.ensemble_combined_sources {
                continue;
            }
            for rule in snapshot.active_rules() {
                if hits.iter().any(|h| h.rule.id == rule.id) {
                    continue;
                }
                let search_started = Instant::now();
                match rule.pattern.search(text, budget) {
                    Ok(Some(record)) => {
                        rule.record_match(search_started.elapsed().as_secs_f64() * 1000.0);
                        self.telemetry.record_rule_match(&rule.dataset, rule.severity);
                        if !rule.counts_toward_verdict() {
                            tracing::info!(
                                rule_id = %rule.id,
                                dataset = %rule.dataset,
                                source = %kind.label(),
                                "canary rule matched (shadow)"
                            );
                            continue;
                        }
                        hits.push(RuleHit {
                            rule: Arc::clone(rule),
                            source: *kind,
                            span_hash: record.span_hash,
                        });
                    }
                    Ok(None) => {}
                    Err(timeout) => {
                        self.telemetry.record_regex_timeout();
                        let benched = rule.record_timeout();
                        tracing::warn!(
                            rule_id = %rule.id,
                            budget_ms = timeout.budget_ms,
                            benched,
                            "regex timeout, treating as no match"
                        );
                    }
                }
            }
        }
        hits
    }

    /// Package a terminal verdict. Every exit path funnels through here so
    /// the audit token, redaction and timing stay consistent.
    fn finish(
        &self,
        request: &ScanRequest,
        snapshot: &RegistrySnapshot,
        started: Instant,
        status: ScanStatus,
        hit: Option<&RuleHit>,
        note: Option<String>,
    ) -> ScanResult {
        let audit_token = audit_token(
            request,
            snapshot.version(),
            hit.map(|h| h.rule.id.as_str()),
            hit.map(|h| h.span_hash.as_str()),
        );

        if let Some(hit) = hit {
            tracing::info!(
                rule_id = %hit.rule.id,
                dataset = %hit.rule.dataset,
                severity = hit.rule.severity.as_str(),
                source_kind = %hit.source.label(),
                match_span_hash = %hit.span_hash,
                audit_token = %audit_token,
                "rule verdict"
            );
        }

        ScanResult {
            status,
            rule_id: hit.map(|h| h.rule.id.clone()),
            dataset: hit.map(|h| h.rule.dataset.clone()),
            severity: hit.map(|h| h.rule.severity),
            audit_token,
            processing_time_ms: started.elapsed().as_secs_f64() * 1000.0,
            rule_set_version: snapshot.version().to_string(),
            scanner_version: SCANNER_VERSION.to_string(),
            note,
            degraded: false,
        }
    }

    /// Fail policy: fail-closed produces REVIEW_REQUIRED, fail-open
    /// (development only) produces CLEAN. The note stays short and
    /// non-revealing.
    fn failure_result(
        &self,
        request: &ScanRequest,
        snapshot: &RegistrySnapshot,
        started: Instant,
        message: &str,
    ) -> ScanResult {
        let (status, mode) = if self.config.scan.fail_open {
            (ScanStatus::Clean, "fail-open")
        } else {
            (ScanStatus::ReviewRequired, "fail-closed")
        };
        let mut result = self.finish(
            request,
            snapshot,
            started,
            status,
            None,
            Some(format!("{message} ({mode})")),
        );
        result.degraded = true;
        result
    }
}

// ---------------------------------------------------------------------------
// Verdict helpers
// ---------------------------------------------------------------------------

fn severity_status(severity: Severity) -> ScanStatus {
    match severity {
        Severity::Critical | Severity::High => ScanStatus::Rejected,
        Severity::Medium | Severity::Low => ScanStatus::Warn,
    }
}

/// Aggregated ensemble score: 1 - prod(1 - impact_i) over matched rules.
fn ensemble_score(hits: &[RuleHit]) -> f64 {
    let miss_all: f64 = hits
        .iter()
        .map(|h| 1.0 - h.rule.impact_score.clamp(0.0, 1.0))
        .product();
    1.0 - miss_all
}

/// Deterministic audit token over (request fingerprint, rule set version,
/// matched rule id or none, matched span hash or none). Traceable without
/// exposing any matched text.
fn audit_token(
    request: &ScanRequest,
    rule_set_version: &str,
    rule_id: Option<&str>,
    span_hash: Option<&str>,
) -> String {
    let mut fingerprint = Sha256::new();
    fingerprint.update(request.user_input.as_bytes());
    for chunk in &request.external_chunks {
        fingerprint.update([0x1F]);
        fingerprint.update(chunk.as_bytes());
    }

    let mut outer = Sha256::new();
    outer.update(fingerprint.finalize());
    outer.update([0x1F]);
    outer.update(rule_set_version.as_bytes());
    outer.update([0x1F]);
    outer.update(rule_id.unwrap_or("-").as_bytes());
    outer.update([0x1F]);
    outer.update(span_hash.unwrap_or("-").as_bytes());

    URL_SAFE_NO_PAD.encode(outer.finalize())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
