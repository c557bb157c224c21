// Copyright 2026 The Rampart Project
// SPDX-License-Identifier: Apache-2.0

// Safe pattern execution
//
// Compilation prefers the linear-time engine: its worst case is O(n) and
// immune to catastrophic backtracking. Patterns that need backreferences
// or lookaround fall back to a backtracking engine capped by an explicit
// backtrack limit, and every search is additionally checked against a
// wall-clock budget. Match records carry a hash of the matched span,
// never the span itself.

use std::fmt;
use std::time::{Duration, Instant};

use regex::RegexBuilder;
use sha2::{Digest, Sha256};

/// Maximum compiled regex size (1 MB). Prevents pathological patterns
/// from consuming excessive memory at load time.
const MAX_REGEX_SIZE: usize = 1024 * 1024;

/// Backtracking step ceiling for the fallback engine.
const BACKTRACK_LIMIT: usize = 250_000;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
#[error("invalid pattern \"{pattern}\": {message}")]
pub struct CompileError {
    pub pattern: String,
    pub message: String,
}

/// Pattern execution exceeded its budget (wall clock or backtrack limit).
/// Callers treat this as "no match" for the rule and record telemetry.
#[derive(Debug, thiserror::Error)]
#[error("pattern execution exceeded the {budget_ms}ms budget")]
pub struct MatchTimeout {
    pub budget_ms: u64,
}

// ---------------------------------------------------------------------------
// Match record
// ---------------------------------------------------------------------------

/// The span of the first match plus a redacted content hash. The matched
/// substring itself never leaves this module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchRecord {
    pub start: usize,
    pub end: usize,
    /// "sha256:{first 16 hex chars}" over the matched substring.
    pub span_hash: String,
}

pub fn hash_span(span: &str) -> String {
    let digest = Sha256::digest(span.as_bytes());
    let hex = format!("{:x}", digest);
    format!("sha256:{}", &hex[..16])
}

// ---------------------------------------------------------------------------
// SafePattern
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineKind {
    /// Linear-time engine; cannot backtrack catastrophically.
    Linear,
    /// Bounded-backtracking fallback for lookaround/backreferences.
    Backtracking,
}

enum Engine {
    Linear(regex::Regex),
    Backtracking(fancy_regex::Regex),
}

/// A compiled detection pattern with the original text preserved for
/// diagnostics.
pub struct SafePattern {
    pub pattern: String,
    engine: Engine,
}

impl SafePattern {
    /// Compile `pattern`, preferring the linear engine. Called only during
    /// dataset load.
    pub fn compile(pattern: &str) -> Result<Self, CompileError> {
        match RegexBuilder::new(pattern).size_limit(MAX_REGEX_SIZE).build() {
            Ok(regex) => Ok(Self {
                pattern: pattern.to_string(),
                engine: Engine::Linear(regex),
            }),
            Err(linear_err) => {
                let fallback = fancy_regex::RegexBuilder::new(pattern)
                    .backtrack_limit(BACKTRACK_LIMIT)
                    .delegate_size_limit(MAX_REGEX_SIZE)
                    .build();
                match fallback {
                    Ok(regex) => Ok(Self {
                        pattern: pattern.to_string(),
                        engine: Engine::Backtracking(regex),
                    }),
                    // Report the linear engine's message: it is the primary
                    // engine and its diagnostics are better.
                    Err(_) => Err(CompileError {
                        pattern: pattern.to_string(),
                        message: linear_err.to_string(),
                    }),
                }
            }
        }
    }

    pub fn engine_kind(&self) -> EngineKind {
        match self.engine {
            Engine::Linear(_) => EngineKind::Linear,
            Engine::Backtracking(_) => EngineKind::Backtracking,
        }
    }

    /// Find the first match in `text` under the given wall-clock budget.
    ///
    /// A backtrack-limit overrun in the fallback engine and a blown
    /// wall-clock budget are both reported as `MatchTimeout`; the caller
    /// decides what "no match" means for the owning rule.
    pub fn search(&self, text: &str, budget: Duration) -> Result<Option<MatchRecord>, MatchTimeout> {
        let started = Instant::now();
        let budget_ms = budget.as_millis() as u64;

        let span = match &self.engine {
            Engine::Linear(regex) => regex.find(text).map(|m| (m.start(), m.end())),
            Engine::Backtracking(regex) => match regex.find(text) {
                Ok(found) => found.map(|m| (m.start(), m.end())),
                // Backtrack limit exceeded (or another runtime fault):
                // the pattern is misbehaving on this input.
                Err(_) => return Err(MatchTimeout { budget_ms }),
            },
        };

        if started.elapsed() > budget {
            return Err(MatchTimeout { budget_ms });
        }

        Ok(span.map(|(start, end)| MatchRecord {
            start,
            end,
            span_hash: hash_span(&text[start..end]),
        }))
    }

    /// Convenience for self-tests: does the pattern match at all?
    pub fn is_match(&self, text: &str, budget: Duration) -> Result<bool, MatchTimeout> {
        Ok(self.search(text, budget)?.is_some())
    }
}

impl fmt::Debug for SafePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SafePattern")
            .field("pattern", &self.pattern)
            .field("engine", &self.engine_kind())
            .finish()
    }
}

impl PartialEq for SafePattern {
    fn eq(&self, other: &Self) -> bool {
        self.pattern == other.pattern
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const BUDGET: Duration = Duration::from_millis(100);

    // -------------------------------------------------------------------
    // Engine selection
    // -------------------------------------------------------------------

    #[test]
    fn plain_pattern_uses_linear_engine() {
        let p = SafePattern::compile(r"(?i)ignore\s+previous").unwrap();
        assert_eq!(p.engine_kind(), EngineKind::Linear);
    }

    #[test]
    fn lookahead_pattern_falls_back_to_backtracking() {
        let p = SafePattern::compile(r"(?=ignore)ignore previous").unwrap();
        assert_eq!(p.engine_kind(), EngineKind::Backtracking);
    }

    #[test]
    fn backreference_pattern_falls_back_to_backtracking() {
        let p = SafePattern::compile(r"(ignore) \1").unwrap();
        assert_eq!(p.engine_kind(), EngineKind::Backtracking);
        let m = p.search("please ignore ignore this", BUDGET).unwrap();
        assert!(m.is_some());
    }

    #[test]
    fn garbage_pattern_fails_both_engines() {
        let err = SafePattern::compile(r"(unclosed").unwrap_err();
        assert_eq!(err.pattern, "(unclosed");
    }

    // -------------------------------------------------------------------
    // Matching and redaction
    // -------------------------------------------------------------------

    #[test]
    fn match_record_carries_span_and_hash_only() {
        let p = SafePattern::compile(r"secret-\d+").unwrap();
        let m = p
            .search("the token secret-42 leaked", BUDGET)
            .unwrap()
            .unwrap();
        assert_eq!(m.start, 10);
        assert_eq!(m.end, 19);
        assert!(m.span_hash.starts_with("sha256:"));
        assert_eq!(m.span_hash.len(), "sha256:".len() + 16);
        assert!(!m.span_hash.contains("secret-42"));
    }

    #[test]
    fn span_hash_is_deterministic_and_content_sensitive() {
        assert_eq!(hash_span("ignore"), hash_span("ignore"));
        assert_ne!(hash_span("ignore"), hash_span("ignores"));
    }

    #[test]
    fn no_match_returns_none() {
        let p = SafePattern::compile(r"jailbreak").unwrap();
        assert!(p.search("innocent text", BUDGET).unwrap().is_none());
    }

    // -------------------------------------------------------------------
    // Timeout enforcement
    // -------------------------------------------------------------------

    #[test]
    fn catastrophic_backtracking_reports_timeout() {
        // The lookahead keeps this in the fallback engine, where the
        // ambiguous repetition explodes on a non-matching input and trips
        // the backtrack limit deterministically.
        let p = SafePattern::compile(r"(a|b|ab)*(?=c)").unwrap();
        assert_eq!(p.engine_kind(), EngineKind::Backtracking);

        let adversarial = "ab".repeat(100);
        let err = p.search(&adversarial, BUDGET).unwrap_err();
        assert_eq!(err.budget_ms, 100);
    }

    #[test]
    fn zero_budget_always_times_out() {
        let p = SafePattern::compile(r"needle").unwrap();
        let haystack = "hay ".repeat(10_000);
        assert!(p.search(&haystack, Duration::ZERO).is_err());
    }

    #[test]
    fn linear_engine_handles_redos_shaped_patterns() {
        // The same shape compiles on the linear engine without lookaround
        // and runs in linear time regardless of input.
        let p = SafePattern::compile(r"(a+)+$").unwrap();
        assert_eq!(p.engine_kind(), EngineKind::Linear);

        let adversarial = format!("{}!", "a".repeat(4096));
        assert!(p.search(&adversarial, BUDGET).unwrap().is_none());
    }

    #[test]
    fn oversized_pattern_rejected_at_compile_time() {
        // Nested repetition blows past the compiled-size limit.
        let huge = format!("(?:{}){{1000}}", "abcdefghij".repeat(200));
        assert!(SafePattern::compile(&huge).is_err());
    }
}
