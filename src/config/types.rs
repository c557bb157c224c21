use std::path::PathBuf;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Top-level parsed and validated rampart config.
#[derive(Debug)]
pub struct Config {
    /// Scan behavior: timeouts, match mode, size limits, fail policy.
    pub scan: ScanConfig,
    /// Keyword prefilter fast path.
    pub prefilter: PrefilterConfig,
    /// Code-bypass heuristics for user input.
    pub code_detection: CodeDetectionConfig,
    /// Normalizer limits and thresholds.
    pub normalize: NormalizeConfig,
    /// Rule dataset locations and integrity secret.
    pub datasets: DatasetConfig,
    /// HTTP service guards: rate limits and the scan circuit breaker.
    pub server: ServerConfig,
    /// Environment label (e.g. "internal", "production").
    pub environment: String,
    /// Optional API key for /scan, /datasets/reload and /stats.
    pub api_key: Option<String>,
    /// SHA256 hash of the raw YAML: "sha256:{hex}".
    pub contract_hash: String,
}

// ---------------------------------------------------------------------------
// Typed config structs
// ---------------------------------------------------------------------------

/// Scan behavior configuration.
#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// Per-pattern wall-clock ceiling in milliseconds.
    pub regex_timeout_ms: u64,
    /// If true, the first matched rule yields a terminal verdict;
    /// otherwise all rules are evaluated and ensemble-scored.
    pub stop_on_first_match: bool,
    /// Ensemble score cutoff for REJECTED (vs WARN) in ensemble mode.
    pub ensemble_threshold: f64,
    /// Whether combined-source matches contribute to the ensemble score.
    pub ensemble_combined_sources: bool,
    /// Wall-clock budget for the whole scan in milliseconds.
    pub scan_deadline_ms: u64,
    /// Oversize gate for the whole request (user input + chunks) in bytes.
    pub max_input_bytes: usize,
    /// If true, internal errors produce CLEAN instead of REVIEW_REQUIRED.
    /// Development only.
    pub fail_open: bool,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            regex_timeout_ms: 100,
            stop_on_first_match: true,
            ensemble_threshold: 0.95,
            ensemble_combined_sources: true,
            scan_deadline_ms: 500,
            max_input_bytes: 1024 * 1024,
            fail_open: false,
        }
    }
}

/// Keyword prefilter configuration.
#[derive(Debug, Clone)]
pub struct PrefilterConfig {
    pub enabled: bool,
    /// Lowercased keyword set fed to the multi-pattern matcher. Must be a
    /// superset of the literal anchors of active rules, or the prefilter
    /// must be disabled.
    pub keywords: Vec<String>,
}

impl Default for PrefilterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            keywords: default_prefilter_keywords(),
        }
    }
}

/// Default keyword set, a superset of the literal anchors in the starter
/// datasets. Kept deliberately broad: a false "might match" only costs a
/// regex pass, a false "clean" would skip detection entirely.
pub fn default_prefilter_keywords() -> Vec<String> {
    [
        "ignore",
        "disregard",
        "forget",
        "override",
        "jailbreak",
        "system",
        "prompt",
        "instructions",
        "rules",
        "restrict",
        "developer",
        "dan",
        "admin",
        "root",
        "bypass",
        "unfiltered",
        "filters",
        "limitations",
        "guidelines",
        "comply",
        "obey",
        "secrets",
        "credentials",
        "passwords",
        "base64",
        "character",
        "anything",
        "reveal",
        "roleplay",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Code-bypass configuration.
#[derive(Debug, Clone)]
pub struct CodeDetectionConfig {
    pub enabled: bool,
    /// Threshold for the is_code verdict, in [0, 1].
    pub confidence_threshold: f64,
}

impl Default for CodeDetectionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            confidence_threshold: 0.7,
        }
    }
}

/// Normalizer configuration.
#[derive(Debug, Clone)]
pub struct NormalizeConfig {
    /// Maximum input size the normalizer accepts, in bytes.
    pub max_input_bytes: usize,
    /// Whitespace runs longer than this collapse to a single space
    /// (or newline, when the run contains one).
    pub whitespace_run_threshold: usize,
    /// Minimum length for a base64-looking run to raise the blob flag.
    pub base64_min_len: usize,
}

impl Default for NormalizeConfig {
    fn default() -> Self {
        Self {
            max_input_bytes: 1024 * 1024,
            whitespace_run_threshold: 3,
            base64_min_len: 50,
        }
    }
}

/// HTTP service guard configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// /scan request budget per fixed one-minute window.
    pub scan_rate_limit_per_minute: u32,
    /// /datasets/reload request budget per fixed one-hour window.
    pub reload_rate_limit_per_hour: u32,
    /// Consecutive scan failures that trip the circuit breaker open.
    pub circuit_breaker_failure_threshold: u32,
    /// How long the breaker stays open before a half-open probe.
    pub circuit_breaker_reset_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            scan_rate_limit_per_minute: 100,
            reload_rate_limit_per_hour: 10,
            circuit_breaker_failure_threshold: 10,
            circuit_breaker_reset_ms: 60_000,
        }
    }
}

/// Rule dataset configuration.
#[derive(Debug, Clone, Default)]
pub struct DatasetConfig {
    /// Ordered list of dataset files to load.
    pub paths: Vec<PathBuf>,
    /// Secret for HMAC-SHA256 dataset integrity verification. Datasets
    /// carrying a signature fail to load without it.
    pub hmac_secret: Option<String>,
}
