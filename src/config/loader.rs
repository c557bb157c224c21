use std::path::PathBuf;

use sha2::{Digest, Sha256};

use super::error::ConfigError;
use super::raw;
use super::source::ConfigSource;
use super::types::*;

/// Load and validate a rampart config from the given source.
///
/// Steps:
/// 1. Read raw YAML bytes from source
/// 2. Compute SHA256 contract hash
/// 3. Parse YAML into raw deserialization types (unknown keys rejected)
/// 4. Validate required fields and value ranges
/// 5. Build typed Config struct
pub fn load_config(source: &dyn ConfigSource) -> Result<Config, ConfigError> {
    let raw_yaml = source.load()?;
    let contract_hash = compute_hash(&raw_yaml);

    let raw: raw::RawConfig = serde_yaml::from_str(&raw_yaml)?;

    // Validate version
    if raw.rampart != "v1" {
        return Err(ConfigError::Validation(format!(
            "unsupported contract version \"{}\", expected \"v1\"",
            raw.rampart
        )));
    }

    let scan = build_scan_config(raw.scan)?;
    let prefilter = build_prefilter_config(raw.prefilter)?;
    let code_detection = build_code_detection_config(raw.code_detection)?;
    let normalize = build_normalize_config(raw.normalize)?;
    let datasets = build_dataset_config(raw.datasets);
    let server = build_server_config(raw.server)?;

    Ok(Config {
        scan,
        prefilter,
        code_detection,
        normalize,
        datasets,
        server,
        environment: raw.environment.unwrap_or_default(),
        api_key: raw.api_key,
        contract_hash,
    })
}

pub fn compute_hash(raw_yaml: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(raw_yaml.as_bytes());
    let hash = hasher.finalize();
    format!("sha256:{:x}", hash)
}

fn build_scan_config(raw: Option<raw::RawScanConfig>) -> Result<ScanConfig, ConfigError> {
    let defaults = ScanConfig::default();
    let raw = match raw {
        Some(r) => r,
        None => return Ok(defaults),
    };

    let regex_timeout_ms = raw.regex_timeout_ms.unwrap_or(defaults.regex_timeout_ms);
    if regex_timeout_ms == 0 {
        return Err(ConfigError::Validation(
            "scan.regex_timeout_ms must be greater than 0".to_string(),
        ));
    }

    let scan_deadline_ms = raw.scan_deadline_ms.unwrap_or(defaults.scan_deadline_ms);
    if scan_deadline_ms == 0 {
        return Err(ConfigError::Validation(
            "scan.scan_deadline_ms must be greater than 0".to_string(),
        ));
    }

    let ensemble_threshold = raw.ensemble_threshold.unwrap_or(defaults.ensemble_threshold);
    if !(0.0..=1.0).contains(&ensemble_threshold) {
        return Err(ConfigError::Validation(format!(
            "scan.ensemble_threshold must be within [0, 1], got {ensemble_threshold}"
        )));
    }

    let max_input_bytes = raw.max_input_bytes.unwrap_or(defaults.max_input_bytes);
    if max_input_bytes == 0 {
        return Err(ConfigError::Validation(
            "scan.max_input_bytes must be greater than 0".to_string(),
        ));
    }

    Ok(ScanConfig {
        regex_timeout_ms,
        stop_on_first_match: raw.stop_on_first_match.unwrap_or(defaults.stop_on_first_match),
        ensemble_threshold,
        ensemble_combined_sources: raw
            .ensemble_combined_sources
            .unwrap_or(defaults.ensemble_combined_sources),
        scan_deadline_ms,
        max_input_bytes,
        fail_open: raw.fail_open.unwrap_or(defaults.fail_open),
    })
}

fn build_prefilter_config(
    raw: Option<raw::RawPrefilterConfig>,
) -> Result<PrefilterConfig, ConfigError> {
    let defaults = PrefilterConfig::default();
    let raw = match raw {
        Some(r) => r,
        None => return Ok(defaults),
    };

    let enabled = raw.enabled.unwrap_or(defaults.enabled);

    // Keywords are matched case-insensitively; store them lowercased so the
    // automaton and the soundness check in the scanner agree.
    let keywords: Vec<String> = raw
        .keywords
        .unwrap_or(defaults.keywords)
        .into_iter()
        .map(|k| k.trim().to_lowercase())
        .filter(|k| !k.is_empty())
        .collect();

    if enabled && keywords.is_empty() {
        return Err(ConfigError::Validation(
            "prefilter.keywords must not be empty while the prefilter is enabled".to_string(),
        ));
    }

    Ok(PrefilterConfig { enabled, keywords })
}

fn build_code_detection_config(
    raw: Option<raw::RawCodeDetectionConfig>,
) -> Result<CodeDetectionConfig, ConfigError> {
    let defaults = CodeDetectionConfig::default();
    let raw = match raw {
        Some(r) => r,
        None => return Ok(defaults),
    };

    let confidence_threshold = raw
        .confidence_threshold
        .unwrap_or(defaults.confidence_threshold);
    if !(0.0..=1.0).contains(&confidence_threshold) {
        return Err(ConfigError::Validation(format!(
            "code_detection.confidence_threshold must be within [0, 1], got {confidence_threshold}"
        )));
    }

    Ok(CodeDetectionConfig {
        enabled: raw.enabled.unwrap_or(defaults.enabled),
        confidence_threshold,
    })
}

fn build_normalize_config(
    raw: Option<raw::RawNormalizeConfig>,
) -> Result<NormalizeConfig, ConfigError> {
    let defaults = NormalizeConfig::default();
    let raw = match raw {
        Some(r) => r,
        None => return Ok(defaults),
    };

    let max_input_bytes = raw.max_input_bytes.unwrap_or(defaults.max_input_bytes);
    if max_input_bytes == 0 {
        return Err(ConfigError::Validation(
            "normalize.max_input_bytes must be greater than 0".to_string(),
        ));
    }

    let whitespace_run_threshold = raw
        .whitespace_run_threshold
        .unwrap_or(defaults.whitespace_run_threshold);
    if whitespace_run_threshold == 0 {
        return Err(ConfigError::Validation(
            "normalize.whitespace_run_threshold must be greater than 0".to_string(),
        ));
    }

    Ok(NormalizeConfig {
        max_input_bytes,
        whitespace_run_threshold,
        base64_min_len: raw.base64_min_len.unwrap_or(defaults.base64_min_len),
    })
}

fn build_server_config(raw: Option<raw::RawServerConfig>) -> Result<ServerConfig, ConfigError> {
    let defaults = ServerConfig::default();
    let raw = match raw {
        Some(r) => r,
        None => return Ok(defaults),
    };

    let scan_rate_limit_per_minute = raw
        .scan_rate_limit_per_minute
        .unwrap_or(defaults.scan_rate_limit_per_minute);
    let reload_rate_limit_per_hour = raw
        .reload_rate_limit_per_hour
        .unwrap_or(defaults.reload_rate_limit_per_hour);
    let circuit_breaker_failure_threshold = raw
        .circuit_breaker_failure_threshold
        .unwrap_or(defaults.circuit_breaker_failure_threshold);
    let circuit_breaker_reset_ms = raw
        .circuit_breaker_reset_ms
        .unwrap_or(defaults.circuit_breaker_reset_ms);

    for (name, value) in [
        ("server.scan_rate_limit_per_minute", scan_rate_limit_per_minute as u64),
        ("server.reload_rate_limit_per_hour", reload_rate_limit_per_hour as u64),
        (
            "server.circuit_breaker_failure_threshold",
            circuit_breaker_failure_threshold as u64,
        ),
        ("server.circuit_breaker_reset_ms", circuit_breaker_reset_ms),
    ] {
        if value == 0 {
            return Err(ConfigError::Validation(format!(
                "{name} must be greater than 0"
            )));
        }
    }

    Ok(ServerConfig {
        scan_rate_limit_per_minute,
        reload_rate_limit_per_hour,
        circuit_breaker_failure_threshold,
        circuit_breaker_reset_ms,
    })
}

fn build_dataset_config(raw: Option<raw::RawDatasetConfig>) -> DatasetConfig {
    let raw = match raw {
        Some(r) => r,
        None => return DatasetConfig::default(),
    };

    DatasetConfig {
        paths: raw.paths.into_iter().map(PathBuf::from).collect(),
        hmac_secret: raw.hmac_secret.filter(|s| !s.is_empty()),
    }
}
