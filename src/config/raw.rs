// Copyright 2026 The Rampart Project
// SPDX-License-Identifier: Apache-2.0

// Raw YAML deserialization types (internal)
// These are separate from the public Config structs because:
// 1. We validate ranges and relationships between raw and public
// 2. Unknown config keys must be rejected at load time, which is a
//    deserialization concern, not a domain concern
// 3. Keeps the public API clean

use serde::Deserialize;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawConfig {
    pub rampart: String,
    pub scan: Option<RawScanConfig>,
    pub prefilter: Option<RawPrefilterConfig>,
    pub code_detection: Option<RawCodeDetectionConfig>,
    pub normalize: Option<RawNormalizeConfig>,
    pub datasets: Option<RawDatasetConfig>,
    pub server: Option<RawServerConfig>,
    pub environment: Option<String>,
    pub api_key: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawServerConfig {
    pub scan_rate_limit_per_minute: Option<u32>,
    pub reload_rate_limit_per_hour: Option<u32>,
    pub circuit_breaker_failure_threshold: Option<u32>,
    pub circuit_breaker_reset_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawScanConfig {
    pub regex_timeout_ms: Option<u64>,
    pub stop_on_first_match: Option<bool>,
    pub ensemble_threshold: Option<f64>,
    pub ensemble_combined_sources: Option<bool>,
    pub scan_deadline_ms: Option<u64>,
    pub max_input_bytes: Option<usize>,
    pub fail_open: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawPrefilterConfig {
    pub enabled: Option<bool>,
    pub keywords: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawCodeDetectionConfig {
    pub enabled: Option<bool>,
    pub confidence_threshold: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawNormalizeConfig {
    pub max_input_bytes: Option<usize>,
    pub whitespace_run_threshold: Option<usize>,
    pub base64_min_len: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawDatasetConfig {
    #[serde(default)]
    pub paths: Vec<String>,
    pub hmac_secret: Option<String>,
}
