// Rule registry
//
// A snapshot is immutable after construction: the scanner reads it
// through a shared handle, the reload controller is the sole writer, and
// readers that loaded an older snapshot keep scanning against it until
// they finish. The only mutation inside a snapshot is the per-rule
// telemetry counters, which are atomics.
//
// Canonical scan order: severity weight descending, impact descending,
// id ascending. Stop-on-first-match verdicts are reproducible because
// every scan walks this order.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::config::Config;
use crate::dataset::loader::{load_dataset_str, DatasetError, LoadDiagnostics, LoadedDataset};
use crate::dataset::Rule;

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct DatasetSummary {
    pub name: String,
    pub version: String,
    pub dataset_build_id: String,
    pub rule_count: usize,
}

#[derive(Debug)]
pub struct RegistrySnapshot {
    by_id: HashMap<String, Arc<Rule>>,
    /// All admitted rules in canonical scan order. Lifecycle filtering
    /// happens at iteration time because timeout quarantine can bench a
    /// rule mid-snapshot.
    ordered: Vec<Arc<Rule>>,
    version: String,
    load_timestamp_secs: u64,
    datasets: Vec<DatasetSummary>,
}

impl RegistrySnapshot {
    /// The snapshot used before any dataset has loaded.
    pub fn empty() -> Self {
        Self {
            by_id: HashMap::new(),
            ordered: Vec::new(),
            version: "0.0.0".to_string(),
            load_timestamp_secs: unix_now(),
            datasets: Vec::new(),
        }
    }

    pub fn from_datasets(loaded: Vec<LoadedDataset>) -> Self {
        let mut by_id: HashMap<String, Arc<Rule>> = HashMap::new();
        let mut ordered: Vec<Arc<Rule>> = Vec::new();
        let mut datasets = Vec::with_capacity(loaded.len());

        for dataset in loaded {
            datasets.push(DatasetSummary {
                name: dataset.metadata.name.clone(),
                version: dataset.metadata.version.clone(),
                dataset_build_id: dataset.metadata.dataset_build_id.clone(),
                rule_count: dataset.rules.len(),
            });

            for rule in dataset.rules {
                if by_id.contains_key(&rule.id) {
                    // Ids are unique within a dataset; across datasets the
                    // first configured dataset wins so results stay
                    // deterministic for a given dataset order.
                    tracing::warn!(
                        rule_id = %rule.id,
                        dataset = %rule.dataset,
                        "duplicate rule id across datasets, keeping first"
                    );
                    continue;
                }
                by_id.insert(rule.id.clone(), Arc::clone(&rule));
                ordered.push(rule);
            }
        }

        ordered.sort_by(|a, b| {
            b.severity
                .weight()
                .cmp(&a.severity.weight())
                .then_with(|| b.impact_score.total_cmp(&a.impact_score))
                .then_with(|| a.id.cmp(&b.id))
        });

        let version = compute_version(&ordered);

        Self {
            by_id,
            ordered,
            version,
            load_timestamp_secs: unix_now(),
            datasets,
        }
    }

    /// All scannable rules in canonical order.
    pub fn active_rules(&self) -> impl Iterator<Item = &Arc<Rule>> {
        self.ordered.iter().filter(|rule| rule.is_scannable())
    }

    pub fn lookup(&self, rule_id: &str) -> Option<&Arc<Rule>> {
        self.by_id.get(rule_id)
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn total_rules(&self) -> usize {
        self.ordered.len()
    }

    pub fn total_datasets(&self) -> usize {
        self.datasets.len()
    }

    pub fn load_timestamp_secs(&self) -> u64 {
        self.load_timestamp_secs
    }

    pub fn stats(&self) -> RegistryStats {
        let mut matched: Vec<RuleMatchStat> = self
            .ordered
            .iter()
            .filter(|rule| rule.match_count() > 0)
            .map(|rule| RuleMatchStat {
                rule_id: rule.id.clone(),
                dataset: rule.dataset.clone(),
                count: rule.match_count(),
                last_matched_at: rule.last_matched_at(),
            })
            .collect();
        matched.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.rule_id.cmp(&b.rule_id)));

        let total_matches = matched.iter().map(|m| m.count).sum();
        matched.truncate(10);

        let avg_execution_times = self
            .ordered
            .iter()
            .filter_map(|rule| {
                rule.avg_execution_time_ms()
                    .map(|avg| (rule.id.clone(), avg))
            })
            .collect();

        RegistryStats {
            version: self.version.clone(),
            load_timestamp: self.load_timestamp_secs,
            total_datasets: self.datasets.len(),
            total_rules: self.ordered.len(),
            total_matches,
            top_matched_rules: matched,
            avg_execution_times,
            datasets: self.datasets.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RuleMatchStat {
    pub rule_id: String,
    pub dataset: String,
    pub count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_matched_at: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegistryStats {
    pub version: String,
    pub load_timestamp: u64,
    pub total_datasets: usize,
    pub total_rules: usize,
    pub total_matches: u64,
    pub top_matched_rules: Vec<RuleMatchStat>,
    /// Average matching-search latency per rule in milliseconds,
    /// cumulative over the snapshot's lifetime.
    pub avg_execution_times: std::collections::BTreeMap<String, f64>,
    pub datasets: Vec<DatasetSummary>,
}

/// Version hash over admitted rule identity and compiled pattern text:
/// it changes iff the set of admitted rule ids or their patterns changes.
fn compute_version(rules: &[Arc<Rule>]) -> String {
    if rules.is_empty() {
        return "0.0.0".to_string();
    }
    let mut entries: Vec<String> = rules
        .iter()
        .map(|r| format!("{}/{}/{}", r.dataset, r.id, r.pattern.pattern))
        .collect();
    entries.sort_unstable();

    let digest = Sha256::digest(entries.join("|").as_bytes());
    let hex = format!("{:x}", digest);
    format!("ruleset-{}", &hex[..8])
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Shared handle
// ---------------------------------------------------------------------------

/// Shared handle to the current snapshot. Readers clone the inner `Arc`
/// and keep it for the duration of a scan; `install` swaps the pointer
/// under a single-writer discipline. Old snapshots are dropped when the
/// last in-flight scan referencing them completes.
#[derive(Clone)]
pub struct SharedRegistry {
    inner: Arc<RwLock<Arc<RegistrySnapshot>>>,
}

impl SharedRegistry {
    pub fn new(snapshot: RegistrySnapshot) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(snapshot))),
        }
    }

    pub fn empty() -> Self {
        Self::new(RegistrySnapshot::empty())
    }

    pub fn current(&self) -> Arc<RegistrySnapshot> {
        Arc::clone(&self.inner.read())
    }

    pub fn install(&self, snapshot: RegistrySnapshot) {
        *self.inner.write() = Arc::new(snapshot);
    }
}

// ---------------------------------------------------------------------------
// Reload controller
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ReloadError {
    #[error(transparent)]
    Dataset(#[from] DatasetError),
}

#[derive(Debug, Clone, Serialize)]
pub struct ReloadReport {
    pub status: &'static str,
    pub rule_set_version: String,
    pub total_rules: usize,
    pub reload_time_ms: f64,
    pub diagnostics: Vec<LoadDiagnostics>,
}

/// Sole writer of the registry handle. Reads every configured dataset
/// file, runs each through the loader, and installs the combined
/// snapshot atomically. If any dataset fails, the reload fails and the
/// existing snapshot stays in force; in fail-open mode a failing dataset
/// is skipped with a loud warning instead.
pub struct ReloadController {
    config: Arc<Config>,
    registry: SharedRegistry,
}

impl ReloadController {
    pub fn new(config: Arc<Config>, registry: SharedRegistry) -> Self {
        Self { config, registry }
    }

    pub fn registry(&self) -> &SharedRegistry {
        &self.registry
    }

    pub async fn reload(&self) -> Result<ReloadReport, ReloadError> {
        let started = Instant::now();
        let secret = self.config.datasets.hmac_secret.as_deref();
        let budget = std::time::Duration::from_millis(self.config.scan.regex_timeout_ms);

        let mut loaded = Vec::with_capacity(self.config.datasets.paths.len());
        for path in &self.config.datasets.paths {
            let label = path.display().to_string();
            // File reads are the only suspension point in the reload path;
            // parsing and pattern compilation below are CPU-bound.
            let content = match tokio::fs::read_to_string(path).await {
                Ok(content) => content,
                Err(source) => {
                    let err = DatasetError::Io {
                        path: label,
                        source,
                    };
                    if self.config.scan.fail_open {
                        tracing::warn!(error = %err, "skipping unreadable dataset (fail-open)");
                        continue;
                    }
                    return Err(err.into());
                }
            };

            match load_dataset_str(&label, &content, secret, budget) {
                Ok(dataset) => loaded.push(dataset),
                Err(err) => {
                    if self.config.scan.fail_open {
                        tracing::warn!(error = %err, "skipping failed dataset (fail-open)");
                        continue;
                    }
                    return Err(err.into());
                }
            }
        }

        let diagnostics: Vec<LoadDiagnostics> =
            loaded.iter().map(|d| d.diagnostics.clone()).collect();

        let snapshot = RegistrySnapshot::from_datasets(loaded);
        let report = ReloadReport {
            status: "success",
            rule_set_version: snapshot.version().to_string(),
            total_rules: snapshot.total_rules(),
            reload_time_ms: started.elapsed().as_secs_f64() * 1000.0,
            diagnostics,
        };

        self.registry.install(snapshot);

        tracing::info!(
            rule_set_version = %report.rule_set_version,
            total_rules = report.total_rules,
            reload_time_ms = report.reload_time_ms,
            "registry snapshot installed"
        );

        Ok(report)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, StringSource};
    use std::io::Write as _;
    use std::time::Duration;

    const BUDGET: Duration = Duration::from_millis(100);

    fn dataset_yaml(name: &str, rules: &[(&str, &str, &str, f64)]) -> String {
        let mut yaml = format!("metadata:\n  name: {name}\n  version: \"1.0\"\nrules:\n");
        for (id, pattern, severity, impact) in rules {
            yaml.push_str(&format!(
                "  - id: {id}\n    pattern: \"{pattern}\"\n    severity: {severity}\n    impact_score: {impact}\n"
            ));
        }
        yaml
    }

    fn snapshot_from(yaml: &str) -> RegistrySnapshot {
        let loaded =
            crate::dataset::loader::load_dataset_str("test.yaml", yaml, None, BUDGET).unwrap();
        RegistrySnapshot::from_datasets(vec![loaded])
    }

    // -------------------------------------------------------------------
    // Canonical order
    // -------------------------------------------------------------------

    #[test]
    fn rules_iterate_in_canonical_order() {
        let yaml = dataset_yaml(
            "order",
            &[
                ("b-low", "low1", "low", 0.5),
                ("a-crit-2", "crit2", "critical", 0.6),
                ("z-crit-1", "crit1", "critical", 0.9),
                ("m-high", "high1", "high", 0.8),
                ("a-crit-3", "crit3", "critical", 0.6),
            ],
        );
        let snapshot = snapshot_from(&yaml);
        let order: Vec<&str> = snapshot.active_rules().map(|r| r.id.as_str()).collect();
        // severity desc, impact desc, id asc
        assert_eq!(order, vec!["z-crit-1", "a-crit-2", "a-crit-3", "m-high", "b-low"]);
    }

    #[test]
    fn non_scannable_rules_are_skipped() {
        let yaml = r#"metadata:
  name: states
  version: "1.0"
rules:
  - id: on-1
    pattern: "a"
    severity: high
  - id: off-1
    pattern: "b"
    severity: high
    enabled: false
  - id: draft-1
    pattern: "c"
    severity: high
    state: draft
  - id: canary-1
    pattern: "d"
    severity: high
    state: canary
"#;
        let snapshot = snapshot_from(yaml);
        assert_eq!(snapshot.total_rules(), 4);
        let scannable: Vec<&str> = snapshot.active_rules().map(|r| r.id.as_str()).collect();
        assert_eq!(scannable, vec!["canary-1", "on-1"]);
    }

    #[test]
    fn lookup_finds_admitted_rules() {
        let yaml = dataset_yaml("lookup", &[("r-1", "abc", "high", 0.9)]);
        let snapshot = snapshot_from(&yaml);
        assert!(snapshot.lookup("r-1").is_some());
        assert!(snapshot.lookup("missing").is_none());
    }

    // -------------------------------------------------------------------
    // Version semantics
    // -------------------------------------------------------------------

    #[test]
    fn version_stable_for_identical_rule_sets() {
        let yaml = dataset_yaml("v", &[("r-1", "abc", "high", 0.9)]);
        assert_eq!(snapshot_from(&yaml).version(), snapshot_from(&yaml).version());
    }

    #[test]
    fn version_changes_when_rule_set_changes() {
        let one = dataset_yaml("v", &[("r-1", "abc", "high", 0.9)]);
        let two = dataset_yaml("v", &[("r-1", "abc", "high", 0.9), ("r-2", "def", "low", 0.3)]);
        assert_ne!(snapshot_from(&one).version(), snapshot_from(&two).version());
    }

    #[test]
    fn version_changes_when_pattern_changes() {
        let a = dataset_yaml("v", &[("r-1", "abc", "high", 0.9)]);
        let b = dataset_yaml("v", &[("r-1", "abcd", "high", 0.9)]);
        assert_ne!(snapshot_from(&a).version(), snapshot_from(&b).version());
    }

    #[test]
    fn empty_snapshot_has_sentinel_version() {
        assert_eq!(RegistrySnapshot::empty().version(), "0.0.0");
    }

    // -------------------------------------------------------------------
    // Shared handle semantics
    // -------------------------------------------------------------------

    #[test]
    fn in_flight_readers_keep_their_snapshot_across_install() {
        let registry = SharedRegistry::new(snapshot_from(&dataset_yaml(
            "old",
            &[("old-1", "abc", "high", 0.9)],
        )));

        let in_flight = registry.current();
        let old_version = in_flight.version().to_string();

        registry.install(snapshot_from(&dataset_yaml(
            "new",
            &[("new-1", "def", "high", 0.9)],
        )));

        // The in-flight reader still sees the old rules.
        assert_eq!(in_flight.version(), old_version);
        assert!(in_flight.lookup("old-1").is_some());

        // New readers see the new snapshot.
        let fresh = registry.current();
        assert_ne!(fresh.version(), old_version);
        assert!(fresh.lookup("new-1").is_some());
    }

    // -------------------------------------------------------------------
    // Stats
    // -------------------------------------------------------------------

    #[test]
    fn stats_aggregate_match_counters() {
        let yaml = dataset_yaml(
            "stats",
            &[("s-1", "abc", "high", 0.9), ("s-2", "def", "low", 0.3)],
        );
        let snapshot = snapshot_from(&yaml);
        snapshot.lookup("s-1").unwrap().record_match(1.0);
        snapshot.lookup("s-1").unwrap().record_match(3.0);
        snapshot.lookup("s-2").unwrap().record_match(0.5);

        let stats = snapshot.stats();
        assert_eq!(stats.total_matches, 3);
        assert_eq!(stats.top_matched_rules[0].rule_id, "s-1");
        assert_eq!(stats.top_matched_rules[0].count, 2);
        assert_eq!(stats.total_rules, 2);
        assert_eq!(stats.total_datasets, 1);
    }

    #[test]
    fn stats_report_average_execution_times() {
        let yaml = dataset_yaml(
            "timing",
            &[("t-1", "abc", "high", 0.9), ("t-2", "def", "low", 0.3)],
        );
        let snapshot = snapshot_from(&yaml);
        snapshot.lookup("t-1").unwrap().record_match(2.0);
        snapshot.lookup("t-1").unwrap().record_match(4.0);

        let stats = snapshot.stats();
        let avg = stats.avg_execution_times["t-1"];
        assert!((avg - 3.0).abs() < 0.01, "avg was {avg}");
        // Rules that never matched carry no timing entry.
        assert!(!stats.avg_execution_times.contains_key("t-2"));
    }

    // -------------------------------------------------------------------
    // Reload controller
    // -------------------------------------------------------------------

    fn config_for(paths: &[&std::path::Path], fail_open: bool, secret: Option<&str>) -> Config {
        let mut yaml = String::from("rampart: v1\nscan:\n");
        yaml.push_str(&format!("  fail_open: {fail_open}\n"));
        yaml.push_str("datasets:\n  paths:\n");
        for p in paths {
            yaml.push_str(&format!("    - \"{}\"\n", p.display()));
        }
        if let Some(secret) = secret {
            yaml.push_str(&format!("  hmac_secret: \"{secret}\"\n"));
        }
        crate::config::load_config(&StringSource { content: yaml }).unwrap()
    }

    fn write_temp(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[tokio::test]
    async fn reload_installs_combined_snapshot() {
        let a = write_temp(&dataset_yaml("alpha", &[("a-1", "abc", "high", 0.9)]));
        let b = write_temp(&dataset_yaml("beta", &[("b-1", "def", "low", 0.5)]));
        let config = Arc::new(config_for(&[a.path(), b.path()], false, None));

        let controller = ReloadController::new(config, SharedRegistry::empty());
        let report = controller.reload().await.unwrap();

        assert_eq!(report.status, "success");
        assert_eq!(report.total_rules, 2);
        assert_eq!(report.diagnostics.len(), 2);

        let snapshot = controller.registry().current();
        assert_eq!(snapshot.total_datasets(), 2);
        assert!(snapshot.lookup("a-1").is_some());
        assert!(snapshot.lookup("b-1").is_some());
    }

    #[tokio::test]
    async fn failed_dataset_aborts_reload_and_keeps_old_snapshot() {
        let good = write_temp(&dataset_yaml("good", &[("g-1", "abc", "high", 0.9)]));
        let config = Arc::new(config_for(&[good.path()], false, None));
        let controller = ReloadController::new(Arc::clone(&config), SharedRegistry::empty());
        controller.reload().await.unwrap();
        let before = controller.registry().current().version().to_string();

        // Second reload against a missing file fails closed.
        let missing = std::path::Path::new("/nonexistent/rampart-missing.yaml");
        let bad_config = Arc::new(config_for(&[good.path(), missing], false, None));
        let second = ReloadController::new(bad_config, controller.registry().clone());
        assert!(second.reload().await.is_err());

        assert_eq!(controller.registry().current().version(), before);
    }

    #[tokio::test]
    async fn tampered_hmac_fails_closed_and_keeps_old_snapshot() {
        let unsigned = dataset_yaml("signed", &[("s-1", "abc", "high", 0.9)]);
        let signature =
            crate::dataset::loader::sign_dataset(&unsigned, "secret-1").unwrap();
        let signed = unsigned.replace(
            "  version: \"1.0\"\n",
            &format!("  version: \"1.0\"\n  hmac_signature: \"{signature}\"\n"),
        );

        let file = write_temp(&signed);
        let config = Arc::new(config_for(&[file.path()], false, Some("secret-1")));
        let controller = ReloadController::new(config, SharedRegistry::empty());
        controller.reload().await.unwrap();
        let before = controller.registry().current().version().to_string();

        // Tamper without re-signing.
        let tampered = signed.replace("severity: high", "severity: low");
        let tampered_file = write_temp(&tampered);
        let config = Arc::new(config_for(&[tampered_file.path()], false, Some("secret-1")));
        let second = ReloadController::new(config, controller.registry().clone());
        let err = second.reload().await.unwrap_err();
        assert!(err.to_string().contains("HMAC"));

        assert_eq!(controller.registry().current().version(), before);
    }

    #[tokio::test]
    async fn fail_open_skips_bad_dataset_with_warning() {
        let good = write_temp(&dataset_yaml("good", &[("g-1", "abc", "high", 0.9)]));
        let missing = std::path::Path::new("/nonexistent/rampart-missing.yaml");
        let config = Arc::new(config_for(&[missing, good.path()], true, None));

        let controller = ReloadController::new(config, SharedRegistry::empty());
        let report = controller.reload().await.unwrap();
        assert_eq!(report.total_rules, 1);
    }
}
