//! Incremental EPG reconciliation: coverage analysis, request planning, merge, and orchestration.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use epg_core::TimeResolver;
use serde::{Deserialize, Serialize};
use tokio::fs;

pub mod analyzer;
pub mod merger;
pub mod metadata;
pub mod pipeline;
pub mod planner;
pub mod report;

pub use analyzer::{missing_ranges, CoverageAnalyzer, CoveragePolicy};
pub use merger::{MergeOutcome, MergeStats, Merger};
pub use metadata::{build_metadata, should_skip_analysis, CoverageMetadataStore};
pub use pipeline::{
    CycleContext, CycleOutcome, FetchBatch, FetchFailure, Inspection, RunOptions, SourceReport,
    SourceSync, SyncPipeline,
};
pub use planner::plan_requests;
pub use report::{report_markdown, SyncRunSummary};

pub const CRATE_NAME: &str = "epg-sync";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceMode {
    Api,
    Fixture,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    pub mode: SourceMode,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub fixture_path: Option<PathBuf>,
}

fn enabled_by_default() -> bool {
    true
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SourceRegistry {
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
}

impl SourceRegistry {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let registry: SourceRegistry =
            serde_yaml::from_str(text).context("parsing source registry")?;
        registry.validate()?;
        Ok(registry)
    }

    /// Relative fixture paths resolve against the registry file's directory.
    pub async fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let mut registry =
            Self::from_yaml_str(&text).with_context(|| format!("loading {}", path.display()))?;

        let base = path.parent().unwrap_or_else(|| Path::new("."));
        for source in &mut registry.sources {
            if let Some(fixture) = &source.fixture_path {
                if fixture.is_relative() {
                    source.fixture_path = Some(base.join(fixture));
                }
            }
        }
        Ok(registry)
    }

    fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for source in &self.sources {
            let id = source.source_id.as_str();
            if id.is_empty() || id.starts_with('.') || id.contains(['/', '\\']) {
                bail!("invalid source_id {id:?}");
            }
            if !seen.insert(id) {
                bail!("duplicate source_id {id:?}");
            }
        }
        Ok(())
    }

    /// Enabled sources, optionally narrowed to one id.
    pub fn selected(&self, only: Option<&str>) -> Result<Vec<&SourceConfig>> {
        if let Some(id) = only {
            let source = self
                .sources
                .iter()
                .find(|s| s.source_id == id)
                .with_context(|| format!("unknown source {id:?}"))?;
            return Ok(vec![source]);
        }
        Ok(self.sources.iter().filter(|s| s.enabled).collect())
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub data_dir: PathBuf,
    pub sources_file: PathBuf,
    pub policy: CoveragePolicy,
    pub utc_offset_hours: i32,
    pub max_workers: usize,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub archive_raw: bool,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let parsed = |name: &str| lookup(name).map(|v| v.trim().to_string());
        fn num<T: FromStr>(raw: Option<String>, default: T) -> T {
            raw.and_then(|v| v.parse().ok()).unwrap_or(default)
        }

        let defaults = CoveragePolicy::default();
        Self {
            data_dir: parsed("EPG_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data")),
            sources_file: parsed("EPG_SOURCES_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./sources.yaml")),
            policy: CoveragePolicy {
                past_days: num(parsed("EPG_PAST_DAYS"), defaults.past_days),
                future_days: num(parsed("EPG_FUTURE_DAYS"), defaults.future_days),
                retention_days: num(parsed("EPG_RETENTION_DAYS"), defaults.retention_days),
                gap_tolerance_days: num(
                    parsed("EPG_GAP_TOLERANCE_DAYS"),
                    defaults.gap_tolerance_days,
                ),
                staleness_hours: num(parsed("EPG_STALENESS_HOURS"), defaults.staleness_hours),
            },
            utc_offset_hours: num(parsed("EPG_UTC_OFFSET_HOURS"), 3),
            max_workers: num(parsed("EPG_MAX_WORKERS"), 4usize).max(1),
            http_timeout_secs: num(parsed("EPG_HTTP_TIMEOUT_SECS"), 30),
            user_agent: parsed("EPG_USER_AGENT").unwrap_or_else(|| "epg-sync/0.1".to_string()),
            archive_raw: parsed("EPG_ARCHIVE_RAW").is_some_and(|v| is_truthy(&v)),
            scheduler_enabled: parsed("EPG_SCHEDULER_ENABLED").is_some_and(|v| is_truthy(&v)),
            sync_cron: parsed("EPG_SYNC_CRON").unwrap_or_else(|| "0 0 */6 * * *".to_string()),
        }
    }

    pub fn resolver(&self) -> Result<TimeResolver> {
        TimeResolver::from_utc_offset_hours(self.utc_offset_hours)
            .with_context(|| format!("EPG_UTC_OFFSET_HOURS={}", self.utc_offset_hours))
    }

    pub fn source_dir(&self, source_id: &str) -> PathBuf {
        self.data_dir.join(source_id)
    }

    pub fn reports_dir(&self) -> PathBuf {
        self.data_dir.join("reports")
    }

    pub fn archive_dir(&self) -> PathBuf {
        self.data_dir.join("raw")
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use std::collections::HashMap;

    #[test]
    fn config_defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.data_dir, PathBuf::from("./data"));
        assert_eq!(config.policy, CoveragePolicy::default());
        assert_eq!(config.utc_offset_hours, 3);
        assert_eq!(config.max_workers, 4);
        assert!(!config.archive_raw);
        assert!(!config.scheduler_enabled);
        assert_eq!(config.sync_cron, "0 0 */6 * * *");
        assert_eq!(config.source_dir("iptv"), PathBuf::from("./data/iptv"));
    }

    #[test]
    fn config_overrides_and_bad_values() {
        let vars: HashMap<&str, &str> = [
            ("EPG_DATA_DIR", "/var/lib/epg"),
            ("EPG_PAST_DAYS", "3"),
            ("EPG_RETENTION_DAYS", "not-a-number"),
            ("EPG_MAX_WORKERS", "0"),
            ("EPG_ARCHIVE_RAW", "TRUE"),
            ("EPG_UTC_OFFSET_HOURS", "-5"),
        ]
        .into_iter()
        .collect();
        let config = SyncConfig::from_lookup(|name| vars.get(name).map(|v| v.to_string()));

        assert_eq!(config.reports_dir(), PathBuf::from("/var/lib/epg/reports"));
        assert_eq!(config.policy.past_days, 3);
        assert_eq!(config.policy.retention_days, 30);
        assert_eq!(config.max_workers, 1);
        assert!(config.archive_raw);
        assert_eq!(config.resolver().unwrap().offset().local_minus_utc(), -5 * 3600);
    }

    #[test]
    fn extreme_window_and_staleness_values_stay_usable() {
        let vars: HashMap<&str, &str> = [
            ("EPG_PAST_DAYS", "100000000"),
            ("EPG_FUTURE_DAYS", "9223372036854775807"),
            ("EPG_STALENESS_HOURS", "9223372036854775807"),
        ]
        .into_iter()
        .collect();
        let config = SyncConfig::from_lookup(|name| vars.get(name).map(|v| v.to_string()));
        let today = NaiveDate::from_ymd_opt(2026, 3, 10).unwrap();

        let window = config.policy.target_window(today);
        assert_eq!(window.start(), NaiveDate::MIN);
        assert_eq!(window.end(), NaiveDate::MAX);
        assert_eq!(config.policy.staleness_hours, i64::MAX);
    }

    #[test]
    fn registry_parses_and_selects() {
        let registry = SourceRegistry::from_yaml_str(
            r#"
sources:
  - source_id: main
    display_name: Main
    mode: api
    base_url: http://example.invalid/epg
    params: { tz: "3" }
  - source_id: local
    mode: fixture
    enabled: false
    fixture_path: fixtures/local.json
"#,
        )
        .unwrap();

        assert_eq!(registry.sources.len(), 2);
        assert_eq!(registry.sources[0].mode, SourceMode::Api);
        assert_eq!(registry.sources[0].params.get("tz").map(String::as_str), Some("3"));

        let enabled = registry.selected(None).unwrap();
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0].source_id, "main");

        let forced = registry.selected(Some("local")).unwrap();
        assert_eq!(forced[0].source_id, "local");
        assert!(registry.selected(Some("nope")).is_err());
    }

    #[test]
    fn registry_rejects_duplicate_and_unsafe_ids() {
        let dup = "sources:\n  - {source_id: a, mode: api}\n  - {source_id: a, mode: fixture}\n";
        assert!(SourceRegistry::from_yaml_str(dup).is_err());

        let unsafe_id = "sources:\n  - {source_id: ../etc, mode: api}\n";
        assert!(SourceRegistry::from_yaml_str(unsafe_id).is_err());
    }

    #[tokio::test]
    async fn registry_resolves_fixture_paths_against_its_directory() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("sources.yaml");
        tokio::fs::write(
            &path,
            "sources:\n  - {source_id: f, mode: fixture, fixture_path: feeds/f.json}\n",
        )
        .await
        .unwrap();

        let registry = SourceRegistry::load(&path).await.unwrap();
        assert_eq!(
            registry.sources[0].fixture_path.as_deref(),
            Some(dir.path().join("feeds/f.json").as_path())
        );
    }
}
