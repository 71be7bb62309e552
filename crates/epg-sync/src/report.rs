use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use uuid::Uuid;

use crate::pipeline::{CycleOutcome, SourceReport};

pub const REPORT_FILE_NAME: &str = "sync_report.json";
pub const BRIEF_FILE_NAME: &str = "run_brief.md";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub trigger: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub sources: Vec<SourceReport>,
    #[serde(default)]
    pub reports_dir: String,
}

impl SyncRunSummary {
    pub fn failed_sources(&self) -> usize {
        self.sources
            .iter()
            .filter(|s| s.outcome == CycleOutcome::Failed)
            .count()
    }

    pub fn fetch_failures(&self) -> usize {
        self.sources.iter().map(|s| s.fetch_failures.len()).sum()
    }

    pub fn records_added(&self) -> usize {
        self.sources
            .iter()
            .filter_map(|s| s.merge.as_ref())
            .map(|m| m.added)
            .sum()
    }
}

fn outcome_label(outcome: CycleOutcome) -> &'static str {
    match outcome {
        CycleOutcome::Skipped => "skipped",
        CycleOutcome::UpToDate => "up to date",
        CycleOutcome::Updated => "updated",
        CycleOutcome::Pruned => "pruned",
        CycleOutcome::Failed => "FAILED",
    }
}

pub fn render_run_brief(summary: &SyncRunSummary) -> String {
    let mut lines = vec![
        "# EPG Sync Run".to_string(),
        String::new(),
        format!("- Run ID: `{}`", summary.run_id),
        format!("- Trigger: {}", summary.trigger),
        format!("- Started: {}", summary.started_at),
        format!("- Finished: {}", summary.finished_at),
        format!("- Sources: {}", summary.sources.len()),
        format!("- Records added: {}", summary.records_added()),
        format!("- Failed fetches: {}", summary.fetch_failures()),
        String::new(),
        "## Sources".to_string(),
    ];

    for source in &summary.sources {
        let mut line = format!(
            "- {}: {} ({} records, {} missing ranges, {} stale)",
            source.source_id,
            outcome_label(source.outcome),
            source.total_records,
            source.missing_ranges.len(),
            source.stale_records
        );
        if let Some(merge) = &source.merge {
            line.push_str(&format!(
                "; +{} added, {} updated, {} removed",
                merge.added, merge.updated, merge.removed
            ));
        }
        if let Some(err) = &source.error {
            line.push_str(&format!("; error: {err}"));
        }
        lines.push(line);
        for failure in &source.fetch_failures {
            lines.push(format!(
                "  - fetch {} failed: {}",
                failure.request.description, failure.error
            ));
        }
    }
    lines.push(String::new());
    lines.join("\n")
}

/// Writes `<root>/<run_id>/sync_report.json` and `run_brief.md`.
///
/// The directory is recorded on `summary`.
pub async fn write_run_report(
    reports_root: &Path,
    summary: &mut SyncRunSummary,
) -> Result<PathBuf> {
    let dir = reports_root.join(summary.run_id.to_string());
    fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;
    summary.reports_dir = dir.display().to_string();

    let json = serde_json::to_vec_pretty(summary).context("serializing sync report")?;
    fs::write(dir.join(REPORT_FILE_NAME), json)
        .await
        .with_context(|| format!("writing {REPORT_FILE_NAME}"))?;
    fs::write(dir.join(BRIEF_FILE_NAME), render_run_brief(summary))
        .await
        .with_context(|| format!("writing {BRIEF_FILE_NAME}"))?;
    Ok(dir)
}

/// Markdown digest of the most recent `runs` reports under `reports_root`.
pub fn report_markdown(runs: usize, reports_root: &Path) -> Result<String> {
    let mut summaries = Vec::new();
    let entries = match std::fs::read_dir(reports_root) {
        Ok(entries) => entries.filter_map(|e| e.ok()).collect::<Vec<_>>(),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Vec::new(),
        Err(err) => {
            return Err(err).with_context(|| format!("reading {}", reports_root.display()))
        }
    };
    for entry in entries {
        let path = entry.path().join(REPORT_FILE_NAME);
        if !path.is_file() {
            continue;
        }
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        let summary: SyncRunSummary =
            serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        summaries.push(summary);
    }
    summaries.sort_by(|a, b| b.started_at.cmp(&a.started_at));

    let mut lines = vec!["# EPG Sync Report".to_string(), String::new()];
    if summaries.is_empty() {
        lines.push("No runs recorded yet.".to_string());
    }
    for summary in summaries.into_iter().take(runs.max(1)) {
        lines.push(format!("## Run `{}` ({})", summary.run_id, summary.trigger));
        lines.push(format!("- started: {}", summary.started_at));
        lines.push(format!("- sources: {}", summary.sources.len()));
        lines.push(format!("- records added: {}", summary.records_added()));
        lines.push(format!("- failed fetches: {}", summary.fetch_failures()));
        lines.push(format!("- failed sources: {}", summary.failed_sources()));
        for source in &summary.sources {
            lines.push(format!(
                "  - {}: {} ({} records)",
                source.source_id,
                outcome_label(source.outcome),
                source.total_records
            ));
        }
        lines.push(format!("- report: `{}`", summary.reports_dir));
        lines.push(String::new());
    }
    Ok(lines.join("\n"))
}
