use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use epg_adapters::{EpgFetcher, FetchContext, FixtureFetcher, IptvApiFetcher};
use epg_core::{DateRange, DayBucket, EpgAnalysis, FetchRequest, PersistedRange, TimeResolver};
use epg_storage::{HttpClientConfig, HttpFetcher, RawPayloadArchive, StoreFile, StoreLoad};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::analyzer::{CoverageAnalyzer, CoveragePolicy};
use crate::merger::{MergeStats, Merger};
use crate::metadata::CoverageMetadataStore;
use crate::planner::plan_requests;
use crate::report::{write_run_report, SyncRunSummary};
use crate::{SourceConfig, SourceMode, SourceRegistry, SyncConfig};

/// Clock readings shared by every source in one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleContext {
    pub run_id: Uuid,
    pub fetched_at: DateTime<Utc>,
    /// `fetched_at` on the upstream's wall clock.
    pub now: NaiveDateTime,
}

impl CycleContext {
    pub fn new(run_id: Uuid, fetched_at: DateTime<Utc>, resolver: &TimeResolver) -> Self {
        Self {
            run_id,
            fetched_at,
            now: resolver.localize(fetched_at),
        }
    }

    pub fn fetch_context(&self) -> FetchContext {
        FetchContext {
            run_id: self.run_id,
            today: self.now.date(),
            fetched_at: self.fetched_at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleOutcome {
    Skipped,
    UpToDate,
    Updated,
    Pruned,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreState {
    Loaded,
    Missing,
    Unreadable,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchFailure {
    pub request: FetchRequest,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceReport {
    pub source_id: String,
    pub outcome: CycleOutcome,
    pub target: PersistedRange,
    #[serde(default)]
    pub store_state: Option<StoreState>,
    #[serde(default)]
    pub existing_ranges: Vec<PersistedRange>,
    #[serde(default)]
    pub missing_ranges: Vec<PersistedRange>,
    #[serde(default)]
    pub stale_records: usize,
    #[serde(default)]
    pub requests: Vec<FetchRequest>,
    #[serde(default)]
    pub fetch_failures: Vec<FetchFailure>,
    #[serde(default)]
    pub merge: Option<MergeStats>,
    #[serde(default)]
    pub total_records: usize,
    #[serde(default)]
    pub error: Option<String>,
}

impl SourceReport {
    fn new(source_id: &str, outcome: CycleOutcome, target: DateRange) -> Self {
        Self {
            source_id: source_id.to_string(),
            outcome,
            target: target.into(),
            store_state: None,
            existing_ranges: Vec::new(),
            missing_ranges: Vec::new(),
            stale_records: 0,
            requests: Vec::new(),
            fetch_failures: Vec::new(),
            merge: None,
            total_records: 0,
            error: None,
        }
    }

    pub fn failed(source_id: &str, target: DateRange, err: &anyhow::Error) -> Self {
        let mut report = Self::new(source_id, CycleOutcome::Failed, target);
        report.error = Some(format!("{err:#}"));
        report
    }

    fn with_analysis(mut self, state: StoreState, analysis: &EpgAnalysis) -> Self {
        self.store_state = Some(state);
        self.existing_ranges = analysis.existing_ranges.iter().copied().map(Into::into).collect();
        self.missing_ranges = analysis.missing_ranges.iter().copied().map(Into::into).collect();
        self.stale_records = analysis.stale_records.len();
        self.total_records = analysis.total_records;
        self
    }
}

/// Read-only view of a source: its store analyzed against the target window.
#[derive(Debug, Clone, PartialEq)]
pub struct Inspection {
    pub target: DateRange,
    pub store_state: StoreState,
    pub buckets: Vec<DayBucket>,
    pub analysis: EpgAnalysis,
    pub requests: Vec<FetchRequest>,
}

/// Successful fetch results in request order, plus the requests that failed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchBatch {
    pub buckets: Vec<DayBucket>,
    pub failures: Vec<FetchFailure>,
}

/// Reconciliation of one source's store against its upstream.
pub struct SourceSync {
    source_id: String,
    fetcher: Arc<dyn EpgFetcher>,
    store: StoreFile,
    metadata: CoverageMetadataStore,
    analyzer: CoverageAnalyzer,
    merger: Merger,
    policy: CoveragePolicy,
    max_workers: usize,
}

impl SourceSync {
    pub fn new(
        source_id: impl Into<String>,
        fetcher: Arc<dyn EpgFetcher>,
        dir: impl AsRef<std::path::Path>,
        policy: CoveragePolicy,
        resolver: TimeResolver,
        max_workers: usize,
    ) -> Self {
        let dir = dir.as_ref();
        Self {
            source_id: source_id.into(),
            fetcher,
            store: StoreFile::in_dir(dir),
            metadata: CoverageMetadataStore::in_dir(dir, policy.retention_days),
            analyzer: CoverageAnalyzer::new(policy, resolver),
            merger: Merger::new(policy, resolver),
            policy,
            max_workers: max_workers.max(1),
        }
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    pub fn store(&self) -> &StoreFile {
        &self.store
    }

    pub fn metadata(&self) -> &CoverageMetadataStore {
        &self.metadata
    }

    async fn load_store(&self) -> (StoreState, Vec<DayBucket>) {
        match self.store.load().await {
            StoreLoad::Loaded(buckets) => (StoreState::Loaded, buckets),
            StoreLoad::Missing => (StoreState::Missing, Vec::new()),
            StoreLoad::Unreadable(err) => {
                warn!(
                    source_id = %self.source_id,
                    error = %err,
                    "store unreadable; treating as empty"
                );
                (StoreState::Unreadable, Vec::new())
            }
        }
    }

    pub async fn inspect(&self, now: NaiveDateTime) -> Inspection {
        let today = now.date();
        let target = self.policy.target_window(today);
        let (store_state, buckets) = self.load_store().await;
        let analysis = self.analyzer.analyze(&target, &buckets, now);
        let requests = plan_requests(&analysis.missing_ranges, today);
        Inspection {
            target,
            store_state,
            buckets,
            analysis,
            requests,
        }
    }

    /// Analyze, fetch what is missing, merge, and persist.
    pub async fn run_cycle(&self, ctx: &CycleContext, force: bool) -> Result<SourceReport> {
        let span = info_span!("source_cycle", source_id = %self.source_id, run_id = %ctx.run_id);
        self.cycle(ctx, force).instrument(span).await
    }

    async fn cycle(&self, ctx: &CycleContext, force: bool) -> Result<SourceReport> {
        let target = self.policy.target_window(ctx.now.date());
        if !force
            && self
                .metadata
                .should_skip(&target, ctx.now, self.policy.staleness_hours)
                .await
        {
            info!(%target, "recent metadata covers target; skipping analysis");
            return Ok(SourceReport::new(&self.source_id, CycleOutcome::Skipped, target));
        }

        let inspection = self.inspect(ctx.now).await;
        let analysis = &inspection.analysis;
        info!(
            total = analysis.total_records,
            existing = analysis.existing_ranges.len(),
            missing = analysis.missing_ranges.len(),
            stale = analysis.stale_records.len(),
            "analyzed store"
        );
        let report = SourceReport::new(&self.source_id, CycleOutcome::UpToDate, target)
            .with_analysis(inspection.store_state, analysis);

        if !analysis.needs_update {
            self.metadata
                .save(analysis, &[], ctx.now)
                .await
                .context("refreshing coverage metadata")?;
            return Ok(report);
        }

        let batch = if inspection.requests.is_empty() {
            info!("only stale records; pruning without fetching");
            FetchBatch::default()
        } else {
            self.fetch_all(&ctx.fetch_context(), &inspection.requests).await
        };

        let outcome = if inspection.requests.is_empty() {
            CycleOutcome::Pruned
        } else {
            CycleOutcome::Updated
        };
        let stats = self
            .merge_and_persist(inspection.buckets, batch.buckets, &inspection.requests, ctx.now)
            .await?;

        Ok(SourceReport {
            outcome,
            requests: inspection.requests,
            fetch_failures: batch.failures,
            merge: Some(stats),
            ..report
        })
    }

    /// Drop expired records without contacting the upstream.
    pub async fn prune(&self, now: NaiveDateTime) -> Result<SourceReport> {
        let inspection = self.inspect(now).await;
        let report = SourceReport::new(&self.source_id, CycleOutcome::UpToDate, inspection.target)
            .with_analysis(inspection.store_state, &inspection.analysis);
        if inspection.store_state != StoreState::Loaded {
            return Ok(report);
        }

        let stats = self
            .merge_and_persist(inspection.buckets, Vec::new(), &[], now)
            .await?;
        Ok(SourceReport {
            outcome: CycleOutcome::Pruned,
            merge: Some(stats),
            ..report
        })
    }

    async fn merge_and_persist(
        &self,
        existing: Vec<DayBucket>,
        incoming: Vec<DayBucket>,
        requests: &[FetchRequest],
        now: NaiveDateTime,
    ) -> Result<MergeStats> {
        let merged = self.merger.merge(existing, incoming, now);
        info!(
            added = merged.stats.added,
            updated = merged.stats.updated,
            removed = merged.stats.removed,
            records = merged.stats.merged_records,
            "merged store"
        );

        self.store
            .save(&merged.buckets)
            .await
            .with_context(|| format!("writing store for {}", self.source_id))?;

        let target = self.policy.target_window(now.date());
        let post = self.analyzer.analyze(&target, &merged.buckets, now);
        self.metadata
            .save(&post, requests, now)
            .await
            .with_context(|| format!("writing metadata for {}", self.source_id))?;
        Ok(merged.stats)
    }

    /// Run every request on a bounded pool; failures are reported, not raised.
    pub async fn fetch_all(&self, ctx: &FetchContext, requests: &[FetchRequest]) -> FetchBatch {
        let limit = Arc::new(Semaphore::new(self.max_workers));
        let (tx, mut rx) = mpsc::channel(requests.len().max(1));
        let mut workers = JoinSet::new();

        for (index, request) in requests.iter().cloned().enumerate() {
            let fetcher = Arc::clone(&self.fetcher);
            let limit = Arc::clone(&limit);
            let tx = tx.clone();
            let ctx = ctx.clone();
            workers.spawn(async move {
                let result = match limit.acquire_owned().await {
                    Ok(_permit) => fetcher.fetch(&ctx, &request).await.map_err(|e| e.to_string()),
                    Err(_) => Err("worker pool closed".to_string()),
                };
                let _ = tx.send((index, result)).await;
            });
        }
        drop(tx);

        while let Some(joined) = workers.join_next().await {
            if let Err(err) = joined {
                error!(error = %err, "fetch worker aborted");
            }
        }

        let mut results = Vec::with_capacity(requests.len());
        while let Some(item) = rx.recv().await {
            results.push(item);
        }
        results.sort_by_key(|(index, _)| *index);

        let mut batch = FetchBatch::default();
        let mut answered = BTreeSet::new();
        for (index, result) in results {
            answered.insert(index);
            let request = &requests[index];
            match result {
                Ok(buckets) => {
                    info!(request = %request.description, buckets = buckets.len(), "fetched");
                    batch.buckets.extend(buckets);
                }
                Err(error) => {
                    warn!(
                        request = %request.description,
                        %error,
                        "fetch failed; range stays missing"
                    );
                    batch.failures.push(FetchFailure {
                        request: request.clone(),
                        error,
                    });
                }
            }
        }
        for (index, request) in requests.iter().enumerate() {
            if !answered.contains(&index) {
                batch.failures.push(FetchFailure {
                    request: request.clone(),
                    error: "worker aborted".to_string(),
                });
            }
        }
        batch
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOptions {
    pub force: bool,
    pub source: Option<String>,
}

/// Owns the shared HTTP client and drives every configured source.
pub struct SyncPipeline {
    config: SyncConfig,
    resolver: TimeResolver,
    http: Arc<HttpFetcher>,
    archive: Option<RawPayloadArchive>,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig) -> Result<Self> {
        let resolver = config.resolver()?;
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            per_source_concurrency: config.max_workers,
            ..Default::default()
        })?;
        let archive = config
            .archive_raw
            .then(|| RawPayloadArchive::new(config.archive_dir()));
        Ok(Self {
            config,
            resolver,
            http: Arc::new(http),
            archive,
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn resolver(&self) -> TimeResolver {
        self.resolver
    }

    pub fn context(&self) -> CycleContext {
        CycleContext::new(Uuid::new_v4(), Utc::now(), &self.resolver)
    }

    pub async fn load_registry(&self) -> Result<SourceRegistry> {
        SourceRegistry::load(&self.config.sources_file).await
    }

    pub fn fetcher_for(&self, source: &SourceConfig) -> Result<Arc<dyn EpgFetcher>> {
        match source.mode {
            SourceMode::Api => {
                let base_url = source
                    .base_url
                    .clone()
                    .with_context(|| format!("source {} has no base_url", source.source_id))?;
                let mut fetcher =
                    IptvApiFetcher::new(&source.source_id, base_url, Arc::clone(&self.http))
                        .with_params(source.params.clone())
                        .with_headers(source.headers.clone());
                if let Some(archive) = &self.archive {
                    fetcher = fetcher.with_archive(archive.clone());
                }
                Ok(Arc::new(fetcher))
            }
            SourceMode::Fixture => {
                let path = source
                    .fixture_path
                    .clone()
                    .with_context(|| format!("source {} has no fixture_path", source.source_id))?;
                Ok(Arc::new(FixtureFetcher::new(&source.source_id, path, self.resolver)))
            }
        }
    }

    pub fn source_sync(&self, source: &SourceConfig) -> Result<SourceSync> {
        Ok(SourceSync::new(
            &source.source_id,
            self.fetcher_for(source)?,
            self.config.source_dir(&source.source_id),
            self.config.policy,
            self.resolver,
            self.config.max_workers,
        ))
    }

    pub async fn run_once(&self, options: &RunOptions) -> Result<SyncRunSummary> {
        let registry = self.load_registry().await?;
        let sources = registry.selected(options.source.as_deref())?;
        let ctx = self.context();
        info!(
            run_id = %ctx.run_id,
            sources = sources.len(),
            force = options.force,
            "sync run starting"
        );

        let mut reports = Vec::with_capacity(sources.len());
        for source in sources {
            let result = match self.source_sync(source) {
                Ok(sync) => sync.run_cycle(&ctx, options.force).await,
                Err(err) => Err(err),
            };
            reports.push(self.settle(&source.source_id, &ctx, result));
        }
        self.finish("sync", ctx, reports).await
    }

    pub async fn prune(&self, source: Option<&str>) -> Result<SyncRunSummary> {
        let registry = self.load_registry().await?;
        let ctx = self.context();

        let mut reports = Vec::new();
        for source in registry.selected(source)? {
            let result = match self.source_sync(source) {
                Ok(sync) => sync.prune(ctx.now).await,
                Err(err) => Err(err),
            };
            reports.push(self.settle(&source.source_id, &ctx, result));
        }
        self.finish("prune", ctx, reports).await
    }

    pub async fn inspect(&self, source: Option<&str>) -> Result<Vec<(String, Inspection)>> {
        let registry = self.load_registry().await?;
        let now = self.context().now;
        let mut out = Vec::new();
        for source in registry.selected(source)? {
            let sync = self.source_sync(source)?;
            out.push((source.source_id.clone(), sync.inspect(now).await));
        }
        Ok(out)
    }

    fn settle(
        &self,
        source_id: &str,
        ctx: &CycleContext,
        result: Result<SourceReport>,
    ) -> SourceReport {
        result.unwrap_or_else(|err| {
            error!(source_id, error = %format!("{err:#}"), "source cycle failed");
            let target = self.config.policy.target_window(ctx.now.date());
            SourceReport::failed(source_id, target, &err)
        })
    }

    async fn finish(
        &self,
        trigger: &str,
        ctx: CycleContext,
        sources: Vec<SourceReport>,
    ) -> Result<SyncRunSummary> {
        let mut summary = SyncRunSummary {
            run_id: ctx.run_id,
            trigger: trigger.to_string(),
            started_at: ctx.fetched_at,
            finished_at: Utc::now(),
            sources,
            reports_dir: String::new(),
        };
        let dir = write_run_report(&self.config.reports_dir(), &mut summary).await?;
        info!(
            run_id = %summary.run_id,
            failed = summary.failed_sources(),
            report = %dir.display(),
            "run finished"
        );
        Ok(summary)
    }

    /// Cron-driven runs, when enabled by configuration.
    pub async fn maybe_build_scheduler(self: &Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let pipeline = Arc::clone(self);
        let cron = self.config.sync_cron.clone();
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let pipeline = Arc::clone(&pipeline);
            Box::pin(async move {
                match pipeline.run_once(&RunOptions::default()).await {
                    Ok(summary) => info!(run_id = %summary.run_id, "scheduled sync finished"),
                    Err(err) => error!(error = %format!("{err:#}"), "scheduled sync failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(Some(sched))
    }
}
