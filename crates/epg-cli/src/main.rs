use std::env;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use epg_sync::{report_markdown, RunOptions, SyncConfig, SyncPipeline, SyncRunSummary};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "epg-cli")]
#[command(about = "Incremental EPG sync command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch missing date ranges and merge them into each source's store
    Sync {
        /// Ignore fresh coverage metadata and analyze anyway
        #[arg(long)]
        force: bool,
        /// Only this source (also runs it when disabled)
        #[arg(long)]
        source: Option<String>,
    },
    /// Show coverage and the requests a sync would issue, without writing
    Analyze {
        #[arg(long)]
        source: Option<String>,
    },
    /// Drop expired records without fetching
    Prune {
        #[arg(long)]
        source: Option<String>,
    },
    /// Run syncs on the configured cron schedule until interrupted
    Schedule,
    /// Summarize recent runs as markdown
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("EPG_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    let format = env::var("EPG_LOG_FORMAT").unwrap_or_else(|_| "compact".to_string());

    let registry = tracing_subscriber::registry().with(filter);
    match format.as_str() {
        "json" => {
            registry
                .with(fmt::layer().json().with_ansi(false).with_writer(std::io::stderr))
                .init();
        }
        _ => {
            registry
                .with(fmt::layer().compact().with_writer(std::io::stderr))
                .init();
        }
    }
}

fn print_summary(label: &str, summary: &SyncRunSummary) {
    println!(
        "{label} complete: run_id={} sources={} added={} failed_fetches={} report={}",
        summary.run_id,
        summary.sources.len(),
        summary.records_added(),
        summary.fetch_failures(),
        summary.reports_dir
    );
}

fn ensure_no_failures(summary: &SyncRunSummary) -> Result<()> {
    match summary.failed_sources() {
        0 => Ok(()),
        n => bail!("{n} source(s) failed; see {}", summary.reports_dir),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync {
        force: false,
        source: None,
    }) {
        Commands::Sync { force, source } => {
            let pipeline = SyncPipeline::new(config)?;
            let summary = pipeline.run_once(&RunOptions { force, source }).await?;
            print_summary("sync", &summary);
            ensure_no_failures(&summary)?;
        }
        Commands::Analyze { source } => {
            let pipeline = SyncPipeline::new(config)?;
            for (source_id, inspection) in pipeline.inspect(source.as_deref()).await? {
                let analysis = &inspection.analysis;
                println!(
                    "{source_id}: target {} ({:?} store)",
                    inspection.target, inspection.store_state
                );
                println!(
                    "  records={} stale={} coverage={} needs_update={}",
                    analysis.total_records,
                    analysis.stale_records.len(),
                    analysis.coverage,
                    analysis.needs_update
                );
                for range in &analysis.existing_ranges {
                    println!("  have    {range} ({} days)", range.days_count());
                }
                for request in &inspection.requests {
                    println!(
                        "  request epg_from={} epg_limit={}  # {}",
                        request.offset_from_today_days, request.span_days, request.description
                    );
                }
            }
        }
        Commands::Prune { source } => {
            let pipeline = SyncPipeline::new(config)?;
            let summary = pipeline.prune(source.as_deref()).await?;
            print_summary("prune", &summary);
            ensure_no_failures(&summary)?;
        }
        Commands::Schedule => {
            let pipeline = Arc::new(SyncPipeline::new(config)?);
            let Some(sched) = pipeline.maybe_build_scheduler().await? else {
                bail!("scheduler disabled; set EPG_SCHEDULER_ENABLED=true");
            };
            sched.start().await.context("starting scheduler")?;
            info!(cron = %pipeline.config().sync_cron, "scheduler running; Ctrl-C to stop");
            tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
            let mut sched = sched;
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Report { runs } => {
            println!("{}", report_markdown(runs, &config.reports_dir())?);
        }
    }

    Ok(())
}
