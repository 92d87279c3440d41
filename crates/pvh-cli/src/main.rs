use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand, ValueEnum};
use pvh_core::{parse_anchor, resolve_interval};
use pvh_sync::{
    backfill, build_pipeline, hourly_anchors, migrate, BackendOverrides, CancelToken,
    PipelineConfig, RetryPolicy, RunReport,
};
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "pvh-cli")]
#[command(about = "Hourly pageviews ingestion")]
struct Cli {
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Args)]
struct Backends {
    /// Read dumps from a local directory instead of the remote archive.
    #[arg(long)]
    fixtures_dir: Option<PathBuf>,
    /// Load into an in-memory table instead of Postgres.
    #[arg(long)]
    dry_run: bool,
}

impl From<Backends> for BackendOverrides {
    fn from(b: Backends) -> Self {
        Self {
            fixtures_dir: b.fixtures_dir,
            dry_run: b.dry_run,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Ingest the hour ending at the anchor, retrying per PVH_RETRIES.
    ///
    /// ZERO_FILL defaults to true: every allow-listed entity gets a row for the
    /// hour, with 0 pageviews when it is absent from the dump. Set ZERO_FILL=false
    /// to store only entities that were seen.
    Run {
        #[arg(long, value_parser = anchor_arg)]
        anchor: DateTime<Utc>,
        #[arg(long)]
        no_retry: bool,
        /// Write the run report as JSON.
        #[arg(long)]
        report: Option<PathBuf>,
        #[command(flatten)]
        backends: Backends,
    },
    /// Print the interval and remote file for an anchor.
    Resolve {
        #[arg(long, value_parser = anchor_arg)]
        anchor: DateTime<Utc>,
    },
    /// Ingest every hour with an anchor in [from, to].
    Backfill {
        #[arg(long, value_parser = anchor_arg)]
        from: DateTime<Utc>,
        #[arg(long, value_parser = anchor_arg)]
        to: DateTime<Utc>,
        #[arg(long, default_value_t = 4)]
        concurrency: usize,
        /// Directory receiving one JSON report per interval.
        #[arg(long)]
        report_dir: Option<PathBuf>,
        #[command(flatten)]
        backends: Backends,
    },
    /// Create the pageviews table if needed.
    Migrate,
}

fn anchor_arg(raw: &str) -> Result<DateTime<Utc>, String> {
    parse_anchor(raw).map_err(|err| err.to_string())
}

fn init_tracing(format: LogFormat, default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let _ = match format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
}

fn cancel_on_ctrl_c(cancel: CancelToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; stopping at the next stage boundary");
            cancel.cancel();
        }
    });
}

fn print_report(report: &RunReport) {
    let interval = report
        .interval
        .map(|i| i.to_string())
        .unwrap_or_else(|| report.anchor.to_rfc3339());
    println!(
        "run {}: interval={} state={} rows={} attempts={}",
        report.run_id,
        interval,
        serde_json::to_string(&report.state).unwrap_or_default(),
        report.rows_loaded,
        report.attempts
    );
    if let Some(stats) = &report.stats {
        println!("  transform: {stats}");
    }
}

fn report_file(dir: &Path, report: &RunReport) -> PathBuf {
    dir.join(format!("{}.json", report.anchor.format("%Y%m%d_%H%M%S")))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = PipelineConfig::from_env().context("loading configuration")?;
    init_tracing(cli.log_format, &config.log_level);

    match cli.command {
        Commands::Run {
            anchor,
            no_retry,
            report,
            backends,
        } => {
            let pipeline = build_pipeline(&config, &backends.into()).await?;
            cancel_on_ctrl_c(pipeline.cancel_token().clone());
            let policy = if no_retry { RetryPolicy::none() } else { config.retry };

            let outcome = pipeline.run_with_retries(anchor, policy).await;
            let run_report = match &outcome {
                Ok(report) => report,
                Err(failure) => failure.report.as_ref(),
            };
            print_report(run_report);
            if let Some(path) = &report {
                run_report.write_json(path)?;
            }
            outcome?;
        }
        Commands::Resolve { anchor } => {
            let resolved = resolve_interval(anchor, &config.layout)?;
            println!("{}", serde_json::to_string_pretty(&resolved)?);
        }
        Commands::Backfill {
            from,
            to,
            concurrency,
            report_dir,
            backends,
        } => {
            let anchors = hourly_anchors(from, to)?;
            let total = anchors.len();
            let pipeline = Arc::new(build_pipeline(&config, &backends.into()).await?);
            cancel_on_ctrl_c(pipeline.cancel_token().clone());

            let summary = backfill(pipeline, anchors, concurrency, config.retry).await;
            let reports = summary
                .succeeded
                .iter()
                .chain(summary.failed.iter().map(|f| f.report.as_ref()));
            for report in reports {
                print_report(report);
                if let Some(dir) = &report_dir {
                    report.write_json(&report_file(dir, report))?;
                }
            }
            println!(
                "backfill complete: intervals={} succeeded={} failed={} aborted={}",
                total,
                summary.succeeded.len(),
                summary.failed.len(),
                summary.aborted
            );
            if !summary.failed.is_empty() || summary.aborted > 0 {
                bail!("{} of {} intervals did not load", summary.failed.len() + summary.aborted, total);
            }
        }
        Commands::Migrate => {
            migrate(&config).await?;
            println!("table {} ready", config.table_name);
        }
    }

    Ok(())
}
