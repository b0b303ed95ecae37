//! CLI entry point for the GTFS-RT vehicle-position ingestion pipeline.
//!
//! Provides subcommands for a single run, an in-process schedule, a
//! freshness audit of the index, and listing the configured feeds.

use anyhow::{Result, bail};
use clap::builder::RangedU64ValueParser;
use clap::{Args, Parser, Subcommand, value_parser};
use gtfs_rt_ingest::{
    audit::FreshnessAuditor,
    config::Settings,
    output::{RunHistoryRow, append_run_history, log_report},
    pipeline::{Pipeline, RunReport},
    registry::{FeedSource, YamlFeedRegistry},
    schedule::{RetryPolicy, run_every, run_with_retry},
    storage::SqliteIndex,
};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

const MAX_CONCURRENCY: u64 = 256;

#[derive(Parser)]
#[command(name = "gtfs_rt_ingest")]
#[command(about = "Ingest GTFS-RT vehicle positions into GeoParquet", long_about = None)]
struct Cli {
    #[command(flatten)]
    settings: SettingsArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct SettingsArgs {
    /// YAML document with a `custom_feeds` section
    #[arg(long, env = "GTFS_RT_FEEDS_CONFIG", default_value = "feeds_config.yaml")]
    feeds_config: PathBuf,

    /// Root directory of the GeoParquet partition tree
    #[arg(long, env = "GTFS_RT_DATA_DIR", default_value = "data/geoparquet")]
    data_dir: PathBuf,

    /// SQLite metadata index
    #[arg(long, env = "GTFS_RT_INDEX_PATH", default_value = "data/db/gtfs_rt.db")]
    index_path: PathBuf,

    /// Per-feed fetch timeout in seconds
    #[arg(long, env = "GTFS_RT_FETCH_TIMEOUT_SECS", default_value_t = 30)]
    fetch_timeout_secs: u64,

    /// Maximum number of concurrent feed downloads
    #[arg(
        short,
        long,
        env = "GTFS_RT_CONCURRENCY",
        default_value_t = 5,
        value_parser = RangedU64ValueParser::<usize>::new().range(1..=MAX_CONCURRENCY)
    )]
    concurrency: usize,

    /// Audit window in seconds
    #[arg(long, env = "GTFS_RT_AUDIT_WINDOW_SECS", default_value_t = 3600)]
    audit_window_secs: u64,

    /// Optional CSV file to append one row per run attempt to
    #[arg(long, env = "GTFS_RT_RUN_HISTORY")]
    run_history: Option<PathBuf>,
}

impl SettingsArgs {
    fn into_settings(self, audit_after_run: bool) -> Settings {
        Settings {
            feeds_config: self.feeds_config,
            data_dir: self.data_dir,
            index_path: self.index_path,
            fetch_timeout: Duration::from_secs(self.fetch_timeout_secs),
            concurrency: self.concurrency,
            audit_window: Duration::from_secs(self.audit_window_secs),
            audit_after_run,
            run_history: self.run_history,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Execute one pipeline run
    Run {
        /// Audit the index after persisting
        #[arg(long, default_value_t = false)]
        audit: bool,
    },
    /// Run the pipeline on a fixed interval until interrupted
    Schedule {
        /// Seconds between run starts
        #[arg(
            short = 'i',
            long,
            default_value_t = 60,
            value_parser = value_parser!(u64).range(1..)
        )]
        interval_secs: u64,

        /// Attempts per run when the run fails outright
        #[arg(long, default_value_t = 3)]
        max_attempts: u32,

        /// Seconds to wait between attempts
        #[arg(long, default_value_t = 1)]
        retry_delay_secs: u64,

        /// Number of runs before exiting (omit to run until Ctrl+C)
        #[arg(short = 'n', long)]
        runs: Option<usize>,

        /// Audit the index after each persisted run
        #[arg(long, default_value_t = false)]
        audit: bool,
    },
    /// Check the index for fresh, consistent data
    Audit,
    /// List the feeds in the registry document
    ListFeeds,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok(); // Load .env file

    // Logging setup: colored stderr + JSON rolling log file
    let log_file_path =
        std::env::var("LOG_FILE_PATH").unwrap_or_else(|_| "logs/gtfs_rt_ingest.log".to_string());
    let log_dir = Path::new(&log_file_path)
        .parent()
        .unwrap_or(Path::new("logs"));
    let log_file_name = Path::new(&log_file_path)
        .file_name()
        .unwrap_or(OsStr::new("gtfs_rt_ingest.log"));

    let file_appender = tracing_appender::rolling::daily(log_dir, log_file_name);
    let (non_blocking_file, _file_guard) = tracing_appender::non_blocking(file_appender);

    let stderr_layer = fmt::layer()
        .with_target(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::from_env("RUST_LOG").add_directive("info".parse()?));

    let json_layer = fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_writer(non_blocking_file)
        .with_filter(EnvFilter::from_env("RUST_LOG_JSON").add_directive("debug".parse()?));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run { audit } => {
            let settings = cli.settings.into_settings(audit);
            let pipeline = Mutex::new(Pipeline::from_settings(&settings)?);
            run_once(
                &pipeline,
                &RetryPolicy::default(),
                settings.run_history.as_deref(),
            )
            .await?;
        }
        Commands::Schedule {
            interval_secs,
            max_attempts,
            retry_delay_secs,
            runs,
            audit,
        } => {
            let settings = cli.settings.into_settings(audit);
            let policy = RetryPolicy {
                max_attempts,
                delay: Duration::from_secs(retry_delay_secs),
            };
            schedule(&settings, Duration::from_secs(interval_secs), runs, policy).await?;
        }
        Commands::Audit => {
            let settings = cli.settings.into_settings(false);
            let index = SqliteIndex::open(&settings.index_path)?;
            let auditor = FreshnessAuditor::new(Arc::new(index), settings.audit_window);

            match auditor.audit() {
                Ok(report) => info!(%report, "Index is fresh"),
                Err(e) => {
                    error!(error = %e, "Audit failed");
                    bail!(e);
                }
            }
        }
        Commands::ListFeeds => {
            let settings = cli.settings.into_settings(false);
            let registry = YamlFeedRegistry::new(&settings.feeds_config);
            let registration = registry.load_feeds()?;

            for feed in &registration.feeds {
                let authenticated = feed.headers.contains_key(reqwest::header::AUTHORIZATION);
                info!(
                    feed_id = %feed.id,
                    url = %feed.url,
                    header_count = feed.headers.len(),
                    authenticated,
                    "Feed"
                );
            }
            for rejected in &registration.rejected {
                warn!(error = %rejected, "Rejected feed entry");
            }

            info!(
                path = %registry.path().display(),
                total = registration.feeds.len(),
                rejected = registration.rejected.len(),
                "Feed list summary"
            );
        }
    }

    Ok(())
}

/// Executes one run with whole-run retry, recording every attempt.
async fn run_once(
    pipeline: &Mutex<Pipeline>,
    policy: &RetryPolicy,
    history: Option<&Path>,
) -> Result<RunReport> {
    let report = run_with_retry(policy, |attempt| async move {
        let result = pipeline.lock().await.run().await;

        if let Some(path) = history {
            let row = match &result {
                Ok(report) => RunHistoryRow::from_report(attempt, report),
                Err(e) => RunHistoryRow::from_error(attempt, e),
            };
            if let Err(e) = append_run_history(path, &row) {
                warn!(path = %path.display(), error = %e, "Failed to append run history");
            }
        }

        result
    })
    .await?;

    log_report(&report)?;
    Ok(report)
}

#[tracing::instrument(skip(settings, policy))]
async fn schedule(
    settings: &Settings,
    interval: Duration,
    runs: Option<usize>,
    policy: RetryPolicy,
) -> Result<()> {
    let pipeline = Arc::new(Mutex::new(Pipeline::from_settings(settings)?));
    let history = settings.run_history.clone();

    match runs {
        Some(runs) => info!(runs, interval_secs = interval.as_secs(), "Starting schedule"),
        None => info!(
            interval_secs = interval.as_secs(),
            "Running until interrupted. Press Ctrl+C to stop."
        ),
    }

    run_every(interval, runs, |run| {
        let pipeline = pipeline.clone();
        let history = history.clone();
        async move {
            info!(run, "Starting scheduled run");
            if let Err(e) = run_once(&pipeline, &policy, history.as_deref()).await {
                error!(
                    run,
                    error = %format_args!("{e:#}"),
                    "Scheduled run failed after retries"
                );
            }
        }
    })
    .await;

    Ok(())
}
