//! Ingestion orchestrator: registry → fetch → decode → persist → audit.
//!
//! Feed-level failures are captured as [`FeedOutcome`] values and folded into
//! counters; they never abort a run. Anything returned as an error from
//! [`Pipeline::run`] is a whole-run failure, eligible for retry by whatever
//! triggers the pipeline.

use std::fmt;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::{Instrument, debug, error, info, warn};

use crate::audit::{AuditReport, FreshnessAuditor};
use crate::config::Settings;
use crate::error::{DecodeError, FetchError};
use crate::fetch::{FeedFetcher, HttpFetcher};
use crate::parser::decode_vehicle_positions;
use crate::record::VehiclePositionRecord;
use crate::registry::{FeedDescriptor, FeedSource, YamlFeedRegistry};
use crate::storage::{IndexStore, PersistReport, Persister, SqliteIndex};

/// Where a run currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStage {
    Idle,
    Fetching,
    Aggregating,
    Persisting,
    Auditing,
}

/// Result of processing one feed.
#[derive(Debug)]
pub enum FeedOutcome {
    Fetched {
        feed_id: String,
        records: Vec<VehiclePositionRecord>,
    },
    FetchFailed(FetchError),
    DecodeFailed(DecodeError),
    /// The feed task panicked or was cancelled.
    Aborted { feed_id: String, reason: String },
}

impl FeedOutcome {
    pub fn feed_id(&self) -> &str {
        match self {
            FeedOutcome::Fetched { feed_id, .. } => feed_id,
            FeedOutcome::FetchFailed(e) => &e.feed_id,
            FeedOutcome::DecodeFailed(e) => &e.feed_id,
            FeedOutcome::Aborted { feed_id, .. } => feed_id,
        }
    }
}

/// All records produced by one run, with per-feed counters.
#[derive(Debug, Clone)]
pub struct IngestionRun {
    pub run_timestamp: DateTime<Utc>,
    pub records: Vec<VehiclePositionRecord>,
    pub success_count: usize,
    pub error_count: usize,
    pub failed_feeds: Vec<String>,
}

/// Folds feed outcomes into a run aggregate.
///
/// Records from successful feeds are kept whatever happened to the others.
pub fn aggregate<I>(run_timestamp: DateTime<Utc>, outcomes: I) -> IngestionRun
where
    I: IntoIterator<Item = FeedOutcome>,
{
    outcomes.into_iter().fold(
        IngestionRun {
            run_timestamp,
            records: Vec::new(),
            success_count: 0,
            error_count: 0,
            failed_feeds: Vec::new(),
        },
        |mut run, outcome| {
            match outcome {
                FeedOutcome::Fetched { records, .. } => {
                    run.records.extend(records);
                    run.success_count += 1;
                }
                failed => {
                    run.failed_feeds.push(failed.feed_id().to_string());
                    run.error_count += 1;
                }
            }
            run
        },
    )
}

/// Fetches and decodes one feed, logging any failure.
pub async fn process_feed(
    fetcher: &dyn FeedFetcher,
    feed: &FeedDescriptor,
    run_timestamp: DateTime<Utc>,
) -> FeedOutcome {
    let fetch_start = std::time::Instant::now();
    let bytes = match fetcher.fetch(feed).await {
        Ok(bytes) => bytes,
        Err(e) => {
            error!(error = %e, "Feed HTTP fetch failed");
            return FeedOutcome::FetchFailed(e);
        }
    };

    let elapsed = fetch_start.elapsed();
    if elapsed.as_secs() > 15 {
        warn!(elapsed_secs = elapsed.as_secs(), "Feed fetch was slow");
    }

    match decode_vehicle_positions(&bytes, &feed.id, run_timestamp) {
        Ok(records) => {
            info!(record_count = records.len(), "Feed processed successfully");
            FeedOutcome::Fetched {
                feed_id: feed.id.clone(),
                records,
            }
        }
        Err(e) => {
            error!(error = %e, "Feed parse failed");
            FeedOutcome::DecodeFailed(e)
        }
    }
}

/// Processes every feed concurrently, at most `concurrency` at a time.
///
/// Outcomes are returned in `feeds` order regardless of completion order.
pub async fn fetch_all(
    feeds: &[FeedDescriptor],
    fetcher: Arc<dyn FeedFetcher>,
    concurrency: usize,
    run_timestamp: DateTime<Utc>,
) -> Vec<FeedOutcome> {
    let semaphore = Arc::new(Semaphore::new(concurrency.clamp(1, Semaphore::MAX_PERMITS)));
    let mut tasks = Vec::with_capacity(feeds.len());

    for feed in feeds {
        let sem = semaphore.clone();
        let fetcher = fetcher.clone();
        let feed = feed.clone();
        let feed_id = feed.id.clone();
        let feed_span = tracing::info_span!("process_feed", feed_id = %feed_id);

        let task = tokio::spawn(
            async move {
                // The semaphore is never closed, so acquire cannot fail.
                let _permit = sem.acquire_owned().await.ok();
                process_feed(fetcher.as_ref(), &feed, run_timestamp).await
            }
            .instrument(feed_span),
        );
        tasks.push((feed_id, task));
    }

    let mut outcomes = Vec::with_capacity(tasks.len());
    for (feed_id, task) in tasks {
        let outcome = match task.await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(feed_id = %feed_id, error = %e, "Feed task aborted");
                FeedOutcome::Aborted {
                    feed_id,
                    reason: e.to_string(),
                }
            }
        };
        outcomes.push(outcome);
    }
    outcomes
}

/// Metadata emitted by one run. Partial failure is visible from the counts
/// alone.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_timestamp: DateTime<Utc>,
    pub feed_count: usize,
    pub feed_ids: Vec<String>,
    pub rejected_feeds: Vec<String>,
    pub success_count: usize,
    pub error_count: usize,
    pub failed_feeds: Vec<String>,
    pub record_count: usize,
    pub persisted: Option<PersistReport>,
    pub audit: Option<AuditReport>,
    pub audit_failure: Option<String>,
}

/// A run that got as far as aggregation and then failed to persist.
///
/// Attached as context to the run error so callers can still report the
/// per-feed counts; recover it with `err.downcast_ref::<PersistFailed>()`.
#[derive(Debug)]
pub struct PersistFailed {
    pub report: RunReport,
}

impl fmt::Display for PersistFailed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "failed to persist run ({} of {} feeds succeeded, {} records)",
            self.report.success_count, self.report.feed_count, self.report.record_count
        )
    }
}

/// One configured pipeline. Lives for the whole process; each call to
/// [`Pipeline::run`] is one independent run.
pub struct Pipeline {
    source: Box<dyn FeedSource>,
    fetcher: Arc<dyn FeedFetcher>,
    persister: Persister,
    auditor: Option<FreshnessAuditor>,
    concurrency: usize,
    stage: RunStage,
}

impl Pipeline {
    pub fn new(
        source: Box<dyn FeedSource>,
        fetcher: Arc<dyn FeedFetcher>,
        persister: Persister,
        concurrency: usize,
    ) -> Self {
        Self {
            source,
            fetcher,
            persister,
            auditor: None,
            concurrency,
            stage: RunStage::Idle,
        }
    }

    /// Wires the production stack: YAML registry, HTTP fetcher, SQLite index.
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let index = SqliteIndex::open(&settings.index_path).with_context(|| {
            format!("failed to open index {}", settings.index_path.display())
        })?;
        let index: Arc<dyn IndexStore> = Arc::new(index);

        let fetcher =
            HttpFetcher::new(settings.fetch_timeout).context("failed to build HTTP client")?;

        let mut pipeline = Self::new(
            Box::new(YamlFeedRegistry::new(&settings.feeds_config)),
            Arc::new(fetcher),
            Persister::new(&settings.data_dir, index.clone()),
            settings.concurrency,
        );
        if settings.audit_after_run {
            pipeline = pipeline.with_auditor(FreshnessAuditor::new(index, settings.audit_window));
        }

        Ok(pipeline)
    }

    /// Runs the freshness audit after every successful persist.
    pub fn with_auditor(mut self, auditor: FreshnessAuditor) -> Self {
        self.auditor = Some(auditor);
        self
    }

    pub fn stage(&self) -> RunStage {
        self.stage
    }

    pub fn persister(&self) -> &Persister {
        &self.persister
    }

    fn transition(&mut self, next: RunStage) {
        debug!(from = ?self.stage, to = ?next, "Run stage");
        self.stage = next;
    }

    /// Executes one run.
    ///
    /// # Errors
    ///
    /// Fails only when the registry cannot be loaded or persistence fails.
    /// Feed failures are counted in the report instead. An audit failure is
    /// reported in [`RunReport::audit_failure`] and does not fail the run.
    #[tracing::instrument(skip(self))]
    pub async fn run(&mut self) -> Result<RunReport> {
        let result = self.run_stages().await;
        self.transition(RunStage::Idle);
        result
    }

    async fn run_stages(&mut self) -> Result<RunReport> {
        let run_timestamp = Utc::now();
        self.transition(RunStage::Fetching);

        let registration = self
            .source
            .load_feeds()
            .context("failed to load feed registry")?;
        let feed_ids = registration.feed_ids();
        let rejected_feeds: Vec<String> =
            registration.rejected.iter().map(|e| e.to_string()).collect();
        info!(
            feed_count = feed_ids.len(),
            rejected = rejected_feeds.len(),
            "Feeds loaded"
        );

        let outcomes = fetch_all(
            &registration.feeds,
            self.fetcher.clone(),
            self.concurrency,
            run_timestamp,
        )
        .await;

        self.transition(RunStage::Aggregating);
        let run = aggregate(run_timestamp, outcomes);
        info!(
            success_count = run.success_count,
            error_count = run.error_count,
            record_count = run.records.len(),
            "Feeds aggregated"
        );

        let mut report = RunReport {
            run_timestamp,
            feed_count: feed_ids.len(),
            feed_ids,
            rejected_feeds,
            success_count: run.success_count,
            error_count: run.error_count,
            failed_feeds: run.failed_feeds.clone(),
            record_count: run.records.len(),
            persisted: None,
            audit: None,
            audit_failure: None,
        };

        self.transition(RunStage::Persisting);
        // Parquet encoding, fsync and SQLite all block.
        let persister = self.persister.clone();
        let persisted = match tokio::task::spawn_blocking(move || persister.persist(&run)).await {
            Ok(Ok(persisted)) => persisted,
            Ok(Err(e)) => return Err(anyhow::Error::new(e).context(PersistFailed { report })),
            Err(e) => return Err(anyhow::Error::new(e).context(PersistFailed { report })),
        };
        report.persisted = persisted;

        if report.persisted.is_some() && self.auditor.is_some() {
            self.transition(RunStage::Auditing);
            if let Some(auditor) = &self.auditor {
                match auditor.audit() {
                    Ok(audit) => report.audit = Some(audit),
                    Err(e) => {
                        error!(error = %e, "Freshness audit failed");
                        report.audit_failure = Some(e.to_string());
                    }
                }
            }
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FetchCause;
    use crate::gtfs_rt::{FeedEntity, FeedHeader, FeedMessage, Position, VehiclePosition};
    use crate::storage::MemoryIndex;
    use async_trait::async_trait;
    use bytes::Bytes;
    use prost::Message;
    use std::collections::HashMap;
    use std::time::Duration;

    /// Serves canned payloads keyed by feed id; unknown ids time out.
    struct FakeFetcher {
        payloads: HashMap<String, Vec<u8>>,
    }

    #[async_trait]
    impl FeedFetcher for FakeFetcher {
        async fn fetch(&self, feed: &FeedDescriptor) -> Result<Bytes, FetchError> {
            match self.payloads.get(&feed.id) {
                Some(bytes) => Ok(Bytes::from(bytes.clone())),
                None => Err(FetchError {
                    feed_id: feed.id.clone(),
                    cause: FetchCause::Timeout(Duration::from_secs(30)),
                }),
            }
        }
    }

    struct PanickingFetcher;

    #[async_trait]
    impl FeedFetcher for PanickingFetcher {
        async fn fetch(&self, feed: &FeedDescriptor) -> Result<Bytes, FetchError> {
            if feed.id == "boom" {
                panic!("fetcher bug");
            }
            Ok(Bytes::from(feed_bytes(1)))
        }
    }

    fn feed_bytes(vehicles: usize) -> Vec<u8> {
        let entity = (0..vehicles)
            .map(|i| FeedEntity {
                id: format!("e{i}"),
                vehicle: Some(VehiclePosition {
                    position: Some(Position {
                        latitude: 40.0 + i as f32 * 0.01,
                        longitude: -74.0,
                        bearing: None,
                        speed: None,
                        odometer: None,
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            })
            .collect();
        FeedMessage {
            header: FeedHeader {
                gtfs_realtime_version: "2.0".into(),
                ..Default::default()
            },
            entity,
        }
        .encode_to_vec()
    }

    fn feeds(ids: &[&str]) -> Vec<FeedDescriptor> {
        ids.iter()
            .map(|id| FeedDescriptor::new(*id, format!("http://localhost/{id}")))
            .collect()
    }

    fn fetcher(payloads: &[(&str, Vec<u8>)]) -> Arc<dyn FeedFetcher> {
        Arc::new(FakeFetcher {
            payloads: payloads
                .iter()
                .map(|(id, b)| (id.to_string(), b.clone()))
                .collect(),
        })
    }

    #[test]
    fn test_aggregate_is_pure_fold() {
        let ts = Utc::now();
        let outcomes = vec![
            FeedOutcome::Fetched {
                feed_id: "a".into(),
                records: vec![VehiclePositionRecord::empty("a", ts)],
            },
            FeedOutcome::FetchFailed(FetchError {
                feed_id: "b".into(),
                cause: FetchCause::Timeout(Duration::from_secs(30)),
            }),
            FeedOutcome::Aborted {
                feed_id: "c".into(),
                reason: "panic".into(),
            },
            FeedOutcome::Fetched {
                feed_id: "d".into(),
                records: Vec::new(),
            },
        ];

        let run = aggregate(ts, outcomes);
        assert_eq!(run.success_count, 2);
        assert_eq!(run.error_count, 2);
        assert_eq!(run.records.len(), 1);
        assert_eq!(run.failed_feeds, vec!["b", "c"]);
    }

    #[tokio::test]
    async fn test_middle_feed_timeout_is_isolated() {
        let fetcher = fetcher(&[("one", feed_bytes(3)), ("three", feed_bytes(4))]);
        let outcomes = fetch_all(&feeds(&["one", "two", "three"]), fetcher, 2, Utc::now()).await;

        let ids: Vec<_> = outcomes.iter().map(|o| o.feed_id().to_string()).collect();
        assert_eq!(ids, vec!["one", "two", "three"]);
        assert!(matches!(&outcomes[1], FeedOutcome::FetchFailed(e) if e.cause.is_timeout()));

        let run = aggregate(Utc::now(), outcomes);
        assert_eq!(run.success_count, 2);
        assert_eq!(run.error_count, 1);
        assert_eq!(run.records.len(), 7);
    }

    #[tokio::test]
    async fn test_decode_failure_is_isolated() {
        let fetcher = fetcher(&[
            ("good", feed_bytes(2)),
            ("garbage", vec![0xFF, 0xFE, 0x00, 0x01]),
        ]);
        let run = aggregate(
            Utc::now(),
            fetch_all(&feeds(&["garbage", "good"]), fetcher, 4, Utc::now()).await,
        );
        assert_eq!(run.success_count, 1);
        assert_eq!(run.error_count, 1);
        assert_eq!(run.failed_feeds, vec!["garbage"]);
        assert_eq!(run.records.len(), 2);
    }

    #[tokio::test]
    async fn test_panicking_feed_is_aborted_not_fatal() {
        let outcomes = fetch_all(
            &feeds(&["ok", "boom"]),
            Arc::new(PanickingFetcher),
            1,
            Utc::now(),
        )
        .await;
        assert!(matches!(&outcomes[1], FeedOutcome::Aborted { feed_id, .. } if feed_id == "boom"));
        let run = aggregate(Utc::now(), outcomes);
        assert_eq!(run.records.len(), 1);
        assert_eq!(run.error_count, 1);
    }

    #[tokio::test]
    async fn test_records_share_run_timestamp() {
        let ts = Utc::now();
        let fetcher = fetcher(&[("a", feed_bytes(2)), ("b", feed_bytes(2))]);
        let run = aggregate(ts, fetch_all(&feeds(&["a", "b"]), fetcher, 2, ts).await);
        assert!(run.records.iter().all(|r| r.run_timestamp == ts));
    }

    #[tokio::test]
    async fn test_run_reports_partial_failure_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let index = Arc::new(MemoryIndex::new());
        let mut pipeline = Pipeline::new(
            Box::new(feeds(&["one", "two", "three"])),
            fetcher(&[("one", feed_bytes(3)), ("three", feed_bytes(4))]),
            Persister::new(dir.path(), index.clone()),
            3,
        );

        let report = pipeline.run().await.unwrap();

        assert_eq!(pipeline.stage(), RunStage::Idle);
        assert_eq!(report.feed_count, 3);
        assert_eq!(report.success_count, 2);
        assert_eq!(report.error_count, 1);
        assert_eq!(report.failed_feeds, vec!["two"]);
        assert_eq!(report.record_count, 7);
        let persisted = report.persisted.unwrap();
        assert_eq!(persisted.record_count, 7);
        assert_eq!(index.len(), 1);
        assert_eq!(index.total_records().unwrap(), 7);
    }

    #[tokio::test]
    async fn test_run_with_no_feeds_persists_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let index = Arc::new(MemoryIndex::new());
        let mut pipeline = Pipeline::new(
            Box::new(Vec::<FeedDescriptor>::new()),
            fetcher(&[]),
            Persister::new(dir.path(), index.clone()),
            3,
        )
        .with_auditor(FreshnessAuditor::new(index.clone(), Duration::from_secs(3600)));

        let report = pipeline.run().await.unwrap();

        assert_eq!(report.feed_count, 0);
        assert!(report.persisted.is_none());
        assert!(report.audit.is_none());
        assert!(index.is_empty());
    }

    #[tokio::test]
    async fn test_run_audits_after_persist() {
        let dir = tempfile::tempdir().unwrap();
        let index = Arc::new(MemoryIndex::new());
        let mut pipeline = Pipeline::new(
            Box::new(feeds(&["a"])),
            fetcher(&[("a", feed_bytes(2))]),
            Persister::new(dir.path(), index.clone()),
            1,
        )
        .with_auditor(FreshnessAuditor::new(index.clone(), Duration::from_secs(3600)));

        let report = pipeline.run().await.unwrap();

        let audit = report.audit.unwrap();
        assert_eq!(audit.total_records, 2);
        assert_eq!(audit.recent_records, 2);
        assert!(report.audit_failure.is_none());
    }

    #[tokio::test]
    async fn test_persist_failure_keeps_feed_counts() {
        let dir = tempfile::tempdir().unwrap();
        let not_a_dir = dir.path().join("occupied");
        std::fs::write(&not_a_dir, b"x").unwrap();

        let mut pipeline = Pipeline::new(
            Box::new(feeds(&["one", "two", "three"])),
            fetcher(&[("one", feed_bytes(3)), ("three", feed_bytes(4))]),
            Persister::new(&not_a_dir, Arc::new(MemoryIndex::new())),
            3,
        );

        let err = pipeline.run().await.unwrap_err();

        assert_eq!(pipeline.stage(), RunStage::Idle);
        let failed = err.downcast_ref::<PersistFailed>().unwrap();
        assert_eq!(failed.report.success_count, 2);
        assert_eq!(failed.report.error_count, 1);
        assert_eq!(failed.report.failed_feeds, vec!["two"]);
        assert_eq!(failed.report.record_count, 7);
        assert!(failed.report.persisted.is_none());
        assert!(format!("{err:#}").starts_with("failed to persist run (2 of 3 feeds succeeded"));
    }

    #[tokio::test]
    async fn test_unbounded_concurrency_is_clamped() {
        let fetcher = fetcher(&[("a", feed_bytes(1))]);
        let outcomes = fetch_all(&feeds(&["a"]), fetcher, usize::MAX, Utc::now()).await;
        assert!(matches!(&outcomes[0], FeedOutcome::Fetched { .. }));
    }

    #[tokio::test]
    async fn test_registry_failure_fails_run() {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("feeds.yaml");
        std::fs::write(&config, "custom_feeds: [unclosed").unwrap();

        let mut pipeline = Pipeline::new(
            Box::new(YamlFeedRegistry::new(&config)),
            fetcher(&[]),
            Persister::new(dir.path(), Arc::new(MemoryIndex::new())),
            1,
        );

        assert!(pipeline.run().await.is_err());
        assert_eq!(pipeline.stage(), RunStage::Idle);
    }
}
