//! Run report output: structured log line and optional run-history CSV.

use anyhow::Result;
use chrono::{DateTime, Utc};
use csv::WriterBuilder;
use serde::Serialize;
use std::fs::OpenOptions;
use std::path::Path;
use tracing::{debug, info};

use crate::pipeline::{PersistFailed, RunReport};

/// Logs the run report as one JSON document.
pub fn log_report(report: &RunReport) -> Result<()> {
    info!(report = %serde_json::to_string(report)?, "Run report");
    Ok(())
}

/// One row of the run-history CSV.
#[derive(Debug, Default, Serialize)]
pub struct RunHistoryRow {
    pub finished_at: DateTime<Utc>,
    pub attempt: u32,
    pub status: String,
    pub feed_count: usize,
    pub success_count: usize,
    pub error_count: usize,
    pub record_count: usize,
    pub geoparquet_file: Option<String>,
    pub total_records: Option<u64>,
    pub audit_failure: Option<String>,
    pub error_message: Option<String>,
}

impl RunHistoryRow {
    pub fn from_report(attempt: u32, report: &RunReport) -> Self {
        RunHistoryRow {
            finished_at: Utc::now(),
            attempt,
            status: "success".to_string(),
            feed_count: report.feed_count,
            success_count: report.success_count,
            error_count: report.error_count,
            record_count: report.record_count,
            geoparquet_file: report.persisted.as_ref().map(|p| p.geoparquet_file.clone()),
            total_records: report.persisted.as_ref().map(|p| p.total_records),
            audit_failure: report.audit_failure.clone(),
            error_message: None,
        }
    }

    /// A row for an attempt that failed outright. Feed counts are kept when
    /// the run got as far as aggregation.
    pub fn from_error(attempt: u32, error: &anyhow::Error) -> Self {
        let base = match error.downcast_ref::<PersistFailed>() {
            Some(failed) => Self::from_report(attempt, &failed.report),
            None => RunHistoryRow {
                attempt,
                ..Default::default()
            },
        };
        RunHistoryRow {
            finished_at: Utc::now(),
            status: "failed".to_string(),
            error_message: Some(format!("{error:#}")),
            ..base
        }
    }
}

/// Appends a [`RunHistoryRow`] to a CSV file.
///
/// Creates the file (and its directory) with headers if it does not already
/// exist.
pub fn append_run_history(path: &Path, row: &RunHistoryRow) -> Result<()> {
    let file_exists = path.exists();
    debug!(path = %path.display(), file_exists, "Appending run history");

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let file = OpenOptions::new().append(true).create(true).open(path)?;

    let mut writer = WriterBuilder::new()
        .has_headers(!file_exists) // headers only on a fresh file
        .from_writer(file);

    writer.serialize(row)?;
    writer.flush()?;

    Ok(())
}
