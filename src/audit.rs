//! Freshness audit over the metadata index.
//!
//! Passes only when the index has a latest entry whose file is still on disk,
//! the index holds records at all, and some of them fall inside the trailing
//! window. Failures are reported, never repaired.

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::info;

use crate::error::IndexError;
use crate::record::BoundingBox;
use crate::storage::IndexStore;

/// Values computed by an audit, reported whether it passes or not.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditReport {
    pub total_records: u64,
    pub recent_records: u64,
    pub window_secs: u64,
    pub latest_file: Option<String>,
    pub latest_bbox: Option<BoundingBox>,
    pub checked_at: DateTime<Utc>,
}

impl fmt::Display for AuditReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "total_records={} recent_records={} window={}s latest_file={}",
            self.total_records,
            self.recent_records,
            self.window_secs,
            self.latest_file.as_deref().unwrap_or("none"),
        )
    }
}

/// Which audit condition did not hold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailedCondition {
    /// The index has no entries.
    NoIndexedFiles,
    /// The latest entry points at a file that is gone. Indicates data loss or
    /// a race in the storage layer.
    IndexInconsistency { file_path: String },
    NoRecords,
    NoRecentRecords,
}

impl fmt::Display for FailedCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailedCondition::NoIndexedFiles => write!(f, "no geoparquet files indexed"),
            FailedCondition::IndexInconsistency { file_path } => {
                write!(f, "latest geoparquet file {file_path} not found")
            }
            FailedCondition::NoRecords => write!(f, "no records found"),
            FailedCondition::NoRecentRecords => write!(f, "no records added in the audit window"),
        }
    }
}

#[derive(Error, Debug)]
pub enum AuditError {
    #[error("audit failed: {condition} ({details})")]
    Failed {
        condition: FailedCondition,
        details: AuditReport,
    },

    #[error(transparent)]
    Index(#[from] IndexError),
}

impl AuditError {
    pub fn condition(&self) -> Option<&FailedCondition> {
        match self {
            AuditError::Failed { condition, .. } => Some(condition),
            AuditError::Index(_) => None,
        }
    }
}

/// Checks that the index is populated, fresh, and consistent with disk.
pub struct FreshnessAuditor {
    index: Arc<dyn IndexStore>,
    window: Duration,
}

impl FreshnessAuditor {
    pub fn new(index: Arc<dyn IndexStore>, window: Duration) -> Self {
        Self { index, window }
    }

    pub fn audit(&self) -> Result<AuditReport, AuditError> {
        self.audit_at(Utc::now())
    }

    /// Audits as of `now`.
    #[tracing::instrument(skip(self))]
    pub fn audit_at(&self, now: DateTime<Utc>) -> Result<AuditReport, AuditError> {
        let total_records = self.index.total_records()?;
        let window = chrono::Duration::from_std(self.window).unwrap_or(chrono::Duration::MAX);
        let since = now.checked_sub_signed(window).unwrap_or(DateTime::<Utc>::MIN_UTC);
        let recent_records = self.index.records_since(since)?;
        let latest = self.index.latest()?;

        let details = AuditReport {
            total_records,
            recent_records,
            window_secs: self.window.as_secs(),
            latest_file: latest.as_ref().map(|e| e.file_path.clone()),
            latest_bbox: latest.as_ref().and_then(|e| e.bbox),
            checked_at: now,
        };

        let failed = match &latest {
            None => Some(FailedCondition::NoIndexedFiles),
            Some(entry) if !Path::new(&entry.file_path).exists() => {
                Some(FailedCondition::IndexInconsistency {
                    file_path: entry.file_path.clone(),
                })
            }
            Some(_) if total_records == 0 => Some(FailedCondition::NoRecords),
            Some(_) if recent_records == 0 => Some(FailedCondition::NoRecentRecords),
            Some(_) => None,
        };

        if let Some(condition) = failed {
            return Err(AuditError::Failed { condition, details });
        }

        info!(
            total_records,
            recent_records,
            latest_file = details.latest_file.as_deref().unwrap_or(""),
            "Audit passed"
        );
        Ok(details)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryIndex, NewIndexEntry};
    use chrono::TimeZone;
    use std::fs;

    const HOUR: Duration = Duration::from_secs(3600);

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    fn index_file(index: &MemoryIndex, path: &Path, at: DateTime<Utc>, count: u64) {
        index
            .insert(NewIndexEntry {
                file_path: path.to_string_lossy().into_owned(),
                timestamp: at,
                record_count: count,
                bbox: None,
            })
            .unwrap();
    }

    #[test]
    fn test_audit_passes() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("0000.geoparquet");
        fs::write(&file, b"x").unwrap();
        let index = Arc::new(MemoryIndex::new());
        index_file(&index, &file, now() - chrono::Duration::minutes(5), 12);

        let report = FreshnessAuditor::new(index, HOUR).audit_at(now()).unwrap();
        assert_eq!(report.total_records, 12);
        assert_eq!(report.recent_records, 12);
        assert_eq!(report.latest_file.as_deref(), Some(&*file.to_string_lossy()));
    }

    #[test]
    fn test_empty_index_fails() {
        let err = FreshnessAuditor::new(Arc::new(MemoryIndex::new()), HOUR)
            .audit_at(now())
            .unwrap_err();
        assert_eq!(err.condition(), Some(&FailedCondition::NoIndexedFiles));
    }

    #[test]
    fn test_deleted_latest_file_is_inconsistency() {
        let dir = tempfile::tempdir().unwrap();
        let older = dir.path().join("0000.geoparquet");
        let latest = dir.path().join("0100.geoparquet");
        fs::write(&older, b"x").unwrap();
        fs::write(&latest, b"x").unwrap();
        let index = Arc::new(MemoryIndex::new());
        index_file(&index, &older, now() - chrono::Duration::minutes(2), 3);
        index_file(&index, &latest, now() - chrono::Duration::minutes(1), 4);

        fs::remove_file(&latest).unwrap();

        let err = FreshnessAuditor::new(index, HOUR).audit_at(now()).unwrap_err();
        assert_eq!(
            err.condition(),
            Some(&FailedCondition::IndexInconsistency {
                file_path: latest.to_string_lossy().into_owned()
            })
        );
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn test_stale_index_fails_with_counts() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("0000.geoparquet");
        fs::write(&file, b"x").unwrap();
        let index = Arc::new(MemoryIndex::new());
        index_file(&index, &file, now() - chrono::Duration::hours(3), 8);

        let err = FreshnessAuditor::new(index, HOUR).audit_at(now()).unwrap_err();
        match err {
            AuditError::Failed { condition, details } => {
                assert_eq!(condition, FailedCondition::NoRecentRecords);
                assert_eq!(details.total_records, 8);
                assert_eq!(details.recent_records, 0);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_zero_record_rows_fail() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("0000.geoparquet");
        fs::write(&file, b"x").unwrap();
        let index = Arc::new(MemoryIndex::new());
        index_file(&index, &file, now(), 0);

        let err = FreshnessAuditor::new(index, HOUR).audit_at(now()).unwrap_err();
        assert_eq!(err.condition(), Some(&FailedCondition::NoRecords));
    }
}
