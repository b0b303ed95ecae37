//! Persistence of ingestion runs.
//!
//! A run's records become one GeoParquet partition file plus one row in the
//! metadata index. The file is always complete on disk before its row is
//! inserted; a crash in between leaves an unindexed file, never a row
//! pointing at nothing.

pub mod geoparquet;
pub mod index;
pub mod partition;

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::error::PersistError;
use crate::pipeline::IngestionRun;
use crate::record::BoundingBox;

pub use index::{IndexEntry, IndexStore, MemoryIndex, NewIndexEntry, SqliteIndex};

/// What a successful write reports back as run metadata.
#[derive(Debug, Clone, Serialize)]
pub struct PersistReport {
    pub geoparquet_file: String,
    pub record_count: u64,
    /// Records across the whole index after this write.
    pub total_records: u64,
    pub bbox: Option<BoundingBox>,
    pub timestamp: DateTime<Utc>,
}

/// Owns partition-file and index-row creation as one paired operation.
#[derive(Clone)]
pub struct Persister {
    root: PathBuf,
    index: Arc<dyn IndexStore>,
}

impl Persister {
    pub fn new(root: impl Into<PathBuf>, index: Arc<dyn IndexStore>) -> Self {
        Self {
            root: root.into(),
            index,
        }
    }

    pub fn index(&self) -> &Arc<dyn IndexStore> {
        &self.index
    }

    /// Persists `run` under the current wall-clock time.
    pub fn persist(&self, run: &IngestionRun) -> Result<Option<PersistReport>, PersistError> {
        self.persist_at(run, Utc::now())
    }

    /// Persists `run` as if written at `now`.
    ///
    /// Returns `Ok(None)` without touching disk or index when the run has no
    /// records.
    ///
    /// # Errors
    ///
    /// [`PersistError::PathCollision`] if a partition already exists for the
    /// same second; I/O, encoding and index errors otherwise. No index row is
    /// written when the file write fails.
    #[tracing::instrument(skip(self, run), fields(record_count = run.records.len()))]
    pub fn persist_at(
        &self,
        run: &IngestionRun,
        now: DateTime<Utc>,
    ) -> Result<Option<PersistReport>, PersistError> {
        if run.records.is_empty() {
            warn!("No records to store");
            return Ok(None);
        }

        let path = partition::partition_path(&self.root, now);
        let bbox = BoundingBox::from_records(&run.records);

        geoparquet::write_partition(&path, &run.records, bbox)?;

        let file_path = path.to_string_lossy().into_owned();
        let entry = self.index.insert(NewIndexEntry {
            file_path: file_path.clone(),
            timestamp: now,
            record_count: run.records.len() as u64,
            bbox,
        })?;
        let total_records = self.index.total_records()?;

        info!(
            geoparquet_file = %file_path,
            record_count = entry.record_count,
            total_records,
            "Partition written"
        );

        Ok(Some(PersistReport {
            geoparquet_file: file_path,
            record_count: entry.record_count,
            total_records,
            bbox,
            timestamp: now,
        }))
    }
}
