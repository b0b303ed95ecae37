//! Runtime settings for a pipeline process.

use std::path::PathBuf;
use std::time::Duration;

use crate::fetch::DEFAULT_FETCH_TIMEOUT;

/// Everything a [`crate::pipeline::Pipeline`] needs besides the feed list.
#[derive(Debug, Clone)]
pub struct Settings {
    /// YAML feed registry document.
    pub feeds_config: PathBuf,
    /// Root of the partition tree.
    pub data_dir: PathBuf,
    /// SQLite metadata index.
    pub index_path: PathBuf,
    pub fetch_timeout: Duration,
    /// Maximum feeds fetched at once.
    pub concurrency: usize,
    /// Trailing window the auditor requires fresh records in.
    pub audit_window: Duration,
    pub audit_after_run: bool,
    /// Optional CSV file receiving one row per run attempt.
    pub run_history: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            feeds_config: PathBuf::from("feeds_config.yaml"),
            data_dir: PathBuf::from("data/geoparquet"),
            index_path: PathBuf::from("data/db/gtfs_rt.db"),
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
            concurrency: 5,
            audit_window: Duration::from_secs(60 * 60),
            audit_after_run: false,
            run_history: None,
        }
    }
}
