//! Time-partitioned file layout: `<root>/YYYY/MM/DD/HH/MMSS.geoparquet`.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

pub const PARTITION_EXTENSION: &str = "geoparquet";

/// Directory holding every partition written during the hour of `at`.
pub fn hour_dir(root: &Path, at: DateTime<Utc>) -> PathBuf {
    root.join(at.format("%Y/%m/%d/%H").to_string())
}

/// Path of the partition file for a write at `at`.
///
/// Unique per wall-clock second only; two writes within the same second map
/// to the same path and the second one is refused by the writer.
pub fn partition_path(root: &Path, at: DateTime<Utc>) -> PathBuf {
    hour_dir(root, at).join(format!("{}.{}", at.format("%M%S"), PARTITION_EXTENSION))
}
