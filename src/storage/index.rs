//! Metadata index over partition files.
//!
//! One row per partition file with its record count and bounding box, so
//! freshness can be checked without opening any data file.

use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, ErrorCode, OptionalExtension, params};

use crate::error::IndexError;
use crate::record::BoundingBox;

/// A row about to be inserted.
#[derive(Debug, Clone, PartialEq)]
pub struct NewIndexEntry {
    pub file_path: String,
    /// Business time: when the partition was written.
    pub timestamp: DateTime<Utc>,
    pub record_count: u64,
    pub bbox: Option<BoundingBox>,
}

/// A stored row.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexEntry {
    pub id: i64,
    pub file_path: String,
    pub timestamp: DateTime<Utc>,
    pub record_count: u64,
    /// When the row itself was inserted.
    pub created_at: DateTime<Utc>,
    pub bbox: Option<BoundingBox>,
}

/// Storage for [`IndexEntry`] rows. Entries are never updated or removed.
pub trait IndexStore: Send + Sync {
    /// Inserts a row; `file_path` must not already be indexed.
    fn insert(&self, entry: NewIndexEntry) -> Result<IndexEntry, IndexError>;

    /// Sum of `record_count` over all rows.
    fn total_records(&self) -> Result<u64, IndexError>;

    /// Sum of `record_count` over rows with `timestamp >= since`.
    fn records_since(&self, since: DateTime<Utc>) -> Result<u64, IndexError>;

    /// The row with the latest `timestamp`, ties broken by insertion order.
    fn latest(&self) -> Result<Option<IndexEntry>, IndexError>;
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS geoparquet_files (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    file_path TEXT NOT NULL UNIQUE,
    timestamp TEXT NOT NULL,
    record_count INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    bbox_minx REAL,
    bbox_miny REAL,
    bbox_maxx REAL,
    bbox_maxy REAL
);
CREATE INDEX IF NOT EXISTS idx_geoparquet_files_timestamp
    ON geoparquet_files (timestamp);
";

/// Fixed-width UTC text, so string order in SQL equals time order.
fn to_sql_time(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn from_sql_time(column: &'static str, value: String) -> Result<DateTime<Utc>, IndexError> {
    DateTime::parse_from_rfc3339(&value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| IndexError::Corrupt { column, value })
}

/// SQLite-backed index.
pub struct SqliteIndex {
    conn: Mutex<Connection>,
}

impl SqliteIndex {
    /// Opens (creating if needed) the index database at `path`.
    pub fn open(path: &Path) -> Result<Self, IndexError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, IndexError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, IndexError> {
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, IndexError>,
    ) -> Result<T, IndexError> {
        // Poisoning leaves the connection usable.
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        f(&*conn)
    }
}

type RawRow = (
    i64,
    String,
    String,
    i64,
    String,
    Option<f64>,
    Option<f64>,
    Option<f64>,
    Option<f64>,
);

fn entry_from_row(row: RawRow) -> Result<IndexEntry, IndexError> {
    let (id, file_path, timestamp, record_count, created_at, minx, miny, maxx, maxy) = row;
    let bbox = match (minx, miny, maxx, maxy) {
        (Some(minx), Some(miny), Some(maxx), Some(maxy)) => Some(BoundingBox {
            minx,
            miny,
            maxx,
            maxy,
        }),
        _ => None,
    };
    Ok(IndexEntry {
        id,
        file_path,
        timestamp: from_sql_time("timestamp", timestamp)?,
        record_count: u64::try_from(record_count).map_err(|_| IndexError::Corrupt {
            column: "record_count",
            value: record_count.to_string(),
        })?,
        created_at: from_sql_time("created_at", created_at)?,
        bbox,
    })
}

impl IndexStore for SqliteIndex {
    fn insert(&self, entry: NewIndexEntry) -> Result<IndexEntry, IndexError> {
        let created_at = Utc::now();
        let bbox = entry.bbox;
        self.with_conn(|conn| {
            let result = conn.execute(
                "INSERT INTO geoparquet_files (
                    file_path, timestamp, record_count, created_at,
                    bbox_minx, bbox_miny, bbox_maxx, bbox_maxy
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    entry.file_path,
                    to_sql_time(entry.timestamp),
                    entry.record_count as i64,
                    to_sql_time(created_at),
                    bbox.map(|b| b.minx),
                    bbox.map(|b| b.miny),
                    bbox.map(|b| b.maxx),
                    bbox.map(|b| b.maxy),
                ],
            );
            match result {
                Ok(_) => {}
                Err(rusqlite::Error::SqliteFailure(err, _))
                    if err.code == ErrorCode::ConstraintViolation =>
                {
                    return Err(IndexError::DuplicatePath(entry.file_path.clone()));
                }
                Err(e) => return Err(e.into()),
            }
            Ok(IndexEntry {
                id: conn.last_insert_rowid(),
                file_path: entry.file_path.clone(),
                timestamp: entry.timestamp,
                record_count: entry.record_count,
                created_at,
                bbox,
            })
        })
    }

    fn total_records(&self) -> Result<u64, IndexError> {
        self.with_conn(|conn| {
            let total: Option<i64> = conn.query_row(
                "SELECT SUM(record_count) FROM geoparquet_files",
                [],
                |row| row.get(0),
            )?;
            Ok(total.unwrap_or(0).max(0) as u64)
        })
    }

    fn records_since(&self, since: DateTime<Utc>) -> Result<u64, IndexError> {
        self.with_conn(|conn| {
            let total: Option<i64> = conn.query_row(
                "SELECT SUM(record_count) FROM geoparquet_files WHERE timestamp >= ?1",
                params![to_sql_time(since)],
                |row| row.get(0),
            )?;
            Ok(total.unwrap_or(0).max(0) as u64)
        })
    }

    fn latest(&self) -> Result<Option<IndexEntry>, IndexError> {
        self.with_conn(|conn| {
            let row: Option<RawRow> = conn
                .query_row(
                    "SELECT id, file_path, timestamp, record_count, created_at,
                            bbox_minx, bbox_miny, bbox_maxx, bbox_maxy
                     FROM geoparquet_files
                     ORDER BY timestamp DESC, id DESC
                     LIMIT 1",
                    [],
                    |row| {
                        Ok((
                            row.get(0)?,
                            row.get(1)?,
                            row.get(2)?,
                            row.get(3)?,
                            row.get(4)?,
                            row.get(5)?,
                            row.get(6)?,
                            row.get(7)?,
                            row.get(8)?,
                        ))
                    },
                )
                .optional()?;
            row.map(entry_from_row).transpose()
        })
    }
}

/// In-process index, for tests and dry runs.
#[derive(Default)]
pub struct MemoryIndex {
    rows: Mutex<Vec<IndexEntry>>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rows.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl IndexStore for MemoryIndex {
    fn insert(&self, entry: NewIndexEntry) -> Result<IndexEntry, IndexError> {
        let mut rows = self.rows.lock().unwrap_or_else(|e| e.into_inner());
        if rows.iter().any(|r| r.file_path == entry.file_path) {
            return Err(IndexError::DuplicatePath(entry.file_path));
        }
        let stored = IndexEntry {
            id: rows.len() as i64 + 1,
            file_path: entry.file_path,
            timestamp: entry.timestamp,
            record_count: entry.record_count,
            created_at: Utc::now(),
            bbox: entry.bbox,
        };
        rows.push(stored.clone());
        Ok(stored)
    }

    fn total_records(&self) -> Result<u64, IndexError> {
        let rows = self.rows.lock().unwrap_or_else(|e| e.into_inner());
        Ok(rows.iter().map(|r| r.record_count).sum())
    }

    fn records_since(&self, since: DateTime<Utc>) -> Result<u64, IndexError> {
        let rows = self.rows.lock().unwrap_or_else(|e| e.into_inner());
        Ok(rows
            .iter()
            .filter(|r| r.timestamp >= since)
            .map(|r| r.record_count)
            .sum())
    }

    fn latest(&self) -> Result<Option<IndexEntry>, IndexError> {
        let rows = self.rows.lock().unwrap_or_else(|e| e.into_inner());
        Ok(rows
            .iter()
            .max_by_key(|r| (r.timestamp, r.id))
            .cloned())
    }
}
