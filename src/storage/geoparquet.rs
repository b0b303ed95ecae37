//! GeoParquet encoding of vehicle position records.
//!
//! One row per record; `geometry` is a WKB point built from
//! `(longitude, latitude)` or null when the record has no fix. File-level
//! `geo` metadata follows GeoParquet 1.0 with the default OGC:CRS84 CRS.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow_array::{
    ArrayRef, BinaryArray, Float32Array, Float64Array, RecordBatch, StringArray,
    TimestampMillisecondArray, UInt32Array,
};
use arrow_schema::{DataType, Field, Schema, SchemaRef, TimeUnit};
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::metadata::KeyValue;
use parquet::file::properties::WriterProperties;
use serde_json::json;

use crate::error::PersistError;
use crate::record::{BoundingBox, VehiclePositionRecord};

pub const GEOMETRY_COLUMN: &str = "geometry";

/// Arrow schema shared by every partition file.
pub fn schema() -> SchemaRef {
    let utc_millis = DataType::Timestamp(TimeUnit::Millisecond, Some("UTC".into()));
    Arc::new(Schema::new(vec![
        Field::new("feed_id", DataType::Utf8, false),
        Field::new("timestamp", utc_millis.clone(), false),
        Field::new("vehicle_id", DataType::Utf8, true),
        Field::new("latitude", DataType::Float64, true),
        Field::new("longitude", DataType::Float64, true),
        Field::new("speed", DataType::Float32, true),
        Field::new("bearing", DataType::Float32, true),
        Field::new("trip_id", DataType::Utf8, true),
        Field::new("route_id", DataType::Utf8, true),
        Field::new("current_stop_sequence", DataType::UInt32, true),
        Field::new("current_status", DataType::Utf8, true),
        Field::new("vehicle_timestamp", utc_millis, true),
        Field::new(GEOMETRY_COLUMN, DataType::Binary, true),
    ]))
}

/// Little-endian WKB encoding of a 2D point.
pub fn wkb_point(x: f64, y: f64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(21);
    buf.push(1u8);
    buf.extend_from_slice(&1u32.to_le_bytes());
    buf.extend_from_slice(&x.to_le_bytes());
    buf.extend_from_slice(&y.to_le_bytes());
    buf
}

/// The `geo` file metadata value.
pub fn geo_metadata(bbox: Option<BoundingBox>) -> Result<String, serde_json::Error> {
    let mut column = json!({
        "encoding": "WKB",
        "geometry_types": ["Point"],
    });
    if let Some(b) = bbox {
        column["bbox"] = json!(b.as_array());
    }
    serde_json::to_string(&json!({
        "version": "1.0.0",
        "primary_column": GEOMETRY_COLUMN,
        "columns": { "geometry": column },
    }))
}

/// Builds the single record batch for a run.
pub fn to_record_batch(records: &[VehiclePositionRecord]) -> Result<RecordBatch, PersistError> {
    let strings = |f: fn(&VehiclePositionRecord) -> Option<&str>| -> ArrayRef {
        Arc::new(StringArray::from(records.iter().map(f).collect::<Vec<_>>()))
    };

    let geometries: Vec<Option<Vec<u8>>> = records
        .iter()
        .map(|r| r.point().map(|(x, y)| wkb_point(x, y)))
        .collect();

    let columns: Vec<ArrayRef> = vec![
        strings(|r| Some(r.feed_id.as_str())),
        Arc::new(
            TimestampMillisecondArray::from(
                records
                    .iter()
                    .map(|r| r.run_timestamp.timestamp_millis())
                    .collect::<Vec<_>>(),
            )
            .with_timezone("UTC"),
        ),
        strings(|r| r.vehicle_id.as_deref()),
        Arc::new(Float64Array::from(
            records.iter().map(|r| r.latitude).collect::<Vec<_>>(),
        )),
        Arc::new(Float64Array::from(
            records.iter().map(|r| r.longitude).collect::<Vec<_>>(),
        )),
        Arc::new(Float32Array::from(
            records.iter().map(|r| r.speed).collect::<Vec<_>>(),
        )),
        Arc::new(Float32Array::from(
            records.iter().map(|r| r.bearing).collect::<Vec<_>>(),
        )),
        strings(|r| r.trip_id.as_deref()),
        strings(|r| r.route_id.as_deref()),
        Arc::new(UInt32Array::from(
            records
                .iter()
                .map(|r| r.current_stop_sequence)
                .collect::<Vec<_>>(),
        )),
        strings(|r| r.current_status.map(|s| s.as_str_name())),
        Arc::new(
            TimestampMillisecondArray::from(
                records
                    .iter()
                    .map(|r| r.vehicle_timestamp.map(|t| t.timestamp_millis()))
                    .collect::<Vec<_>>(),
            )
            .with_timezone("UTC"),
        ),
        Arc::new(BinaryArray::from_opt_vec(
            geometries.iter().map(|g| g.as_deref()).collect(),
        )),
    ];

    Ok(RecordBatch::try_new(schema(), columns)?)
}

/// Encodes `records` as a complete GeoParquet file in memory.
pub fn encode(
    records: &[VehiclePositionRecord],
    bbox: Option<BoundingBox>,
) -> Result<Vec<u8>, PersistError> {
    let batch = to_record_batch(records)?;
    let props = WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .set_key_value_metadata(Some(vec![KeyValue::new(
            "geo".to_string(),
            geo_metadata(bbox)?,
        )]))
        .build();

    let mut buf = Vec::new();
    let mut writer = ArrowWriter::try_new(&mut buf, batch.schema(), Some(props))?;
    writer.write(&batch)?;
    writer.close()?;
    Ok(buf)
}

/// Writes a partition file so that it only ever appears at `path` complete.
///
/// The bytes go to a hidden sibling first, are synced, and are then
/// hard-linked into place. Linking fails if `path` already exists, so an
/// existing partition is never overwritten.
pub fn write_partition(
    path: &Path,
    records: &[VehiclePositionRecord],
    bbox: Option<BoundingBox>,
) -> Result<(), PersistError> {
    if path.exists() {
        return Err(PersistError::PathCollision(path.to_path_buf()));
    }

    let bytes = encode(records, bbox)?;

    let dir = path.parent().unwrap_or(Path::new("."));
    fs::create_dir_all(dir)?;

    let tmp = temp_path(path);
    let result = write_synced(&tmp, &bytes).and_then(|()| {
        fs::hard_link(&tmp, path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::AlreadyExists {
                PersistError::PathCollision(path.to_path_buf())
            } else {
                PersistError::Io(e)
            }
        })
    });
    let _ = fs::remove_file(&tmp);
    result?;

    // Persist the new directory entry.
    if let Ok(d) = File::open(dir) {
        let _ = d.sync_all();
    }
    Ok(())
}

fn temp_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{name}.{}.tmp", std::process::id()))
}

fn write_synced(path: &Path, bytes: &[u8]) -> Result<(), PersistError> {
    let mut file = File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    Ok(())
}
