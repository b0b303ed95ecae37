//! Protobuf decoding of GTFS Realtime feeds into vehicle position records.

use chrono::{DateTime, Utc};
use prost::Message;
use tracing::debug;

use crate::error::DecodeError;
use crate::gtfs_rt::vehicle_position::VehicleStopStatus;
use crate::gtfs_rt::{FeedMessage, VehiclePosition};
use crate::record::VehiclePositionRecord;

/// Decodes a protobuf-encoded GTFS-RT [`FeedMessage`] from raw bytes.
///
/// # Errors
///
/// Returns an error if the bytes are not valid protobuf for a `FeedMessage`.
pub fn parse_feed(bytes: &[u8]) -> Result<FeedMessage, prost::DecodeError> {
    FeedMessage::decode(bytes)
}

/// Decodes a feed payload into one record per entity carrying a vehicle
/// position. Entities without one are skipped silently.
///
/// # Errors
///
/// Returns [`DecodeError`] when `bytes` is not a `FeedMessage`; no partial
/// output is produced in that case.
pub fn decode_vehicle_positions(
    bytes: &[u8],
    feed_id: &str,
    run_timestamp: DateTime<Utc>,
) -> Result<Vec<VehiclePositionRecord>, DecodeError> {
    let feed = parse_feed(bytes).map_err(|cause| DecodeError {
        feed_id: feed_id.to_string(),
        cause,
    })?;

    let records: Vec<_> = feed
        .entity
        .iter()
        .filter_map(|e| e.vehicle.as_ref())
        .map(|v| to_record(v, feed_id, run_timestamp))
        .collect();

    debug!(
        feed_id,
        entity_count = feed.entity.len(),
        record_count = records.len(),
        "Feed decoded"
    );

    Ok(records)
}

fn to_record(
    v: &VehiclePosition,
    feed_id: &str,
    run_timestamp: DateTime<Utc>,
) -> VehiclePositionRecord {
    let mut record = VehiclePositionRecord::empty(feed_id, run_timestamp);

    record.vehicle_id = v.vehicle.as_ref().and_then(|d| d.id.clone());

    if let Some(pos) = &v.position {
        // Both coordinates are required on the wire; a non-finite one voids the fix.
        if pos.latitude.is_finite() && pos.longitude.is_finite() {
            record.latitude = Some(f64::from(pos.latitude));
            record.longitude = Some(f64::from(pos.longitude));
        }
        record.speed = pos.speed;
        record.bearing = pos.bearing;
    }

    if let Some(trip) = &v.trip {
        record.trip_id = trip.trip_id.clone();
        record.route_id = trip.route_id.clone();
    }

    record.current_stop_sequence = v.current_stop_sequence;
    record.current_status = v
        .current_status
        .and_then(|s| VehicleStopStatus::try_from(s).ok());
    record.vehicle_timestamp = v
        .timestamp
        .and_then(|t| i64::try_from(t).ok())
        .and_then(|t| DateTime::from_timestamp(t, 0));

    record
}
