//! Normalized vehicle observations and their spatial extent.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::gtfs_rt::vehicle_position::VehicleStopStatus;

/// One decoded vehicle observation.
///
/// Every optional field is `None` when the feed did not report it; a reported
/// zero stays `Some(0.0)`. `latitude` and `longitude` are either both present
/// or both absent.
#[derive(Debug, Clone, PartialEq)]
pub struct VehiclePositionRecord {
    pub feed_id: String,
    /// Logical timestamp of the ingestion run, shared by all its records.
    pub run_timestamp: DateTime<Utc>,
    pub vehicle_id: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub speed: Option<f32>,
    pub bearing: Option<f32>,
    pub trip_id: Option<String>,
    pub route_id: Option<String>,
    pub current_stop_sequence: Option<u32>,
    pub current_status: Option<VehicleStopStatus>,
    /// When the vehicle itself says the observation was taken.
    pub vehicle_timestamp: Option<DateTime<Utc>>,
}

impl VehiclePositionRecord {
    /// An observation with nothing but its provenance filled in.
    pub fn empty(feed_id: impl Into<String>, run_timestamp: DateTime<Utc>) -> Self {
        Self {
            feed_id: feed_id.into(),
            run_timestamp,
            vehicle_id: None,
            latitude: None,
            longitude: None,
            speed: None,
            bearing: None,
            trip_id: None,
            route_id: None,
            current_stop_sequence: None,
            current_status: None,
            vehicle_timestamp: None,
        }
    }

    /// `(longitude, latitude)` when the record has a fix.
    pub fn point(&self) -> Option<(f64, f64)> {
        match (self.longitude, self.latitude) {
            (Some(x), Some(y)) => Some((x, y)),
            _ => None,
        }
    }
}

/// Minimal rectangle enclosing every record with a fix, in lon/lat degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BoundingBox {
    pub minx: f64,
    pub miny: f64,
    pub maxx: f64,
    pub maxy: f64,
}

impl BoundingBox {
    /// Returns `None` when no record has both coordinates.
    pub fn from_records<'a, I>(records: I) -> Option<Self>
    where
        I: IntoIterator<Item = &'a VehiclePositionRecord>,
    {
        records
            .into_iter()
            .filter_map(VehiclePositionRecord::point)
            .fold(None, |bbox, (x, y)| {
                Some(match bbox {
                    None => BoundingBox {
                        minx: x,
                        miny: y,
                        maxx: x,
                        maxy: y,
                    },
                    Some(b) => BoundingBox {
                        minx: b.minx.min(x),
                        miny: b.miny.min(y),
                        maxx: b.maxx.max(x),
                        maxy: b.maxy.max(y),
                    },
                })
            })
    }

    pub fn as_array(&self) -> [f64; 4] {
        [self.minx, self.miny, self.maxx, self.maxy]
    }
}
