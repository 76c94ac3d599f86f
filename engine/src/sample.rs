//! Location samples and coordinates.

use crate::{error::Result, DeviceId, Error, SequenceNumber, Timestamp};
use serde::{Deserialize, Serialize};

/// Mean Earth radius used for great-circle distances.
pub const EARTH_RADIUS_METERS: f64 = 6_371_008.8;

/// A WGS84 position in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Coordinate {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinate {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Check that both components are finite and within range.
    pub fn validate(&self) -> Result<()> {
        if !self.latitude.is_finite() || !(-90.0..=90.0).contains(&self.latitude) {
            return Err(Error::InvalidSample(format!(
                "latitude out of range: {}",
                self.latitude
            )));
        }
        if !self.longitude.is_finite() || !(-180.0..=180.0).contains(&self.longitude) {
            return Err(Error::InvalidSample(format!(
                "longitude out of range: {}",
                self.longitude
            )));
        }
        Ok(())
    }

    /// Great-circle distance in meters (haversine).
    pub fn distance_to(&self, other: &Coordinate) -> f64 {
        let lat1 = self.latitude.to_radians();
        let lat2 = other.latitude.to_radians();
        let d_lat = (other.latitude - self.latitude).to_radians();
        let d_lon = (other.longitude - self.longitude).to_radians();

        let a = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lon / 2.0).sin().powi(2);
        let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
        EARTH_RADIUS_METERS * c
    }

    /// A maps link for this position, for alert bodies.
    pub fn maps_url(&self) -> String {
        format!(
            "https://maps.google.com/?q={:.6},{:.6}",
            self.latitude, self.longitude
        )
    }
}

impl std::fmt::Display for Coordinate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.6}, {:.6}", self.latitude, self.longitude)
    }
}

/// Capture time of a sample.
///
/// `monotonic_ms` comes from the device's monotonic clock and only orders
/// samples within one boot. `wall_ms` is comparable across devices and is
/// what transitions are stamped with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SampleTime {
    pub monotonic_ms: u64,
    pub wall_ms: Timestamp,
}

impl SampleTime {
    pub fn new(monotonic_ms: u64, wall_ms: Timestamp) -> Self {
        Self {
            monotonic_ms,
            wall_ms,
        }
    }
}

/// A position report as delivered by the location provider, before the
/// local store assigns it a sequence number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationReading {
    pub device_id: DeviceId,
    pub timestamp: SampleTime,
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy_meters: f64,
}

impl LocationReading {
    pub fn new(
        device_id: impl Into<DeviceId>,
        timestamp: SampleTime,
        latitude: f64,
        longitude: f64,
        accuracy_meters: f64,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            timestamp,
            latitude,
            longitude,
            accuracy_meters,
        }
    }

    /// Validate position and accuracy.
    pub fn validate(&self) -> Result<()> {
        if self.device_id.is_empty() {
            return Err(Error::InvalidSample("empty device id".into()));
        }
        Coordinate::new(self.latitude, self.longitude).validate()?;
        if !self.accuracy_meters.is_finite() || self.accuracy_meters < 0.0 {
            return Err(Error::InvalidSample(format!(
                "accuracy must be a non-negative number of meters, got {}",
                self.accuracy_meters
            )));
        }
        Ok(())
    }

    /// Attach the locally assigned sequence number.
    pub fn into_sample(self, sequence_number: SequenceNumber) -> LocationSample {
        LocationSample {
            device_id: self.device_id,
            timestamp: self.timestamp,
            latitude: self.latitude,
            longitude: self.longitude,
            accuracy_meters: self.accuracy_meters,
            sequence_number,
        }
    }
}

/// An immutable, sequence-numbered location sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationSample {
    pub device_id: DeviceId,
    pub timestamp: SampleTime,
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy_meters: f64,
    /// Strictly increasing per device; the sync cursor.
    pub sequence_number: SequenceNumber,
}

impl LocationSample {
    pub fn coordinate(&self) -> Coordinate {
        Coordinate::new(self.latitude, self.longitude)
    }

    pub fn wall_ms(&self) -> Timestamp {
        self.timestamp.wall_ms
    }
}
