//! Transition events derived from geofence evaluation.

use crate::{Coordinate, DeviceId, GeofenceId, SequenceNumber, Timestamp, TriggerKind, WriteStamp};
use serde::{Deserialize, Serialize};

/// Whether a transition was derived from a sample of acceptable accuracy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    /// Derived from a low-accuracy sample; may be confirmed or retracted
    /// by a later high-accuracy sample inside the debounce window.
    Provisional,
    Confirmed,
}

/// A detected boundary crossing or dwell for a device relative to a geofence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransitionEvent {
    pub geofence_id: GeofenceId,
    pub device_id: DeviceId,
    pub kind: TriggerKind,
    /// Wall-clock time of the sample that caused the transition
    pub triggered_at: Timestamp,
    pub source_sample_seq: SequenceNumber,
    /// Position of the source sample
    pub location: Coordinate,
    pub confidence: Confidence,
}

impl TransitionEvent {
    /// Key used to suppress duplicate alerts for the same physical crossing.
    pub fn dedup_key(&self, bucket_ms: u64) -> DedupKey {
        DedupKey {
            geofence_id: self.geofence_id.clone(),
            device_id: self.device_id.clone(),
            kind: self.kind,
            bucket: self.triggered_at / bucket_ms.max(1),
        }
    }

    /// Last-writer-wins stamp.
    pub fn stamp(&self) -> WriteStamp {
        WriteStamp::new(self.triggered_at, self.device_id.clone())
    }

    pub fn is_provisional(&self) -> bool {
        self.confidence == Confidence::Provisional
    }
}

/// Deduplication key: (geofence, device, kind, triggered-at bucket).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DedupKey {
    pub geofence_id: GeofenceId,
    pub device_id: DeviceId,
    pub kind: TriggerKind,
    pub bucket: u64,
}

impl std::fmt::Display for DedupKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.geofence_id, self.device_id, self.kind, self.bucket
        )
    }
}
