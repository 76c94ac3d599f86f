//! Versioned envelopes for persisted engine state.
//!
//! The agent persists evaluator state and the reconciled transition view as
//! JSON snapshots so that a restart resumes exactly where the device left
//! off. All engine state uses `BTreeMap`, so serialization is deterministic.

use crate::{error::Result, DeviceId, Error, Timestamp};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// Version of the snapshot format for future compatibility.
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// A device's state at a point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot<T> {
    pub format_version: u32,
    pub device_id: DeviceId,
    /// Wall-clock time the snapshot was taken
    pub taken_at: Timestamp,
    pub state: T,
}

impl<T> Snapshot<T> {
    pub fn new(device_id: impl Into<DeviceId>, taken_at: Timestamp, state: T) -> Self {
        Self {
            format_version: SNAPSHOT_FORMAT_VERSION,
            device_id: device_id.into(),
            taken_at,
            state,
        }
    }

    pub fn into_state(self) -> T {
        self.state
    }
}

impl<T: Serialize> Snapshot<T> {
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::InvalidSnapshot(e.to_string()))
    }
}

impl<T: DeserializeOwned> Snapshot<T> {
    /// Parse and check that the snapshot belongs to `device_id`.
    pub fn from_json(json: &str, device_id: &str) -> Result<Self> {
        let snapshot: Self =
            serde_json::from_str(json).map_err(|e| Error::InvalidSnapshot(e.to_string()))?;

        if snapshot.format_version != SNAPSHOT_FORMAT_VERSION {
            return Err(Error::SnapshotVersionMismatch {
                expected: SNAPSHOT_FORMAT_VERSION,
                actual: snapshot.format_version,
            });
        }
        if snapshot.device_id != device_id {
            return Err(Error::DeviceMismatch {
                expected: device_id.to_string(),
                got: snapshot.device_id,
            });
        }

        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        evaluate, EvaluatorConfig, EvaluatorState, Geofence, GeofenceSet, LocationReading,
        SampleTime, TriggerKind, Coordinate,
    };

    fn state_after_one_sample() -> EvaluatorState {
        let fences = GeofenceSet::new()
            .with_fence(Geofence::new("home", Coordinate::new(0.0, 0.0), 100.0, TriggerKind::Enter))
            .unwrap();
        let sample = LocationReading::new("phone", SampleTime::new(0, 1_000), 0.0, 0.0, 5.0)
            .into_sample(1);
        evaluate(&sample, &EvaluatorState::new(), &fences, &EvaluatorConfig::default())
            .unwrap()
            .new_state
    }

    #[test]
    fn evaluator_state_survives_restart() {
        let state = state_after_one_sample();
        let json = Snapshot::new("phone", 2_000, state.clone()).to_json().unwrap();

        let restored: Snapshot<EvaluatorState> = Snapshot::from_json(&json, "phone").unwrap();
        assert_eq!(restored.taken_at, 2_000);
        assert_eq!(restored.into_state(), state);
    }

    #[test]
    fn serialization_is_deterministic() {
        let a = Snapshot::new("phone", 1, state_after_one_sample()).to_json().unwrap();
        let b = Snapshot::new("phone", 1, state_after_one_sample()).to_json().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn rejects_other_device() {
        let json = Snapshot::new("tablet", 1, EvaluatorState::new()).to_json().unwrap();
        let err = Snapshot::<EvaluatorState>::from_json(&json, "phone").unwrap_err();
        assert!(matches!(err, Error::DeviceMismatch { .. }));
    }

    #[test]
    fn rejects_future_format() {
        let json = r#"{"formatVersion":99,"deviceId":"phone","takenAt":0,"state":{}}"#;
        let err = Snapshot::<serde_json::Value>::from_json(json, "phone").unwrap_err();
        assert_eq!(
            err,
            Error::SnapshotVersionMismatch {
                expected: 1,
                actual: 99
            }
        );
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!(
            Snapshot::<EvaluatorState>::from_json("not json", "phone"),
            Err(Error::InvalidSnapshot(_))
        ));
    }
}
