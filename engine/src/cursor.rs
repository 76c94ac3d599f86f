//! Per-device sync cursor.

use crate::{DeviceId, RemoteVersion, SequenceNumber};
use serde::{Deserialize, Serialize};

/// Resume position for one device. Mutated only by the sync engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSyncCursor {
    pub device_id: DeviceId,
    /// Highest sequence acknowledged by the remote store (0 = none)
    pub last_acked_sequence: SequenceNumber,
    /// Highest remote version pulled and reconciled (0 = none)
    pub last_pulled_version: RemoteVersion,
}

impl DeviceSyncCursor {
    pub fn new(device_id: impl Into<DeviceId>) -> Self {
        Self {
            device_id: device_id.into(),
            last_acked_sequence: 0,
            last_pulled_version: 0,
        }
    }

    /// Record an acknowledgement. Never moves backwards.
    pub fn advance_ack(&mut self, sequence: SequenceNumber) -> bool {
        if sequence > self.last_acked_sequence {
            self.last_acked_sequence = sequence;
            true
        } else {
            false
        }
    }

    /// Record a reconciled pull. Never moves backwards.
    pub fn advance_pull(&mut self, version: RemoteVersion) -> bool {
        if version > self.last_pulled_version {
            self.last_pulled_version = version;
            true
        } else {
            false
        }
    }
}
