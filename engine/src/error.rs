//! Error types for the Sentinel engine.

use crate::{DeviceId, GeofenceId, LocalId, SequenceNumber};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How an error should be handled by the surrounding system.
///
/// Component-local classes (`DataIntegrity`, `OutOfOrder`) are logged and the
/// pipeline continues. Cross-boundary classes (`Unauthenticated`,
/// `ResourceExhausted`) are surfaced to the host application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorClass {
    /// Network or timeout failure; retried with backoff.
    Transient,
    /// Corrupt or poisoned record; isolated and skipped.
    DataIntegrity,
    /// Sequencing violation; rejected at the call site.
    OutOfOrder,
    /// Credentials missing or expired; terminal until refreshed.
    Unauthenticated,
    /// Local storage full; ingestion paused until resolved.
    ResourceExhausted,
}

impl ErrorClass {
    /// Whether the error must propagate to the host application.
    pub fn is_cross_boundary(&self) -> bool {
        matches!(self, Self::Unauthenticated | Self::ResourceExhausted)
    }

    /// Whether retrying the same call later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::DataIntegrity => "data_integrity",
            Self::OutOfOrder => "out_of_order",
            Self::Unauthenticated => "unauthenticated",
            Self::ResourceExhausted => "resource_exhausted",
        }
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// All possible errors from the Sentinel engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Validation errors
    #[error("invalid sample: {0}")]
    InvalidSample(String),

    #[error("invalid geofence '{id}': {reason}")]
    InvalidGeofence { id: GeofenceId, reason: String },

    #[error("duplicate geofence: {0}")]
    DuplicateGeofence(GeofenceId),

    // Ordering errors
    #[error("out of order sample for device '{device_id}': last evaluated {last}, got {got}")]
    OutOfOrderSample {
        device_id: DeviceId,
        last: SequenceNumber,
        got: SequenceNumber,
    },

    #[error("sample for device '{got}' evaluated against state of device '{expected}'")]
    DeviceMismatch { expected: DeviceId, got: DeviceId },

    // Record lifecycle errors
    #[error("record {0} is already synced")]
    AlreadySynced(LocalId),

    #[error("record {local_id} cannot move from {from} to {to}")]
    InvalidStateTransition {
        local_id: LocalId,
        from: String,
        to: String,
    },

    // State machine errors
    #[error("illegal sync transition from {from} on {event}")]
    IllegalSyncTransition { from: String, event: String },

    // Snapshot errors
    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),

    #[error("snapshot format mismatch: expected {expected}, got {actual}")]
    SnapshotVersionMismatch { expected: u32, actual: u32 },
}

impl Error {
    /// Classify this error for propagation decisions.
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::OutOfOrderSample { .. } => ErrorClass::OutOfOrder,
            Error::InvalidSample(_)
            | Error::InvalidGeofence { .. }
            | Error::DuplicateGeofence(_)
            | Error::DeviceMismatch { .. }
            | Error::AlreadySynced(_)
            | Error::InvalidStateTransition { .. }
            | Error::IllegalSyncTransition { .. }
            | Error::InvalidSnapshot(_)
            | Error::SnapshotVersionMismatch { .. } => ErrorClass::DataIntegrity,
        }
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = Error::OutOfOrderSample {
            device_id: "phone".into(),
            last: 7,
            got: 5,
        };
        assert_eq!(
            err.to_string(),
            "out of order sample for device 'phone': last evaluated 7, got 5"
        );

        let err = Error::InvalidGeofence {
            id: "home".into(),
            reason: "radius must be positive".into(),
        };
        assert_eq!(
            err.to_string(),
            "invalid geofence 'home': radius must be positive"
        );
    }

    #[test]
    fn classification() {
        let err = Error::OutOfOrderSample {
            device_id: "phone".into(),
            last: 2,
            got: 1,
        };
        assert_eq!(err.class(), ErrorClass::OutOfOrder);
        assert_eq!(
            Error::InvalidSnapshot("bad".into()).class(),
            ErrorClass::DataIntegrity
        );
    }

    #[test]
    fn cross_boundary_classes() {
        assert!(ErrorClass::Unauthenticated.is_cross_boundary());
        assert!(ErrorClass::ResourceExhausted.is_cross_boundary());
        assert!(!ErrorClass::DataIntegrity.is_cross_boundary());
        assert!(ErrorClass::Transient.is_retryable());
        assert!(!ErrorClass::OutOfOrder.is_retryable());
    }
}
