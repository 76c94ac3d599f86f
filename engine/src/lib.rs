//! # Sentinel Engine
//!
//! The deterministic core of an offline-first location sharing and
//! geofence alerting system.
//!
//! This crate holds everything about Sentinel that can be expressed as pure
//! logic: the data model, geofence evaluation, last-writer-wins
//! reconciliation, the per-device sync state machine, retry backoff, alert
//! deduplication and SOS gesture detection. The same inputs always produce
//! the same outputs, which is what makes re-evaluation after a crash safe.
//!
//! ## Design Principles
//!
//! - **No IO**: persistence, network and timers live in `sentinel-agent`
//! - **Deterministic**: randomness (jitter) and time are always inputs
//! - **Testable**: every state transition is an input/output pair
//!
//! ## Core Concepts
//!
//! ### Samples and geofences
//!
//! A [`LocationSample`] is an immutable, sequence-numbered position report.
//! A [`Geofence`] is a circular region that fires one [`TriggerKind`]:
//! enter, exit or dwell.
//!
//! ### Evaluation
//!
//! [`evaluate`] maps `(sample, prior state, geofence set)` to zero or more
//! [`TransitionEvent`]s and a new [`EvaluatorState`].
//!
//! ### Sync records
//!
//! Samples and transitions are wrapped in [`SyncRecord`]s that move from
//! `Pending` to `Synced`, `Conflicted` or `Failed` exactly once. The
//! [`SyncMachine`] tracks the `Idle → Pulling → Reconciling → Pushing` cycle.
//!
//! ### Reconciliation
//!
//! The [`Reconciler`] merges remote changes into a [`TransitionView`] using
//! last-writer-wins by `triggered_at`, ties broken by device id. The merge is
//! commutative, so the order changes arrive in never matters.
//!
//! ### Alerts
//!
//! The [`AlertLedger`] admits each dedup key at most once per suppression
//! window.
//!
//! ## Quick Start
//!
//! ```rust
//! use sentinel_engine::{
//!     evaluate, Coordinate, EvaluatorConfig, EvaluatorState, Geofence, GeofenceSet,
//!     LocationReading, SampleTime, TriggerKind,
//! };
//!
//! // 1. Configure geofences
//! let home = Coordinate::new(52.5200, 13.4050);
//! let mut fences = GeofenceSet::new();
//! fences
//!     .insert(Geofence::new("home", home, 100.0, TriggerKind::Enter).with_label("Home"))
//!     .unwrap();
//!
//! // 2. Evaluate samples in sequence order
//! let config = EvaluatorConfig::default();
//! let state = EvaluatorState::new();
//!
//! let away = LocationReading::new("phone", SampleTime::new(0, 1_706_745_600_000), 52.53, 13.42, 5.0)
//!     .into_sample(1);
//! let eval = evaluate(&away, &state, &fences, &config).unwrap();
//! assert!(eval.transitions.is_empty()); // first sample is the baseline
//!
//! let back = LocationReading::new("phone", SampleTime::new(60_000, 1_706_745_660_000), 52.5201, 13.4051, 5.0)
//!     .into_sample(2);
//! let eval = evaluate(&back, &eval.new_state, &fences, &config).unwrap();
//! assert_eq!(eval.transitions.len(), 1);
//! assert_eq!(eval.transitions[0].kind, TriggerKind::Enter);
//! ```
//!
//! ## Persistence
//!
//! Evaluator state and the reconciled view are persisted by the agent as
//! [`Snapshot`]s, serialized to JSON with deterministic ordering.

pub mod alert;
pub mod backoff;
pub mod cursor;
pub mod error;
pub mod evaluate;
pub mod geofence;
pub mod reconcile;
pub mod record;
pub mod safety;
pub mod sample;
pub mod snapshot;
pub mod stamp;
pub mod sync;
pub mod transition;

// Re-export main types at crate root
pub use alert::{Admission, AlertLedger, EmergencyContact, Notification, Severity};
pub use backoff::BackoffPolicy;
pub use cursor::DeviceSyncCursor;
pub use error::{Error, ErrorClass, Result};
pub use evaluate::{evaluate, Evaluation, EvaluatorConfig, EvaluatorState, FenceState};
pub use geofence::{Geofence, GeofenceSet, TriggerKind};
pub use reconcile::{
    Conflict, MergeOutcome, ReconcileResult, Reconciler, RemoteChange, TransitionView,
};
pub use record::{RecordBody, SyncRecord, SyncState};
pub use safety::{
    SafetyTrigger, ShakeConfig, ShakeDetector, VolumeButton, VolumeGestureConfig,
    VolumeGestureDetector,
};
pub use sample::{Coordinate, LocationReading, LocationSample, SampleTime};
pub use snapshot::{Snapshot, SNAPSHOT_FORMAT_VERSION};
pub use stamp::WriteStamp;
pub use sync::{
    commit_batch, Acknowledgement, BatchCommit, PushAck, Rejection, StageFailure, SyncMachine,
    SyncPhase, SyncTrigger,
};
pub use transition::{Confidence, DedupKey, TransitionEvent};

/// Type aliases for clarity
pub type DeviceId = String;
pub type GeofenceId = String;
pub type RemoteId = String;
pub type LocalId = u64;
pub type SequenceNumber = u64;
pub type RemoteVersion = u64;
/// Milliseconds since the Unix epoch.
pub type Timestamp = u64;
