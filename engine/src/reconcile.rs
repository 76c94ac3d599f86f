//! Reconciliation of remote changes into the local view.
//!
//! Location samples are keyed per device and sequence, so samples from
//! different devices never conflict. Transition events compete for a slot
//! `(geofence_id, kind)`: the shared "latest transition" for that geofence.
//!
//! # Algorithm
//!
//! 1. Order remote changes by version
//! 2. Merge every remote and local-pending transition into its slot, keeping
//!    the maximum by (triggered_at, device_id, confidence, source seq)
//! 3. Merge remote samples into the per-device latest location
//! 4. A local pending transition whose slot is now held by a different
//!    device's event is reported as a conflict
//!
//! Taking a maximum is commutative and idempotent, so applying the same
//! changes in any order, or twice, yields the same view.

use crate::{
    DeviceId, GeofenceId, LocalId, LocationSample, RecordBody, RemoteId, RemoteVersion,
    SyncRecord, TransitionEvent, TriggerKind,
};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// A record learned from the remote store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteChange {
    pub version: RemoteVersion,
    pub remote_id: RemoteId,
    pub body: RecordBody,
}

/// Outcome of merging a single transition into the view.
#[derive(Debug, Clone, PartialEq)]
pub enum MergeOutcome {
    /// Slot was empty
    Inserted,
    /// Incoming event replaced the previous winner
    Replaced(TransitionEvent),
    /// Existing winner kept
    Kept,
    /// Identical to the current winner
    Duplicate,
}

/// Total order used for last-writer-wins.
fn compare(a: &TransitionEvent, b: &TransitionEvent) -> Ordering {
    a.stamp()
        .cmp(&b.stamp())
        .then_with(|| a.confidence.cmp(&b.confidence))
        .then_with(|| a.source_sample_seq.cmp(&b.source_sample_seq))
}

/// The reconciled picture of shared state: last writer per transition slot
/// and the latest known location of every device.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransitionView {
    /// Using BTreeMap for deterministic ordering
    #[serde(default)]
    slots: BTreeMap<GeofenceId, BTreeMap<TriggerKind, TransitionEvent>>,
    #[serde(default)]
    last_locations: BTreeMap<DeviceId, LocationSample>,
}

impl TransitionView {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current winner for a slot.
    pub fn winner(&self, geofence_id: &str, kind: TriggerKind) -> Option<&TransitionEvent> {
        self.slots.get(geofence_id)?.get(&kind)
    }

    /// Latest known sample for a device.
    pub fn latest_location(&self, device_id: &str) -> Option<&LocationSample> {
        self.last_locations.get(device_id)
    }

    /// All slot winners, in (geofence, kind) order.
    pub fn winners(&self) -> impl Iterator<Item = &TransitionEvent> {
        self.slots.values().flat_map(|kinds| kinds.values())
    }

    pub fn slot_count(&self) -> usize {
        self.slots.values().map(|kinds| kinds.len()).sum()
    }

    /// Merge a transition into its slot.
    pub fn merge_transition(&mut self, event: TransitionEvent) -> MergeOutcome {
        let kinds = self.slots.entry(event.geofence_id.clone()).or_default();
        match kinds.get(&event.kind) {
            None => {
                kinds.insert(event.kind, event);
                MergeOutcome::Inserted
            }
            Some(current) => match compare(&event, current) {
                Ordering::Greater => {
                    let previous = kinds.insert(event.kind, event);
                    match previous {
                        Some(previous) => MergeOutcome::Replaced(previous),
                        None => MergeOutcome::Inserted,
                    }
                }
                Ordering::Equal => MergeOutcome::Duplicate,
                Ordering::Less => MergeOutcome::Kept,
            },
        }
    }

    /// Merge a sample; the highest sequence per device wins.
    pub fn merge_sample(&mut self, sample: LocationSample) -> bool {
        match self.last_locations.get(&sample.device_id) {
            Some(current) if current.sequence_number >= sample.sequence_number => false,
            _ => {
                self.last_locations.insert(sample.device_id.clone(), sample);
                true
            }
        }
    }

    /// Whether `event` lost its slot to another device's event.
    pub fn superseded_by_other_device(&self, event: &TransitionEvent) -> Option<&TransitionEvent> {
        let winner = self.winner(&event.geofence_id, event.kind)?;
        if winner.device_id != event.device_id && compare(winner, event) == Ordering::Greater {
            Some(winner)
        } else {
            None
        }
    }
}

/// A local pending transition that lost last-writer-wins.
#[derive(Debug, Clone, PartialEq)]
pub struct Conflict {
    pub local_id: LocalId,
    pub local: TransitionEvent,
    pub winner: TransitionEvent,
}

impl Conflict {
    pub fn reason(&self) -> String {
        format!(
            "superseded by {} at {} from device '{}'",
            self.winner.kind, self.winner.triggered_at, self.winner.device_id
        )
    }
}

/// Result of reconciliation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcileResult {
    /// Remote changes that altered the view
    pub applied_remote: Vec<RemoteId>,
    /// Remote changes that lost or were already known
    pub ignored_remote: Vec<RemoteId>,
    /// Every remote transition, in version order, for alert dispatch
    pub remote_transitions: Vec<TransitionEvent>,
    /// Local pending transitions that lost their slot
    pub conflicts: Vec<Conflict>,
    /// Highest remote version seen
    pub max_version: Option<RemoteVersion>,
}

/// Merges remote changes and local pending records into a view.
pub struct Reconciler {
    local_device_id: DeviceId,
    view: TransitionView,
}

impl Reconciler {
    pub fn new(local_device_id: impl Into<DeviceId>, view: TransitionView) -> Self {
        Self {
            local_device_id: local_device_id.into(),
            view,
        }
    }

    /// Reconcile local pending records with remote changes.
    ///
    /// Returns the reconciliation result and the final view.
    pub fn reconcile(
        mut self,
        local_pending: &[SyncRecord],
        mut remote: Vec<RemoteChange>,
    ) -> (ReconcileResult, TransitionView) {
        let mut result = ReconcileResult::default();

        remote.sort_by(|a, b| {
            a.version
                .cmp(&b.version)
                .then_with(|| a.remote_id.cmp(&b.remote_id))
        });

        for change in remote {
            result.max_version = Some(
                result
                    .max_version
                    .map_or(change.version, |v| v.max(change.version)),
            );

            let changed = match change.body {
                RecordBody::Sample(sample) => self.view.merge_sample(sample),
                RecordBody::Transition(event) => {
                    result.remote_transitions.push(event.clone());
                    matches!(
                        self.view.merge_transition(event),
                        MergeOutcome::Inserted | MergeOutcome::Replaced(_)
                    )
                }
            };

            if changed {
                result.applied_remote.push(change.remote_id);
            } else {
                result.ignored_remote.push(change.remote_id);
            }
        }

        let local_transitions: Vec<_> = local_pending
            .iter()
            .filter(|r| r.is_pending() && r.device_id == self.local_device_id)
            .filter_map(|r| r.body.as_transition().map(|t| (r.local_id, t)))
            .collect();

        for (_, event) in &local_transitions {
            self.view.merge_transition((*event).clone());
        }

        for (local_id, event) in local_transitions {
            if let Some(winner) = self.view.superseded_by_other_device(event) {
                result.conflicts.push(Conflict {
                    local_id,
                    local: event.clone(),
                    winner: winner.clone(),
                });
            }
        }

        (result, self.view)
    }
}
