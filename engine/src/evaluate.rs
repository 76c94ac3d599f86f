//! Geofence evaluation.
//!
//! [`evaluate`] is a pure function of `(sample, prior state, geofence set,
//! config)`. Re-running it after a crash over the same inputs yields the same
//! transitions and the same new state, which is what makes re-evaluation of
//! an unacknowledged sample window idempotent.
//!
//! # Algorithm
//!
//! For each geofence, in id order:
//!
//! 1. The first observation records a baseline membership and emits nothing
//! 2. A pending provisional change is confirmed or retracted by a
//!    high-confidence sample inside the debounce window, or stands once the
//!    window has passed
//! 3. A membership change emits `enter`/`exit` if the fence fires on it
//! 4. A dwell fence fires once `dwell_seconds` after entry, and not again
//!    until an exit

use crate::{
    error::Result, Confidence, Coordinate, DeviceId, Error, Geofence, GeofenceId, GeofenceSet,
    LocationSample, SequenceNumber, Timestamp, TransitionEvent, TriggerKind,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Tunables for evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluatorConfig {
    /// Samples with an accuracy radius worse than this are low confidence
    pub accuracy_threshold_m: f64,
    /// How long a provisional change waits for a high-confidence sample
    pub debounce_ms: u64,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            accuracy_threshold_m: 50.0,
            debounce_ms: 30_000,
        }
    }
}

/// A membership change caused by a low-confidence sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionalChange {
    /// Membership after the change
    pub entered: bool,
    pub changed_at: Timestamp,
    pub expires_at: Timestamp,
    pub source_sample_seq: SequenceNumber,
    pub location: Coordinate,
    /// The transition emitted for this change, if the fence fires on it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub emitted: Option<TriggerKind>,
    /// State to restore if the change is retracted
    pub prior_since: Timestamp,
    pub prior_dwell_fired: bool,
}

/// Per-geofence membership state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FenceState {
    pub inside: bool,
    /// When the current membership began
    pub since: Timestamp,
    pub dwell_fired: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provisional: Option<ProvisionalChange>,
}

impl FenceState {
    fn baseline(inside: bool, at: Timestamp) -> Self {
        Self {
            inside,
            since: at,
            dwell_fired: false,
            provisional: None,
        }
    }
}

/// Evaluator state carried between samples for one device.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluatorState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<DeviceId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sequence: Option<SequenceNumber>,
    /// Using BTreeMap for deterministic ordering
    #[serde(default)]
    pub fences: BTreeMap<GeofenceId, FenceState>,
}

impl EvaluatorState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fence(&self, id: &str) -> Option<&FenceState> {
        self.fences.get(id)
    }

    /// Whether the device is currently inside the given fence.
    pub fn is_inside(&self, id: &str) -> bool {
        self.fences.get(id).map(|f| f.inside).unwrap_or(false)
    }
}

/// Output of one evaluation step.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub transitions: Vec<TransitionEvent>,
    pub new_state: EvaluatorState,
    /// The sample's accuracy was worse than the configured threshold
    pub low_confidence: bool,
    /// Provisional transitions withdrawn by this sample
    pub retracted: Vec<TransitionEvent>,
}

/// Evaluate one sample against the geofence set.
pub fn evaluate(
    sample: &LocationSample,
    prior: &EvaluatorState,
    fences: &GeofenceSet,
    config: &EvaluatorConfig,
) -> Result<Evaluation> {
    if let Some(expected) = &prior.device_id {
        if expected != &sample.device_id {
            return Err(Error::DeviceMismatch {
                expected: expected.clone(),
                got: sample.device_id.clone(),
            });
        }
    }
    if let Some(last) = prior.last_sequence {
        if sample.sequence_number <= last {
            return Err(Error::OutOfOrderSample {
                device_id: sample.device_id.clone(),
                last,
                got: sample.sequence_number,
            });
        }
    }

    let low_confidence = sample.accuracy_meters > config.accuracy_threshold_m;
    let mut step = Step {
        sample,
        config,
        low_confidence,
        transitions: Vec::new(),
        retracted: Vec::new(),
    };

    // Fences no longer configured drop their state
    let mut new_fences = BTreeMap::new();
    for fence in fences.iter() {
        let state = step.evaluate_fence(fence, prior.fences.get(&fence.id));
        new_fences.insert(fence.id.clone(), state);
    }

    Ok(Evaluation {
        transitions: step.transitions,
        new_state: EvaluatorState {
            device_id: Some(sample.device_id.clone()),
            last_sequence: Some(sample.sequence_number),
            fences: new_fences,
        },
        low_confidence,
        retracted: step.retracted,
    })
}

struct Step<'a> {
    sample: &'a LocationSample,
    config: &'a EvaluatorConfig,
    low_confidence: bool,
    transitions: Vec<TransitionEvent>,
    retracted: Vec<TransitionEvent>,
}

impl Step<'_> {
    fn evaluate_fence(&mut self, fence: &Geofence, prior: Option<&FenceState>) -> FenceState {
        let now = self.sample.wall_ms();
        let position = self.sample.coordinate();
        let inside_now = fence.contains(&position);

        let mut state = match prior {
            Some(state) => state.clone(),
            None => {
                let state = FenceState::baseline(inside_now, now);
                return self.check_dwell(fence, state);
            }
        };

        self.resolve_provisional(fence, &mut state, inside_now);

        if inside_now != state.inside {
            let change = if inside_now {
                TriggerKind::Enter
            } else {
                TriggerKind::Exit
            };
            let prior_since = state.since;
            let prior_dwell_fired = state.dwell_fired;

            state.inside = inside_now;
            state.since = now;
            state.dwell_fired = false;

            let emitted = (fence.kind == change).then_some(change);
            if let Some(kind) = emitted {
                let event = self.event(
                    fence,
                    kind,
                    now,
                    self.sample.sequence_number,
                    position,
                    self.confidence(),
                );
                self.transitions.push(event);
            }

            state.provisional = self.low_confidence.then(|| ProvisionalChange {
                entered: inside_now,
                changed_at: now,
                expires_at: now.saturating_add(self.config.debounce_ms),
                source_sample_seq: self.sample.sequence_number,
                location: position,
                emitted,
                prior_since,
                prior_dwell_fired,
            });
        }

        self.check_dwell(fence, state)
    }

    fn resolve_provisional(&mut self, fence: &Geofence, state: &mut FenceState, inside_now: bool) {
        let Some(pending) = state.provisional.clone() else {
            return;
        };
        let now = self.sample.wall_ms();

        if now > pending.expires_at {
            // The window passed without a better sample; the change stands
            state.provisional = None;
            return;
        }
        if self.low_confidence {
            return;
        }

        state.provisional = None;
        if inside_now == pending.entered {
            if let Some(kind) = pending.emitted {
                let event = self.event(
                    fence,
                    kind,
                    pending.changed_at,
                    pending.source_sample_seq,
                    pending.location,
                    Confidence::Confirmed,
                );
                self.transitions.push(event);
            }
        } else {
            if let Some(kind) = pending.emitted {
                let event = self.event(
                    fence,
                    kind,
                    pending.changed_at,
                    pending.source_sample_seq,
                    pending.location,
                    Confidence::Provisional,
                );
                self.retracted.push(event);
            }
            state.inside = !pending.entered;
            state.since = pending.prior_since;
            state.dwell_fired = pending.prior_dwell_fired;
        }
    }

    fn check_dwell(&mut self, fence: &Geofence, mut state: FenceState) -> FenceState {
        if fence.kind != TriggerKind::Dwell || !state.inside || state.dwell_fired {
            return state;
        }
        let Some(dwell_seconds) = fence.dwell_seconds else {
            return state;
        };

        let now = self.sample.wall_ms();
        if now.saturating_sub(state.since) >= dwell_seconds.saturating_mul(1000) {
            let event = self.event(
                fence,
                TriggerKind::Dwell,
                now,
                self.sample.sequence_number,
                self.sample.coordinate(),
                self.confidence(),
            );
            self.transitions.push(event);
            state.dwell_fired = true;
        }
        state
    }

    fn confidence(&self) -> Confidence {
        if self.low_confidence {
            Confidence::Provisional
        } else {
            Confidence::Confirmed
        }
    }

    fn event(
        &self,
        fence: &Geofence,
        kind: TriggerKind,
        triggered_at: Timestamp,
        source_sample_seq: SequenceNumber,
        location: Coordinate,
        confidence: Confidence,
    ) -> TransitionEvent {
        TransitionEvent {
            geofence_id: fence.id.clone(),
            device_id: self.sample.device_id.clone(),
            kind,
            triggered_at,
            source_sample_seq,
            location,
            confidence,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{LocationReading, SampleTime};

    const T0: Timestamp = 1_706_745_600_000;

    fn center() -> Coordinate {
        Coordinate::new(52.5200, 13.4050)
    }

    // ~1.1 km north of center
    fn far() -> Coordinate {
        Coordinate::new(52.5300, 13.4050)
    }

    fn sample(seq: u64, secs: u64, at: Coordinate, accuracy: f64) -> LocationSample {
        LocationReading::new(
            "phone",
            SampleTime::new(secs * 1000, T0 + secs * 1000),
            at.latitude,
            at.longitude,
            accuracy,
        )
        .into_sample(seq)
    }

    fn fences(fence: Geofence) -> GeofenceSet {
        GeofenceSet::new().with_fence(fence).unwrap()
    }

    fn run(samples: &[LocationSample], set: &GeofenceSet) -> (Vec<TransitionEvent>, EvaluatorState) {
        let config = EvaluatorConfig::default();
        let mut state = EvaluatorState::new();
        let mut all = Vec::new();
        for s in samples {
            let eval = evaluate(s, &state, set, &config).unwrap();
            all.extend(eval.transitions);
            state = eval.new_state;
        }
        (all, state)
    }

    #[test]
    fn first_sample_is_baseline() {
        let set = fences(Geofence::new("home", center(), 100.0, TriggerKind::Enter));
        let (events, state) = run(&[sample(1, 0, center(), 5.0)], &set);
        assert!(events.is_empty());
        assert!(state.is_inside("home"));
    }

    #[test]
    fn enter_and_exit_detected() {
        let set = GeofenceSet::new()
            .with_fence(Geofence::new("in", center(), 100.0, TriggerKind::Enter))
            .unwrap()
            .with_fence(Geofence::new("out", center(), 100.0, TriggerKind::Exit))
            .unwrap();

        let (events, _) = run(
            &[
                sample(1, 0, far(), 5.0),
                sample(2, 10, center(), 5.0),
                sample(3, 20, far(), 5.0),
            ],
            &set,
        );

        assert_eq!(events.len(), 2);
        assert_eq!(events[0].geofence_id, "in");
        assert_eq!(events[0].kind, TriggerKind::Enter);
        assert_eq!(events[0].source_sample_seq, 2);
        assert_eq!(events[0].triggered_at, T0 + 10_000);
        assert_eq!(events[1].geofence_id, "out");
        assert_eq!(events[1].kind, TriggerKind::Exit);
        assert_eq!(events[1].confidence, Confidence::Confirmed);
    }

    #[test]
    fn dwell_fires_once() {
        let set = fences(Geofence::dwell("park", center(), 100.0, 60));
        let (events, _) = run(
            &[
                sample(1, 0, center(), 5.0),
                sample(2, 30, center(), 5.0),
                sample(3, 90, center(), 5.0),
                sample(4, 120, center(), 5.0),
            ],
            &set,
        );

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, TriggerKind::Dwell);
        assert_eq!(events[0].triggered_at, T0 + 90_000);
        assert_eq!(events[0].source_sample_seq, 3);
    }

    #[test]
    fn dwell_rearms_after_exit() {
        let set = fences(Geofence::dwell("park", center(), 100.0, 60));
        let (events, _) = run(
            &[
                sample(1, 0, center(), 5.0),
                sample(2, 61, center(), 5.0),
                sample(3, 70, far(), 5.0),
                sample(4, 80, center(), 5.0),
                sample(5, 150, center(), 5.0),
            ],
            &set,
        );
        let dwells: Vec<_> = events.iter().map(|e| e.triggered_at).collect();
        assert_eq!(dwells, vec![T0 + 61_000, T0 + 150_000]);
    }

    #[test]
    fn out_of_order_rejected() {
        let set = fences(Geofence::new("home", center(), 100.0, TriggerKind::Enter));
        let (_, state) = run(&[sample(5, 0, far(), 5.0)], &set);

        let err = evaluate(&sample(4, 10, center(), 5.0), &state, &set, &EvaluatorConfig::default())
            .unwrap_err();
        assert_eq!(
            err,
            Error::OutOfOrderSample {
                device_id: "phone".into(),
                last: 5,
                got: 4
            }
        );

        // Same sequence twice is also rejected
        assert!(evaluate(&sample(5, 10, center(), 5.0), &state, &set, &EvaluatorConfig::default()).is_err());
    }

    #[test]
    fn rejects_foreign_device_state() {
        let set = fences(Geofence::new("home", center(), 100.0, TriggerKind::Enter));
        let (_, state) = run(&[sample(1, 0, far(), 5.0)], &set);
        let mut other = sample(2, 10, center(), 5.0);
        other.device_id = "tablet".into();
        assert!(matches!(
            evaluate(&other, &state, &set, &EvaluatorConfig::default()),
            Err(Error::DeviceMismatch { .. })
        ));
    }

    #[test]
    fn low_confidence_is_flagged_and_provisional() {
        let set = fences(Geofence::new("home", center(), 100.0, TriggerKind::Enter));
        let config = EvaluatorConfig::default();
        let (_, state) = run(&[sample(1, 0, far(), 5.0)], &set);

        let eval = evaluate(&sample(2, 10, center(), 500.0), &state, &set, &config).unwrap();
        assert!(eval.low_confidence);
        assert_eq!(eval.transitions.len(), 1);
        assert_eq!(eval.transitions[0].confidence, Confidence::Provisional);
        assert!(eval.new_state.fence("home").unwrap().provisional.is_some());
    }

    #[test]
    fn provisional_confirmed_with_same_key() {
        let set = fences(Geofence::new("home", center(), 100.0, TriggerKind::Enter));
        let (events, state) = run(
            &[
                sample(1, 0, far(), 5.0),
                sample(2, 10, center(), 500.0),
                sample(3, 20, center(), 5.0),
            ],
            &set,
        );

        assert_eq!(events.len(), 2);
        assert_eq!(events[0].confidence, Confidence::Provisional);
        assert_eq!(events[1].confidence, Confidence::Confirmed);
        assert_eq!(events[0].dedup_key(60_000), events[1].dedup_key(60_000));
        assert_eq!(events[1].triggered_at, events[0].triggered_at);
        assert_eq!(events[1].source_sample_seq, 2);
        assert!(state.fence("home").unwrap().provisional.is_none());
    }

    #[test]
    fn provisional_retracted_by_contradiction() {
        let set = fences(Geofence::new("home", center(), 100.0, TriggerKind::Enter));
        let config = EvaluatorConfig::default();
        let (_, state) = run(
            &[sample(1, 0, far(), 5.0), sample(2, 10, center(), 500.0)],
            &set,
        );

        let eval = evaluate(&sample(3, 20, far(), 5.0), &state, &set, &config).unwrap();
        assert!(eval.transitions.is_empty());
        assert_eq!(eval.retracted.len(), 1);
        assert_eq!(eval.retracted[0].source_sample_seq, 2);
        assert!(!eval.new_state.is_inside("home"));
        assert_eq!(eval.new_state.fence("home").unwrap().since, T0);
    }

    #[test]
    fn provisional_stands_after_window() {
        let set = fences(Geofence::new("home", center(), 100.0, TriggerKind::Enter));
        let (events, state) = run(
            &[
                sample(1, 0, far(), 5.0),
                sample(2, 10, center(), 500.0),
                // debounce is 30s; this sample arrives after the window
                sample(3, 100, center(), 5.0),
            ],
            &set,
        );
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].confidence, Confidence::Provisional);
        assert!(state.is_inside("home"));
    }

    #[test]
    fn removed_fence_drops_state() {
        let set = fences(Geofence::new("home", center(), 100.0, TriggerKind::Enter));
        let (_, state) = run(&[sample(1, 0, far(), 5.0)], &set);

        let eval = evaluate(
            &sample(2, 10, center(), 5.0),
            &state,
            &GeofenceSet::new(),
            &EvaluatorConfig::default(),
        )
        .unwrap();
        assert!(eval.new_state.fences.is_empty());
        assert_eq!(eval.new_state.last_sequence, Some(2));
    }

    #[test]
    fn evaluation_is_pure() {
        let set = GeofenceSet::new()
            .with_fence(Geofence::new("home", center(), 100.0, TriggerKind::Enter))
            .unwrap()
            .with_fence(Geofence::dwell("park", center(), 100.0, 5))
            .unwrap();
        let config = EvaluatorConfig::default();
        let (_, state) = run(&[sample(1, 0, far(), 5.0)], &set);
        let next = sample(2, 10, center(), 80.0);

        let first = evaluate(&next, &state, &set, &config).unwrap();
        let second = evaluate(&next, &state, &set, &config).unwrap();
        assert_eq!(first, second);
    }

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn prop_evaluate_deterministic(
                offsets in proptest::collection::vec((0u32..3000, 1u32..200), 1..20),
            ) {
                let set = GeofenceSet::new()
                    .with_fence(Geofence::new("a", center(), 150.0, TriggerKind::Enter)).unwrap()
                    .with_fence(Geofence::new("b", center(), 400.0, TriggerKind::Exit)).unwrap()
                    .with_fence(Geofence::dwell("c", center(), 250.0, 30)).unwrap();
                let config = EvaluatorConfig::default();

                let mut state_one = EvaluatorState::new();
                let mut state_two = EvaluatorState::new();
                for (i, (meters, accuracy)) in offsets.iter().enumerate() {
                    let lat = center().latitude + f64::from(*meters) / 111_000.0;
                    let s = sample(i as u64 + 1, i as u64 * 20, Coordinate::new(lat, center().longitude), f64::from(*accuracy));

                    let one = evaluate(&s, &state_one, &set, &config).unwrap();
                    let two = evaluate(&s, &state_two, &set, &config).unwrap();
                    prop_assert_eq!(&one.transitions, &two.transitions);
                    prop_assert_eq!(&one.new_state, &two.new_state);
                    state_one = one.new_state;
                    state_two = two.new_state;
                }
            }
        }
    }
}
