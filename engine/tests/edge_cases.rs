//! Edge case tests for sentinel-engine
//!
//! These tests cover boundary conditions and unusual inputs.

use sentinel_engine::{
    commit_batch, evaluate, Admission, AlertLedger, Confidence, Coordinate, Error,
    EvaluatorConfig, EvaluatorState, Geofence, GeofenceSet, LocationReading, LocationSample,
    PushAck, RecordBody, Reconciler, RemoteChange, SampleTime, Snapshot, SyncRecord,
    TransitionEvent, TransitionView, TriggerKind,
};

const T0: u64 = 1_706_745_600_000;

fn reading(seq: u64, secs: u64, lat: f64, lon: f64, accuracy: f64) -> LocationSample {
    LocationReading::new(
        "phone",
        SampleTime::new(secs * 1000, T0 + secs * 1000),
        lat,
        lon,
        accuracy,
    )
    .into_sample(seq)
}

fn single(fence: Geofence) -> GeofenceSet {
    GeofenceSet::new().with_fence(fence).unwrap()
}

fn run(
    samples: &[LocationSample],
    fences: &GeofenceSet,
    config: &EvaluatorConfig,
) -> (Vec<TransitionEvent>, EvaluatorState) {
    let mut state = EvaluatorState::new();
    let mut events = Vec::new();
    for sample in samples {
        let eval = evaluate(sample, &state, fences, config).unwrap();
        events.extend(eval.transitions);
        state = eval.new_state;
    }
    (events, state)
}

// ============================================================================
// Geometry Edge Cases
// ============================================================================

#[test]
fn fence_across_antimeridian() {
    let fences = single(Geofence::new(
        "dateline",
        Coordinate::new(0.0, 179.9995),
        200.0,
        TriggerKind::Enter,
    ));
    let (events, state) = run(
        &[
            reading(1, 0, 0.0, 179.9, 5.0),
            reading(2, 60, 0.0, -179.9995, 5.0),
        ],
        &fences,
        &EvaluatorConfig::default(),
    );
    assert_eq!(events.len(), 1);
    assert!(state.is_inside("dateline"));
}

#[test]
fn fence_at_north_pole() {
    let fences = single(Geofence::new(
        "pole",
        Coordinate::new(90.0, 0.0),
        500.0,
        TriggerKind::Exit,
    ));
    let (events, _) = run(
        &[
            reading(1, 0, 89.999, 120.0, 5.0),
            reading(2, 60, 89.99, -60.0, 5.0),
        ],
        &fences,
        &EvaluatorConfig::default(),
    );
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, TriggerKind::Exit);
}

#[test]
fn boundary_point_counts_as_inside() {
    let center = Coordinate::new(10.0, 10.0);
    let edge = Coordinate::new(10.001, 10.0);
    let fence = Geofence::new("edge", center, center.distance_to(&edge), TriggerKind::Enter);
    assert!(fence.contains(&edge));
}

#[test]
fn invalid_readings_rejected() {
    let bad = [
        LocationReading::new("phone", SampleTime::new(0, 0), 91.0, 0.0, 1.0),
        LocationReading::new("phone", SampleTime::new(0, 0), 0.0, -180.5, 1.0),
        LocationReading::new("phone", SampleTime::new(0, 0), f64::NAN, 0.0, 1.0),
        LocationReading::new("phone", SampleTime::new(0, 0), 0.0, 0.0, -1.0),
    ];
    for reading in bad {
        assert!(matches!(reading.validate(), Err(Error::InvalidSample(_))));
    }
    let zero_accuracy = LocationReading::new("phone", SampleTime::new(0, 0), 0.0, 0.0, 0.0);
    assert!(zero_accuracy.validate().is_ok());
}

// ============================================================================
// Evaluation Edge Cases
// ============================================================================

#[test]
fn duplicate_sequence_rejected() {
    let fences = single(Geofence::new("home", Coordinate::new(0.0, 0.0), 100.0, TriggerKind::Enter));
    let config = EvaluatorConfig::default();
    let first = reading(5, 0, 0.0, 0.0, 5.0);
    let state = evaluate(&first, &EvaluatorState::new(), &fences, &config)
        .unwrap()
        .new_state;

    let err = evaluate(&first, &state, &fences, &config).unwrap_err();
    assert_eq!(
        err,
        Error::OutOfOrderSample {
            device_id: "phone".into(),
            last: 5,
            got: 5
        }
    );
}

#[test]
fn other_device_state_rejected() {
    let fences = GeofenceSet::new();
    let config = EvaluatorConfig::default();
    let state = evaluate(&reading(1, 0, 0.0, 0.0, 5.0), &EvaluatorState::new(), &fences, &config)
        .unwrap()
        .new_state;

    let tablet = LocationReading::new("tablet", SampleTime::new(0, T0), 0.0, 0.0, 5.0).into_sample(2);
    assert!(matches!(
        evaluate(&tablet, &state, &fences, &config),
        Err(Error::DeviceMismatch { .. })
    ));
}

#[test]
fn empty_geofence_set_emits_nothing() {
    let (events, state) = run(
        &[reading(1, 0, 0.0, 0.0, 5.0), reading(2, 10, 1.0, 1.0, 5.0)],
        &GeofenceSet::new(),
        &EvaluatorConfig::default(),
    );
    assert!(events.is_empty());
    assert!(state.fences.is_empty());
    assert_eq!(state.last_sequence, Some(2));
}

#[test]
fn removed_fence_drops_state() {
    let fence = Geofence::new("home", Coordinate::new(0.0, 0.0), 100.0, TriggerKind::Enter);
    let config = EvaluatorConfig::default();
    let state = evaluate(&reading(1, 0, 0.0, 0.0, 5.0), &EvaluatorState::new(), &single(fence), &config)
        .unwrap()
        .new_state;
    assert!(state.fence("home").is_some());

    let eval = evaluate(&reading(2, 10, 0.0, 0.0, 5.0), &state, &GeofenceSet::new(), &config).unwrap();
    assert!(eval.new_state.fence("home").is_none());
}

#[test]
fn provisional_enter_retracted_by_accurate_sample() {
    let fences = single(Geofence::new("home", Coordinate::new(0.0, 0.0), 100.0, TriggerKind::Enter));
    let config = EvaluatorConfig::default();

    let state = evaluate(&reading(1, 0, 0.01, 0.0, 5.0), &EvaluatorState::new(), &fences, &config)
        .unwrap()
        .new_state;

    // Poor fix that happens to land inside
    let noisy = evaluate(&reading(2, 10, 0.0, 0.0, 400.0), &state, &fences, &config).unwrap();
    assert!(noisy.low_confidence);
    assert_eq!(noisy.transitions.len(), 1);
    assert_eq!(noisy.transitions[0].confidence, Confidence::Provisional);

    // Accurate fix inside the window says we never left
    let accurate = evaluate(&reading(3, 20, 0.01, 0.0, 5.0), &noisy.new_state, &fences, &config).unwrap();
    assert!(accurate.transitions.is_empty());
    assert_eq!(accurate.retracted.len(), 1);
    assert_eq!(
        accurate.retracted[0].dedup_key(60_000),
        noisy.transitions[0].dedup_key(60_000)
    );
    assert!(!accurate.new_state.is_inside("home"));
}

#[test]
fn provisional_enter_confirmed_with_same_key() {
    let fences = single(Geofence::new("home", Coordinate::new(0.0, 0.0), 100.0, TriggerKind::Enter));
    let (events, state) = run(
        &[
            reading(1, 0, 0.01, 0.0, 5.0),
            reading(2, 10, 0.0, 0.0, 400.0),
            reading(3, 20, 0.0, 0.0, 5.0),
        ],
        &fences,
        &EvaluatorConfig::default(),
    );
    assert_eq!(events.len(), 2);
    assert_eq!(events[1].confidence, Confidence::Confirmed);
    assert_eq!(events[0].dedup_key(60_000), events[1].dedup_key(60_000));
    assert_eq!(events[1].source_sample_seq, 2);
    assert!(state.is_inside("home"));
}

#[test]
fn provisional_stands_after_window() {
    let fences = single(Geofence::new("home", Coordinate::new(0.0, 0.0), 100.0, TriggerKind::Enter));
    let (events, state) = run(
        &[
            reading(1, 0, 0.01, 0.0, 5.0),
            reading(2, 10, 0.0, 0.0, 400.0),
            // Accurate fix outside, but long after the debounce window
            reading(3, 120, 0.01, 0.0, 5.0),
        ],
        &fences,
        &EvaluatorConfig::default(),
    );
    // Only the provisional enter; leaving an enter-only fence emits nothing
    assert_eq!(events.len(), 1);
    assert!(!state.is_inside("home"));
}

#[test]
fn reevaluation_after_restore_is_identical() {
    let fences = single(
        Geofence::dwell("park", Coordinate::new(0.0, 0.0), 100.0, 60).with_label("Park"),
    );
    let config = EvaluatorConfig::default();
    let samples: Vec<_> = (1..=10)
        .map(|i| {
            let lat = if i % 4 == 0 { 0.01 } else { 0.0 };
            reading(i, i * 30, lat, 0.0, 5.0)
        })
        .collect();

    let (_, mid_state) = run(&samples[..5], &fences, &config);
    let json = Snapshot::new("phone", T0, mid_state.clone()).to_json().unwrap();
    let restored = Snapshot::<EvaluatorState>::from_json(&json, "phone")
        .unwrap()
        .into_state();

    let replay = |start: EvaluatorState| {
        let mut state = start;
        let mut events = Vec::new();
        for s in &samples[5..] {
            let eval = evaluate(s, &state, &fences, &config).unwrap();
            events.extend(eval.transitions);
            state = eval.new_state;
        }
        (events, state)
    };
    assert_eq!(replay(mid_state), replay(restored));
}

// ============================================================================
// Reconciliation Edge Cases
// ============================================================================

fn remote_enter(version: u64, device: &str, at: u64) -> RemoteChange {
    RemoteChange {
        version,
        remote_id: format!("r{version}"),
        body: RecordBody::Transition(TransitionEvent {
            geofence_id: "school".into(),
            device_id: device.into(),
            kind: TriggerKind::Enter,
            triggered_at: at,
            source_sample_seq: version,
            location: Coordinate::new(0.0, 0.0),
            confidence: Confidence::Confirmed,
        }),
    }
}

#[test]
fn reconcile_nothing() {
    let (result, view) = Reconciler::new("phone", TransitionView::new()).reconcile(&[], vec![]);
    assert!(result.applied_remote.is_empty());
    assert_eq!(result.max_version, None);
    assert_eq!(view.slot_count(), 0);
}

#[test]
fn remote_redelivery_is_ignored() {
    let changes = vec![remote_enter(1, "tablet", 100)];
    let (_, view) = Reconciler::new("phone", TransitionView::new()).reconcile(&[], changes.clone());
    let (result, again) = Reconciler::new("phone", view.clone()).reconcile(&[], changes);
    assert_eq!(result.ignored_remote, vec!["r1".to_string()]);
    assert_eq!(view, again);
}

#[test]
fn own_echo_does_not_conflict() {
    let event = match remote_enter(3, "phone", 500).body {
        RecordBody::Transition(t) => t,
        RecordBody::Sample(_) => unreachable!(),
    };
    let pending = vec![SyncRecord::pending(9, 9, RecordBody::Transition(event), 0)];
    let (result, _) = Reconciler::new("phone", TransitionView::new())
        .reconcile(&pending, vec![remote_enter(3, "phone", 500)]);
    assert!(result.conflicts.is_empty());
}

#[test]
fn same_instant_tie_is_deterministic() {
    let a = vec![remote_enter(1, "alpha", 100), remote_enter(2, "bravo", 100)];
    let b = vec![remote_enter(2, "bravo", 100), remote_enter(1, "alpha", 100)];
    let (_, va) = Reconciler::new("phone", TransitionView::new()).reconcile(&[], a);
    let (_, vb) = Reconciler::new("phone", TransitionView::new()).reconcile(&[], b);
    assert_eq!(va, vb);
    assert_eq!(va.winner("school", TriggerKind::Enter).unwrap().device_id, "bravo");
}

// ============================================================================
// Push and Alert Edge Cases
// ============================================================================

#[test]
fn empty_batch_commits_nothing() {
    let commit = commit_batch(&[], &PushAck::default());
    assert!(commit.is_complete());
    assert_eq!(commit.highest_synced(), None);
}

#[test]
fn ack_with_only_error_leaves_batch_pending() {
    let sample = reading(1, 0, 0.0, 0.0, 5.0);
    let batch = vec![SyncRecord::pending(1, 1, RecordBody::Sample(sample), 0)];
    let ack = PushAck {
        error: Some("gateway timeout".into()),
        ..PushAck::default()
    };
    let commit = commit_batch(&batch, &ack);
    assert_eq!(commit.unresolved, vec![1]);
    assert!(commit.synced.is_empty());
}

#[test]
fn local_and_remote_delivery_alerts_once() {
    let mut ledger = AlertLedger::new(600_000, 0);
    let local = match remote_enter(1, "phone", T0).body {
        RecordBody::Transition(t) => t,
        RecordBody::Sample(_) => unreachable!(),
    };
    let echoed = local.clone();

    assert_eq!(
        ledger.admit(&local.dedup_key(60_000), local.triggered_at, T0),
        Admission::Deliver
    );
    assert!(matches!(
        ledger.admit(&echoed.dedup_key(60_000), echoed.triggered_at, T0 + 5_000),
        Admission::Suppressed { .. }
    ));
}
