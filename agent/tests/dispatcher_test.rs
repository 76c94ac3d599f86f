//! Alert dispatch: at-most-once admission, retries and history.

mod common;

use std::sync::Arc;

use async_trait::async_trait;
use common::{home_fences, RecordingChannel, HOME};
use sentinel_agent::alerts::{AlertDispatcher, DispatcherConfig, DispatcherHandle};
use sentinel_agent::now_ms;
use sentinel_agent::store::{AlertHistory, AlertOutcome, AlertSource};
use sentinel_agent::summary::{Summarizer, SummaryError};
use sentinel_engine::{
    BackoffPolicy, Confidence, EmergencyContact, SafetyTrigger, Severity, Timestamp,
    TransitionEvent, TriggerKind,
};
use tempfile::TempDir;
use tokio::sync::watch;

struct Fixture {
    _dir: TempDir,
    history: AlertHistory,
    channel: Arc<RecordingChannel>,
    alerts: DispatcherHandle,
    _shutdown: watch::Sender<bool>,
}

fn fast_config() -> DispatcherConfig {
    DispatcherConfig {
        retry: BackoffPolicy::new(1, 5).with_jitter(0.0),
        ..DispatcherConfig::default()
    }
}

async fn fixture(
    config: DispatcherConfig,
    channel: Arc<RecordingChannel>,
    summarizer: Option<Arc<dyn Summarizer>>,
) -> Fixture {
    let dir = TempDir::new().unwrap();
    let store = common::temp_store(&dir, None).await;
    let history = AlertHistory::new(store.pool().clone());
    let (shutdown, shutdown_rx) = watch::channel(false);
    let (dispatcher, alerts) = AlertDispatcher::new(
        config,
        channel.clone(),
        history.clone(),
        Arc::new(home_fences()),
        summarizer,
    );
    dispatcher.spawn(shutdown_rx);

    Fixture {
        _dir: dir,
        history,
        channel,
        alerts,
        _shutdown: shutdown,
    }
}

fn arrival(device: &str, at: Timestamp) -> TransitionEvent {
    TransitionEvent {
        geofence_id: "home".into(),
        device_id: device.into(),
        kind: TriggerKind::Enter,
        triggered_at: at,
        source_sample_seq: 7,
        location: HOME,
        confidence: Confidence::Confirmed,
    }
}

#[tokio::test]
async fn same_crossing_from_local_and_remote_alerts_once() {
    let fx = fixture(fast_config(), RecordingChannel::new(), None).await;
    let event = arrival("phone", now_ms());

    fx.alerts.on_transition(event.clone());
    fx.alerts.on_remote_transition(event.clone());
    // A retried sync re-delivers the same event
    fx.alerts.on_remote_transition(event);
    fx.alerts.drain().await;

    let delivered = fx.channel.delivered();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].title, "phone arrived at Home");
    assert!(delivered[0].body.contains("Map: https://maps.google.com/?q="));

    let history = fx.history.recent(10).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].outcome, AlertOutcome::Delivered);
    assert_eq!(history[0].source, AlertSource::Local);
    assert_eq!(history[0].attempts, 1);
    assert!(history[0].dedup_key.is_some());
}

#[tokio::test]
async fn distinct_devices_alert_separately() {
    let fx = fixture(fast_config(), RecordingChannel::new(), None).await;
    let at = now_ms();

    fx.alerts.on_transition(arrival("phone", at));
    fx.alerts.on_remote_transition(arrival("tablet", at));
    fx.alerts.drain().await;

    assert_eq!(fx.channel.delivered().len(), 2);
    assert_eq!(fx.history.count().await.unwrap(), 2);
}

#[tokio::test]
async fn failed_delivery_is_retried() {
    let fx = fixture(fast_config(), RecordingChannel::failing(2), None).await;

    fx.alerts.on_transition(arrival("phone", now_ms()));
    fx.alerts.drain().await;

    assert_eq!(fx.channel.attempts(), 3);
    assert_eq!(fx.channel.delivered().len(), 1);

    let history = fx.history.recent(10).await.unwrap();
    assert_eq!(history[0].outcome, AlertOutcome::Delivered);
    assert_eq!(history[0].attempts, 3);
}

#[tokio::test]
async fn exhausted_retries_are_recorded_undelivered() {
    let config = DispatcherConfig {
        max_attempts: 3,
        ..fast_config()
    };
    let fx = fixture(config, RecordingChannel::failing(10), None).await;
    let event = arrival("phone", now_ms());

    fx.alerts.on_transition(event.clone());
    fx.alerts.drain().await;

    assert_eq!(fx.channel.attempts(), 3);
    assert!(fx.channel.delivered().is_empty());

    let history = fx.history.recent(10).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].outcome, AlertOutcome::Undelivered);
    assert_eq!(history[0].attempts, 3);
    assert_eq!(history[0].reason.as_deref(), Some("push gateway down"));

    // Admission happened before delivery, so the same crossing stays suppressed
    fx.alerts.on_remote_transition(event);
    fx.alerts.drain().await;
    assert_eq!(fx.channel.attempts(), 3);
}

#[tokio::test]
async fn stale_transition_is_recorded_but_not_sent() {
    let fx = fixture(fast_config(), RecordingChannel::new(), None).await;
    let two_hours_ago = now_ms() - 2 * 3_600_000;

    fx.alerts.on_remote_transition(arrival("tablet", two_hours_ago));
    fx.alerts.drain().await;

    assert_eq!(fx.channel.attempts(), 0);
    let history = fx.history.recent(10).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].outcome, AlertOutcome::Stale);
    assert_eq!(history[0].source, AlertSource::Remote);
}

#[tokio::test]
async fn safety_alerts_are_never_suppressed() {
    let config = DispatcherConfig {
        emergency_contact: Some(EmergencyContact {
            name: "Bob".into(),
            phone: "+15550100".into(),
        }),
        ..fast_config()
    };
    let fx = fixture(config, RecordingChannel::new(), None).await;
    let at = now_ms();

    fx.alerts
        .on_safety_trigger("phone", SafetyTrigger::Sos, Some(HOME), at);
    fx.alerts
        .on_safety_trigger("phone", SafetyTrigger::Sos, Some(HOME), at);
    fx.alerts
        .on_safety_trigger("phone", SafetyTrigger::Medical, None, at);
    fx.alerts.drain().await;

    let delivered = fx.channel.delivered();
    assert_eq!(delivered.len(), 3);
    assert!(delivered.iter().all(|n| n.severity == Severity::Critical));
    assert_eq!(delivered[0].title, "SOS alert from phone");
    assert!(delivered[0].body.contains("Emergency contact: Bob (+15550100)"));

    let history = fx.history.recent(10).await.unwrap();
    assert_eq!(history.len(), 3);
    assert!(history.iter().all(|e| e.source == AlertSource::Safety));
    assert!(history
        .iter()
        .all(|e| e.contact_phone.as_deref() == Some("+15550100")));
}

struct FixedSummary;

#[async_trait]
impl Summarizer for FixedSummary {
    async fn summarize(&self, events: &[TransitionEvent]) -> Result<String, SummaryError> {
        Ok(format!("{} recent movements", events.len()))
    }
}

struct BrokenSummary;

#[async_trait]
impl Summarizer for BrokenSummary {
    async fn summarize(&self, _events: &[TransitionEvent]) -> Result<String, SummaryError> {
        Err(SummaryError::Request("connection refused".into()))
    }
}

#[tokio::test]
async fn summary_is_appended_when_available() {
    let fx = fixture(
        fast_config(),
        RecordingChannel::new(),
        Some(Arc::new(FixedSummary)),
    )
    .await;

    fx.alerts.on_transition(arrival("phone", now_ms()));
    fx.alerts.drain().await;

    let delivered = fx.channel.delivered();
    assert!(delivered[0].body.ends_with("Summary: 1 recent movements"));
}

#[tokio::test]
async fn summary_failure_does_not_block_delivery() {
    let fx = fixture(
        fast_config(),
        RecordingChannel::new(),
        Some(Arc::new(BrokenSummary)),
    )
    .await;

    fx.alerts.on_transition(arrival("phone", now_ms()));
    fx.alerts.drain().await;

    let delivered = fx.channel.delivered();
    assert_eq!(delivered.len(), 1);
    assert!(!delivered[0].body.contains("Summary:"));
}
