//! The alert dispatcher task.
//!
//! Alerts arrive on an unbounded channel so ingestion and sync never wait
//! on notification retries. The dispatcher owns the [`AlertLedger`]: a
//! dedup key is admitted once, before the first delivery attempt, and every
//! later sighting inside the suppression window is dropped. Deliveries run
//! concurrently on a `JoinSet`.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use sentinel_engine::{
    Admission, AlertLedger, BackoffPolicy, Coordinate, DedupKey, DeviceId, EmergencyContact,
    GeofenceSet, Notification, SafetyTrigger, Timestamp, TransitionEvent,
};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinHandle, JoinSet};

use super::channel::{ChannelError, NotificationChannel};
use super::render::{append_summary, safety_notification, transition_notification};
use crate::store::{AlertEntry, AlertHistory, AlertOutcome, AlertSource};
use crate::summary::Summarizer;
use crate::{jitter_sample, now_ms};

/// Dispatcher settings.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Width of the triggered-at bucket in dedup keys
    pub dedup_bucket_ms: u64,
    pub suppression_ms: u64,
    /// Alerts older than this are recorded as stale; 0 disables the check
    pub max_age_ms: u64,
    pub max_attempts: u32,
    pub retry: BackoffPolicy,
    pub delivery_timeout: Duration,
    pub summary_timeout: Duration,
    /// How many recent transitions go to the summarizer
    pub summary_window: usize,
    pub emergency_contact: Option<EmergencyContact>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            dedup_bucket_ms: 60_000,
            suppression_ms: 600_000,
            max_age_ms: 1_800_000,
            max_attempts: 5,
            retry: BackoffPolicy::default(),
            delivery_timeout: Duration::from_secs(10),
            summary_timeout: Duration::from_secs(10),
            summary_window: 10,
            emergency_contact: None,
        }
    }
}

enum AlertRequest {
    Transition {
        event: TransitionEvent,
        source: AlertSource,
    },
    Safety {
        device_id: DeviceId,
        trigger: SafetyTrigger,
        location: Option<Coordinate>,
        at: Timestamp,
    },
    Drain(oneshot::Sender<()>),
}

/// Cheap, cloneable sender side of the dispatcher.
#[derive(Clone)]
pub struct DispatcherHandle {
    tx: mpsc::UnboundedSender<AlertRequest>,
}

impl DispatcherHandle {
    /// A transition evaluated on this device.
    pub fn on_transition(&self, event: TransitionEvent) {
        self.send(AlertRequest::Transition {
            event,
            source: AlertSource::Local,
        });
    }

    /// A transition learned from the remote store.
    pub fn on_remote_transition(&self, event: TransitionEvent) {
        self.send(AlertRequest::Transition {
            event,
            source: AlertSource::Remote,
        });
    }

    pub fn on_safety_trigger(
        &self,
        device_id: &str,
        trigger: SafetyTrigger,
        location: Option<Coordinate>,
        at: Timestamp,
    ) {
        self.send(AlertRequest::Safety {
            device_id: device_id.to_string(),
            trigger,
            location,
            at,
        });
    }

    /// Wait until every alert submitted before this call has finished,
    /// retries included.
    pub async fn drain(&self) {
        let (tx, rx) = oneshot::channel();
        self.send(AlertRequest::Drain(tx));
        let _ = rx.await;
    }

    fn send(&self, request: AlertRequest) {
        if self.tx.send(request).is_err() {
            tracing::warn!("Alert dispatcher stopped, alert dropped");
        }
    }
}

pub struct AlertDispatcher {
    config: DispatcherConfig,
    ledger: AlertLedger,
    channel: Arc<dyn NotificationChannel>,
    history: AlertHistory,
    geofences: Arc<GeofenceSet>,
    summarizer: Option<Arc<dyn Summarizer>>,
    recent: VecDeque<TransitionEvent>,
    rx: mpsc::UnboundedReceiver<AlertRequest>,
    inflight: JoinSet<()>,
}

impl AlertDispatcher {
    pub fn new(
        config: DispatcherConfig,
        channel: Arc<dyn NotificationChannel>,
        history: AlertHistory,
        geofences: Arc<GeofenceSet>,
        summarizer: Option<Arc<dyn Summarizer>>,
    ) -> (Self, DispatcherHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let dispatcher = Self {
            ledger: AlertLedger::new(config.suppression_ms, config.max_age_ms),
            config,
            channel,
            history,
            geofences,
            summarizer,
            recent: VecDeque::new(),
            rx,
            inflight: JoinSet::new(),
        };
        (dispatcher, DispatcherHandle { tx })
    }

    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!("Alert dispatcher started");
        loop {
            tokio::select! {
                request = self.rx.recv() => match request {
                    Some(request) => self.handle(request).await,
                    None => break,
                },
                Some(joined) = self.inflight.join_next(), if !self.inflight.is_empty() => {
                    if let Err(e) = joined {
                        tracing::error!(error = %e, "Alert delivery task failed");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }

        // Let in-flight deliveries reach a recorded outcome
        self.finish_inflight().await;
        tracing::info!("Alert dispatcher stopped");
    }

    async fn handle(&mut self, request: AlertRequest) {
        match request {
            AlertRequest::Transition { event, source } => self.on_transition(event, source).await,
            AlertRequest::Safety {
                device_id,
                trigger,
                location,
                at,
            } => self.on_safety(device_id, trigger, location, at),
            AlertRequest::Drain(done) => {
                self.finish_inflight().await;
                let _ = done.send(());
            }
        }
    }

    async fn finish_inflight(&mut self) {
        while let Some(joined) = self.inflight.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "Alert delivery task failed");
            }
        }
    }

    async fn on_transition(&mut self, event: TransitionEvent, source: AlertSource) {
        let now = now_ms();
        self.ledger.expire(now);

        let key = event.dedup_key(self.config.dedup_bucket_ms);
        let admission = self.ledger.admit(&key, event.triggered_at, now);

        let fence = self.geofences.get(&event.geofence_id);
        let notification =
            transition_notification(&event, fence, self.config.emergency_contact.as_ref());
        let mut entry = self.entry(&event.device_id, source, event.kind.as_str(), &notification);
        entry.dedup_key = Some(key_string(&key));
        entry.latitude = Some(event.location.latitude);
        entry.longitude = Some(event.location.longitude);
        entry.maps_url = Some(event.location.maps_url());
        entry.triggered_at = event.triggered_at;

        match admission {
            Admission::Suppressed { first_seen } => {
                tracing::debug!(
                    device_id = %event.device_id,
                    geofence_id = %event.geofence_id,
                    kind = %event.kind,
                    source = source.as_str(),
                    first_seen,
                    "Duplicate alert suppressed"
                );
            }
            Admission::Stale { age_ms } => {
                tracing::warn!(
                    device_id = %event.device_id,
                    geofence_id = %event.geofence_id,
                    age_ms,
                    "Stale alert dropped"
                );
                entry.outcome = AlertOutcome::Stale;
                entry.reason = Some(format!("triggered {age_ms} ms before dispatch"));
                entry.recorded_at = now;
                if let Err(e) = self.history.record(&entry).await {
                    tracing::error!(error = %e, "Failed to record alert history");
                }
            }
            Admission::Deliver => {
                self.recent.push_back(event);
                while self.recent.len() > self.config.summary_window {
                    self.recent.pop_front();
                }
                self.deliver(notification, entry);
            }
        }
    }

    fn on_safety(
        &mut self,
        device_id: DeviceId,
        trigger: SafetyTrigger,
        location: Option<Coordinate>,
        at: Timestamp,
    ) {
        tracing::warn!(device_id = %device_id, trigger = %trigger, "Safety trigger");
        let notification = safety_notification(
            &device_id,
            trigger,
            location.as_ref(),
            at,
            self.config.emergency_contact.as_ref(),
        );
        let mut entry = self.entry(&device_id, AlertSource::Safety, trigger.as_str(), &notification);
        if let Some(location) = location {
            entry.latitude = Some(location.latitude);
            entry.longitude = Some(location.longitude);
            entry.maps_url = Some(location.maps_url());
        }
        entry.triggered_at = at;
        self.deliver(notification, entry);
    }

    fn entry(
        &self,
        device_id: &str,
        source: AlertSource,
        kind: &str,
        notification: &Notification,
    ) -> AlertEntry {
        let contact = self.config.emergency_contact.as_ref();
        AlertEntry {
            alert_id: uuid::Uuid::new_v4().to_string(),
            device_id: device_id.to_string(),
            source,
            kind: kind.to_string(),
            dedup_key: None,
            title: notification.title.clone(),
            body: notification.body.clone(),
            severity: notification.severity,
            outcome: AlertOutcome::Undelivered,
            attempts: 0,
            reason: None,
            latitude: None,
            longitude: None,
            maps_url: None,
            contact_name: contact.map(|c| c.name.clone()),
            contact_phone: contact.map(|c| c.phone.clone()),
            triggered_at: 0,
            recorded_at: 0,
        }
    }

    fn deliver(&mut self, notification: Notification, entry: AlertEntry) {
        let delivery = Delivery {
            notification,
            entry,
            channel: self.channel.clone(),
            history: self.history.clone(),
            summarizer: self.summarizer.clone(),
            recent: self.recent.iter().cloned().collect(),
            max_attempts: self.config.max_attempts.max(1),
            retry: self.config.retry,
            delivery_timeout: self.config.delivery_timeout,
            summary_timeout: self.config.summary_timeout,
        };
        self.inflight.spawn(delivery.run());
    }
}

fn key_string(key: &DedupKey) -> String {
    format!(
        "{}:{}:{}:{}",
        key.geofence_id, key.device_id, key.kind, key.bucket
    )
}

/// One admitted alert on its way to the channel.
struct Delivery {
    notification: Notification,
    entry: AlertEntry,
    channel: Arc<dyn NotificationChannel>,
    history: AlertHistory,
    summarizer: Option<Arc<dyn Summarizer>>,
    recent: Vec<TransitionEvent>,
    max_attempts: u32,
    retry: BackoffPolicy,
    delivery_timeout: Duration,
    summary_timeout: Duration,
}

impl Delivery {
    async fn run(mut self) {
        self.add_summary().await;

        let mut attempts = 0;
        let mut last_error = None;
        let outcome = loop {
            attempts += 1;
            let result =
                match tokio::time::timeout(self.delivery_timeout, self.channel.deliver(&self.notification))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(ChannelError::Unavailable(format!(
                        "timed out after {:?}",
                        self.delivery_timeout
                    ))),
                };

            match result {
                Ok(()) => break AlertOutcome::Delivered,
                Err(ChannelError::Rejected(reason)) => {
                    last_error = Some(reason);
                    break AlertOutcome::Undelivered;
                }
                Err(ChannelError::Unavailable(reason)) => {
                    tracing::debug!(
                        device_id = %self.entry.device_id,
                        attempt = attempts,
                        reason = %reason,
                        "Alert delivery failed"
                    );
                    last_error = Some(reason);
                    if attempts >= self.max_attempts {
                        break AlertOutcome::Undelivered;
                    }
                    tokio::time::sleep(self.retry.delay(attempts, jitter_sample())).await;
                }
            }
        };

        let mut entry = self.entry;
        entry.title = self.notification.title;
        entry.body = self.notification.body;
        entry.outcome = outcome;
        entry.attempts = attempts;
        entry.recorded_at = now_ms();

        match outcome {
            AlertOutcome::Delivered => tracing::info!(
                alert_id = %entry.alert_id,
                device_id = %entry.device_id,
                kind = %entry.kind,
                attempts,
                "Alert delivered"
            ),
            _ => {
                entry.reason = last_error;
                tracing::warn!(
                    alert_id = %entry.alert_id,
                    device_id = %entry.device_id,
                    kind = %entry.kind,
                    attempts,
                    reason = entry.reason.as_deref().unwrap_or(""),
                    "Alert undelivered"
                );
            }
        }

        if let Err(e) = self.history.record(&entry).await {
            tracing::error!(alert_id = %entry.alert_id, error = %e, "Failed to record alert history");
        }
    }

    async fn add_summary(&mut self) {
        let Some(summarizer) = &self.summarizer else {
            return;
        };
        if self.recent.is_empty() {
            return;
        }
        match tokio::time::timeout(self.summary_timeout, summarizer.summarize(&self.recent)).await {
            Ok(Ok(summary)) => append_summary(&mut self.notification, &summary),
            Ok(Err(e)) => tracing::debug!(error = %e, "Summary omitted"),
            Err(_) => tracing::debug!("Summary timed out"),
        }
    }
}
