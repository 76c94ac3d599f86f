//! Shared doubles for agent integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use sentinel_agent::alerts::{ChannelError, NotificationChannel};
use sentinel_agent::identity::Credential;
use sentinel_agent::remote::{PullPage, RemoteError, RemoteStore};
use sentinel_agent::store::LocalEventStore;
use sentinel_engine::{
    Acknowledgement, Coordinate, DeviceId, Geofence, GeofenceSet, LocationReading, Notification,
    PushAck, RecordBody, RemoteChange, RemoteVersion, SampleTime, SequenceNumber, SyncRecord,
    TriggerKind,
};
use tempfile::TempDir;

/// Fixed base time: 2024-02-01T00:00:00Z.
pub const T0: u64 = 1_706_745_600_000;

pub const HOME: Coordinate = Coordinate {
    latitude: 52.5200,
    longitude: 13.4050,
};

pub async fn temp_store(dir: &TempDir, max_records: Option<u64>) -> Arc<LocalEventStore> {
    let url = format!("sqlite://{}", dir.path().join("agent.db").display());
    Arc::new(LocalEventStore::open(&url, max_records).await.unwrap())
}

pub fn home_fences() -> GeofenceSet {
    GeofenceSet::new()
        .with_fence(Geofence::new("home", HOME, 100.0, TriggerKind::Enter).with_label("Home"))
        .unwrap()
        .with_fence(Geofence::new("home-exit", HOME, 100.0, TriggerKind::Exit).with_label("Home"))
        .unwrap()
}

/// A reading `meters_north` of home, `secs` after [`T0`].
pub fn reading(device: &str, secs: u64, meters_north: f64, accuracy: f64) -> LocationReading {
    let latitude = HOME.latitude + meters_north / 111_320.0;
    LocationReading::new(
        device,
        SampleTime::new(secs * 1_000, T0 + secs * 1_000),
        latitude,
        HOME.longitude,
        accuracy,
    )
}

pub fn credential() -> Credential {
    Credential::new("alice", "token-1")
}

/// How the in-memory remote store misbehaves.
#[derive(Debug, Default, Clone)]
pub struct Behavior {
    pub offline: bool,
    pub unauthorized: bool,
    /// Acknowledge at most this many records per push, then report an error
    pub ack_limit: Option<usize>,
    /// Sequences the remote refuses; a batch containing one is rejected whole
    pub poisoned: HashSet<SequenceNumber>,
    /// Stall every pull this long before answering
    pub pull_delay: Option<Duration>,
    /// Stall every push this long before answering
    pub push_delay: Option<Duration>,
}

#[derive(Default)]
struct RemoteState {
    behavior: Behavior,
    changes: Vec<RemoteChange>,
    remote_ids: HashMap<(DeviceId, SequenceNumber), String>,
    pushes: Vec<Vec<SequenceNumber>>,
    pulls: Vec<RemoteVersion>,
}

/// In-memory remote store.
#[derive(Default)]
pub struct MemoryRemote {
    state: Mutex<RemoteState>,
}

impl MemoryRemote {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_behavior(&self, behavior: Behavior) {
        self.state.lock().unwrap().behavior = behavior;
    }

    pub fn go_offline(&self) {
        self.state.lock().unwrap().behavior.offline = true;
    }

    pub fn go_online(&self) {
        self.state.lock().unwrap().behavior.offline = false;
    }

    /// Insert a change as if another device had pushed it.
    pub fn inject(&self, body: RecordBody) -> RemoteVersion {
        let mut state = self.state.lock().unwrap();
        let version = state.changes.len() as u64 + 1;
        state.changes.push(RemoteChange {
            version,
            remote_id: format!("remote-{version}"),
            body,
        });
        version
    }

    /// Sequences stored for a device, in the order they arrived.
    pub fn stored_sequences(&self, device: &str) -> Vec<SequenceNumber> {
        let state = self.state.lock().unwrap();
        state
            .changes
            .iter()
            .filter_map(|c| match &c.body {
                RecordBody::Sample(s) if s.device_id == device => Some(s.sequence_number),
                _ => None,
            })
            .collect()
    }

    pub fn stored_count(&self) -> usize {
        self.state.lock().unwrap().remote_ids.len()
    }

    /// Sequences of every push call, in order.
    pub fn pushes(&self) -> Vec<Vec<SequenceNumber>> {
        self.state.lock().unwrap().pushes.clone()
    }

    /// The `since` version of every answered pull, in order.
    pub fn pulls(&self) -> Vec<RemoteVersion> {
        self.state.lock().unwrap().pulls.clone()
    }

    fn behavior(&self) -> Behavior {
        self.state.lock().unwrap().behavior.clone()
    }
}

#[async_trait]
impl RemoteStore for MemoryRemote {
    async fn pull(
        &self,
        _credential: &Credential,
        since: RemoteVersion,
        limit: u32,
    ) -> Result<PullPage, RemoteError> {
        if let Some(delay) = self.behavior().pull_delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state.lock().unwrap();
        if state.behavior.offline {
            return Err(RemoteError::Transient("offline".into()));
        }
        if state.behavior.unauthorized {
            return Err(RemoteError::Unauthenticated("token revoked".into()));
        }
        state.pulls.push(since);
        let newer: Vec<_> = state
            .changes
            .iter()
            .filter(|c| c.version > since)
            .cloned()
            .collect();
        let has_more = newer.len() > limit as usize;
        Ok(PullPage {
            changes: newer.into_iter().take(limit as usize).collect(),
            has_more,
        })
    }

    async fn push(
        &self,
        _credential: &Credential,
        device_id: &str,
        batch: &[SyncRecord],
    ) -> Result<PushAck, RemoteError> {
        if let Some(delay) = self.behavior().push_delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state.lock().unwrap();
        if state.behavior.offline {
            return Err(RemoteError::Transient("offline".into()));
        }
        if state.behavior.unauthorized {
            return Err(RemoteError::Unauthenticated("token revoked".into()));
        }
        state
            .pushes
            .push(batch.iter().map(|r| r.sequence).collect());

        if batch
            .iter()
            .any(|r| state.behavior.poisoned.contains(&r.sequence))
        {
            return Err(RemoteError::Rejected("payload failed validation".into()));
        }

        let limit = state.behavior.ack_limit.unwrap_or(usize::MAX);
        let mut ack = PushAck::default();
        for record in batch.iter().take(limit) {
            let key = (device_id.to_string(), record.sequence);
            let remote_id = match state.remote_ids.get(&key) {
                Some(id) => id.clone(),
                None => {
                    let version = state.changes.len() as u64 + 1;
                    let id = format!("{device_id}-{}", record.sequence);
                    state.changes.push(RemoteChange {
                        version,
                        remote_id: id.clone(),
                        body: record.body.clone(),
                    });
                    state.remote_ids.insert(key, id.clone());
                    id
                }
            };
            ack.acknowledged.push(Acknowledgement {
                local_id: record.local_id,
                remote_id,
            });
        }
        if batch.len() > limit {
            ack.error = Some("connection reset mid-batch".into());
        }
        Ok(ack)
    }

    async fn probe(&self) -> Result<(), RemoteError> {
        if self.state.lock().unwrap().behavior.offline {
            Err(RemoteError::Transient("offline".into()))
        } else {
            Ok(())
        }
    }
}

/// Records every notification; optionally fails the first few deliveries.
#[derive(Default)]
pub struct RecordingChannel {
    delivered: Mutex<Vec<Notification>>,
    failures_left: AtomicU32,
    attempts: AtomicU32,
}

impl RecordingChannel {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing(times: u32) -> Arc<Self> {
        let channel = Self::default();
        channel.failures_left.store(times, Ordering::SeqCst);
        Arc::new(channel)
    }

    pub fn delivered(&self) -> Vec<Notification> {
        self.delivered.lock().unwrap().clone()
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NotificationChannel for RecordingChannel {
    async fn deliver(&self, notification: &Notification) -> Result<(), ChannelError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let failed = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(ChannelError::Unavailable("push gateway down".into()));
        }
        self.delivered.lock().unwrap().push(notification.clone());
        Ok(())
    }
}
