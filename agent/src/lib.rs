//! Sentinel Agent - device-side sync and alerting runtime.
//!
//! Wires the pure `sentinel-engine` core to the outside world: a SQLite
//! event log, one sync worker per device talking to the remote store, an
//! alert dispatcher feeding a notification channel, and a local HTTP
//! control API for the location provider and the host application.

pub mod alerts;
pub mod config;
pub mod error;
pub mod identity;
pub mod ingest;
pub mod remote;
pub mod routes;
pub mod store;
pub mod summary;
pub mod sync;

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use rand::Rng;
use sentinel_engine::{GeofenceSet, Timestamp};
use tokio::sync::watch;
use tokio::task::JoinSet;

use crate::alerts::{AlertDispatcher, DispatcherHandle, NotificationChannel};
use crate::config::Config;
use crate::identity::StaticIdentity;
use crate::ingest::{IngestError, Ingestor};
use crate::remote::RemoteStore;
use crate::store::{AlertHistory, LocalEventStore};
use crate::summary::Summarizer;
use crate::sync::{DeviceRegistry, SyncWorker};

/// How often held volume buttons are checked for long presses.
const GESTURE_TICK: Duration = Duration::from_millis(250);

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<LocalEventStore>,
    pub history: AlertHistory,
    pub registry: Arc<DeviceRegistry>,
    pub ingestor: Arc<Ingestor>,
    pub alerts: DispatcherHandle,
    pub identity: Arc<StaticIdentity>,
}

/// Wall-clock milliseconds since the Unix epoch.
pub fn now_ms() -> Timestamp {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

/// A jitter sample in `[0, 1)` for backoff delays.
pub(crate) fn jitter_sample() -> f64 {
    rand::rng().random()
}

/// The collaborators an agent is started with.
pub struct AgentParts {
    pub remote: Arc<dyn RemoteStore>,
    pub channel: Arc<dyn NotificationChannel>,
    pub summarizer: Option<Arc<dyn Summarizer>>,
    pub geofences: GeofenceSet,
}

/// A running agent: workers, dispatcher and housekeeping tasks.
pub struct Agent {
    state: AppState,
    shutdown: watch::Sender<bool>,
    tasks: JoinSet<()>,
}

impl Agent {
    /// Recover every device's evaluator state, then start the background
    /// tasks.
    pub async fn start(
        config: &Config,
        store: Arc<LocalEventStore>,
        parts: AgentParts,
    ) -> Result<Self, IngestError> {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let mut tasks = JoinSet::new();

        let identity = Arc::new(StaticIdentity::new(config.credential()));
        let registry = DeviceRegistry::new_shared(&config.device_ids);
        let history = AlertHistory::new(store.pool().clone());
        let geofences = Arc::new(parts.geofences);

        let (dispatcher, alerts) = AlertDispatcher::new(
            config.dispatcher(),
            parts.channel,
            history.clone(),
            geofences.clone(),
            parts.summarizer,
        );
        tasks.spawn(dispatcher.run(shutdown_rx.clone()));

        let ingestor = Arc::new(Ingestor::new(
            store.clone(),
            registry.clone(),
            geofences,
            config.evaluator(),
            alerts.clone(),
        ));
        for device_id in registry.device_ids() {
            ingestor.recover(&device_id).await?;
        }

        for handle in registry.handles() {
            let worker = SyncWorker::new(
                config.worker(),
                store.clone(),
                parts.remote.clone(),
                identity.clone(),
                alerts.clone(),
                handle,
            );
            tasks.spawn(worker.run(shutdown_rx.clone()));
        }

        tasks.spawn(prune_task(
            store.clone(),
            registry.clone(),
            config.retention,
            config.prune_interval,
            shutdown_rx.clone(),
        ));
        tasks.spawn(gesture_task(registry.clone(), alerts.clone(), shutdown_rx));

        tracing::info!(devices = registry.len(), "Agent started");

        Ok(Self {
            state: AppState {
                store,
                history,
                registry,
                ingestor,
                alerts,
                identity,
            },
            shutdown,
            tasks,
        })
    }

    pub fn state(&self) -> AppState {
        self.state.clone()
    }

    /// The control API.
    pub fn router(&self) -> Router {
        routes::create_routes().with_state(self.state.clone())
    }

    /// Signal every task to stop and wait for them.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        while let Some(joined) = self.tasks.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "Agent task failed");
            }
        }
        tracing::info!("Agent stopped");
    }
}

/// Apply the retention policy periodically. A prune that frees space
/// resumes paused ingestion.
async fn prune_task(
    store: Arc<LocalEventStore>,
    registry: Arc<DeviceRegistry>,
    retention: Duration,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(every.max(Duration::from_secs(1)));
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => break,
        }

        let cutoff = now_ms().saturating_sub(retention.as_millis() as u64);
        match store.prune(cutoff, true).await {
            Ok(0) => {}
            Ok(_) => {
                for handle in registry.handles() {
                    handle.resume_ingestion();
                }
            }
            Err(e) => tracing::error!(error = %e, "Prune failed"),
        }
    }
}

/// Lets volume-button long presses fire while the buttons are held.
async fn gesture_task(
    registry: Arc<DeviceRegistry>,
    alerts: DispatcherHandle,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(GESTURE_TICK);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => break,
        }

        let now = now_ms();
        for handle in registry.handles() {
            if let Some(trigger) = handle.volume_tick(now) {
                alerts.on_safety_trigger(handle.device_id(), trigger, handle.last_location(), now);
            }
        }
    }
}
