//! Sample ingestion: append, evaluate, append derived transitions, alert.
//!
//! Evaluation runs synchronously on the append path. Samples for one
//! device are ingested one at a time; devices proceed independently.

use std::sync::Arc;

use dashmap::DashMap;
use sentinel_engine::{
    evaluate, DeviceId, ErrorClass, EvaluatorConfig, EvaluatorState, GeofenceSet,
    LocationReading, LocationSample, SequenceNumber, TransitionEvent,
};
use serde::Serialize;
use tokio::sync::Mutex;

use crate::alerts::DispatcherHandle;
use crate::store::{LocalEventStore, NewEntry, StoreError};
use crate::sync::DeviceRegistry;

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("unknown device '{0}'")]
    UnknownDevice(DeviceId),

    #[error("ingestion paused for '{device_id}': {reason}")]
    Paused { device_id: DeviceId, reason: String },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Engine(#[from] sentinel_engine::Error),
}

impl IngestError {
    /// `None` for an unknown device, which is a caller mistake rather than
    /// a pipeline failure.
    pub fn class(&self) -> Option<ErrorClass> {
        match self {
            IngestError::UnknownDevice(_) => None,
            IngestError::Paused { .. } => Some(ErrorClass::ResourceExhausted),
            IngestError::Store(e) => Some(e.class()),
            IngestError::Engine(e) => Some(e.class()),
        }
    }
}

/// Result of ingesting one reading.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Ingested {
    pub local_id: u64,
    pub sequence: SequenceNumber,
    pub low_confidence: bool,
    pub transitions: Vec<TransitionEvent>,
    /// Provisional transitions undone by this sample
    pub retracted: usize,
}

pub struct Ingestor {
    store: Arc<LocalEventStore>,
    registry: Arc<DeviceRegistry>,
    geofences: Arc<GeofenceSet>,
    config: EvaluatorConfig,
    alerts: DispatcherHandle,
    /// Evaluator state per device; `None` until recovered
    states: DashMap<DeviceId, Arc<Mutex<Option<EvaluatorState>>>>,
}

impl Ingestor {
    pub fn new(
        store: Arc<LocalEventStore>,
        registry: Arc<DeviceRegistry>,
        geofences: Arc<GeofenceSet>,
        config: EvaluatorConfig,
        alerts: DispatcherHandle,
    ) -> Self {
        Self {
            store,
            registry,
            geofences,
            config,
            alerts,
            states: DashMap::new(),
        }
    }

    fn slot(&self, device_id: &str) -> Arc<Mutex<Option<EvaluatorState>>> {
        self.states
            .entry(device_id.to_string())
            .or_default()
            .clone()
    }

    /// Append a reading, evaluate it and persist what it derived.
    pub async fn ingest(&self, reading: LocationReading) -> Result<Ingested, IngestError> {
        let device_id = reading.device_id.clone();
        let handle = self
            .registry
            .get(&device_id)
            .ok_or_else(|| IngestError::UnknownDevice(device_id.clone()))?;
        if handle.is_paused() {
            return Err(IngestError::Paused {
                reason: handle.pause_reason().unwrap_or_default(),
                device_id,
            });
        }

        let slot = self.slot(&device_id);
        let mut state = slot.lock().await;
        if state.is_none() {
            *state = Some(self.replay(&device_id).await?);
        }

        let appended = match self.store.append(&device_id, NewEntry::Reading(reading)).await {
            Ok(appended) => appended,
            Err(StoreError::StorageFull(reason)) => {
                handle.pause_ingestion(&reason);
                return Err(StoreError::StorageFull(reason).into());
            }
            Err(e) => return Err(e.into()),
        };
        let Some(sample) = appended.record.body.as_sample() else {
            return Err(StoreError::CorruptionDetected(format!(
                "record {} was appended as a sample but is not one",
                appended.local_id
            ))
            .into());
        };
        handle.set_last_location(sample.coordinate());

        let prior = state.take().unwrap_or_default();
        let (next, transitions, low_confidence, retracted) =
            match self.evaluate_and_persist(&device_id, sample, &prior).await {
                Ok(result) => result,
                Err(e) => {
                    // The sample is durable; replay picks it up on the next call
                    *state = None;
                    return Err(e);
                }
            };
        *state = Some(next);

        if !transitions.is_empty() {
            handle.request_flush();
        }

        Ok(Ingested {
            local_id: appended.local_id,
            sequence: appended.sequence,
            low_confidence,
            transitions,
            retracted,
        })
    }

    async fn evaluate_and_persist(
        &self,
        device_id: &str,
        sample: &LocationSample,
        prior: &EvaluatorState,
    ) -> Result<(EvaluatorState, Vec<TransitionEvent>, bool, usize), IngestError> {
        let evaluation = evaluate(sample, prior, &self.geofences, &self.config)?;
        if evaluation.low_confidence {
            tracing::debug!(
                device_id = %device_id,
                sequence = sample.sequence_number,
                accuracy_m = sample.accuracy_meters,
                "Low-confidence sample"
            );
        }

        let appended = self.store.append_derived(device_id, &evaluation).await?;
        let transitions: Vec<TransitionEvent> = appended
            .into_iter()
            .filter_map(|a| a.record.body.as_transition().cloned())
            .collect();
        for event in &transitions {
            tracing::info!(
                device_id = %device_id,
                geofence_id = %event.geofence_id,
                kind = %event.kind,
                confidence = ?event.confidence,
                "Geofence transition"
            );
            self.alerts.on_transition(event.clone());
        }

        Ok((
            evaluation.new_state,
            transitions,
            evaluation.low_confidence,
            evaluation.retracted.len(),
        ))
    }

    /// Rebuild a device's evaluator state: load the last persisted state and
    /// re-evaluate every sample appended after it. Evaluation is
    /// deterministic, so samples whose derived records were lost in a crash
    /// produce the same transitions again.
    pub async fn recover(&self, device_id: &str) -> Result<(), IngestError> {
        let slot = self.slot(device_id);
        let mut state = slot.lock().await;
        *state = Some(self.replay(device_id).await?);
        Ok(())
    }

    async fn replay(&self, device_id: &str) -> Result<EvaluatorState, IngestError> {
        let mut state = self
            .store
            .load_evaluator_state(device_id)
            .await?
            .unwrap_or_default();

        let after = state.last_sequence.unwrap_or(0);
        let mut cursor = self.store.read_since(device_id, after).await?;
        let mut replayed = 0usize;
        while let Some(record) = cursor.next().await? {
            let Some(sample) = record.body.as_sample() else {
                continue;
            };
            let (next, _, _, _) = self.evaluate_and_persist(device_id, sample, &state).await?;
            state = next;
            replayed += 1;
        }

        if replayed > 0 {
            tracing::info!(device_id = %device_id, replayed, "Replayed unevaluated samples");
        }
        Ok(state)
    }

    /// Accept samples again after a pause. Returns whether ingestion was
    /// paused.
    pub fn resume(&self, device_id: &str) -> Result<bool, IngestError> {
        let handle = self
            .registry
            .get(device_id)
            .ok_or_else(|| IngestError::UnknownDevice(device_id.to_string()))?;
        Ok(handle.resume_ingestion())
    }
}
