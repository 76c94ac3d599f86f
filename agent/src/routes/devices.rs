//! Per-device endpoints: sample submission, sync signals, sensors, status.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use sentinel_engine::{
    DeviceId, DeviceSyncCursor, LocationReading, SafetyTrigger, SampleTime, Timestamp,
    VolumeButton,
};

use crate::error::{AppError, Result};
use crate::ingest::Ingested;
use crate::store::RecordCounts;
use crate::sync::{DeviceHandle, SyncStatus};
use crate::{now_ms, AppState};

/// A location fix from the device's location provider.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SampleRequest {
    /// Monotonic clock reading; defaults to the wall clock
    pub monotonic_ms: Option<u64>,
    /// Defaults to the time of receipt
    pub wall_ms: Option<Timestamp>,
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy_meters: f64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccelerationRequest {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub at: Option<Timestamp>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ButtonAction {
    Press,
    Release,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeRequest {
    pub button: VolumeButton,
    pub action: ButtonAction,
    pub at: Option<Timestamp>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SosRequest {
    pub trigger: Option<SafetyTrigger>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GestureResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger: Option<SafetyTrigger>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeResponse {
    pub resumed: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceStatus {
    pub device_id: DeviceId,
    pub sync: SyncStatus,
    pub records: RecordCounts,
    pub cursor: DeviceSyncCursor,
    pub last_sequence: u64,
}

/// Create device routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/devices", get(list_devices))
        .route("/devices/{id}/samples", post(submit_sample))
        .route("/devices/{id}/flush", post(flush))
        .route("/devices/{id}/connectivity", post(connectivity))
        .route("/devices/{id}/resume", post(resume))
        .route("/devices/{id}/status", get(status))
        .route("/devices/{id}/sensors/acceleration", post(acceleration))
        .route("/devices/{id}/sensors/volume", post(volume))
        .route("/devices/{id}/sos", post(sos))
}

fn device(state: &AppState, id: &str) -> Result<Arc<DeviceHandle>> {
    state
        .registry
        .get(id)
        .ok_or_else(|| AppError::NotFound(format!("device '{id}'")))
}

/// GET /devices - Registered device ids.
async fn list_devices(State(state): State<AppState>) -> Json<Vec<DeviceId>> {
    Json(state.registry.device_ids())
}

/// POST /devices/{id}/samples - Append and evaluate a location fix.
async fn submit_sample(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<SampleRequest>,
) -> Result<(StatusCode, Json<Ingested>)> {
    let wall_ms = request.wall_ms.unwrap_or_else(now_ms);
    let reading = LocationReading::new(
        id,
        SampleTime::new(request.monotonic_ms.unwrap_or(wall_ms), wall_ms),
        request.latitude,
        request.longitude,
        request.accuracy_meters,
    );
    let ingested = state.ingestor.ingest(reading).await?;
    Ok((StatusCode::CREATED, Json(ingested)))
}

/// POST /devices/{id}/flush - Ask for a sync cycle now.
async fn flush(State(state): State<AppState>, Path(id): Path<String>) -> Result<StatusCode> {
    device(&state, &id)?.request_flush();
    Ok(StatusCode::ACCEPTED)
}

/// POST /devices/{id}/connectivity - Connectivity regained.
async fn connectivity(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode> {
    device(&state, &id)?.notify_connectivity();
    Ok(StatusCode::ACCEPTED)
}

/// POST /devices/{id}/resume - Accept samples again after a pause.
async fn resume(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ResumeResponse>> {
    let resumed = state.ingestor.resume(&id)?;
    Ok(Json(ResumeResponse { resumed }))
}

/// GET /devices/{id}/status - Sync phase, record counts and cursor.
async fn status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<DeviceStatus>> {
    let handle = device(&state, &id)?;
    let records = state.store.counts(&id).await?;
    let cursor = state.store.load_cursor(&id).await?;
    let last_sequence = state.store.last_sequence(&id).await?;

    Ok(Json(DeviceStatus {
        device_id: id,
        sync: handle.status(),
        records,
        cursor,
        last_sequence,
    }))
}

/// POST /devices/{id}/sensors/acceleration - Feed the shake detector.
async fn acceleration(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<AccelerationRequest>,
) -> Result<Json<GestureResponse>> {
    let handle = device(&state, &id)?;
    let at = request.at.unwrap_or_else(now_ms);
    let trigger = handle.on_acceleration(request.x, request.y, request.z, at);
    if let Some(trigger) = trigger {
        state
            .alerts
            .on_safety_trigger(&id, trigger, handle.last_location(), at);
    }
    Ok(Json(GestureResponse { trigger }))
}

/// POST /devices/{id}/sensors/volume - Feed the volume gesture detector.
async fn volume(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<VolumeRequest>,
) -> Result<Json<GestureResponse>> {
    let handle = device(&state, &id)?;
    let at = request.at.unwrap_or_else(now_ms);
    let pressed = matches!(request.action, ButtonAction::Press);
    let trigger = handle.on_volume(request.button, pressed, at);
    if let Some(trigger) = trigger {
        state
            .alerts
            .on_safety_trigger(&id, trigger, handle.last_location(), at);
    }
    Ok(Json(GestureResponse { trigger }))
}

/// POST /devices/{id}/sos - Explicit emergency from the host app.
async fn sos(
    State(state): State<AppState>,
    Path(id): Path<String>,
    request: Option<Json<SosRequest>>,
) -> Result<(StatusCode, Json<GestureResponse>)> {
    let handle = device(&state, &id)?;
    let trigger = request
        .and_then(|Json(r)| r.trigger)
        .unwrap_or(SafetyTrigger::Sos);
    state
        .alerts
        .on_safety_trigger(&id, trigger, handle.last_location(), now_ms());
    Ok((
        StatusCode::ACCEPTED,
        Json(GestureResponse {
            trigger: Some(trigger),
        }),
    ))
}
