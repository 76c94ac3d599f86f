//! Liveness and a per-device readiness summary.

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use serde::Serialize;

use sentinel_engine::{DeviceId, SyncPhase};

use crate::AppState;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    /// `ok`, or `degraded` when a device needs attention from the host
    pub status: &'static str,
    pub version: &'static str,
    pub store_reachable: bool,
    pub devices: Vec<DeviceHealth>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceHealth {
    pub device_id: DeviceId,
    pub phase: SyncPhase,
    pub failures: u32,
    pub ingestion_paused: bool,
}

impl DeviceHealth {
    /// Conditions that need the host application: a refreshed credential
    /// or freed storage.
    fn needs_attention(&self) -> bool {
        self.phase == SyncPhase::Unauthenticated || self.ingestion_paused
    }
}

pub fn routes() -> Router<AppState> {
    Router::new().route("/health", get(health))
}

/// GET /health - 200 while the store answers, 503 otherwise.
async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthReport>) {
    let store_reachable = sqlx::query("SELECT 1")
        .execute(state.store.pool())
        .await
        .is_ok();

    let devices: Vec<DeviceHealth> = state
        .registry
        .handles()
        .into_iter()
        .map(|handle| {
            let sync = handle.status();
            DeviceHealth {
                device_id: handle.device_id().clone(),
                phase: sync.phase,
                failures: sync.failures,
                ingestion_paused: sync.ingestion_paused.is_some(),
            }
        })
        .collect();

    let status = if devices.iter().any(DeviceHealth::needs_attention) {
        "degraded"
    } else {
        "ok"
    };
    let code = if store_reachable {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        code,
        Json(HealthReport {
            status,
            version: env!("CARGO_PKG_VERSION"),
            store_reachable,
            devices,
        }),
    )
}
