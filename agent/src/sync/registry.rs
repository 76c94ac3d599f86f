//! Device registry.
//!
//! Tracks the devices this agent syncs for. Each device has one
//! [`DeviceHandle`] shared by its sync worker, the ingestor and the control
//! API: signals flow in through it, status flows out.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use sentinel_engine::{
    Coordinate, DeviceId, SafetyTrigger, ShakeConfig, ShakeDetector, SyncPhase, Timestamp,
    VolumeButton, VolumeGestureConfig, VolumeGestureDetector,
};
use serde::Serialize;
use tokio::sync::{watch, Notify};

/// Observable sync status of one device.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub phase: SyncPhase,
    /// Consecutive failed cycles
    pub failures: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_synced_at: Option<Timestamp>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ingestion_paused: Option<String>,
}

impl Default for SyncStatus {
    fn default() -> Self {
        Self {
            phase: SyncPhase::Idle,
            failures: 0,
            last_error: None,
            last_synced_at: None,
            ingestion_paused: None,
        }
    }
}

/// Everything shared about one device.
#[derive(Debug)]
pub struct DeviceHandle {
    device_id: DeviceId,
    flush: Notify,
    connectivity: Notify,
    status: watch::Sender<SyncStatus>,
    paused: AtomicBool,
    last_location: Mutex<Option<Coordinate>>,
    shake: Mutex<ShakeDetector>,
    volume: Mutex<VolumeGestureDetector>,
}

impl DeviceHandle {
    pub fn new(device_id: impl Into<DeviceId>) -> Self {
        let (status, _) = watch::channel(SyncStatus::default());
        Self {
            device_id: device_id.into(),
            flush: Notify::new(),
            connectivity: Notify::new(),
            status,
            paused: AtomicBool::new(false),
            last_location: Mutex::new(None),
            shake: Mutex::new(ShakeDetector::new(ShakeConfig::default())),
            volume: Mutex::new(VolumeGestureDetector::new(VolumeGestureConfig::default())),
        }
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    /// Ask the worker for a sync cycle. A request made while a cycle is
    /// running is kept for the next wait.
    pub fn request_flush(&self) {
        self.flush.notify_one();
    }

    pub async fn flush_requested(&self) {
        self.flush.notified().await
    }

    /// Connectivity came back; cuts a backoff wait short.
    pub fn notify_connectivity(&self) {
        tracing::debug!(device_id = %self.device_id, "Connectivity regained");
        self.connectivity.notify_one();
    }

    pub async fn connectivity_regained(&self) {
        self.connectivity.notified().await
    }

    pub fn status(&self) -> SyncStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SyncStatus> {
        self.status.subscribe()
    }

    pub fn update_status(&self, f: impl FnOnce(&mut SyncStatus)) {
        self.status.send_modify(f);
    }

    /// Stop accepting samples, e.g. after the store reported it is full.
    pub fn pause_ingestion(&self, reason: &str) {
        if !self.paused.swap(true, Ordering::SeqCst) {
            tracing::warn!(device_id = %self.device_id, reason, "Ingestion paused");
        }
        let reason = reason.to_string();
        self.update_status(|s| s.ingestion_paused = Some(reason));
    }

    /// Returns whether ingestion was paused.
    pub fn resume_ingestion(&self) -> bool {
        let was_paused = self.paused.swap(false, Ordering::SeqCst);
        if was_paused {
            tracing::info!(device_id = %self.device_id, "Ingestion resumed");
            self.update_status(|s| s.ingestion_paused = None);
        }
        was_paused
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn pause_reason(&self) -> Option<String> {
        self.status.borrow().ingestion_paused.clone()
    }

    pub fn set_last_location(&self, location: Coordinate) {
        *self.last_location.lock().unwrap_or_else(|e| e.into_inner()) = Some(location);
    }

    pub fn last_location(&self) -> Option<Coordinate> {
        *self.last_location.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn on_acceleration(&self, x: f64, y: f64, z: f64, at: Timestamp) -> Option<SafetyTrigger> {
        self.shake
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .on_acceleration(x, y, z, at)
    }

    pub fn on_volume(&self, button: VolumeButton, pressed: bool, at: Timestamp) -> Option<SafetyTrigger> {
        let mut volume = self.volume.lock().unwrap_or_else(|e| e.into_inner());
        if pressed {
            volume.on_press(button, at)
        } else {
            volume.on_release(button, at)
        }
    }

    /// Lets long presses fire while the buttons are still held.
    pub fn volume_tick(&self, now: Timestamp) -> Option<SafetyTrigger> {
        self.volume
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .on_tick(now)
    }
}

/// All devices known to this agent.
///
/// Thread-safe and can be shared across handlers via `Arc`.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: DashMap<DeviceId, Arc<DeviceHandle>>,
}

impl DeviceRegistry {
    pub fn new(device_ids: &[DeviceId]) -> Self {
        let registry = Self::default();
        for id in device_ids {
            registry.register(id.clone());
        }
        registry
    }

    /// Wrapped in Arc for sharing.
    pub fn new_shared(device_ids: &[DeviceId]) -> Arc<Self> {
        Arc::new(Self::new(device_ids))
    }

    /// Register a device, returning the existing handle if already known.
    pub fn register(&self, device_id: DeviceId) -> Arc<DeviceHandle> {
        self.devices
            .entry(device_id.clone())
            .or_insert_with(|| {
                tracing::info!(device_id = %device_id, "Device registered");
                Arc::new(DeviceHandle::new(device_id.clone()))
            })
            .clone()
    }

    pub fn get(&self, device_id: &str) -> Option<Arc<DeviceHandle>> {
        self.devices.get(device_id).map(|h| h.value().clone())
    }

    /// Device ids in sorted order.
    pub fn device_ids(&self) -> Vec<DeviceId> {
        let mut ids: Vec<_> = self.devices.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn handles(&self) -> Vec<Arc<DeviceHandle>> {
        self.devices.iter().map(|e| e.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_is_idempotent() {
        let registry = DeviceRegistry::new(&["phone".to_string()]);
        let a = registry.register("phone".into());
        let b = registry.get("phone").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);
        assert!(registry.get("tablet").is_none());
    }

    #[test]
    fn pause_and_resume() {
        let handle = DeviceHandle::new("phone");
        handle.pause_ingestion("disk full");
        assert!(handle.is_paused());
        assert_eq!(handle.status().ingestion_paused.as_deref(), Some("disk full"));

        assert!(handle.resume_ingestion());
        assert!(!handle.resume_ingestion());
        assert!(handle.status().ingestion_paused.is_none());
    }

    #[tokio::test]
    async fn flush_request_is_kept_until_awaited() {
        let handle = DeviceHandle::new("phone");
        handle.request_flush();
        tokio::time::timeout(std::time::Duration::from_millis(100), handle.flush_requested())
            .await
            .unwrap();
    }
}
