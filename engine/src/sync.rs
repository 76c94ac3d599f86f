//! Per-device sync state machine and push batch bookkeeping.
//!
//! ```text
//!            trigger           pulled            reconciled
//!   Idle ───────────► Pulling ───────► Reconciling ─────────► Pushing
//!    ▲                   │                                      │
//!    │                   │ failure                      pushed  │
//!    │                   ▼                                      │
//!    ├──────────────── Backoff ◄────────────────── failure ─────┤
//!    │   elapsed                                                │
//!    └──────────────────────────────────────────────────────────┘
//!
//!   any stage ── auth failure ──► Unauthenticated ── reauthenticated ──► Idle
//! ```
//!
//! The machine holds no global state: one instance per device, driven by
//! explicit inputs, so every transition is testable as an input/output pair.

use crate::{
    error::Result, DeviceId, Error, LocalId, RemoteId, SequenceNumber, SyncRecord,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Where a device's sync cycle currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncPhase {
    Idle,
    Pulling,
    Reconciling,
    Pushing,
    Backoff,
    /// Terminal until credentials are refreshed
    Unauthenticated,
}

impl SyncPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Pulling => "pulling",
            Self::Reconciling => "reconciling",
            Self::Pushing => "pushing",
            Self::Backoff => "backoff",
            Self::Unauthenticated => "unauthenticated",
        }
    }
}

impl std::fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What started a sync cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncTrigger {
    ConnectivityRegained,
    TimerTick,
    FlushRequested,
}

impl SyncTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConnectivityRegained => "connectivity_regained",
            Self::TimerTick => "timer_tick",
            Self::FlushRequested => "flush_requested",
        }
    }
}

/// Why a network stage failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageFailure {
    /// Network error or timeout
    Transient(String),
    /// Credential rejected or expired
    Unauthenticated(String),
}

impl StageFailure {
    pub fn message(&self) -> &str {
        match self {
            Self::Transient(m) | Self::Unauthenticated(m) => m,
        }
    }
}

/// The sync state machine for one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncMachine {
    device_id: DeviceId,
    phase: SyncPhase,
    /// Consecutive failed cycles; drives backoff
    failures: u32,
    last_failure: Option<String>,
}

impl SyncMachine {
    pub fn new(device_id: impl Into<DeviceId>) -> Self {
        Self {
            device_id: device_id.into(),
            phase: SyncPhase::Idle,
            failures: 0,
            last_failure: None,
        }
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    pub fn phase(&self) -> SyncPhase {
        self.phase
    }

    /// Consecutive failures since the last successful cycle.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn last_failure(&self) -> Option<&str> {
        self.last_failure.as_deref()
    }

    /// `Idle → Pulling`.
    pub fn begin(&mut self, trigger: SyncTrigger) -> Result<SyncPhase> {
        self.expect(SyncPhase::Idle, trigger.as_str())?;
        self.phase = SyncPhase::Pulling;
        Ok(self.phase)
    }

    /// `Pulling → Reconciling`.
    pub fn pulled(&mut self) -> Result<SyncPhase> {
        self.expect(SyncPhase::Pulling, "pulled")?;
        self.phase = SyncPhase::Reconciling;
        Ok(self.phase)
    }

    /// `Reconciling → Pushing`.
    pub fn reconciled(&mut self) -> Result<SyncPhase> {
        self.expect(SyncPhase::Reconciling, "reconciled")?;
        self.phase = SyncPhase::Pushing;
        Ok(self.phase)
    }

    /// `Pushing → Idle`. Resets the failure count.
    pub fn pushed(&mut self) -> Result<SyncPhase> {
        self.expect(SyncPhase::Pushing, "pushed")?;
        self.phase = SyncPhase::Idle;
        self.failures = 0;
        self.last_failure = None;
        Ok(self.phase)
    }

    /// A network stage failed. Transient failures go to `Backoff`,
    /// authentication failures to `Unauthenticated`.
    pub fn fail(&mut self, failure: StageFailure) -> Result<SyncPhase> {
        if !matches!(
            self.phase,
            SyncPhase::Pulling | SyncPhase::Reconciling | SyncPhase::Pushing
        ) {
            return Err(self.illegal("failure"));
        }
        self.last_failure = Some(failure.message().to_string());
        self.phase = match failure {
            StageFailure::Transient(_) => {
                self.failures = self.failures.saturating_add(1);
                SyncPhase::Backoff
            }
            StageFailure::Unauthenticated(_) => SyncPhase::Unauthenticated,
        };
        Ok(self.phase)
    }

    /// `Backoff → Idle`, after the wait elapsed or was cut short.
    pub fn backoff_elapsed(&mut self) -> Result<SyncPhase> {
        self.expect(SyncPhase::Backoff, "backoff_elapsed")?;
        self.phase = SyncPhase::Idle;
        Ok(self.phase)
    }

    /// `Unauthenticated → Idle` once the identity provider has refreshed
    /// credentials.
    pub fn reauthenticated(&mut self) -> Result<SyncPhase> {
        self.expect(SyncPhase::Unauthenticated, "reauthenticated")?;
        self.phase = SyncPhase::Idle;
        self.failures = 0;
        self.last_failure = None;
        Ok(self.phase)
    }

    fn expect(&self, phase: SyncPhase, event: &str) -> Result<()> {
        if self.phase == phase {
            Ok(())
        } else {
            Err(self.illegal(event))
        }
    }

    fn illegal(&self, event: &str) -> Error {
        Error::IllegalSyncTransition {
            from: self.phase.to_string(),
            event: event.to_string(),
        }
    }
}

/// Remote acknowledgement of one record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Acknowledgement {
    pub local_id: LocalId,
    pub remote_id: RemoteId,
}

/// Remote refusal of one record (schema mismatch, poisoned payload).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rejection {
    pub local_id: LocalId,
    pub reason: String,
}

/// Response to a pushed batch. `error` may be set while some records were
/// still acknowledged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushAck {
    #[serde(default)]
    pub acknowledged: Vec<Acknowledgement>,
    #[serde(default)]
    pub rejected: Vec<Rejection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// What to commit locally for a pushed batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchCommit {
    /// (local id, remote id, sequence) to mark Synced
    pub synced: Vec<(LocalId, RemoteId, SequenceNumber)>,
    /// (local id, reason) to mark Failed
    pub failed: Vec<(LocalId, String)>,
    /// Neither acknowledged nor rejected; stay Pending
    pub unresolved: Vec<LocalId>,
}

impl BatchCommit {
    pub fn is_complete(&self) -> bool {
        self.unresolved.is_empty()
    }

    pub fn highest_synced(&self) -> Option<SequenceNumber> {
        self.synced.iter().map(|(_, _, seq)| *seq).max()
    }
}

/// Work out which records of a pushed batch are resolved.
///
/// Acknowledged records are committed even when the batch as a whole
/// reported an error. Acknowledgements for ids outside the batch, or for
/// records that are no longer pending, are ignored.
pub fn commit_batch(batch: &[SyncRecord], ack: &PushAck) -> BatchCommit {
    let acked: HashMap<LocalId, &RemoteId> = ack
        .acknowledged
        .iter()
        .map(|a| (a.local_id, &a.remote_id))
        .collect();
    let rejected: HashMap<LocalId, &str> = ack
        .rejected
        .iter()
        .map(|r| (r.local_id, r.reason.as_str()))
        .collect();

    let mut commit = BatchCommit::default();
    for record in batch.iter().filter(|r| r.is_pending()) {
        if let Some(remote_id) = acked.get(&record.local_id) {
            commit
                .synced
                .push((record.local_id, (*remote_id).clone(), record.sequence));
        } else if let Some(reason) = rejected.get(&record.local_id) {
            commit.failed.push((record.local_id, (*reason).to_string()));
        } else {
            commit.unresolved.push(record.local_id);
        }
    }
    commit
}
