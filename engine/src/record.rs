//! Sync records: the unit of local persistence and remote push.

use crate::{
    error::Result, DeviceId, Error, LocalId, LocationSample, RemoteId, SequenceNumber, Timestamp,
    TransitionEvent,
};
use serde::{Deserialize, Serialize};

/// Lifecycle of a record relative to the remote store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    /// Not yet acknowledged by the remote store
    Pending,
    /// Acknowledged; never re-sent
    Synced,
    /// Lost last-writer-wins to another device; not pushed
    Conflicted,
    /// Poisoned or rejected; isolated from the pipeline
    Failed,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Synced => "synced",
            Self::Conflicted => "conflicted",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "synced" => Some(Self::Synced),
            "conflicted" => Some(Self::Conflicted),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Whether the record no longer participates in pushing.
    pub fn is_resolved(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl std::fmt::Display for SyncState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a record carries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum RecordBody {
    Sample(LocationSample),
    Transition(TransitionEvent),
}

impl RecordBody {
    pub fn device_id(&self) -> &DeviceId {
        match self {
            RecordBody::Sample(s) => &s.device_id,
            RecordBody::Transition(t) => &t.device_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            RecordBody::Sample(_) => "sample",
            RecordBody::Transition(_) => "transition",
        }
    }

    pub fn as_transition(&self) -> Option<&TransitionEvent> {
        match self {
            RecordBody::Transition(t) => Some(t),
            RecordBody::Sample(_) => None,
        }
    }

    pub fn as_sample(&self) -> Option<&LocationSample> {
        match self {
            RecordBody::Sample(s) => Some(s),
            RecordBody::Transition(_) => None,
        }
    }
}

/// A sample or transition with its sync bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRecord {
    pub local_id: LocalId,
    pub device_id: DeviceId,
    /// Per-device log position; equals the sample's sequence number
    pub sequence: SequenceNumber,
    pub body: RecordBody,
    /// Assigned by the remote store on acknowledgement
    pub remote_id: Option<RemoteId>,
    pub sync_state: SyncState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    /// When the record was appended locally (milliseconds since epoch)
    pub recorded_at: Timestamp,
}

impl SyncRecord {
    /// Create a new pending record.
    pub fn pending(
        local_id: LocalId,
        sequence: SequenceNumber,
        body: RecordBody,
        recorded_at: Timestamp,
    ) -> Self {
        Self {
            local_id,
            device_id: body.device_id().clone(),
            sequence,
            body,
            remote_id: None,
            sync_state: SyncState::Pending,
            failure_reason: None,
            recorded_at,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.sync_state == SyncState::Pending
    }

    /// Pending → Synced. Happens exactly once.
    pub fn mark_synced(&mut self, remote_id: impl Into<RemoteId>) -> Result<()> {
        match self.sync_state {
            SyncState::Pending => {
                self.sync_state = SyncState::Synced;
                self.remote_id = Some(remote_id.into());
                Ok(())
            }
            SyncState::Synced => Err(Error::AlreadySynced(self.local_id)),
            other => Err(self.invalid(other, SyncState::Synced)),
        }
    }

    /// Pending → Failed.
    pub fn mark_failed(&mut self, reason: impl Into<String>) -> Result<()> {
        self.resolve(SyncState::Failed, reason.into())
    }

    /// Pending → Conflicted.
    pub fn mark_conflicted(&mut self, reason: impl Into<String>) -> Result<()> {
        self.resolve(SyncState::Conflicted, reason.into())
    }

    fn resolve(&mut self, to: SyncState, reason: String) -> Result<()> {
        if self.sync_state != SyncState::Pending {
            return Err(self.invalid(self.sync_state, to));
        }
        self.sync_state = to;
        self.failure_reason = Some(reason);
        Ok(())
    }

    fn invalid(&self, from: SyncState, to: SyncState) -> Error {
        Error::InvalidStateTransition {
            local_id: self.local_id,
            from: from.to_string(),
            to: to.to_string(),
        }
    }
}
