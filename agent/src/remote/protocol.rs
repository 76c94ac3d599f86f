//! Wire types for the remote store's HTTP API.
//!
//! All bodies are JSON with camelCase field names.

use sentinel_engine::{
    LocalId, RecordBody, RemoteChange, RemoteVersion, SequenceNumber, SyncRecord,
};
use serde::{Deserialize, Serialize};

/// Query for `GET /changes`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullQuery {
    /// Highest version already applied (0 for initial sync)
    pub since: RemoteVersion,
    pub limit: u32,
}

/// Response for `GET /changes`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullResponse {
    #[serde(default)]
    pub changes: Vec<RemoteChange>,
    /// Whether there are more changes to fetch
    #[serde(default)]
    pub has_more: bool,
}

/// One record in a push.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushedRecord {
    pub local_id: LocalId,
    pub sequence: SequenceNumber,
    pub body: RecordBody,
}

impl From<&SyncRecord> for PushedRecord {
    fn from(record: &SyncRecord) -> Self {
        Self {
            local_id: record.local_id,
            sequence: record.sequence,
            body: record.body.clone(),
        }
    }
}

/// Request body for `POST /devices/{id}/records`. The response is a
/// [`sentinel_engine::PushAck`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushRequest {
    pub device_id: String,
    pub records: Vec<PushedRecord>,
}

/// Error body the remote store may send with a non-success status.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RemoteErrorBody {
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub details: Option<String>,
}

impl RemoteErrorBody {
    pub fn message(&self) -> String {
        match &self.details {
            Some(details) if !self.error.is_empty() => format!("{}: {details}", self.error),
            Some(details) => details.clone(),
            None => self.error.clone(),
        }
    }
}
