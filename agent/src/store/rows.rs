//! Row types for the sync_records table.

use sentinel_engine::{RecordBody, SyncRecord, SyncState};
use sha2::{Digest, Sha256};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

/// Columns selected for every record read.
pub(crate) const RECORD_COLUMNS: &str = "local_id, device_id, sequence, kind, body, checksum, \
     remote_id, sync_state, failure_reason, recorded_at";

/// A stored record row from the database, not yet verified.
#[derive(Debug)]
pub(crate) struct StoredRecord {
    pub local_id: i64,
    pub device_id: String,
    pub sequence: i64,
    pub kind: String,
    pub body: String,
    pub checksum: String,
    pub remote_id: Option<String>,
    pub sync_state: String,
    pub failure_reason: Option<String>,
    pub recorded_at: i64,
}

impl<'r> sqlx::FromRow<'r, SqliteRow> for StoredRecord {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(StoredRecord {
            local_id: row.try_get("local_id")?,
            device_id: row.try_get("device_id")?,
            sequence: row.try_get("sequence")?,
            kind: row.try_get("kind")?,
            body: row.try_get("body")?,
            checksum: row.try_get("checksum")?,
            remote_id: row.try_get("remote_id")?,
            sync_state: row.try_get("sync_state")?,
            failure_reason: row.try_get("failure_reason")?,
            recorded_at: row.try_get("recorded_at")?,
        })
    }
}

impl StoredRecord {
    /// Verify and decode the row. The error is the reason the row is
    /// considered corrupt.
    pub fn decode(self) -> Result<SyncRecord, String> {
        let expected = checksum(&self.device_id, self.sequence as u64, &self.body);
        if expected != self.checksum {
            return Err(format!("checksum mismatch on record {}", self.local_id));
        }

        let body: RecordBody = serde_json::from_str(&self.body)
            .map_err(|e| format!("undecodable body on record {}: {e}", self.local_id))?;
        if body.kind() != self.kind || body.device_id() != &self.device_id {
            return Err(format!("body does not match row on record {}", self.local_id));
        }

        let sync_state = SyncState::parse(&self.sync_state)
            .ok_or_else(|| format!("unknown sync state '{}'", self.sync_state))?;

        Ok(SyncRecord {
            local_id: self.local_id as u64,
            device_id: self.device_id,
            sequence: self.sequence as u64,
            body,
            remote_id: self.remote_id,
            sync_state,
            failure_reason: self.failure_reason,
            recorded_at: self.recorded_at as u64,
        })
    }
}

/// Checksum over the identity and body of a record.
pub(crate) fn checksum(device_id: &str, sequence: u64, body: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(device_id.as_bytes());
    hasher.update([0]);
    hasher.update(sequence.to_be_bytes());
    hasher.update(body.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_covers_identity() {
        let body = r#"{"type":"sample"}"#;
        assert_eq!(checksum("phone", 1, body), checksum("phone", 1, body));
        assert_ne!(checksum("phone", 1, body), checksum("phone", 2, body));
        assert_ne!(checksum("phone", 1, body), checksum("tablet", 1, body));
        assert_eq!(checksum("phone", 1, body).len(), 64);
    }
}
