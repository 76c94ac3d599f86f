//! The local event store.
//!
//! An append-only log of samples and transitions per device. Every record
//! gets the next per-device sequence number inside the same transaction
//! that inserts it, so sequences are gap-free at append time and never
//! reused after pruning. Appends for one device are serialized by a
//! per-device mutex; every write transaction across devices and tasks
//! starts `IMMEDIATE`, so writers queue on the busy timeout instead of
//! failing. Reads go straight to the pool and never wait on either.

use super::rows::{checksum, StoredRecord, RECORD_COLUMNS};
use super::{create_pool, run_migrations, Pool};
use crate::now_ms;
use dashmap::DashMap;
use futures::Stream;
use sentinel_engine::{
    BatchCommit, Conflict, DeviceId, DeviceSyncCursor, ErrorClass, Evaluation, EvaluatorState,
    LocalId, LocationReading, RecordBody, RemoteVersion, SequenceNumber, Snapshot, SyncRecord,
    SyncState, Timestamp, TransitionEvent, TransitionView,
};
use serde::Serialize;
use sqlx::{Sqlite, SqliteConnection, Transaction};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};

/// Rows fetched per page by a [`RecordCursor`].
const READ_PAGE_SIZE: i64 = 256;

/// Local store errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("local storage full: {0}")]
    StorageFull(String),

    #[error("corruption detected: {0}")]
    CorruptionDetected(String),

    #[error("record {0} not found")]
    NotFound(LocalId),

    #[error(transparent)]
    Engine(#[from] sentinel_engine::Error),

    #[error("database error: {0}")]
    Database(#[source] sqlx::Error),

    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        if is_disk_full(&e) {
            StoreError::StorageFull(e.to_string())
        } else {
            StoreError::Database(e)
        }
    }
}

impl StoreError {
    pub fn class(&self) -> ErrorClass {
        match self {
            StoreError::StorageFull(_) => ErrorClass::ResourceExhausted,
            StoreError::Engine(e) => e.class(),
            StoreError::Database(_) | StoreError::Migrate(_) => ErrorClass::Transient,
            StoreError::CorruptionDetected(_)
            | StoreError::NotFound(_)
            | StoreError::Encoding(_) => ErrorClass::DataIntegrity,
        }
    }
}

/// Check if a SQL error means the disk or database is full.
fn is_disk_full(e: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = e {
        // SQLITE_FULL
        db_err.code().map(|c| c == "13").unwrap_or(false)
    } else {
        false
    }
}

type Result<T> = std::result::Result<T, StoreError>;

/// What a caller appends.
#[derive(Debug, Clone)]
pub enum NewEntry {
    /// Numbered by the store at append time
    Reading(LocationReading),
    Transition(TransitionEvent),
}

/// A durably appended record.
#[derive(Debug, Clone)]
pub struct Appended {
    pub local_id: LocalId,
    pub sequence: SequenceNumber,
    pub record: SyncRecord,
}

/// A record that could not be read back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreFault {
    pub device_id: DeviceId,
    pub local_id: LocalId,
    pub reason: String,
}

/// Per-device record counts by sync state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordCounts {
    pub pending: u64,
    pub synced: u64,
    pub conflicted: u64,
    pub failed: u64,
}

/// The next pending records to push, with any corrupt rows found on the way.
#[derive(Debug, Default)]
pub struct PendingBatch {
    pub records: Vec<SyncRecord>,
    pub corrupt: Vec<(LocalId, String)>,
}

/// SQLite-backed local event store.
pub struct LocalEventStore {
    pool: Pool,
    writers: DashMap<DeviceId, Arc<Mutex<()>>>,
    faults: broadcast::Sender<StoreFault>,
    max_records: Option<u64>,
}

impl LocalEventStore {
    pub fn new(pool: Pool, max_records: Option<u64>) -> Self {
        let (faults, _) = broadcast::channel(64);
        Self {
            pool,
            writers: DashMap::new(),
            faults,
            max_records,
        }
    }

    /// Connect, migrate and wrap a database.
    pub async fn open(database_url: &str, max_records: Option<u64>) -> Result<Self> {
        let pool = create_pool(database_url).await?;
        run_migrations(&pool).await?;
        Ok(Self::new(pool, max_records))
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Open a transaction that holds the database write lock from its first
    /// statement. A deferred `BEGIN` that reads before writing fails with
    /// `SQLITE_BUSY_SNAPSHOT` once another connection commits in between,
    /// and no busy timeout retries that.
    async fn begin_write(&self) -> Result<Transaction<'static, Sqlite>> {
        Ok(self.pool.begin_with("BEGIN IMMEDIATE").await?)
    }

    /// Corrupt records skipped by reads are reported here.
    pub fn subscribe_faults(&self) -> broadcast::Receiver<StoreFault> {
        self.faults.subscribe()
    }

    fn writer(&self, device_id: &str) -> Arc<Mutex<()>> {
        self.writers
            .entry(device_id.to_string())
            .or_default()
            .clone()
    }

    /// Append one entry. Returns only after the transaction has committed.
    pub async fn append(&self, device_id: &str, entry: NewEntry) -> Result<Appended> {
        if let NewEntry::Reading(reading) = &entry {
            reading.validate()?;
        }
        let entry_device = match &entry {
            NewEntry::Reading(r) => &r.device_id,
            NewEntry::Transition(t) => &t.device_id,
        };
        if entry_device != device_id {
            return Err(sentinel_engine::Error::DeviceMismatch {
                expected: device_id.to_string(),
                got: entry_device.clone(),
            }
            .into());
        }

        let lock = self.writer(device_id);
        let _guard = lock.lock().await;

        if let Some(max) = self.max_records {
            let total = self.total_records().await?;
            if total >= max {
                return Err(StoreError::StorageFull(format!(
                    "record quota of {max} reached"
                )));
            }
        }

        let mut tx = self.begin_write().await?;
        let sequence = next_sequence(&mut tx, device_id).await?;
        let body = match entry {
            NewEntry::Reading(reading) => RecordBody::Sample(reading.into_sample(sequence)),
            NewEntry::Transition(event) => RecordBody::Transition(event),
        };
        let record = insert_record(&mut tx, sequence, body).await?;
        tx.commit().await?;

        tracing::debug!(
            device_id = %device_id,
            local_id = record.local_id,
            sequence,
            kind = record.body.kind(),
            "Record appended"
        );

        Ok(Appended {
            local_id: record.local_id,
            sequence,
            record,
        })
    }

    /// Persist everything an evaluation produced in one transaction: the
    /// derived transitions, the resolution of superseded provisional
    /// records, and the new evaluator state.
    pub async fn append_derived(
        &self,
        device_id: &str,
        evaluation: &Evaluation,
    ) -> Result<Vec<Appended>> {
        let lock = self.writer(device_id);
        let _guard = lock.lock().await;

        let mut tx = self.begin_write().await?;

        let needs_lookup = !evaluation.retracted.is_empty()
            || evaluation.transitions.iter().any(|t| !t.is_provisional());
        if needs_lookup {
            let pending = pending_transitions_in(&mut tx, device_id).await?;
            for record in &pending {
                let Some(stored) = record.body.as_transition() else {
                    continue;
                };
                if !stored.is_provisional() {
                    continue;
                }
                let reason = if evaluation.retracted.iter().any(|r| same_crossing(r, stored)) {
                    "retracted by an accurate fix"
                } else if evaluation
                    .transitions
                    .iter()
                    .any(|t| !t.is_provisional() && same_crossing(t, stored))
                {
                    "superseded by confirmed transition"
                } else {
                    continue;
                };
                resolve_in(&mut tx, record.local_id, SyncState::Conflicted, None, Some(reason))
                    .await?;
            }
        }

        let mut appended = Vec::with_capacity(evaluation.transitions.len());
        for event in &evaluation.transitions {
            let sequence = next_sequence(&mut tx, device_id).await?;
            let record =
                insert_record(&mut tx, sequence, RecordBody::Transition(event.clone())).await?;
            appended.push(Appended {
                local_id: record.local_id,
                sequence,
                record,
            });
        }

        save_state_in(&mut tx, "evaluator_state", device_id, &evaluation.new_state).await?;
        tx.commit().await?;

        if !appended.is_empty() {
            tracing::debug!(
                device_id = %device_id,
                transitions = appended.len(),
                "Derived transitions appended"
            );
        }
        Ok(appended)
    }

    /// Records with sequence greater than `after`, in sequence order.
    pub async fn read_since(&self, device_id: &str, after: SequenceNumber) -> Result<RecordCursor> {
        self.cursor(device_id, after, false).await
    }

    /// Pending records with sequence greater than `after`.
    pub async fn pending_since(
        &self,
        device_id: &str,
        after: SequenceNumber,
    ) -> Result<RecordCursor> {
        self.cursor(device_id, after, true).await
    }

    async fn cursor(
        &self,
        device_id: &str,
        after: SequenceNumber,
        pending_only: bool,
    ) -> Result<RecordCursor> {
        let upper = self.last_sequence(device_id).await?;
        Ok(RecordCursor {
            pool: self.pool.clone(),
            faults: self.faults.clone(),
            device_id: device_id.to_string(),
            position: after,
            upper,
            pending_only,
            buffer: VecDeque::new(),
            skipped: Vec::new(),
            exhausted: after >= upper,
        })
    }

    /// The oldest pending records, up to `limit`.
    pub async fn pending_batch(&self, device_id: &str, limit: usize) -> Result<PendingBatch> {
        let mut cursor = self.pending_since(device_id, 0).await?;
        let mut batch = PendingBatch::default();
        while batch.records.len() < limit {
            match cursor.next().await? {
                Some(record) => batch.records.push(record),
                None => break,
            }
        }
        batch.corrupt = cursor.take_skipped();
        Ok(batch)
    }

    /// All pending transition records for a device.
    pub async fn pending_transitions(&self, device_id: &str) -> Result<Vec<SyncRecord>> {
        let mut conn = self.pool.acquire().await?;
        pending_transitions_in(&mut conn, device_id).await
    }

    /// Highest sequence ever assigned to a device (0 = none).
    pub async fn last_sequence(&self, device_id: &str) -> Result<SequenceNumber> {
        let last: Option<i64> =
            sqlx::query_scalar("SELECT last_sequence FROM device_sequences WHERE device_id = ?")
                .bind(device_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(last.unwrap_or(0) as u64)
    }

    pub async fn get(&self, local_id: LocalId) -> Result<SyncRecord> {
        let row: Option<StoredRecord> = sqlx::query_as(&format!(
            "SELECT {RECORD_COLUMNS} FROM sync_records WHERE local_id = ?"
        ))
        .bind(local_id as i64)
        .fetch_optional(&self.pool)
        .await?;
        row.ok_or(StoreError::NotFound(local_id))?
            .decode()
            .map_err(StoreError::CorruptionDetected)
    }

    /// Pending → Synced.
    pub async fn mark_synced(&self, local_id: LocalId, remote_id: &str) -> Result<()> {
        self.resolve(local_id, SyncState::Synced, Some(remote_id), None)
            .await
    }

    /// Pending → Failed.
    pub async fn mark_failed(&self, local_id: LocalId, reason: &str) -> Result<()> {
        tracing::warn!(local_id, reason, "Record marked failed");
        self.resolve(local_id, SyncState::Failed, None, Some(reason))
            .await
    }

    /// Pending → Conflicted.
    pub async fn mark_conflicted(&self, local_id: LocalId, reason: &str) -> Result<()> {
        self.resolve(local_id, SyncState::Conflicted, None, Some(reason))
            .await
    }

    async fn resolve(
        &self,
        local_id: LocalId,
        to: SyncState,
        remote_id: Option<&str>,
        reason: Option<&str>,
    ) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        if resolve_in(&mut conn, local_id, to, remote_id, reason).await? {
            return Ok(());
        }

        let current: Option<String> =
            sqlx::query_scalar("SELECT sync_state FROM sync_records WHERE local_id = ?")
                .bind(local_id as i64)
                .fetch_optional(&mut *conn)
                .await?;
        let Some(current) = current else {
            return Err(StoreError::NotFound(local_id));
        };
        let err = if current == SyncState::Synced.as_str() && to == SyncState::Synced {
            sentinel_engine::Error::AlreadySynced(local_id)
        } else {
            sentinel_engine::Error::InvalidStateTransition {
                local_id,
                from: current,
                to: to.to_string(),
            }
        };
        Err(err.into())
    }

    /// Apply a push acknowledgement atomically: synced and failed marks plus
    /// the cursor advance. Returns the updated cursor.
    ///
    /// A record conflicted locally while its push was in flight still
    /// becomes Synced, since the remote store has it.
    pub async fn commit_batch(
        &self,
        device_id: &str,
        commit: &BatchCommit,
    ) -> Result<DeviceSyncCursor> {
        let mut tx = self.begin_write().await?;
        let at = now_ms() as i64;

        for (local_id, remote_id, _) in &commit.synced {
            sqlx::query(
                r#"
                UPDATE sync_records
                SET sync_state = 'synced', remote_id = ?, failure_reason = NULL, resolved_at = ?
                WHERE local_id = ? AND device_id = ? AND sync_state IN ('pending', 'conflicted')
                "#,
            )
            .bind(remote_id)
            .bind(at)
            .bind(*local_id as i64)
            .bind(device_id)
            .execute(&mut *tx)
            .await?;
        }
        for (local_id, reason) in &commit.failed {
            resolve_in(&mut tx, *local_id, SyncState::Failed, None, Some(reason)).await?;
        }

        if let Some(highest) = commit.highest_synced() {
            sqlx::query(
                r#"
                INSERT INTO sync_cursors (device_id, last_acked_sequence, last_pulled_version, updated_at)
                VALUES (?, ?, 0, ?)
                ON CONFLICT (device_id) DO UPDATE SET
                    last_acked_sequence = MAX(last_acked_sequence, excluded.last_acked_sequence),
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(device_id)
            .bind(highest as i64)
            .bind(at)
            .execute(&mut *tx)
            .await?;
        }

        let cursor = load_cursor_in(&mut tx, device_id).await?;
        tx.commit().await?;
        Ok(cursor)
    }

    /// Delete resolved records older than `older_than`. Pending records are
    /// never deleted. Returns the number of rows removed.
    pub async fn prune(&self, older_than: Timestamp, only_synced: bool) -> Result<u64> {
        let states = if only_synced {
            "('synced')"
        } else {
            "('synced', 'failed', 'conflicted')"
        };
        let result = sqlx::query(&format!(
            "DELETE FROM sync_records WHERE sync_state IN {states} \
             AND COALESCE(resolved_at, recorded_at) < ?"
        ))
        .bind(older_than as i64)
        .execute(&self.pool)
        .await?;

        let removed = result.rows_affected();
        if removed > 0 {
            tracing::info!(removed, only_synced, "Pruned local records");
        }
        Ok(removed)
    }

    pub async fn load_cursor(&self, device_id: &str) -> Result<DeviceSyncCursor> {
        let mut conn = self.pool.acquire().await?;
        load_cursor_in(&mut conn, device_id).await
    }

    pub async fn save_cursor(&self, cursor: &DeviceSyncCursor) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_cursors (device_id, last_acked_sequence, last_pulled_version, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (device_id) DO UPDATE SET
                last_acked_sequence = excluded.last_acked_sequence,
                last_pulled_version = excluded.last_pulled_version,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&cursor.device_id)
        .bind(cursor.last_acked_sequence as i64)
        .bind(cursor.last_pulled_version as i64)
        .bind(now_ms() as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Last persisted evaluator state, if any.
    pub async fn load_evaluator_state(&self, device_id: &str) -> Result<Option<EvaluatorState>> {
        self.load_snapshot("evaluator_state", device_id).await
    }

    pub async fn save_evaluator_state(&self, device_id: &str, state: &EvaluatorState) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        save_state_in(&mut conn, "evaluator_state", device_id, state).await
    }

    /// Last reconciled view, or an empty one.
    pub async fn load_view(&self, device_id: &str) -> Result<TransitionView> {
        Ok(self
            .load_snapshot("remote_view", device_id)
            .await?
            .unwrap_or_default())
    }

    /// Persist the outcome of a reconciliation in one transaction: mark
    /// conflicted local records, store the view and advance the pull cursor.
    pub async fn save_reconciled(
        &self,
        device_id: &str,
        pulled_version: Option<RemoteVersion>,
        view: &TransitionView,
        conflicts: &[Conflict],
    ) -> Result<DeviceSyncCursor> {
        let mut tx = self.begin_write().await?;

        for conflict in conflicts {
            let reason = conflict.reason();
            if resolve_in(
                &mut tx,
                conflict.local_id,
                SyncState::Conflicted,
                None,
                Some(&reason),
            )
            .await?
            {
                tracing::info!(
                    device_id = %device_id,
                    local_id = conflict.local_id,
                    reason = %reason,
                    "Local transition lost last-writer-wins"
                );
            }
        }

        save_state_in(&mut tx, "remote_view", device_id, view).await?;

        if let Some(version) = pulled_version {
            sqlx::query(
                r#"
                INSERT INTO sync_cursors (device_id, last_acked_sequence, last_pulled_version, updated_at)
                VALUES (?, 0, ?, ?)
                ON CONFLICT (device_id) DO UPDATE SET
                    last_pulled_version = MAX(last_pulled_version, excluded.last_pulled_version),
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(device_id)
            .bind(version as i64)
            .bind(now_ms() as i64)
            .execute(&mut *tx)
            .await?;
        }

        let cursor = load_cursor_in(&mut tx, device_id).await?;
        tx.commit().await?;
        Ok(cursor)
    }

    pub async fn counts(&self, device_id: &str) -> Result<RecordCounts> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT sync_state, COUNT(*) FROM sync_records WHERE device_id = ? GROUP BY sync_state",
        )
        .bind(device_id)
        .fetch_all(&self.pool)
        .await?;

        let mut counts = RecordCounts::default();
        for (state, count) in rows {
            let count = count as u64;
            match SyncState::parse(&state) {
                Some(SyncState::Pending) => counts.pending = count,
                Some(SyncState::Synced) => counts.synced = count,
                Some(SyncState::Conflicted) => counts.conflicted = count,
                Some(SyncState::Failed) => counts.failed = count,
                None => {}
            }
        }
        Ok(counts)
    }

    pub async fn total_records(&self) -> Result<u64> {
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sync_records")
            .fetch_one(&self.pool)
            .await?;
        Ok(total as u64)
    }

    async fn load_snapshot<T: serde::de::DeserializeOwned>(
        &self,
        table: &str,
        device_id: &str,
    ) -> Result<Option<T>> {
        let json: Option<String> = sqlx::query_scalar(&format!(
            "SELECT snapshot FROM {table} WHERE device_id = ?"
        ))
        .bind(device_id)
        .fetch_optional(&self.pool)
        .await?;

        match json {
            Some(json) => Ok(Some(Snapshot::<T>::from_json(&json, device_id)?.into_state())),
            None => Ok(None),
        }
    }
}

/// Lazy, finite, restartable read over one device's log.
///
/// The upper bound is captured when the read begins; records appended
/// afterwards are not observed. Corrupt rows are skipped, reported on the
/// store's fault channel and collected in [`RecordCursor::take_skipped`].
pub struct RecordCursor {
    pool: Pool,
    faults: broadcast::Sender<StoreFault>,
    device_id: DeviceId,
    position: SequenceNumber,
    upper: SequenceNumber,
    pending_only: bool,
    buffer: VecDeque<SyncRecord>,
    skipped: Vec<(LocalId, String)>,
    exhausted: bool,
}

impl RecordCursor {
    /// Next record in sequence order, or `None` when the read is done.
    pub async fn next(&mut self) -> Result<Option<SyncRecord>> {
        if self.buffer.is_empty() && !self.exhausted {
            self.fill().await?;
        }
        Ok(self.buffer.pop_front())
    }

    /// Sequence of the last row consumed from the database; a new cursor
    /// started here resumes the read.
    pub fn position(&self) -> SequenceNumber {
        self.position
    }

    /// The snapshot bound of this read.
    pub fn upper_bound(&self) -> SequenceNumber {
        self.upper
    }

    pub fn take_skipped(&mut self) -> Vec<(LocalId, String)> {
        std::mem::take(&mut self.skipped)
    }

    pub fn into_stream(self) -> impl Stream<Item = Result<SyncRecord>> {
        futures::stream::unfold(self, |mut cursor| async move {
            match cursor.next().await {
                Ok(Some(record)) => Some((Ok(record), cursor)),
                Ok(None) => None,
                Err(e) => {
                    cursor.exhausted = true;
                    cursor.buffer.clear();
                    Some((Err(e), cursor))
                }
            }
        })
    }

    async fn fill(&mut self) -> Result<()> {
        // Keep paging past pages made entirely of corrupt rows
        while self.buffer.is_empty() && !self.exhausted {
            let filter = if self.pending_only {
                " AND sync_state = 'pending'"
            } else {
                ""
            };
            let rows: Vec<StoredRecord> = sqlx::query_as(&format!(
                "SELECT {RECORD_COLUMNS} FROM sync_records \
                 WHERE device_id = ? AND sequence > ? AND sequence <= ?{filter} \
                 ORDER BY sequence LIMIT ?"
            ))
            .bind(&self.device_id)
            .bind(self.position as i64)
            .bind(self.upper as i64)
            .bind(READ_PAGE_SIZE)
            .fetch_all(&self.pool)
            .await?;

            if (rows.len() as i64) < READ_PAGE_SIZE {
                self.exhausted = true;
            }

            for row in rows {
                let local_id = row.local_id as u64;
                self.position = self.position.max(row.sequence as u64);
                match row.decode() {
                    Ok(record) => self.buffer.push_back(record),
                    Err(reason) => {
                        tracing::warn!(
                            device_id = %self.device_id,
                            local_id,
                            reason = %reason,
                            "Skipping corrupt record"
                        );
                        // No subscribers is fine
                        let _ = self.faults.send(StoreFault {
                            device_id: self.device_id.clone(),
                            local_id,
                            reason: reason.clone(),
                        });
                        self.skipped.push((local_id, reason));
                    }
                }
            }
        }
        Ok(())
    }
}

fn same_crossing(a: &TransitionEvent, b: &TransitionEvent) -> bool {
    a.geofence_id == b.geofence_id
        && a.device_id == b.device_id
        && a.kind == b.kind
        && a.triggered_at == b.triggered_at
}

/// Allocate the next sequence for a device, checking the bookkeeping.
async fn next_sequence(conn: &mut SqliteConnection, device_id: &str) -> Result<SequenceNumber> {
    let last: Option<i64> =
        sqlx::query_scalar("SELECT last_sequence FROM device_sequences WHERE device_id = ?")
            .bind(device_id)
            .fetch_optional(&mut *conn)
            .await?;
    let max_stored: Option<i64> =
        sqlx::query_scalar("SELECT MAX(sequence) FROM sync_records WHERE device_id = ?")
            .bind(device_id)
            .fetch_one(&mut *conn)
            .await?;

    let last = last.unwrap_or(0);
    if max_stored.unwrap_or(0) > last {
        return Err(StoreError::CorruptionDetected(format!(
            "device '{device_id}' has records up to sequence {} but the counter is at {last}",
            max_stored.unwrap_or(0)
        )));
    }

    let next = last + 1;
    sqlx::query(
        r#"
        INSERT INTO device_sequences (device_id, last_sequence) VALUES (?, ?)
        ON CONFLICT (device_id) DO UPDATE SET last_sequence = excluded.last_sequence
        "#,
    )
    .bind(device_id)
    .bind(next)
    .execute(&mut *conn)
    .await?;

    Ok(next as u64)
}

async fn insert_record(
    conn: &mut SqliteConnection,
    sequence: SequenceNumber,
    body: RecordBody,
) -> Result<SyncRecord> {
    let device_id = body.device_id().clone();
    let body_json = serde_json::to_string(&body)?;
    let sum = checksum(&device_id, sequence, &body_json);
    let recorded_at = now_ms();

    let result = sqlx::query(
        r#"
        INSERT INTO sync_records (device_id, sequence, kind, body, checksum, sync_state, recorded_at)
        VALUES (?, ?, ?, ?, ?, 'pending', ?)
        "#,
    )
    .bind(&device_id)
    .bind(sequence as i64)
    .bind(body.kind())
    .bind(&body_json)
    .bind(&sum)
    .bind(recorded_at as i64)
    .execute(&mut *conn)
    .await?;

    let local_id = result.last_insert_rowid() as u64;
    Ok(SyncRecord::pending(local_id, sequence, body, recorded_at))
}

/// Move a pending record to `to`. Returns false if it was not pending.
async fn resolve_in(
    conn: &mut SqliteConnection,
    local_id: LocalId,
    to: SyncState,
    remote_id: Option<&str>,
    reason: Option<&str>,
) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE sync_records
        SET sync_state = ?,
            remote_id = COALESCE(?, remote_id),
            failure_reason = COALESCE(?, failure_reason),
            resolved_at = ?
        WHERE local_id = ? AND sync_state = 'pending'
        "#,
    )
    .bind(to.as_str())
    .bind(remote_id)
    .bind(reason)
    .bind(now_ms() as i64)
    .bind(local_id as i64)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected() == 1)
}

async fn pending_transitions_in(
    conn: &mut SqliteConnection,
    device_id: &str,
) -> Result<Vec<SyncRecord>> {
    let rows: Vec<StoredRecord> = sqlx::query_as(&format!(
        "SELECT {RECORD_COLUMNS} FROM sync_records \
         WHERE device_id = ? AND kind = 'transition' AND sync_state = 'pending' \
         ORDER BY sequence"
    ))
    .bind(device_id)
    .fetch_all(&mut *conn)
    .await?;

    // Corrupt rows are reported by the push path's reads
    Ok(rows.into_iter().filter_map(|r| r.decode().ok()).collect())
}

async fn load_cursor_in(conn: &mut SqliteConnection, device_id: &str) -> Result<DeviceSyncCursor> {
    let row: Option<(i64, i64)> = sqlx::query_as(
        "SELECT last_acked_sequence, last_pulled_version FROM sync_cursors WHERE device_id = ?",
    )
    .bind(device_id)
    .fetch_optional(&mut *conn)
    .await?;

    let mut cursor = DeviceSyncCursor::new(device_id);
    if let Some((acked, pulled)) = row {
        cursor.last_acked_sequence = acked as u64;
        cursor.last_pulled_version = pulled as u64;
    }
    Ok(cursor)
}

async fn save_state_in<T: Serialize>(
    conn: &mut SqliteConnection,
    table: &str,
    device_id: &str,
    state: &T,
) -> Result<()> {
    let at = now_ms();
    let json = Snapshot::new(device_id, at, state).to_json()?;
    sqlx::query(&format!(
        r#"
        INSERT INTO {table} (device_id, snapshot, updated_at) VALUES (?, ?, ?)
        ON CONFLICT (device_id) DO UPDATE SET
            snapshot = excluded.snapshot,
            updated_at = excluded.updated_at
        "#
    ))
    .bind(device_id)
    .bind(json)
    .bind(at as i64)
    .execute(&mut *conn)
    .await?;
    Ok(())
}
