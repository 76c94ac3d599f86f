//! The per-device sync worker.
//!
//! One long-lived task per device drives its [`SyncMachine`] through
//! pull, reconcile and push. Network calls are the only suspension points
//! that can block for long, and every one runs under a timeout. Pushed
//! records are committed locally only after the remote store acknowledged
//! them.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use sentinel_engine::{
    commit_batch, BackoffPolicy, DeviceId, Reconciler, RemoteChange, StageFailure, SyncMachine,
    SyncPhase, SyncRecord, SyncTrigger,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::DeviceHandle;
use crate::alerts::DispatcherHandle;
use crate::identity::{Credential, IdentityProvider};
use crate::{jitter_sample, now_ms};
use crate::remote::{RemoteError, RemoteStore};
use crate::store::{LocalEventStore, StoreError};

/// Sync worker settings.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Time between cycles when nothing else triggers one
    pub interval: Duration,
    pub push_batch_size: usize,
    pub pull_page_size: u32,
    pub request_timeout: Duration,
    pub backoff: BackoffPolicy,
    /// How often reachability is probed during backoff
    pub probe_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            push_batch_size: 50,
            pull_page_size: 200,
            request_timeout: Duration::from_secs(10),
            backoff: BackoffPolicy::default(),
            probe_interval: Duration::from_secs(15),
        }
    }
}

/// What one successful cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Remote changes fetched
    pub pulled: usize,
    /// Remote changes that altered the view
    pub applied: usize,
    /// Local transitions marked Conflicted
    pub conflicts: usize,
    /// Records acknowledged and marked Synced
    pub pushed: usize,
    /// Records rejected and marked Failed
    pub failed: usize,
}

pub struct SyncWorker {
    device_id: DeviceId,
    config: WorkerConfig,
    store: Arc<LocalEventStore>,
    remote: Arc<dyn RemoteStore>,
    identity: Arc<dyn IdentityProvider>,
    alerts: DispatcherHandle,
    handle: Arc<DeviceHandle>,
    machine: SyncMachine,
}

impl SyncWorker {
    pub fn new(
        config: WorkerConfig,
        store: Arc<LocalEventStore>,
        remote: Arc<dyn RemoteStore>,
        identity: Arc<dyn IdentityProvider>,
        alerts: DispatcherHandle,
        handle: Arc<DeviceHandle>,
    ) -> Self {
        let device_id = handle.device_id().clone();
        Self {
            machine: SyncMachine::new(device_id.clone()),
            device_id,
            config,
            store,
            remote,
            identity,
            alerts,
            handle,
        }
    }

    pub fn phase(&self) -> SyncPhase {
        self.machine.phase()
    }

    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    /// Drive cycles until shutdown is signalled.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(device_id = %self.device_id, "Sync worker started");
        let mut credentials = self.identity.subscribe();
        let mut trigger = SyncTrigger::TimerTick;

        loop {
            if *shutdown.borrow() {
                break;
            }

            let next = match self.run_cycle(trigger).await {
                Ok(_) => self.wait_idle(&mut shutdown).await,
                Err(StageFailure::Transient(_)) => self.wait_backoff(&mut shutdown).await,
                Err(StageFailure::Unauthenticated(_)) => {
                    tokio::select! {
                        changed = credentials.changed() => match changed {
                            Ok(()) => Some(SyncTrigger::TimerTick),
                            Err(_) => None,
                        },
                        _ = shutdown.changed() => None,
                    }
                }
            };

            match next {
                Some(t) => trigger = t,
                None => break,
            }
        }

        tracing::info!(device_id = %self.device_id, "Sync worker stopped");
    }

    async fn wait_idle(&self, shutdown: &mut watch::Receiver<bool>) -> Option<SyncTrigger> {
        tokio::select! {
            _ = tokio::time::sleep(self.config.interval) => Some(SyncTrigger::TimerTick),
            _ = self.handle.flush_requested() => Some(SyncTrigger::FlushRequested),
            _ = self.handle.connectivity_regained() => Some(SyncTrigger::ConnectivityRegained),
            _ = shutdown.changed() => None,
        }
    }

    /// Wait out the backoff delay, unless connectivity is signalled or a
    /// probe succeeds first.
    async fn wait_backoff(&self, shutdown: &mut watch::Receiver<bool>) -> Option<SyncTrigger> {
        let delay = self
            .config
            .backoff
            .delay(self.machine.failures(), jitter_sample());
        tracing::debug!(
            device_id = %self.device_id,
            failures = self.machine.failures(),
            delay_ms = delay.as_millis() as u64,
            "Backing off"
        );

        tokio::select! {
            _ = tokio::time::sleep(delay) => Some(SyncTrigger::TimerTick),
            _ = self.handle.connectivity_regained() => Some(SyncTrigger::ConnectivityRegained),
            _ = self.probe_until_reachable() => Some(SyncTrigger::ConnectivityRegained),
            _ = shutdown.changed() => None,
        }
    }

    async fn probe_until_reachable(&self) {
        loop {
            tokio::time::sleep(self.config.probe_interval).await;
            if let Ok(Ok(())) =
                tokio::time::timeout(self.config.request_timeout, self.remote.probe()).await
            {
                tracing::debug!(device_id = %self.device_id, "Remote reachable again");
                return;
            }
        }
    }

    /// Run one cycle from whatever phase the machine is in. A worker in
    /// `Backoff` retries immediately; one in `Unauthenticated` retries only
    /// if a valid credential is available.
    pub async fn run_cycle(&mut self, trigger: SyncTrigger) -> Result<CycleReport, StageFailure> {
        match self.machine.phase() {
            SyncPhase::Backoff => self.step(SyncMachine::backoff_elapsed),
            SyncPhase::Unauthenticated => {
                self.credential()?;
                self.step(SyncMachine::reauthenticated);
            }
            _ => {}
        }

        tracing::debug!(
            device_id = %self.device_id,
            trigger = trigger.as_str(),
            "Sync cycle starting"
        );
        self.step(|m| m.begin(trigger));

        match self.cycle().await {
            Ok(report) => {
                self.step(SyncMachine::pushed);
                self.handle
                    .update_status(|s| s.last_synced_at = Some(now_ms()));
                tracing::info!(
                    device_id = %self.device_id,
                    pulled = report.pulled,
                    conflicts = report.conflicts,
                    pushed = report.pushed,
                    failed = report.failed,
                    "Sync cycle complete"
                );
                Ok(report)
            }
            Err(failure) => {
                tracing::warn!(
                    device_id = %self.device_id,
                    phase = %self.machine.phase(),
                    error = failure.message(),
                    "Sync cycle failed"
                );
                let failed = failure.clone();
                self.step(move |m| m.fail(failed));
                Err(failure)
            }
        }
    }

    async fn cycle(&mut self) -> Result<CycleReport, StageFailure> {
        let credential = self.credential()?;
        let mut report = CycleReport::default();

        let changes = self.pull(&credential).await?;
        report.pulled = changes.len();
        self.step(SyncMachine::pulled);

        self.reconcile(changes, &mut report)
            .await
            .map_err(store_failure)?;
        self.step(SyncMachine::reconciled);

        self.push(&credential, &mut report).await?;
        Ok(report)
    }

    fn credential(&self) -> Result<Credential, StageFailure> {
        self.identity
            .credential(now_ms())
            .map_err(|e| StageFailure::Unauthenticated(e.to_string()))
    }

    /// Fetch every page newer than the pulled cursor.
    async fn pull(&self, credential: &Credential) -> Result<Vec<RemoteChange>, StageFailure> {
        let cursor = self
            .store
            .load_cursor(&self.device_id)
            .await
            .map_err(store_failure)?;
        let mut since = cursor.last_pulled_version;
        let mut changes = Vec::new();

        loop {
            let page = self
                .call(self.remote.pull(credential, since, self.config.pull_page_size))
                .await
                .map_err(remote_failure)?;

            let has_more = page.has_more;
            let page_max = page.changes.iter().map(|c| c.version).max();
            changes.extend(page.changes);

            match page_max {
                Some(version) if version > since => since = version,
                _ => break,
            }
            if !has_more {
                break;
            }
        }

        Ok(changes)
    }

    async fn reconcile(
        &self,
        changes: Vec<RemoteChange>,
        report: &mut CycleReport,
    ) -> Result<(), StoreError> {
        let pending = self.store.pending_transitions(&self.device_id).await?;
        let view = self.store.load_view(&self.device_id).await?;

        let (result, view) = Reconciler::new(self.device_id.clone(), view).reconcile(&pending, changes);
        self.store
            .save_reconciled(&self.device_id, result.max_version, &view, &result.conflicts)
            .await?;

        report.applied = result.applied_remote.len();
        report.conflicts = result.conflicts.len();

        // Own transitions were dispatched when they were evaluated
        for event in result.remote_transitions {
            if event.device_id != self.device_id {
                self.alerts.on_remote_transition(event);
            }
        }
        Ok(())
    }

    /// Push pending records in sequence order, one bounded batch at a time.
    async fn push(
        &self,
        credential: &Credential,
        report: &mut CycleReport,
    ) -> Result<(), StageFailure> {
        loop {
            let batch = self
                .store
                .pending_batch(&self.device_id, self.config.push_batch_size)
                .await
                .map_err(store_failure)?;

            for (local_id, reason) in &batch.corrupt {
                match self.store.mark_failed(*local_id, reason).await {
                    Ok(()) => report.failed += 1,
                    Err(e) => tracing::warn!(local_id, error = %e, "Could not isolate corrupt record"),
                }
            }
            if batch.records.is_empty() {
                return Ok(());
            }

            let ack = match self
                .call(self.remote.push(credential, &self.device_id, &batch.records))
                .await
            {
                Ok(ack) => ack,
                Err(RemoteError::Rejected(reason)) => {
                    tracing::warn!(
                        device_id = %self.device_id,
                        records = batch.records.len(),
                        reason = %reason,
                        "Batch rejected, isolating records"
                    );
                    self.push_individually(credential, &batch.records, report)
                        .await?;
                    continue;
                }
                Err(e) => return Err(remote_failure(e)),
            };

            let commit = commit_batch(&batch.records, &ack);
            self.store
                .commit_batch(&self.device_id, &commit)
                .await
                .map_err(store_failure)?;
            report.pushed += commit.synced.len();
            report.failed += commit.failed.len();

            tracing::debug!(
                device_id = %self.device_id,
                synced = commit.synced.len(),
                failed = commit.failed.len(),
                unresolved = commit.unresolved.len(),
                "Batch committed"
            );

            if let Some(error) = ack.error {
                return Err(StageFailure::Transient(error));
            }
            if !commit.is_complete() {
                return Err(StageFailure::Transient(format!(
                    "{} records left unacknowledged",
                    commit.unresolved.len()
                )));
            }
        }
    }

    /// Re-send a rejected batch one record at a time so only the records
    /// the remote store refuses end up Failed.
    async fn push_individually(
        &self,
        credential: &Credential,
        records: &[SyncRecord],
        report: &mut CycleReport,
    ) -> Result<(), StageFailure> {
        for record in records {
            let single = std::slice::from_ref(record);
            match self
                .call(self.remote.push(credential, &self.device_id, single))
                .await
            {
                Ok(ack) => {
                    let commit = commit_batch(single, &ack);
                    self.store
                        .commit_batch(&self.device_id, &commit)
                        .await
                        .map_err(store_failure)?;
                    report.pushed += commit.synced.len();
                    report.failed += commit.failed.len();
                    if let Some(error) = ack.error {
                        return Err(StageFailure::Transient(error));
                    }
                    if !commit.is_complete() {
                        return Err(StageFailure::Transient(format!(
                            "record {} left unacknowledged",
                            record.local_id
                        )));
                    }
                }
                Err(RemoteError::Rejected(reason)) => {
                    self.store
                        .mark_failed(record.local_id, &reason)
                        .await
                        .map_err(store_failure)?;
                    report.failed += 1;
                }
                Err(e) => return Err(remote_failure(e)),
            }
        }
        Ok(())
    }

    async fn call<T>(
        &self,
        fut: impl Future<Output = Result<T, RemoteError>>,
    ) -> Result<T, RemoteError> {
        match tokio::time::timeout(self.config.request_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(RemoteError::Timeout(self.config.request_timeout)),
        }
    }

    fn step(&mut self, f: impl FnOnce(&mut SyncMachine) -> sentinel_engine::Result<SyncPhase>) {
        match f(&mut self.machine) {
            Ok(phase) => {
                let failures = self.machine.failures();
                let last_error = self.machine.last_failure().map(str::to_string);
                self.handle.update_status(|s| {
                    s.phase = phase;
                    s.failures = failures;
                    s.last_error = last_error;
                });
            }
            Err(e) => tracing::error!(
                device_id = %self.device_id,
                error = %e,
                "Sync state machine refused transition"
            ),
        }
    }
}

fn remote_failure(e: RemoteError) -> StageFailure {
    match e {
        RemoteError::Unauthenticated(m) => StageFailure::Unauthenticated(m),
        other => StageFailure::Transient(other.to_string()),
    }
}

fn store_failure(e: StoreError) -> StageFailure {
    StageFailure::Transient(format!("local store: {e}"))
}
