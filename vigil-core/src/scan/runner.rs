//! Engine worker supervision.
//!
//! Each scan gets one supervisor task. It hands host groups to workers,
//! at most `parallel` at a time, each on a freshly claimed KB index. A
//! worker prepares its index, launches the engine, polls it and drains the
//! index into the scan record until the engine exits or the scan is
//! cancelled, then flushes and releases the index.

use std::{
    collections::HashMap,
    io,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use chrono::Utc;
use thiserror::Error;
use tokio::{
    sync::{Mutex, Semaphore},
    task::{JoinHandle, JoinSet},
    time::{Instant, sleep},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{
    EngineExit, EngineInvocation, EngineLauncher, EngineProcess, HostGroup, ScanId, ScanResult,
    SharedRecord,
};
use crate::{
    config::{EngineConfig, RunnerConfig},
    error::{Result, ScanError},
    kb::{DbIndexAllocator, KbError, ScanDb, scan_db::STATUS_NEW},
};

/// Why a worker could not complete its host group.
#[derive(Debug, Error)]
enum WorkerFailure {
    #[error("KB error: {0}")]
    Kb(#[from] KbError),

    #[error("engine could not be started: {0}")]
    Launch(io::Error),

    #[error("engine process error: {0}")]
    Process(#[from] io::Error),

    #[error("engine did not acknowledge its KB index in time")]
    Handshake,

    #[error("engine exited abnormally: {0}")]
    Exit(String),
}

#[derive(Debug)]
struct ActiveScan {
    generation: u64,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

#[derive(Debug)]
pub struct ScanRunner {
    allocator: Arc<DbIndexAllocator>,
    launcher: Arc<dyn EngineLauncher>,
    engine: EngineConfig,
    config: RunnerConfig,
    active: Mutex<HashMap<ScanId, ActiveScan>>,
    generation: AtomicU64,
    shutdown: CancellationToken,
    fatal: CancellationToken,
}

impl ScanRunner {
    pub fn new(
        allocator: Arc<DbIndexAllocator>,
        launcher: Arc<dyn EngineLauncher>,
        engine: EngineConfig,
        config: RunnerConfig,
        fatal: CancellationToken,
    ) -> Self {
        Self {
            allocator,
            launcher,
            engine,
            config,
            active: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
            fatal,
        }
    }

    /// Starts workers for every unfinished host group of the record.
    ///
    /// The first index is claimed before returning so that an exhausted
    /// pool is reported to the caller instead of leaving the scan waiting.
    ///
    /// A resumed scan may still have a supervisor stopping its engines. It
    /// is waited for first so no host runs under two engines at once.
    pub async fn launch(self: &Arc<Self>, id: ScanId, record: SharedRecord) -> Result<()> {
        let previous = self.active.lock().await.remove(&id);
        if let Some(previous) = previous {
            debug!(target: "scan::runner", scan_id = %id, previous = previous.generation, "Waiting for winding-down supervisor");
            previous.cancel.cancel();
            if let Err(err) = previous.handle.await {
                warn!(target: "scan::runner", scan_id = %id, "Supervisor task failed: {err}");
            }
        }

        let (groups, parallel) = {
            let rec = record.lock().await;
            (rec.host_groups(), rec.parallel())
        };

        if groups.is_empty() {
            info!(target: "scan::runner", scan_id = %id, "No unfinished hosts; scan is complete");
            record.lock().await.finish(Utc::now().timestamp());
            return Ok(());
        }

        let first = self.allocator.claim_free().await.map_err(|err| {
            if err.is_fatal() {
                self.fatal.cancel();
            }
            match err {
                KbError::PoolExhausted { max } => ScanError::PoolExhausted { max },
                other => ScanError::Kb(other),
            }
        })?;

        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let cancel = self.shutdown.child_token();

        // Held across the spawn so the supervisor cannot deregister before
        // it is registered. A stop that landed while the index was being
        // claimed found nothing to cancel, so the status is checked here.
        let mut active = self.active.lock().await;
        if !record.lock().await.status().is_active() {
            drop(active);
            info!(target: "scan::runner", scan_id = %id, "Scan stopped before its engines started");
            self.release(first).await;
            return Ok(());
        }
        let handle = tokio::spawn(Arc::clone(self).supervise(
            id.clone(),
            record,
            groups,
            parallel,
            first,
            cancel.clone(),
            generation,
        ));
        active.insert(
            id,
            ActiveScan {
                generation,
                cancel,
                handle,
            },
        );
        Ok(())
    }

    /// Signals every worker of the scan to stop. Returns whether anything
    /// was running. Index release happens asynchronously.
    pub async fn stop(&self, id: &ScanId) -> bool {
        match self.active.lock().await.get(id) {
            Some(scan) => {
                scan.cancel.cancel();
                info!(target: "scan::runner", scan_id = %id, "Stop requested");
                true
            }
            None => false,
        }
    }

    pub async fn is_active(&self, id: &ScanId) -> bool {
        self.active.lock().await.contains_key(id)
    }

    /// Cancels every scan and waits for the supervisors to wind down.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handles: Vec<_> = self
            .active
            .lock()
            .await
            .drain()
            .map(|(_, scan)| scan.handle)
            .collect();
        for handle in handles {
            if let Err(err) = handle.await {
                warn!(target: "scan::runner", "Supervisor task failed: {err}");
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn supervise(
        self: Arc<Self>,
        id: ScanId,
        record: SharedRecord,
        groups: Vec<HostGroup>,
        parallel: usize,
        first: ScanDb,
        cancel: CancellationToken,
        generation: u64,
    ) {
        let permits = Arc::new(Semaphore::new(parallel.max(1)));
        let mut workers = JoinSet::new();
        let mut first = Some(first);
        let mut pending = groups.into_iter();

        while let Some(group) = pending.next() {
            let permit = tokio::select! {
                _ = cancel.cancelled() => None,
                permit = Arc::clone(&permits).acquire_owned() => permit.ok(),
            };
            let Some(permit) = permit else {
                break;
            };
            if !record.lock().await.status().is_active() {
                break;
            }

            let db = match first.take() {
                Some(db) => Some(db),
                None => self.claim_with_retry(&id, &cancel).await,
            };
            let Some(db) = db else {
                if !cancel.is_cancelled() {
                    let unlaunched = std::iter::once(group).chain(pending.by_ref());
                    record_group_failures(&record, unlaunched, "no KB index could be claimed").await;
                }
                break;
            };

            let runner = Arc::clone(&self);
            let worker_id = id.clone();
            let worker_record = Arc::clone(&record);
            let worker_cancel = cancel.clone();
            workers.spawn(async move {
                runner
                    .run_worker(worker_id, worker_record, group, db, worker_cancel)
                    .await;
                drop(permit);
            });
        }

        if let Some(unused) = first {
            self.release(unused).await;
        }

        while let Some(joined) = workers.join_next().await {
            if let Err(err) = joined {
                error!(target: "scan::runner", scan_id = %id, "Worker task failed: {err}");
            }
        }

        if cancel.is_cancelled() {
            info!(target: "scan::runner", scan_id = %id, "Scan workers stopped");
        } else if record.lock().await.finish(Utc::now().timestamp()) {
            info!(target: "scan::runner", scan_id = %id, "Scan finished");
        }

        let mut active = self.active.lock().await;
        if active.get(&id).is_some_and(|scan| scan.generation == generation) {
            active.remove(&id);
        }
    }

    /// Claims an index, waiting out an exhausted pool. `None` on cancel or
    /// on a fatal KB failure.
    async fn claim_with_retry(&self, id: &ScanId, cancel: &CancellationToken) -> Option<ScanDb> {
        loop {
            match self.allocator.claim_free().await {
                Ok(db) => return Some(db),
                Err(err) if err.is_fatal() => {
                    self.fatal.cancel();
                    return None;
                }
                Err(KbError::PoolExhausted { max }) => {
                    debug!(target: "scan::runner", scan_id = %id, max, "KB index pool exhausted; waiting");
                }
                Err(err) => {
                    warn!(target: "scan::runner", scan_id = %id, "Failed to claim KB index: {err}");
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = self.fatal.cancelled() => return None,
                _ = sleep(self.config.pool_retry_interval()) => {}
            }
        }
    }

    async fn run_worker(
        self: Arc<Self>,
        id: ScanId,
        record: SharedRecord,
        group: HostGroup,
        mut db: ScanDb,
        cancel: CancellationToken,
    ) {
        let index = db.index();
        info!(target: "scan::runner", scan_id = %id, index, hosts = group.hosts.len(), "Worker started");

        if let Err(failure) = self.drive(&id, &record, &group, &mut db, &cancel).await {
            warn!(target: "scan::runner", scan_id = %id, index, "Worker failed: {failure}");
            match &failure {
                WorkerFailure::Kb(KbError::Connection(_)) => {
                    // The flush on release needs a live connection.
                    if let Err(err) = db.reconnect(self.allocator.connector().as_ref()).await {
                        error!(target: "scan::runner", scan_id = %id, index, "Cannot reconnect to KB: {err}");
                        if err.is_fatal() {
                            self.fatal.cancel();
                        }
                    }
                }
                WorkerFailure::Kb(err) if err.is_fatal() => self.fatal.cancel(),
                _ => {}
            }
            record_group_failures(&record, std::iter::once(group), &failure.to_string()).await;
        }

        self.release(db).await;
        debug!(target: "scan::runner", scan_id = %id, index, "Worker done");
    }

    async fn drive(
        &self,
        id: &ScanId,
        record: &SharedRecord,
        group: &HostGroup,
        db: &mut ScanDb,
        cancel: &CancellationToken,
    ) -> std::result::Result<(), WorkerFailure> {
        db.prepare(id.as_str(), &group.hosts, &group.ports).await?;

        let invocation = EngineInvocation {
            scan_id: id.clone(),
            index: db.index(),
            hosts: group.hosts.clone(),
            ports: group.ports.clone(),
        };
        let mut process = self
            .launcher
            .launch(&invocation)
            .await
            .map_err(WorkerFailure::Launch)?;

        let outcome = self.watch(record, group, db, process.as_mut(), cancel).await;
        if outcome.is_err()
            && let Err(err) = process.terminate().await
        {
            debug!(target: "scan::runner", scan_id = %id, "Engine terminate failed: {err}");
        }
        outcome
    }

    async fn watch(
        &self,
        record: &SharedRecord,
        group: &HostGroup,
        db: &mut ScanDb,
        process: &mut dyn EngineProcess,
        cancel: &CancellationToken,
    ) -> std::result::Result<(), WorkerFailure> {
        let deadline = Instant::now() + self.engine.handshake_timeout();
        let mut acknowledged = false;

        loop {
            if !acknowledged {
                acknowledged = db.engine_status().await?.as_deref() != Some(STATUS_NEW);
            }
            if acknowledged {
                drain(db, record, group).await?;
            }

            if let Some(exit) = process.try_wait()? {
                // The engine may have acknowledged and exited since the
                // status was last read.
                if !acknowledged {
                    acknowledged = db.engine_status().await?.as_deref() != Some(STATUS_NEW);
                }
                drain(db, record, group).await?;
                return match exit {
                    EngineExit::Success if acknowledged => {
                        let mut rec = record.lock().await;
                        for host in &group.hosts {
                            rec.mark_host_finished(host);
                        }
                        Ok(())
                    }
                    EngineExit::Success => Err(WorkerFailure::Handshake),
                    EngineExit::Failure(reason) => Err(WorkerFailure::Exit(reason)),
                };
            }

            if !acknowledged && Instant::now() >= deadline {
                return Err(WorkerFailure::Handshake);
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    return self.stop_engine(record, group, db, process).await;
                }
                _ = sleep(self.config.poll_interval()) => {}
            }
        }
    }

    /// Asks the engine to stop through its index, waits the grace period
    /// and kills it if it is still alive. Whatever it wrote is kept.
    async fn stop_engine(
        &self,
        record: &SharedRecord,
        group: &HostGroup,
        db: &mut ScanDb,
        process: &mut dyn EngineProcess,
    ) -> std::result::Result<(), WorkerFailure> {
        db.request_stop().await?;

        let deadline = Instant::now() + self.engine.stop_grace();
        while process.try_wait()?.is_none() {
            if Instant::now() >= deadline {
                debug!(target: "scan::runner", index = db.index(), "Engine ignored stop; killing");
                process.terminate().await?;
                break;
            }
            sleep(self.config.poll_interval()).await;
        }

        drain(db, record, group).await?;
        Ok(())
    }

    /// Flushes then releases, so a free registry field never points at
    /// stale engine output.
    async fn release(&self, mut db: ScanDb) {
        let index = db.index();
        if let Err(err) = db.flush().await {
            warn!(target: "scan::runner", index, "Failed to flush KB index: {err}");
        }
        if let Err(err) = self.allocator.release(index).await {
            warn!(target: "scan::runner", index, "Failed to release KB index: {err}");
        }
    }
}

/// Moves everything pending in the index into the record. Reads are
/// destructive, so each entry is committed before the next one is popped.
async fn drain(
    db: &mut ScanDb,
    record: &SharedRecord,
    group: &HostGroup,
) -> std::result::Result<(), KbError> {
    let fallback_host = group.hosts.first().map(String::as_str).unwrap_or_default();

    while let Some(entry) = db.get_result().await? {
        let result = ScanResult::from_engine(&entry, fallback_host);
        record.lock().await.append_result(result);
    }
    while let Some((host, value)) = db.next_host_progress().await? {
        record.lock().await.set_host_progress(&host, value);
    }
    while let Some(host) = db.next_finished_host().await? {
        record.lock().await.mark_host_finished(&host);
    }
    Ok(())
}

/// One error result per host of the groups that is not finished yet.
async fn record_group_failures(
    record: &SharedRecord,
    groups: impl Iterator<Item = HostGroup>,
    reason: &str,
) {
    let mut rec = record.lock().await;
    let finished = rec.finished_hosts();
    for group in groups {
        for host in group.hosts {
            if !finished.contains(&host) {
                rec.append_result(ScanResult::error(host, reason));
            }
        }
    }
}
