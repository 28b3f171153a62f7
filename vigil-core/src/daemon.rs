//! Facade over the scan lifecycle for control-protocol handlers.

use std::{collections::HashMap, sync::Arc};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    config::DaemonConfig,
    error::{Result, ScanError},
    kb::{DbIndexAllocator, KbConnector},
    scan::{
        Credential, EngineLauncher, Reaper, ScanCollection, ScanId, ScanRequest, ScanResult,
        ScanRunner, ScanStatus, StartKind,
    },
};

/// Parameters of a status query.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GetScansQuery {
    pub scan_id: Option<ScanId>,
    /// Include buffered results.
    pub details: bool,
    /// Remove the returned results from the buffer.
    pub pop_results: bool,
    pub max_results: Option<usize>,
}

impl Default for GetScansQuery {
    fn default() -> Self {
        Self {
            scan_id: None,
            details: true,
            pop_results: false,
            max_results: None,
        }
    }
}

impl GetScansQuery {
    pub fn for_scan(id: ScanId) -> Self {
        Self {
            scan_id: Some(id),
            ..Self::default()
        }
    }
}

/// Point-in-time view of one scan.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScanSnapshot {
    pub id: ScanId,
    pub target: String,
    pub status: ScanStatus,
    pub progress: u8,
    pub start_time: i64,
    pub end_time: i64,
    pub results: Vec<ScanResult>,
}

#[derive(Debug)]
pub struct Daemon {
    config: DaemonConfig,
    collection: Arc<ScanCollection>,
    runner: Arc<ScanRunner>,
    fatal: CancellationToken,
    shutdown: CancellationToken,
}

impl Daemon {
    /// Connects to the KB and sizes the index pool. An unreachable store or
    /// an unreadable pool size is returned here, before any scan is taken.
    pub async fn new(
        config: DaemonConfig,
        connector: Arc<dyn KbConnector>,
        launcher: Arc<dyn EngineLauncher>,
    ) -> Result<Self> {
        let allocator = Arc::new(DbIndexAllocator::new(connector, &config.kb).await?);
        allocator.max_database_index().await?;

        let fatal = CancellationToken::new();
        let runner = Arc::new(ScanRunner::new(
            allocator,
            launcher,
            config.engine.clone(),
            config.runner.clone(),
            fatal.clone(),
        ));

        Ok(Self {
            config,
            collection: Arc::new(ScanCollection::new()),
            runner,
            fatal,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    pub fn collection(&self) -> &Arc<ScanCollection> {
        &self.collection
    }

    /// Fires when the KB store is lost for good.
    pub fn fatal_token(&self) -> CancellationToken {
        self.fatal.clone()
    }

    /// Starts a new scan or resumes a stopped one. If no KB index can be
    /// claimed the request is undone and `PoolExhausted` returned.
    pub async fn start_scan(&self, request: ScanRequest) -> Result<ScanId> {
        let parallel = self.config.runner.effective_parallel(request.parallel);
        let (id, record, kind) = self
            .collection
            .start_scan(request, parallel, Utc::now().timestamp())
            .await?;

        if let Err(err) = self.runner.launch(id.clone(), Arc::clone(&record)).await {
            warn!(scan_id = %id, "Scan could not be launched: {err}");
            match kind {
                StartKind::Created => {
                    self.collection.remove(&id).await;
                }
                StartKind::Resumed => {
                    record.lock().await.stop(Utc::now().timestamp());
                }
            }
            return Err(err);
        }

        info!(scan_id = %id, ?kind, "Scan started");
        Ok(id)
    }

    pub async fn get_scans(&self, query: GetScansQuery) -> Result<Vec<ScanSnapshot>> {
        let ids = match &query.scan_id {
            Some(id) => vec![id.clone()],
            None => self.collection.ids().await,
        };

        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            let record = match self.collection.get(&id).await {
                Ok(record) => record,
                Err(err) if query.scan_id.is_some() => return Err(err),
                // Deleted while we were collecting.
                Err(_) => continue,
            };
            let mut rec = record.lock().await;
            let results = if query.details {
                rec.drain_results(query.max_results, query.pop_results)
            } else {
                Vec::new()
            };
            out.push(ScanSnapshot {
                id,
                target: rec.target_string(),
                status: rec.status(),
                progress: rec.overall_progress(),
                start_time: rec.start_time(),
                end_time: rec.end_time(),
                results,
            });
        }
        Ok(out)
    }

    /// Stops a running scan. Its results stay queryable.
    pub async fn stop_scan(&self, id: &ScanId) -> Result<()> {
        let record = self.collection.get(id).await?;
        let stopped = record.lock().await.stop(Utc::now().timestamp());
        self.runner.stop(id).await;
        if !stopped {
            return Err(ScanError::InvalidRequest(format!("scan {id} is not running")));
        }
        info!(scan_id = %id, "Scan stopped");
        Ok(())
    }

    /// Stops the scan if needed and forgets it.
    pub async fn delete_scan(&self, id: &ScanId) -> Result<()> {
        let record = self.collection.get(id).await?;
        record.lock().await.stop(Utc::now().timestamp());
        self.runner.stop(id).await;
        self.collection.remove(id).await;
        info!(scan_id = %id, "Scan deleted");
        Ok(())
    }

    /// One reaper sweep with the configured retention.
    pub async fn clean_forgotten_scans(&self) -> Vec<ScanId> {
        self.reaper().sweep().await
    }

    pub fn start_reaper(&self) -> JoinHandle<()> {
        self.reaper().spawn(self.shutdown.child_token())
    }

    fn reaper(&self) -> Reaper {
        Reaper::new(Arc::clone(&self.collection), self.config.reaper)
    }

    pub async fn get_scan_credentials(
        &self,
        id: &ScanId,
        hosts: &str,
    ) -> Result<HashMap<String, Credential>> {
        self.collection.credentials(id, hosts).await
    }

    pub async fn get_scan_target_options(
        &self,
        id: &ScanId,
        hosts: &str,
    ) -> Result<HashMap<String, String>> {
        self.collection.target_options(id, hosts).await
    }

    pub async fn get_scan_finished_hosts(&self, id: &ScanId) -> Result<Vec<String>> {
        self.collection.finished_hosts(id).await
    }

    pub async fn get_scan_unfinished_hosts(&self, id: &ScanId) -> Result<Vec<String>> {
        self.collection.unfinished_hosts(id).await
    }

    /// Stops every active scan, waits for the workers to release their
    /// indices and ends background tasks.
    pub async fn shutdown(&self) {
        info!("Shutting down scan daemon");
        let now = Utc::now().timestamp();
        for id in self.collection.ids().await {
            if let Ok(record) = self.collection.get(&id).await {
                record.lock().await.stop(now);
            }
        }
        self.shutdown.cancel();
        self.runner.shutdown().await;
    }
}
