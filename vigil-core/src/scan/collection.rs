use std::{collections::HashMap, sync::Arc, time::Duration};

use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use super::{Credential, ScanId, ScanRecord, ScanRequest, ScanStatus};
use crate::error::{Result, ScanError};

pub type SharedRecord = Arc<Mutex<ScanRecord>>;

/// How a start request was applied.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StartKind {
    Created,
    Resumed,
}

/// Process-local registry of scan records. The map lock is only held to
/// look up or insert; every record has its own mutex, so unrelated scans
/// never wait on each other.
#[derive(Debug, Default)]
pub struct ScanCollection {
    scans: RwLock<HashMap<ScanId, SharedRecord>>,
}

impl ScanCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a record for a new id or resumes a stopped one. The record is
    /// `Running` when this returns.
    pub async fn start_scan(
        &self,
        request: ScanRequest,
        parallel: usize,
        now: i64,
    ) -> Result<(ScanId, SharedRecord, StartKind)> {
        let id = request
            .scan_id
            .as_deref()
            .filter(|id| !id.trim().is_empty())
            .map(ScanId::from)
            .unwrap_or_else(ScanId::generate);

        let mut scans = self.scans.write().await;
        if let Some(existing) = scans.get(&id) {
            let record = Arc::clone(existing);
            drop(scans);
            record.lock().await.resume()?;
            info!(target: "scan::collection", scan_id = %id, "Resuming scan");
            return Ok((id, record, StartKind::Resumed));
        }

        let targets = request.resolved_targets()?;
        let mut record = ScanRecord::new(
            id.clone(),
            targets,
            request.scanner_params,
            request.vts,
            parallel,
            now,
        )?;
        record.mark_running();

        let record = Arc::new(Mutex::new(record));
        scans.insert(id.clone(), Arc::clone(&record));
        info!(target: "scan::collection", scan_id = %id, "Created scan");
        Ok((id, record, StartKind::Created))
    }

    pub async fn get(&self, id: &ScanId) -> Result<SharedRecord> {
        self.scans
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| ScanError::NotFound(id.clone()))
    }

    pub async fn remove(&self, id: &ScanId) -> Option<SharedRecord> {
        let removed = self.scans.write().await.remove(id);
        if removed.is_some() {
            debug!(target: "scan::collection", scan_id = %id, "Removed scan");
        }
        removed
    }

    /// Known ids in sorted order.
    pub async fn ids(&self) -> Vec<ScanId> {
        let mut ids: Vec<ScanId> = self.scans.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn len(&self) -> usize {
        self.scans.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.scans.read().await.is_empty()
    }

    /// Drops finished records whose end time is older than `retention`.
    /// Stopped records are never touched.
    pub async fn clean_forgotten(&self, now: i64, retention: Duration) -> Vec<ScanId> {
        let snapshot: Vec<(ScanId, SharedRecord)> = self
            .scans
            .read()
            .await
            .iter()
            .map(|(id, rec)| (id.clone(), Arc::clone(rec)))
            .collect();

        let retention = i64::try_from(retention.as_secs()).unwrap_or(i64::MAX);
        let mut expired = Vec::new();
        for (id, record) in snapshot {
            let record = record.lock().await;
            if record.status() == ScanStatus::Finished
                && now.saturating_sub(record.end_time()) > retention
            {
                expired.push(id);
            }
        }

        if !expired.is_empty() {
            let mut scans = self.scans.write().await;
            for id in &expired {
                scans.remove(id);
                info!(target: "scan::collection", scan_id = %id, "Forgot finished scan");
            }
        }
        expired
    }

    /// Credentials of the target whose host specification is `hosts`.
    pub async fn credentials(
        &self,
        id: &ScanId,
        hosts: &str,
    ) -> Result<HashMap<String, Credential>> {
        let record = self.get(id).await?;
        let record = record.lock().await;
        Ok(record
            .target(hosts)
            .map(|t| t.credentials.clone())
            .unwrap_or_default())
    }

    pub async fn target_options(&self, id: &ScanId, hosts: &str) -> Result<HashMap<String, String>> {
        let record = self.get(id).await?;
        let record = record.lock().await;
        Ok(record
            .target(hosts)
            .map(|t| t.options.clone())
            .unwrap_or_default())
    }

    pub async fn finished_hosts(&self, id: &ScanId) -> Result<Vec<String>> {
        Ok(self.get(id).await?.lock().await.finished_hosts())
    }

    pub async fn unfinished_hosts(&self, id: &ScanId) -> Result<Vec<String>> {
        Ok(self.get(id).await?.lock().await.unfinished_hosts())
    }
}
