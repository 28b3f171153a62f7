use std::sync::Arc;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{ScanCollection, ScanId};
use crate::config::ReaperConfig;

/// Periodically forgets finished scans older than the retention window.
#[derive(Debug, Clone)]
pub struct Reaper {
    collection: Arc<ScanCollection>,
    config: ReaperConfig,
}

impl Reaper {
    pub fn new(collection: Arc<ScanCollection>, config: ReaperConfig) -> Self {
        Self { collection, config }
    }

    pub async fn sweep(&self) -> Vec<ScanId> {
        let removed = self
            .collection
            .clean_forgotten(Utc::now().timestamp(), self.config.retention())
            .await;
        if removed.is_empty() {
            debug!(target: "scan::reaper", "Nothing to reap");
        } else {
            info!(target: "scan::reaper", count = removed.len(), "Reaped finished scans");
        }
        removed
    }

    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        let interval = self.config.interval();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!(target: "scan::reaper", "Reaper shutting down");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {
                        self.sweep().await;
                    }
                }
            }
        })
    }
}
