//! Cross-process allocation of KB indices.
//!
//! Index 0 holds the registry hash: one field per claimed index. Claims and
//! releases are single HSETNX/HDEL round trips. A field alone cannot tell a
//! live holder from one that crashed, so the search also inspects each
//! candidate for engine content and skips anything that is not empty.
//!
//! A registry connection the store drops is reopened once per command. If
//! the store cannot be reached again the error is [`KbError::Unreachable`].

use std::sync::Arc;

use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info, warn};

use super::{KbConnector, KbContext, KbError, KbResult, ScanDb};
use crate::config::KbConfig;

const CLAIM_MARKER: &str = "1";

#[derive(Debug)]
pub struct DbIndexAllocator {
    connector: Arc<dyn KbConnector>,
    registry: Mutex<KbContext>,
    registry_key: String,
    occupancy_pattern: String,
    max_index: OnceCell<usize>,
}

impl DbIndexAllocator {
    /// Opens the registry connection on index 0.
    pub async fn new(connector: Arc<dyn KbConnector>, config: &KbConfig) -> KbResult<Self> {
        let mut registry = connector.connect().await?;
        registry.select_database(0).await?;
        Ok(Self {
            connector,
            registry: Mutex::new(registry),
            registry_key: config.registry_key.clone(),
            occupancy_pattern: config.occupancy_pattern.clone(),
            max_index: OnceCell::new(),
        })
    }

    pub fn connector(&self) -> &Arc<dyn KbConnector> {
        &self.connector
    }

    async fn reconnect(&self, registry: &mut KbContext) -> KbResult<()> {
        warn!(target: "kb::allocator", "Registry connection lost; reconnecting");
        let mut fresh = self.connector.connect().await?;
        fresh.select_database(0).await?;
        *registry = fresh;
        Ok(())
    }

    /// Pool capacity from the server's `databases` setting. Read once per
    /// allocator.
    pub async fn max_database_index(&self) -> KbResult<usize> {
        self.max_index
            .get_or_try_init(|| async {
                let mut registry = self.registry.lock().await;
                let mut setting = registry.server_config("databases").await;
                if matches!(setting, Err(KbError::Connection(_))) {
                    self.reconnect(&mut registry).await?;
                    setting = registry.server_config("databases").await;
                }
                drop(registry);
                let raw = setting?.ok_or_else(|| {
                    KbError::Configuration("server setting `databases` is missing".into())
                })?;
                let max = raw.trim().parse::<usize>().map_err(|_| {
                    KbError::Configuration(format!(
                        "server setting `databases` is not a number: {raw:?}"
                    ))
                })?;
                info!(target: "kb::allocator", max, "KB index pool sized");
                Ok::<_, KbError>(max)
            })
            .await
            .copied()
    }

    /// Returns whether this caller now owns `index`. Transport failures are
    /// reported as [`KbError::Allocation`].
    pub async fn try_claim(&self, index: usize) -> KbResult<bool> {
        if index == 0 {
            return Err(KbError::InvalidArgument("index"));
        }
        let field = index.to_string();
        let mut registry = self.registry.lock().await;
        let mut claimed = registry
            .claim_hash_slot(&self.registry_key, &field, CLAIM_MARKER)
            .await;
        if matches!(claimed, Err(KbError::Connection(_))) {
            claimed = match self.reconnect(&mut registry).await {
                Ok(()) => {
                    registry
                        .claim_hash_slot(&self.registry_key, &field, CLAIM_MARKER)
                        .await
                }
                Err(err) => Err(err),
            };
        }
        claimed.map_err(|source| {
            if source.is_fatal() {
                return source;
            }
            KbError::Allocation {
                index,
                source: Box::new(source),
            }
        })
    }

    /// Drops the registry field for `index`. Releasing a free index is a
    /// no-op.
    pub async fn release(&self, index: usize) -> KbResult<()> {
        let field = index.to_string();
        let mut registry = self.registry.lock().await;
        let released = registry.release_hash_slot(&self.registry_key, &field).await;
        if matches!(released, Err(KbError::Connection(_))) {
            self.reconnect(&mut registry).await?;
            registry.release_hash_slot(&self.registry_key, &field).await?;
        } else {
            released?;
        }
        debug!(target: "kb::allocator", index, "Released KB index");
        Ok(())
    }

    /// Finds, claims and binds the lowest usable index.
    pub async fn claim_free(&self) -> KbResult<ScanDb> {
        let max = self.max_database_index().await?;
        let mut db = ScanDb::new(self.connector.connect().await?);

        for index in 1..max {
            db.select(index).await?;
            if db.context().count_keys_matching(&self.occupancy_pattern).await? > 0 {
                debug!(target: "kb::allocator", index, "Skipping KB index with leftover content");
                continue;
            }

            match self.try_claim(index).await {
                Ok(true) => {
                    debug!(target: "kb::allocator", index, "Claimed KB index");
                    return Ok(db);
                }
                Ok(false) => continue,
                Err(err @ KbError::Allocation { .. }) => {
                    warn!(target: "kb::allocator", index, "Treating KB index as busy: {err}");
                }
                Err(err) => return Err(err),
            }
        }

        Err(KbError::PoolExhausted { max })
    }
}
