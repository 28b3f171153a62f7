//! Client surface over the shared knowledge-base store.
//!
//! The store exposes numbered logical databases holding lists and hashes.
//! [`KbContext`] is the handle every caller works through: it validates
//! arguments before touching the wire and delegates to a [`KbConnection`]
//! backend (Redis in production, [`memory::MemoryKb`] in tests and dev mode).
//! New contexts come from a [`KbConnector`], which owns the connection
//! bootstrap and its retry policy.

pub mod allocator;
pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;
pub mod scan_db;

use std::{fmt, future::Future, time::Duration};

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, error, warn};

pub use allocator::DbIndexAllocator;
pub use memory::{MemoryConnector, MemoryKb};
pub use scan_db::ScanDb;

#[derive(Error, Debug)]
pub enum KbError {
    #[error("Missing required argument: {0}")]
    InvalidArgument(&'static str),

    #[error("Transient KB connection failure: {0}")]
    Connection(String),

    #[error("Not possible to connect to the KB at {address} after {attempts} attempts")]
    Unreachable { address: String, attempts: u32 },

    #[error("KB command {command} failed: {message}")]
    Command {
        command: &'static str,
        message: String,
    },

    #[error("KB configuration error: {0}")]
    Configuration(String),

    #[error("Failed to claim KB index {index}: {source}")]
    Allocation {
        index: usize,
        #[source]
        source: Box<KbError>,
    },

    #[error("No free KB index among 1..{max}")]
    PoolExhausted { max: usize },
}

impl KbError {
    /// Losing the store means no invariant can be maintained any more.
    pub fn is_fatal(&self) -> bool {
        matches!(self, KbError::Unreachable { .. })
    }

    pub fn command(command: &'static str, message: impl fmt::Display) -> Self {
        KbError::Command {
            command,
            message: message.to_string(),
        }
    }
}

pub type KbResult<T> = std::result::Result<T, KbError>;

/// Raw store primitives a backend has to provide. Arguments are already
/// validated by [`KbContext`] when these are called.
#[async_trait]
pub trait KbConnection: Send + fmt::Debug {
    async fn select(&mut self, index: usize) -> KbResult<()>;

    async fn rpush(&mut self, key: &str, values: &[String]) -> KbResult<()>;

    async fn lpush(&mut self, key: &str, values: &[String]) -> KbResult<()>;

    async fn lrange(&mut self, key: &str) -> KbResult<Vec<String>>;

    async fn rpop(&mut self, key: &str) -> KbResult<Option<String>>;

    async fn lindex(&mut self, key: &str, index: isize) -> KbResult<Option<String>>;

    async fn lrem_all(&mut self, key: &str, value: &str) -> KbResult<usize>;

    /// Delete-then-push executed as one transaction.
    async fn replace_list(&mut self, key: &str, values: &[String]) -> KbResult<()>;

    async fn keys(&mut self, pattern: &str) -> KbResult<Vec<String>>;

    async fn hsetnx(&mut self, key: &str, field: &str, value: &str) -> KbResult<bool>;

    async fn hdel(&mut self, key: &str, field: &str) -> KbResult<()>;

    async fn config_get(&mut self, name: &str) -> KbResult<Option<String>>;

    async fn flushdb(&mut self) -> KbResult<()>;
}

/// Produces fresh contexts, each with its own connection so that database
/// selection never leaks between callers.
#[async_trait]
pub trait KbConnector: Send + Sync + fmt::Debug {
    async fn connect(&self) -> KbResult<KbContext>;
}

/// A connection bound to one logical database.
#[derive(Debug)]
pub struct KbContext {
    conn: Box<dyn KbConnection>,
    index: usize,
}

fn require(name: &'static str, value: &str) -> KbResult<()> {
    if value.is_empty() {
        return Err(KbError::InvalidArgument(name));
    }
    Ok(())
}

fn require_values(values: &[String]) -> KbResult<()> {
    if values.is_empty() {
        return Err(KbError::InvalidArgument("values"));
    }
    Ok(())
}

impl KbContext {
    /// Wraps a connection currently pointed at database 0.
    pub fn new(conn: Box<dyn KbConnection>) -> Self {
        Self { conn, index: 0 }
    }

    /// Index of the logical database this context operates on.
    pub fn index(&self) -> usize {
        self.index
    }

    pub async fn select_database(&mut self, index: usize) -> KbResult<()> {
        self.conn.select(index).await?;
        self.index = index;
        Ok(())
    }

    /// Push one value to the tail of the list at `key`.
    pub async fn append_item(&mut self, key: &str, value: &str) -> KbResult<()> {
        self.append_items(key, &[value.to_string()]).await
    }

    /// Push values to the tail of the list at `key`, in order.
    pub async fn append_items(&mut self, key: &str, values: &[String]) -> KbResult<()> {
        require("key", key)?;
        require_values(values)?;
        self.conn.rpush(key, values).await
    }

    /// Push one value to the head of the list at `key`.
    pub async fn prepend_item(&mut self, key: &str, value: &str) -> KbResult<()> {
        require("key", key)?;
        self.conn.lpush(key, &[value.to_string()]).await
    }

    /// Full list at `key`; empty when the key does not exist.
    pub async fn list_items(&mut self, key: &str) -> KbResult<Vec<String>> {
        require("key", key)?;
        self.conn.lrange(key).await
    }

    /// Atomically remove and return the tail element.
    pub async fn pop_last(&mut self, key: &str) -> KbResult<Option<String>> {
        require("key", key)?;
        self.conn.rpop(key).await
    }

    /// Element at `index` without removing it. Negative indices count from
    /// the tail.
    pub async fn read_at(&mut self, key: &str, index: isize) -> KbResult<Option<String>> {
        require("key", key)?;
        self.conn.lindex(key, index).await
    }

    /// Head element of the list at `key`.
    pub async fn read_single(&mut self, key: &str) -> KbResult<Option<String>> {
        self.read_at(key, 0).await
    }

    /// Remove every occurrence of `value`; returns how many were removed.
    pub async fn remove_value(&mut self, key: &str, value: &str) -> KbResult<usize> {
        require("key", key)?;
        self.conn.lrem_all(key, value).await
    }

    /// Atomically replace the whole list at `key`.
    pub async fn overwrite(&mut self, key: &str, values: &[String]) -> KbResult<()> {
        require("key", key)?;
        require_values(values)?;
        self.conn.replace_list(key, values).await
    }

    pub async fn set_single(&mut self, key: &str, value: &str) -> KbResult<()> {
        self.overwrite(key, &[value.to_string()]).await
    }

    /// Keys matching a glob pattern.
    pub async fn keys_matching(&mut self, pattern: &str) -> KbResult<Vec<String>> {
        require("pattern", pattern)?;
        self.conn.keys(pattern).await
    }

    /// Every matching key paired with its full list contents.
    pub async fn scan_all_matching(
        &mut self,
        pattern: &str,
    ) -> KbResult<Vec<(String, Vec<String>)>> {
        let keys = self.keys_matching(pattern).await?;
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            let items = self.conn.lrange(&key).await?;
            out.push((key, items));
        }
        Ok(out)
    }

    /// Every matching key paired with the element at `index` of its list.
    /// Keys whose list is too short are skipped.
    pub async fn elements_at_index(
        &mut self,
        pattern: &str,
        index: isize,
    ) -> KbResult<Vec<(String, String)>> {
        let keys = self.keys_matching(pattern).await?;
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(item) = self.conn.lindex(&key, index).await? {
                out.push((key, item));
            }
        }
        Ok(out)
    }

    pub async fn count_keys_matching(&mut self, pattern: &str) -> KbResult<usize> {
        Ok(self.keys_matching(pattern).await?.len())
    }

    pub async fn count_keys(&mut self) -> KbResult<usize> {
        self.count_keys_matching("*").await
    }

    /// Set `field` in `hash_key` only if it is absent. Returns whether the
    /// set happened.
    pub async fn claim_hash_slot(
        &mut self,
        hash_key: &str,
        field: &str,
        value: &str,
    ) -> KbResult<bool> {
        require("hash_key", hash_key)?;
        require("field", field)?;
        require("value", value)?;
        self.conn.hsetnx(hash_key, field, value).await
    }

    pub async fn release_hash_slot(&mut self, hash_key: &str, field: &str) -> KbResult<()> {
        require("hash_key", hash_key)?;
        require("field", field)?;
        self.conn.hdel(hash_key, field).await
    }

    pub async fn server_config(&mut self, name: &str) -> KbResult<Option<String>> {
        require("name", name)?;
        self.conn.config_get(name).await
    }

    /// Drop every key of the currently selected database.
    pub async fn flush_database(&mut self) -> KbResult<()> {
        self.conn.flushdb().await
    }
}

/// Bounded, fixed-delay retry used while establishing connections.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &crate::config::KbConfig) -> Self {
        Self {
            attempts: config.connect_attempts.max(1),
            delay: config.retry_delay(),
        }
    }
}

/// Runs `attempt` until it succeeds, fails with something other than a
/// transient [`KbError::Connection`], or the policy is exhausted. Exhaustion
/// is reported as [`KbError::Unreachable`], which callers treat as fatal.
pub async fn connect_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    address: &str,
    mut attempt: F,
) -> KbResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = KbResult<T>>,
{
    for n in 1..=policy.attempts {
        match attempt().await {
            Ok(value) => {
                if n > 1 {
                    debug!(target: "kb::client", address, attempt = n, "KB connection established");
                }
                return Ok(value);
            }
            Err(KbError::Connection(reason)) => {
                warn!(
                    target: "kb::client",
                    address,
                    attempt = n,
                    max_attempts = policy.attempts,
                    "KB connection attempt failed: {reason}"
                );
                if n < policy.attempts {
                    tokio::time::sleep(policy.delay).await;
                }
            }
            Err(other) => return Err(other),
        }
    }

    error!(target: "kb::client", address, "KB store unreachable; no scan can make progress");
    Err(KbError::Unreachable {
        address: address.to_string(),
        attempts: policy.attempts,
    })
}
